//! 可选的日志订阅器安装（`subscriber` feature）。

use thiserror::Error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// 安装全局订阅器时可能出现的错误。
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// 进程内已存在全局 `tracing` 订阅器。
    #[error("a global tracing subscriber is already installed")]
    SubscriberAlreadySet,
    #[error("failed to install tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// 安装 `fmt + EnvFilter` 订阅器，过滤规则取自 `RUST_LOG`，缺省为 `info`。
///
/// 供没有自带日志栈的宿主（命令行工具、集成测试）快速启用通道日志；
/// 已接入其他订阅器的宿主不应调用。
pub fn install_tracing() -> Result<(), TelemetryError> {
    if tracing::dispatcher::has_been_set() {
        return Err(TelemetryError::SubscriberAlreadySet);
    }
    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_rejected() {
        // 同一测试二进制中其他用例可能已装好全局订阅器，第一次调用两种结果都合法。
        let _ = install_tracing();
        assert!(matches!(
            install_tracing(),
            Err(TelemetryError::SubscriberAlreadySet)
        ));
    }
}
