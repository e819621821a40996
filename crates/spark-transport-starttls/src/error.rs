use std::{borrow::Cow, fmt, io, time::Duration};

use rustls::{AlertDescription, Error as RustlsError};
use thiserror::Error;

use crate::certificate::{CertificateErrors, CertificateInfo};

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const RESOLVE: OperationKind = OperationKind {
    code: "spark.transport.starttls.resolve_failed",
    message: "endpoint resolve",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.transport.starttls.connect_failed",
    message: "tcp connect",
};
pub(crate) const BIND: OperationKind = OperationKind {
    code: "spark.transport.starttls.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.transport.starttls.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.transport.starttls.configure_failed",
    message: "socket configure",
};
pub(crate) const HANDSHAKE: OperationKind = OperationKind {
    code: "spark.transport.starttls.handshake_failed",
    message: "tls handshake",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.transport.starttls.read_failed",
    message: "stream read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.transport.starttls.write_failed",
    message: "stream write",
};
pub(crate) const FLUSH: OperationKind = OperationKind {
    code: "spark.transport.starttls.flush_failed",
    message: "stream flush",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "spark.transport.starttls.shutdown_failed",
    message: "tcp shutdown",
};
pub(crate) const CLOSE_NOTIFY: OperationKind = OperationKind {
    code: "spark.transport.starttls.close_notify_failed",
    message: "tls close_notify",
};

const TIMEOUT_CODE: &str = "spark.transport.starttls.timeout";
const CERTIFICATE_REJECTED_CODE: &str = "spark.transport.starttls.certificate_rejected";
const NOT_CONNECTED_CODE: &str = "spark.transport.starttls.not_connected";
const NOT_AUTHENTICATED_CODE: &str = "spark.transport.starttls.not_authenticated";
const DISPOSED_CODE: &str = "spark.transport.starttls.disposed";
const CONFIG_CODE: &str = "spark.transport.starttls.invalid_config";

/// 错误的自动化处置分类。
///
/// 与 `spark-core` 的 `ErrorCategory` 同构的最小子集：调用方（协议会话层）据此决定
/// 是否重试、是否告警；通道自身从不重试。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 瞬时故障，建议至少等待 `after` 再重试。
    Retryable { after: Duration },
    /// 超时（读写超时、建连超时、接受超时）。
    Timeout,
    /// 安全相关：证书被拒、握手完整性违规等。
    Security,
    /// 调用顺序或配置错误，重试没有意义。
    NonRetryable,
}

/// 通道对外暴露的错误域。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将建连、握手、证书决策与流读写的失败收敛为一个枚举，调用方只需匹配变体即可区分
///   `ConnectionError`/`HandshakeError`/`CertificateValidationError` 三类生命周期错误；
/// - 每个变体都带稳定错误码（[`ChannelError::code`]），日志与告警规则无需解析文案。
///
/// ## 契约（What）
/// - `Connection`：套接字建立失败（解析、拒绝、不可达、超时），状态保持 Disconnected；
/// - `Handshake`：TLS 低层握手失败，与证书信任无关；
/// - `CertificateValidation`：握手在传输层完成，但证书校验失败且无观察者覆盖；
///   携带原始错误集合与证书信息，调用方可注册覆盖后重试 `authenticate_connection`；
/// - `Io`：活动流上的读写/刷新失败，包含读写超时；
/// - 其余变体描述调用顺序错误，不涉及底层 IO。
///
/// ## 注意事项（Trade-offs）
/// - 拆除阶段的问题不会以本类型返回，而是记录为 [`TeardownWarning`]。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChannelError {
    #[error("{context}: {source}")]
    Connection {
        code: &'static str,
        context: Cow<'static, str>,
        #[source]
        source: io::Error,
    },
    #[error("tls handshake: {source}")]
    Handshake {
        #[source]
        source: io::Error,
    },
    #[error("peer certificate rejected: {errors}")]
    CertificateValidation {
        errors: CertificateErrors,
        info: Box<CertificateInfo>,
    },
    #[error("{context}: {source}")]
    Io {
        code: &'static str,
        context: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{operation} requires a connected channel")]
    NotConnected { operation: &'static str },
    #[error("{operation} requires an authenticated secure stream")]
    NotAuthenticated { operation: &'static str },
    #[error("channel has been disposed")]
    Disposed,
    #[error("invalid channel configuration: {message}")]
    Config { message: String },
}

impl ChannelError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            ChannelError::Connection { code, .. } | ChannelError::Io { code, .. } => code,
            ChannelError::Handshake { .. } => HANDSHAKE.code,
            ChannelError::CertificateValidation { .. } => CERTIFICATE_REJECTED_CODE,
            ChannelError::NotConnected { .. } => NOT_CONNECTED_CODE,
            ChannelError::NotAuthenticated { .. } => NOT_AUTHENTICATED_CODE,
            ChannelError::Disposed => DISPOSED_CODE,
            ChannelError::Config { .. } => CONFIG_CODE,
        }
    }

    /// 推导处置分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            ChannelError::Connection { source, .. } | ChannelError::Io { source, .. } => {
                categorize_io_error(source)
            }
            ChannelError::Handshake { source } => categorize_with_rustls(source),
            ChannelError::CertificateValidation { .. } => ErrorCategory::Security,
            ChannelError::NotConnected { .. }
            | ChannelError::NotAuthenticated { .. }
            | ChannelError::Disposed
            | ChannelError::Config { .. } => ErrorCategory::NonRetryable,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.category() == ErrorCategory::Timeout
    }

    /// 证书被拒时返回原始校验错误集合。
    pub fn certificate_errors(&self) -> Option<CertificateErrors> {
        match self {
            ChannelError::CertificateValidation { errors, .. } => Some(*errors),
            _ => None,
        }
    }
}

/// 拆除某一层资源时遇到的非致命问题。
///
/// 只记录、不中断：拆除流程会继续释放剩余各层。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TeardownWarning {
    pub layer: LayerKind,
    pub code: &'static str,
    pub message: String,
}

impl fmt::Display for TeardownWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({})", self.layer, self.message, self.code)
    }
}

/// 通道内部的资源分层，按创建顺序排列。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Transport,
    Stream,
    SecureStream,
    Reader,
    Listener,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LayerKind::Transport => "transport",
            LayerKind::Stream => "stream",
            LayerKind::SecureStream => "secure-stream",
            LayerKind::Reader => "reader",
            LayerKind::Listener => "listener",
        };
        f.write_str(name)
    }
}

pub(crate) fn teardown_warning(
    layer: LayerKind,
    kind: OperationKind,
    error: &io::Error,
) -> TeardownWarning {
    TeardownWarning {
        layer,
        code: kind.code,
        message: format!("{}: {}", kind.message, error),
    }
}

/// 建连类错误：超时统一改写为超时错误码，其他保留操作码。
pub(crate) fn connection_error(
    kind: OperationKind,
    target: impl fmt::Display,
    error: io::Error,
) -> ChannelError {
    let code = if is_timeout_kind(error.kind()) {
        TIMEOUT_CODE
    } else {
        kind.code
    };
    ChannelError::Connection {
        code,
        context: Cow::Owned(format!("{} {}", kind.message, target)),
        source: error,
    }
}

pub(crate) fn io_error(kind: OperationKind, error: io::Error) -> ChannelError {
    let code = if is_timeout_kind(error.kind()) {
        TIMEOUT_CODE
    } else {
        kind.code
    };
    ChannelError::Io {
        code,
        context: kind.message,
        source: error,
    }
}

pub(crate) fn handshake_error(error: io::Error) -> ChannelError {
    ChannelError::Handshake { source: error }
}

pub(crate) fn config_error(message: impl fmt::Display) -> ChannelError {
    ChannelError::Config {
        message: message.to_string(),
    }
}

/// 阻塞套接字设置了超时后，读写超时在 Unix 上表现为 `WouldBlock`，在 Windows 上为 `TimedOut`。
fn is_timeout_kind(kind: io::ErrorKind) -> bool {
    matches!(kind, io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

fn categorize_with_rustls(error: &io::Error) -> ErrorCategory {
    if let Some(source) = error.get_ref()
        && let Some(rustls_error) = source.downcast_ref::<RustlsError>()
    {
        return categorize_rustls_error(rustls_error);
    }
    categorize_io_error(error)
}

fn categorize_rustls_error(error: &RustlsError) -> ErrorCategory {
    use RustlsError::*;
    match error {
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | EncryptError
        | PeerSentOversizedRecord
        | NoCertificatesPresented
        | InvalidCertificate(_)
        | UnsupportedNameType
        | NoApplicationProtocol => ErrorCategory::Security,
        AlertReceived(alert) => alert_to_category(alert),
        PeerIncompatible(_) | HandshakeNotComplete | General(_) => {
            retryable(Duration::from_millis(80))
        }
        _ => ErrorCategory::NonRetryable,
    }
}

fn alert_to_category(alert: &AlertDescription) -> ErrorCategory {
    use AlertDescription::*;
    match alert {
        CloseNotify | UserCanceled => retryable(Duration::from_millis(30)),
        BadCertificate
        | UnsupportedCertificate
        | CertificateRevoked
        | CertificateExpired
        | CertificateUnknown
        | UnknownCA
        | AccessDenied
        | HandshakeFailure
        | DecryptError
        | BadRecordMac
        | IllegalParameter
        | InsufficientSecurity
        | ProtocolVersion => ErrorCategory::Security,
        _ => retryable(Duration::from_millis(40)),
    }
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => ErrorCategory::Timeout,
        ErrorKind::Interrupted => retryable(Duration::from_millis(5)),
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => retryable(Duration::from_millis(50)),
        _ => ErrorCategory::NonRetryable,
    }
}

fn retryable(after: Duration) -> ErrorCategory {
    ErrorCategory::Retryable { after }
}
