#![doc = r#"
# spark-transport-starttls

## 设计动机（Why）
- **显式 TLS**：控制/数据类协议常在明文握手之后再协商加密（如 "AUTH TLS"），
  需要一个能在会话中途把同一条 TCP 连接升级为 TLS 的通道；
- **可重连**：会话层会反复连接、断开，通道必须保证每次断开都完整释放资源，
  重连后看不到上一代的任何句柄、缓冲或证书；
- **可干预的证书信任**：自签名或名称不符的证书在运维场景中很常见，
  调用方需要先看到证书再决定是否放行，而不是让握手直接失败。

## 核心契约（What）
- [`Channel`]：生命周期（`connect` / `disconnect` / `dispose`）、惰性安全层
  （`request_secure_stream` / `authenticate_connection`）与统一活动流（[`ActiveStream`]）；
- 两阶段信任：握手回调只记录 [`CertificateInfo`]，握手后由 [`decide`] 结合
  invalid-certificate 观察者的 [`CertificateDecision`] 给出 [`TrustVerdict`]；
- [`LifecycleNotifier`]：connected / disconnected / disposed / invalid-certificate 四类事件，
  同步、按注册顺序分发；
- 错误统一为 [`ChannelError`]，每个变体带稳定错误码；拆除阶段的问题只记录为 [`TeardownWarning`]。

## 实现策略（How）
- `socket2` 承担建连、超时、缓冲区与 shutdown，`rustls` 以阻塞方式（`complete_io`）
  在同一套接字上驱动 TLS 客户端会话；
- 每次连接的资源收拢为一代（generation），拆除按 读取器 → 安全流层 → 流层 → 传输句柄 顺序进行；
- 客户端 TLS 参数放在 `ArcSwap` 中，替换后只影响之后新建的安全层。

## 风险与考量（Trade-offs）
- 全部操作阻塞调用线程，取消只能依赖读写超时；
- 观察者放行证书后错误集合仍保留可查，“握手完成”不代表“证书可信”；
- 安全层在认证通过前拒绝任何读写，避免应用数据流经未经判定的会话。
"#]

mod certificate;
mod channel;
mod config;
mod endpoint;
mod error;
mod events;
mod layers;
mod reader;
mod stream;
#[cfg(feature = "subscriber")]
mod telemetry;
mod tls;
mod variants;
mod verifier;

pub use certificate::{CertificateDecision, CertificateErrors, CertificateInfo, TrustVerdict, decide};
pub use channel::{Channel, ChannelState};
pub use config::{ChannelConfig, ChannelRole, SocketOptions};
pub use endpoint::Endpoint;
pub use error::{ChannelError, ErrorCategory, LayerKind, TeardownWarning};
pub use events::{
    CertificateObserver, ChannelObserver, LifecycleNotifier, NotificationKind, ObserverId,
};
pub use stream::{ActiveStream, LayerIdentity};
#[cfg(feature = "subscriber")]
pub use telemetry::{TelemetryError, install_tracing};
pub use tls::{HotReloadingClientConfig, TlsClientSettings};
pub use variants::{
    ActiveStreamAccessor, Connect, ControlChannel, DataChannel, DataMode, Disconnect,
};
