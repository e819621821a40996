use std::{
    io::{self, Write},
    net::SocketAddr,
    time::Duration,
};

use rustls::pki_types::CertificateDer;
use tracing::{debug, info, warn};

use crate::{
    certificate::{self, CertificateDecision, CertificateErrors, CertificateInfo, TrustVerdict},
    config::{self, ChannelConfig, ChannelRole, SocketOptions},
    endpoint::Endpoint,
    error::{self, ChannelError, TeardownWarning},
    events::{LifecycleNotifier, NotificationKind},
    layers::{Generation, Listener, TransportHandle},
    reader::BufferedReader,
    stream::{ActiveStream, LayerIdentity},
    tls::{HotReloadingClientConfig, SecureLayer},
};

/// 通道的生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Disconnected,
    Connected,
    /// 安全流层已建立；是否已完成认证见 [`Channel::is_secure`]。
    ConnectedSecure,
}

/// 可在明文与 TLS 之间中途升级的双向 TCP 通道。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 为 "AUTH TLS" 一类显式 TLS 协议提供单一的连接抽象：会话层只管发命令、读应答，
///   升级前后使用同一个活动流访问器；
/// - 把“每次连接的资源”收拢到 [`Generation`]，断开即整体拆除，重连从干净状态开始。
///
/// ## 逻辑（How）
/// - `connect` 创建新一代资源（传输句柄 + 流层）并触发 connected；
/// - `request_secure_stream` 惰性地在流层外包一层 TLS 会话，不握手；
/// - `authenticate_connection` 执行握手，握手期间校验回调只记录不拒绝，
///   握手后用 [`certificate::decide`] 结合观察者决定接受与否；
/// - `disconnect` 按 读取器 → 安全流层 → 流层 → 传输句柄 顺序释放，然后清空证书信息。
///
/// ## 契约（What）
/// - 全部调用阻塞当前线程；实例内不加锁、不起线程，不同实例之间不共享状态；
/// - 读写超时由 `read_timeout`/`write_timeout` 约束，同时也约束握手中的套接字读写；
/// - 除超时外没有取消手段，不支持从另一线程关闭底层套接字来打断阻塞调用；
/// - `dispose` 之后通道不可再连接，所有操作返回 [`ChannelError::Disposed`]。
///
/// ## 注意事项（Trade-offs）
/// - 第一阶段“放行”不等于“可信”：证书错误一律保存在 [`Channel::certificate_errors`]，
///   即使观察者选择忽略。
pub struct Channel {
    config: ChannelConfig,
    tls: HotReloadingClientConfig,
    endpoint: Option<Endpoint>,
    generation: Option<Generation>,
    listener: Option<Listener>,
    certificate: Option<CertificateInfo>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    send_buffer_size: Option<usize>,
    receive_buffer_size: Option<usize>,
    generations: u64,
    disposed: bool,
    notifier: LifecycleNotifier,
    teardown_warnings: Vec<TeardownWarning>,
}

impl Channel {
    pub fn new(config: ChannelConfig) -> Self {
        Self::with_tls(config, HotReloadingClientConfig::default())
    }

    pub fn with_tls(config: ChannelConfig, tls: HotReloadingClientConfig) -> Self {
        Self {
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            send_buffer_size: config.socket.send_buffer_size,
            receive_buffer_size: config.socket.receive_buffer_size,
            config,
            tls,
            endpoint: None,
            generation: None,
            listener: None,
            certificate: None,
            generations: 0,
            disposed: false,
            notifier: LifecycleNotifier::default(),
            teardown_warnings: Vec::new(),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn role(&self) -> ChannelRole {
        self.config.role
    }

    pub fn tls(&self) -> &HotReloadingClientConfig {
        &self.tls
    }

    pub fn notifier(&mut self) -> &mut LifecycleNotifier {
        &mut self.notifier
    }

    /// 最近一次 `connect`/`listen` 的目标端点。
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn state(&self) -> ChannelState {
        match &self.generation {
            None => ChannelState::Disconnected,
            Some(generation) if generation.has_secure() => ChannelState::ConnectedSecure,
            Some(_) => ChannelState::Connected,
        }
    }

    pub fn connected(&self) -> bool {
        self.generation.is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// 安全层已握手且已通过信任判定；仅建立了安全层并不算。
    pub fn is_secure(&self) -> bool {
        self.generation
            .as_ref()
            .and_then(Generation::secure)
            .is_some_and(SecureLayer::is_encrypted)
    }

    /// 当前连接代的编号，从 1 开始，每次建连递增。
    pub fn generation(&self) -> Option<u64> {
        self.generation.as_ref().map(Generation::id)
    }

    /// 连接到 `endpoint` 并触发 connected。
    ///
    /// 已连接时不做任何事（不会静默重连）。acceptor 角色下等价于在 `endpoint`
    /// 上监听（若尚未监听）并接受一个对端；已在监听时 `endpoint` 必须与
    /// [`Channel::listen`] 所用的端点相同，否则返回配置错误且监听保持不变。
    /// 失败时状态保持 Disconnected。
    pub fn connect(&mut self, endpoint: impl Into<Endpoint>) -> Result<(), ChannelError> {
        self.ensure_usable()?;
        let endpoint = endpoint.into();
        if let Some(generation) = &self.generation {
            debug!(%endpoint, generation = generation.id(), "connect ignored, already connected");
            return Ok(());
        }
        if self.config.role == ChannelRole::Acceptor {
            match &self.listener {
                None => {
                    self.listen(endpoint)?;
                }
                Some(listener) if self.endpoint.as_ref() != Some(&endpoint) => {
                    return Err(error::config_error(format_args!(
                        "connect to {endpoint} while listening on {}",
                        listener.local_addr()
                    )));
                }
                Some(_) => {}
            }
            return self.accept();
        }

        self.release_layers();
        let addrs = endpoint.resolve()?;
        debug!(host = endpoint.host(), port = endpoint.port(), candidates = addrs.len(), "connecting");
        let transport = TransportHandle::connect(
            &endpoint,
            &addrs,
            &self.socket_options(),
            self.config.connect_timeout,
        )?;
        self.endpoint = Some(endpoint);
        self.adopt(transport)
    }

    /// 断开并重新连接到上一次的端点。
    pub fn reconnect(&mut self) -> Result<(), ChannelError> {
        self.ensure_usable()?;
        let endpoint = self.endpoint.clone().ok_or(ChannelError::NotConnected {
            operation: "reconnect",
        })?;
        self.disconnect();
        self.connect(endpoint)
    }

    /// 拆除当前连接代的全部资源；未连接时是空操作，不触发 disconnected。
    pub fn disconnect(&mut self) {
        if self.release_layers() {
            self.notify(NotificationKind::Disconnected);
        }
    }

    /// 断开并进入终止状态，disposed 事件恰好触发一次。
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disconnect();
        self.disposed = true;
        debug!("channel disposed");
        self.notify(NotificationKind::Disposed);
    }

    /// 惰性建立安全流层并返回其身份；重复调用返回同一身份，不重建、不握手。
    ///
    /// 已有的读取器绑定的是明文流，随之作废。
    pub fn request_secure_stream(&mut self) -> Result<LayerIdentity, ChannelError> {
        self.ensure_usable()?;
        let Some(generation) = self.generation.as_mut() else {
            return Err(ChannelError::NotConnected {
                operation: "request_secure_stream",
            });
        };
        let identity = LayerIdentity::Secure {
            generation: generation.id(),
        };
        if generation.has_secure() {
            return Ok(identity);
        }

        let server_name = match (self.config.tls_server_name.as_deref(), &self.endpoint) {
            (_, Some(endpoint)) => endpoint.server_name(self.config.tls_server_name.as_deref())?,
            (Some(name), None) => Endpoint::new(name, 0).server_name(None)?,
            (None, None) => generation
                .transport()
                .map(|transport| Endpoint::from(transport.peer_addr()))
                .ok_or(ChannelError::NotConnected {
                    operation: "request_secure_stream",
                })?
                .server_name(None)?,
        };
        let layer = SecureLayer::new(&self.tls.snapshot(), server_name)?;
        debug!(generation = generation.id(), ?layer, "secure layer created");
        generation.install_secure(layer);
        Ok(identity)
    }

    /// 在安全层上完成握手并执行信任判定。
    ///
    /// 未连接或已认证时为空操作；尚无安全层时先建立。证书存在错误时依次调用
    /// invalid-certificate 观察者，无人放行则返回 [`ChannelError::CertificateValidation`]，
    /// 安全层保留且未认证，注册放行观察者后可再次调用（只重做判定，不重新握手）。
    pub fn authenticate_connection(&mut self) -> Result<(), ChannelError> {
        self.ensure_usable()?;
        if self.generation.is_none() || self.is_secure() {
            return Ok(());
        }
        self.request_secure_stream()?;

        let Some(generation) = self.generation.as_mut() else {
            return Ok(());
        };
        let id = generation.id();
        let layer = generation.handshake()?;
        if self.certificate.is_none() {
            let info = layer.take_certificate_info();
            debug!(generation = id, server_name = info.server_name(), errors = %info.errors(), "handshake completed");
            self.certificate = Some(info);
        }

        let errors = self.certificate_errors();
        let ignore = !errors.is_empty() && self.dispatch_invalid_certificate();
        match certificate::decide(errors, ignore) {
            TrustVerdict::Accept => {
                if !errors.is_empty() {
                    info!(generation = id, %errors, "certificate errors ignored by observer");
                }
                if let Some(layer) = self.generation.as_mut().and_then(Generation::secure_mut) {
                    layer.mark_authenticated();
                }
                Ok(())
            }
            TrustVerdict::Reject => {
                let info = self
                    .certificate
                    .clone()
                    .unwrap_or_else(|| CertificateInfo::not_available(String::new()));
                warn!(
                    generation = id,
                    %errors,
                    details = ?info.details(),
                    "peer certificate rejected"
                );
                Err(ChannelError::CertificateValidation {
                    errors,
                    info: Box::new(info),
                })
            }
        }
    }

    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.transport().map(TransportHandle::local_addr)
    }

    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.transport().map(TransportHandle::peer_addr)
    }

    /// acceptor 角色下监听套接字的地址（用于 PORT/EPRT 通告）。
    pub fn listener_endpoint(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(Listener::local_addr)
    }

    /// 本代握手记录的校验错误；未握手或已断开时为空集。
    pub fn certificate_errors(&self) -> CertificateErrors {
        self.certificate
            .as_ref()
            .map_or(CertificateErrors::NONE, CertificateInfo::errors)
    }

    pub fn peer_certificate(&self) -> Option<&CertificateDer<'static>> {
        self.certificate
            .as_ref()
            .and_then(CertificateInfo::peer_certificate)
    }

    pub fn certificate_info(&self) -> Option<&CertificateInfo> {
        self.certificate.as_ref()
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// 设置读超时，已连接时立即作用于套接字；断开后回落到配置默认值。
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        config::check_timeout("read_timeout", timeout)?;
        self.read_timeout = timeout;
        self.apply_timeouts()
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        config::check_timeout("write_timeout", timeout)?;
        self.write_timeout = timeout;
        self.apply_timeouts()
    }

    /// 发送缓冲区大小：显式设置过则返回设置值，否则返回当前套接字的实际值。
    pub fn send_buffer_size(&self) -> Option<usize> {
        self.send_buffer_size.or_else(|| {
            self.transport()
                .and_then(|transport| transport.socket().send_buffer_size().ok())
        })
    }

    /// 设置发送缓冲区大小；偏好跨连接保留，已连接时立即生效。
    pub fn set_send_buffer_size(&mut self, size: usize) -> Result<(), ChannelError> {
        self.send_buffer_size = Some(size);
        match self.transport() {
            Some(transport) => transport
                .socket()
                .set_send_buffer_size(size)
                .map_err(|err| error::io_error(error::CONFIGURE, err)),
            None => Ok(()),
        }
    }

    pub fn receive_buffer_size(&self) -> Option<usize> {
        self.receive_buffer_size.or_else(|| {
            self.transport()
                .and_then(|transport| transport.socket().recv_buffer_size().ok())
        })
    }

    pub fn set_receive_buffer_size(&mut self, size: usize) -> Result<(), ChannelError> {
        self.receive_buffer_size = Some(size);
        match self.transport() {
            Some(transport) => transport
                .socket()
                .set_recv_buffer_size(size)
                .map_err(|err| error::io_error(error::CONFIGURE, err)),
            None => Ok(()),
        }
    }

    /// 当前最外层活动流。安全层存在但未认证时返回 [`ChannelError::NotAuthenticated`]。
    pub fn active_stream(&mut self) -> Result<ActiveStream<'_>, ChannelError> {
        self.ensure_usable()?;
        let generation = self.generation_mut("active_stream")?;
        let (slot, active) = generation.split("active_stream")?;
        if slot
            .as_ref()
            .is_some_and(|reader| reader.bound_to() != active.identity())
        {
            *slot = None;
        }
        Ok(match slot.as_mut() {
            Some(reader) => active.with_pending(reader),
            None => active,
        })
    }

    /// 读取一行文本（去掉行尾 CRLF/LF），对端关闭且无残留数据时返回 `None`。
    ///
    /// 行长超过 [`ChannelConfig::max_line_length`] 时返回 `read_failed`（`InvalidData`）。
    pub fn read_line(&mut self) -> Result<Option<String>, ChannelError> {
        self.ensure_usable()?;
        let limit = self.config.max_line_length;
        let generation = self.generation_mut("read_line")?;
        let (slot, mut active) = generation.split("read_line")?;
        let reader = BufferedReader::bind(slot, active.identity(), limit);
        reader
            .read_line(&mut active)
            .map_err(|err| error::io_error(error::READ, err))
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        self.ensure_usable()?;
        let limit = self.config.max_line_length;
        let generation = self.generation_mut("read")?;
        let (slot, mut active) = generation.split("read")?;
        let reader = BufferedReader::bind(slot, active.identity(), limit);
        reader
            .read(&mut active, buf)
            .map_err(|err| error::io_error(error::READ, err))
    }

    /// 写出全部字节并刷新到套接字。
    pub fn write_all(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
        self.ensure_usable()?;
        let (_, mut active) = self.generation_mut("write_all")?.split("write_all")?;
        active
            .write_all(buf)
            .map_err(|err| error::io_error(error::WRITE, err))?;
        active
            .flush()
            .map_err(|err| error::io_error(error::FLUSH, err))
    }

    /// 写出一行文本，自动追加 CRLF。
    pub fn write_line(&mut self, line: &str) -> Result<(), ChannelError> {
        let mut framed = Vec::with_capacity(line.len() + 2);
        framed.extend_from_slice(line.as_bytes());
        framed.extend_from_slice(b"\r\n");
        self.write_all(&framed)
    }

    pub fn flush(&mut self) -> Result<(), ChannelError> {
        self.ensure_usable()?;
        let (_, mut active) = self.generation_mut("flush")?.split("flush")?;
        active
            .flush()
            .map_err(|err| error::io_error(error::FLUSH, err))
    }

    /// 非阻塞探测对端是否仍在；不改变通道状态。
    pub fn is_alive(&self) -> bool {
        self.transport().is_some_and(TransportHandle::probe)
    }

    /// 本代从套接字读到的字节数（TLS 模式下为密文字节数）。
    pub fn bytes_read(&self) -> u64 {
        self.generation
            .as_ref()
            .and_then(Generation::stream)
            .map_or(0, |stream| stream.bytes_read())
    }

    pub fn bytes_written(&self) -> u64 {
        self.generation
            .as_ref()
            .and_then(Generation::stream)
            .map_or(0, |stream| stream.bytes_written())
    }

    /// 最近一次拆除连接代时记录下的警告。
    pub fn last_teardown_warnings(&self) -> &[TeardownWarning] {
        &self.teardown_warnings
    }

    /// 在 `endpoint` 上监听，返回实际绑定的地址；端口为 0 时由系统分配。
    pub fn listen(&mut self, endpoint: impl Into<Endpoint>) -> Result<SocketAddr, ChannelError> {
        self.ensure_usable()?;
        if self.generation.is_some() {
            return Err(error::config_error("listen requires a disconnected channel"));
        }
        let endpoint = endpoint.into();
        self.release_layers();
        let addr = endpoint.resolve()?.into_iter().next().ok_or_else(|| {
            error::config_error(format_args!("{endpoint} resolved to no address"))
        })?;
        let listener = Listener::bind(addr)?;
        let local = listener.local_addr();
        debug!(%endpoint, %local, "listening for data connection");
        self.listener = Some(listener);
        self.endpoint = Some(endpoint);
        Ok(local)
    }

    /// 等待一个对端连入（受 `accept_timeout` 约束），接管其套接字作为新一代连接。
    ///
    /// 接受成功后监听套接字随即关闭。已连接时为空操作。
    pub fn accept(&mut self) -> Result<(), ChannelError> {
        self.ensure_usable()?;
        if self.generation.is_some() {
            return Ok(());
        }
        let listener = self.listener.as_ref().ok_or(ChannelError::NotConnected {
            operation: "accept",
        })?;
        let socket = listener.accept(self.config.accept_timeout)?;
        self.listener = None;
        let transport = TransportHandle::from_accepted(socket, &self.socket_options())?;
        self.adopt(transport)
    }

    fn ensure_usable(&self) -> Result<(), ChannelError> {
        if self.disposed {
            return Err(ChannelError::Disposed);
        }
        Ok(())
    }

    fn transport(&self) -> Option<&TransportHandle> {
        self.generation.as_ref().and_then(Generation::transport)
    }

    fn generation_mut(&mut self, operation: &'static str) -> Result<&mut Generation, ChannelError> {
        self.generation
            .as_mut()
            .ok_or(ChannelError::NotConnected { operation })
    }

    fn socket_options(&self) -> SocketOptions {
        self.config
            .socket
            .clone()
            .with_send_buffer_size(self.send_buffer_size)
            .with_receive_buffer_size(self.receive_buffer_size)
    }

    fn apply_timeouts(&self) -> Result<(), ChannelError> {
        match self.transport() {
            Some(transport) => transport
                .set_timeouts(self.read_timeout, self.write_timeout)
                .map_err(|err| error::io_error(error::CONFIGURE, err)),
            None => Ok(()),
        }
    }

    /// 以新的传输句柄开启一代连接并触发 connected。
    ///
    /// 此时连接尚未建立完成，超时设置失败按建连失败上报。
    fn adopt(&mut self, transport: TransportHandle) -> Result<(), ChannelError> {
        transport
            .set_timeouts(self.read_timeout, self.write_timeout)
            .map_err(|err| adoption_error(transport.peer_addr(), err))?;
        self.generations += 1;
        let generation = Generation::new(self.generations, transport);
        debug!(
            generation = generation.id(),
            local = ?generation.transport().map(TransportHandle::local_addr),
            peer = ?generation.transport().map(TransportHandle::peer_addr),
            "connected"
        );
        self.generation = Some(generation);
        self.notify(NotificationKind::Connected);
        Ok(())
    }

    /// 释放当前代的全部资源，返回是否确实存在过一代连接。
    ///
    /// 证书信息在各层释放之后清空；读写超时回落到配置默认值。
    fn release_layers(&mut self) -> bool {
        if let Some(listener) = self.listener.take() {
            debug!(local = %listener.local_addr(), "listener closed");
        }
        let released = match self.generation.take() {
            Some(generation) => {
                let id = generation.id();
                self.teardown_warnings = generation.teardown();
                self.read_timeout = self.config.read_timeout;
                self.write_timeout = self.config.write_timeout;
                debug!(generation = id, warnings = self.teardown_warnings.len(), "disconnected");
                true
            }
            None => false,
        };
        self.certificate = None;
        released
    }

    fn notify(&mut self, kind: NotificationKind) {
        let mut observers = self.notifier.take_channel_observers(kind);
        for observer in observers.iter_mut() {
            observer(&*self);
        }
        self.notifier.restore_channel_observers(kind, observers);
    }

    /// 依注册顺序调用 invalid-certificate 观察者，返回最终的 ignore 决定。
    fn dispatch_invalid_certificate(&mut self) -> bool {
        let mut observers = self.notifier.take_certificate_observers();
        let ignore = match self.certificate.as_ref() {
            Some(info) => {
                let mut decision = CertificateDecision::new(info);
                for observer in observers.iter_mut() {
                    observer(&*self, &mut decision);
                }
                decision.ignore()
            }
            None => false,
        };
        self.notifier.restore_certificate_observers(observers);
        ignore
    }
}

/// 接管新套接字时的失败属于建连失败，不论出在哪一步套接字设置上。
fn adoption_error(peer: SocketAddr, err: io::Error) -> ChannelError {
    error::connection_error(error::CONNECT, peer, err)
}

impl Drop for Channel {
    /// 静默拆除剩余资源，不触发任何通知。
    fn drop(&mut self) {
        if let Some(generation) = self.generation.take() {
            generation.teardown();
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("state", &self.state())
            .field("endpoint", &self.endpoint)
            .field("generation", &self.generation())
            .field("secure", &self.is_secure())
            .field("disposed", &self.disposed)
            .field("notifier", &self.notifier)
            .finish()
    }
}
