//! 一次连接代（generation）内的分层资源，以及严格逆序的拆除流程。
//!
//! 分层自内向外：传输句柄（原始套接字）→ 流层（字节视图与统计）→ 安全流层（TLS 会话）
//! → 缓冲读取器。外层只借用内层，不持有其所有权，因此拆除时可以逐层独立释放，
//! 任何一层缺失都只是跳过。

use std::{
    io::{self, Read, Write},
    mem::MaybeUninit,
    net::{Shutdown, SocketAddr},
    thread,
    time::{Duration, Instant},
};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, warn};

use crate::{
    config::SocketOptions,
    endpoint::Endpoint,
    error::{self, ChannelError, LayerKind, TeardownWarning},
    reader::BufferedReader,
    stream::{ActiveStream, LayerIdentity},
    tls::SecureLayer,
};

/// 非阻塞 accept 的轮询间隔。
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 传输句柄：独占一个已连接的 TCP 套接字。
#[derive(Debug)]
pub(crate) struct TransportHandle {
    socket: Socket,
    local: SocketAddr,
    peer: SocketAddr,
}

impl TransportHandle {
    /// 依次尝试解析得到的地址，返回第一个连通的句柄；全部失败时返回最后一个错误。
    pub(crate) fn connect(
        endpoint: &Endpoint,
        addrs: &[SocketAddr],
        options: &SocketOptions,
        timeout: Option<Duration>,
    ) -> Result<Self, ChannelError> {
        let mut last_error = None;
        for addr in addrs {
            match Self::connect_addr(*addr, options, timeout) {
                Ok(handle) => return Ok(handle),
                Err(err) => {
                    debug!(%endpoint, %addr, error = %err, "connect attempt failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            error::connection_error(
                error::CONNECT,
                endpoint,
                io::Error::new(io::ErrorKind::NotFound, "no candidate address"),
            )
        }))
    }

    fn connect_addr(
        addr: SocketAddr,
        options: &SocketOptions,
        timeout: Option<Duration>,
    ) -> Result<Self, ChannelError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|err| error::connection_error(error::CONNECT, addr, err))?;
        options.apply_before_connect(&socket)?;
        let target = SockAddr::from(addr);
        match timeout {
            Some(timeout) => socket.connect_timeout(&target, timeout),
            None => socket.connect(&target),
        }
        .map_err(|err| error::connection_error(error::CONNECT, addr, err))?;
        options.apply_after_connect(&socket)?;
        Self::from_socket(socket).map_err(|err| error::connection_error(error::CONNECT, addr, err))
    }

    /// 接管一个已由监听套接字接受的连接。
    pub(crate) fn from_accepted(socket: Socket, options: &SocketOptions) -> Result<Self, ChannelError> {
        socket
            .set_nonblocking(false)
            .map_err(|err| error::io_error(error::CONFIGURE, err))?;
        options.apply(&socket)?;
        Self::from_socket(socket).map_err(|err| error::io_error(error::ACCEPT, err))
    }

    fn from_socket(socket: Socket) -> io::Result<Self> {
        let local = socket_addr(&socket.local_addr()?)?;
        let peer = socket_addr(&socket.peer_addr()?)?;
        Ok(Self {
            socket,
            local,
            peer,
        })
    }

    pub(crate) fn socket(&self) -> &Socket {
        &self.socket
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// 错误按调用场景映射：建连期间属于连接失败，已连接后属于配置失败。
    pub(crate) fn set_timeouts(
        &self,
        read: Option<Duration>,
        write: Option<Duration>,
    ) -> io::Result<()> {
        self.socket
            .set_read_timeout(read)
            .and_then(|()| self.socket.set_write_timeout(write))
    }

    /// 非阻塞窥探一个字节：对端已关闭（读到 EOF）或套接字出错时返回 `false`。
    pub(crate) fn probe(&self) -> bool {
        if self.socket.set_nonblocking(true).is_err() {
            return false;
        }
        let mut byte = [MaybeUninit::<u8>::uninit(); 1];
        let alive = match self.socket.peek(&mut byte) {
            Ok(0) => false,
            Ok(_) => true,
            Err(err) => err.kind() == io::ErrorKind::WouldBlock,
        };
        let restored = self.socket.set_nonblocking(false).is_ok();
        alive && restored
    }

    fn shutdown(&self) -> io::Result<()> {
        self.socket.shutdown(Shutdown::Both)
    }
}

fn socket_addr(addr: &SockAddr) -> io::Result<SocketAddr> {
    addr.as_socket().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "socket is not bound to an inet address")
    })
}

/// 监听套接字（acceptor 角色的 "server socket"），只在 accept 前存在。
#[derive(Debug)]
pub(crate) struct Listener {
    socket: Socket,
    local: SocketAddr,
}

impl Listener {
    pub(crate) fn bind(addr: SocketAddr) -> Result<Self, ChannelError> {
        let bind_error = |err: io::Error| error::connection_error(error::BIND, addr, err);
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_error)?;
        socket.set_reuse_address(true).map_err(bind_error)?;
        socket.bind(&SockAddr::from(addr)).map_err(bind_error)?;
        socket.listen(1).map_err(bind_error)?;
        socket.set_nonblocking(true).map_err(bind_error)?;
        let local = socket_addr(&socket.local_addr().map_err(bind_error)?).map_err(bind_error)?;
        Ok(Self { socket, local })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// 轮询等待一个入站连接，`timeout` 为 `None` 时无限等待。
    pub(crate) fn accept(&self, timeout: Option<Duration>) -> Result<Socket, ChannelError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            match self.socket.accept() {
                Ok((socket, peer)) => {
                    debug!(local = %self.local, peer = ?peer.as_socket(), "accepted data connection");
                    return Ok(socket);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        return Err(error::connection_error(
                            error::ACCEPT,
                            self.local,
                            io::Error::new(io::ErrorKind::TimedOut, "no peer connected in time"),
                        ));
                    }
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(error::connection_error(error::ACCEPT, self.local, err)),
            }
        }
    }
}

/// 流层：传输句柄之上的字节视图，统计本代的收发字节数。
#[derive(Debug, Default)]
pub(crate) struct StreamLayer {
    bytes_read: u64,
    bytes_written: u64,
}

impl StreamLayer {
    pub(crate) fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

/// 流层在一次 I/O 调用期间的借用视图。
pub(crate) struct PlainStream<'a> {
    socket: &'a Socket,
    stats: &'a mut StreamLayer,
}

impl<'a> PlainStream<'a> {
    pub(crate) fn new(socket: &'a Socket, stats: &'a mut StreamLayer) -> Self {
        Self { socket, stats }
    }
}

impl Read for PlainStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut socket = self.socket;
        let read = socket.read(buf)?;
        self.stats.bytes_read += read as u64;
        Ok(read)
    }
}

impl Write for PlainStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut socket = self.socket;
        let written = socket.write(buf)?;
        self.stats.bytes_written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut socket = self.socket;
        socket.flush()
    }
}

/// 一次连接代的全部资源。
///
/// 字段按创建顺序声明；[`Generation::teardown`] 按相反顺序释放。
#[derive(Debug)]
pub(crate) struct Generation {
    id: u64,
    transport: Option<TransportHandle>,
    stream: Option<StreamLayer>,
    secure: Option<SecureLayer>,
    reader: Option<BufferedReader>,
}

impl Generation {
    pub(crate) fn new(id: u64, transport: TransportHandle) -> Self {
        Self {
            id,
            transport: Some(transport),
            stream: Some(StreamLayer::default()),
            secure: None,
            reader: None,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn transport(&self) -> Option<&TransportHandle> {
        self.transport.as_ref()
    }

    pub(crate) fn stream(&self) -> Option<&StreamLayer> {
        self.stream.as_ref()
    }

    pub(crate) fn secure(&self) -> Option<&SecureLayer> {
        self.secure.as_ref()
    }

    pub(crate) fn has_secure(&self) -> bool {
        self.secure.is_some()
    }

    /// 安装安全层并作废当前读取器（它绑定的是明文流）。
    pub(crate) fn install_secure(&mut self, layer: SecureLayer) {
        if let Some(reader) = self.reader.take()
            && reader.buffered() > 0
        {
            debug!(
                generation = self.id,
                discarded = reader.buffered(),
                "dropping plaintext bytes buffered before the secure layer"
            );
        }
        self.secure = Some(layer);
    }

    /// 在安全层上执行握手；握手读写直接走流层，不经过读取器。
    pub(crate) fn handshake(&mut self) -> Result<&mut SecureLayer, ChannelError> {
        let Self {
            transport,
            stream,
            secure,
            ..
        } = self;
        let (Some(transport), Some(stream), Some(secure)) =
            (transport.as_ref(), stream.as_mut(), secure.as_mut())
        else {
            return Err(ChannelError::NotConnected {
                operation: "authenticate_connection",
            });
        };
        let mut plain = PlainStream::new(transport.socket(), stream);
        secure.handshake(&mut plain)?;
        Ok(secure)
    }

    pub(crate) fn secure_mut(&mut self) -> Option<&mut SecureLayer> {
        self.secure.as_mut()
    }

    /// 拆出读取器槽位与当前最外层活动流，两者借用互不重叠。
    ///
    /// 安全层存在但尚未通过认证时拒绝任何 I/O。
    pub(crate) fn split(
        &mut self,
        operation: &'static str,
    ) -> Result<(&mut Option<BufferedReader>, ActiveStream<'_>), ChannelError> {
        let Self {
            id,
            transport,
            stream,
            secure,
            reader,
        } = self;
        let (Some(transport), Some(stream)) = (transport.as_ref(), stream.as_mut()) else {
            return Err(ChannelError::NotConnected { operation });
        };
        let plain = PlainStream::new(transport.socket(), stream);
        let active = match secure.as_mut() {
            Some(layer) if layer.is_encrypted() => {
                ActiveStream::secure(layer.session_mut(), plain, LayerIdentity::Secure {
                    generation: *id,
                })
            }
            Some(_) => return Err(ChannelError::NotAuthenticated { operation }),
            None => ActiveStream::plain(plain, LayerIdentity::Plain { generation: *id }),
        };
        Ok((reader, active))
    }

    /// 严格按 读取器 → 安全流层 → 流层 → 传输句柄 的顺序释放。
    ///
    /// 每一步的失败记录为警告后继续，缺失的层直接跳过。
    pub(crate) fn teardown(mut self) -> Vec<TeardownWarning> {
        let mut warnings = Vec::new();
        let generation = self.id;

        if let Some(reader) = self.reader.take() {
            debug!(generation, layer = %LayerKind::Reader, buffered = reader.buffered(), "released");
        }

        if let Some(mut secure) = self.secure.take() {
            match (self.transport.as_ref(), self.stream.as_mut()) {
                (Some(transport), Some(stream)) => {
                    let mut plain = PlainStream::new(transport.socket(), stream);
                    if let Err(err) = secure.send_close_notify(&mut plain) {
                        warnings.push(error::teardown_warning(
                            LayerKind::SecureStream,
                            error::CLOSE_NOTIFY,
                            &err,
                        ));
                    }
                }
                _ => debug!(generation, "secure layer outlived its stream, skipping close_notify"),
            }
            drop(secure);
            debug!(generation, layer = %LayerKind::SecureStream, "released");
        }

        if let Some(stream) = self.stream.take() {
            debug!(
                generation,
                layer = %LayerKind::Stream,
                bytes_read = stream.bytes_read(),
                bytes_written = stream.bytes_written(),
                "released"
            );
        }

        if let Some(transport) = self.transport.take() {
            if let Err(err) = transport.shutdown() {
                warnings.push(error::teardown_warning(
                    LayerKind::Transport,
                    error::SHUTDOWN,
                    &err,
                ));
            }
            debug!(generation, layer = %LayerKind::Transport, peer = %transport.peer_addr(), "released");
            drop(transport);
        }

        for warning in &warnings {
            warn!(generation, layer = %warning.layer, code = warning.code, "{}", warning.message);
        }
        warnings
    }
}
