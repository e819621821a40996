use std::{io, time::Duration};

use serde::{Deserialize, Serialize};
use socket2::{Socket, TcpKeepalive};

use crate::error::{self, ChannelError};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// 通道在连接中扮演的角色。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    /// 主动发起连接的一侧（控制连接、被动模式数据连接）。
    #[default]
    Initiator,
    /// 监听并接受对端连接的一侧（主动模式数据连接的 "server socket"）。
    Acceptor,
}

/// 通道级配置，所有字段都有默认值，可整体从 TOML 读取。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将超时、缓冲区与 TLS 名称覆盖集中到一个可序列化结构，宿主可以从配置文件装载，
///   而不必在代码中逐项调用 setter；
/// - 读写超时在每次断开后回落到这里的默认值，因此这里也是“新一代连接的初始状态”。
///
/// ## 契约（What）
/// - 时长字段以毫秒表示（`*_ms`），缺省或显式 `None` 表示不设超时；
/// - `tls_server_name`：覆盖 SNI 与证书名称匹配所用的主机名，缺省使用端点主机名；
/// - `max_line_length`：`read_line` 单行内容的字节上限，防止对端发送无换行的数据撑满内存；
/// - 未知字段直接报错，防止拼写错误被静默忽略。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    pub role: ChannelRole,
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Option<Duration>,
    #[serde(rename = "read_timeout_ms", with = "millis")]
    pub read_timeout: Option<Duration>,
    #[serde(rename = "write_timeout_ms", with = "millis")]
    pub write_timeout: Option<Duration>,
    #[serde(rename = "accept_timeout_ms", with = "millis")]
    pub accept_timeout: Option<Duration>,
    pub tls_server_name: Option<String>,
    pub max_line_length: usize,
    pub socket: SocketOptions,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            role: ChannelRole::Initiator,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            read_timeout: Some(DEFAULT_IO_TIMEOUT),
            write_timeout: Some(DEFAULT_IO_TIMEOUT),
            accept_timeout: Some(DEFAULT_ACCEPT_TIMEOUT),
            tls_server_name: None,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            socket: SocketOptions::default(),
        }
    }
}

impl ChannelConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ChannelError> {
        let config: Self = toml::from_str(source).map_err(error::config_error)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ChannelError> {
        toml::to_string(self).map_err(error::config_error)
    }

    pub fn with_role(mut self, role: ChannelRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn with_tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.tls_server_name = Some(name.into());
        self
    }

    pub fn with_max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = max_line_length;
        self
    }

    pub fn with_socket(mut self, socket: SocketOptions) -> Self {
        self.socket = socket;
        self
    }

    /// 零时长在套接字层面会被拒绝（标准库要求非零超时），提前在配置阶段报错。
    pub fn validate(&self) -> Result<(), ChannelError> {
        for (name, value) in [
            ("connect_timeout_ms", self.connect_timeout),
            ("read_timeout_ms", self.read_timeout),
            ("write_timeout_ms", self.write_timeout),
            ("accept_timeout_ms", self.accept_timeout),
        ] {
            check_timeout(name, value)?;
        }
        if self.max_line_length == 0 {
            return Err(error::config_error("max_line_length must be greater than zero"));
        }
        Ok(())
    }
}

pub(crate) fn check_timeout(name: &str, value: Option<Duration>) -> Result<(), ChannelError> {
    match value {
        Some(timeout) if timeout.is_zero() => Err(error::config_error(format_args!(
            "{name} must be greater than zero"
        ))),
        _ => Ok(()),
    }
}

/// 套接字级选项，对应 `socket2` 可设置的内核行为。
///
/// 缓冲区大小需在 `connect` 之前设置才能影响 TCP 窗口协商，其余选项在建连成功后落地。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocketOptions {
    pub send_buffer_size: Option<usize>,
    pub receive_buffer_size: Option<usize>,
    pub nodelay: bool,
    #[serde(rename = "keepalive_ms", with = "millis")]
    pub keepalive: Option<Duration>,
    #[serde(rename = "linger_ms", with = "millis")]
    pub linger: Option<Duration>,
}

impl SocketOptions {
    pub const fn new() -> Self {
        Self {
            send_buffer_size: None,
            receive_buffer_size: None,
            nodelay: false,
            keepalive: None,
            linger: None,
        }
    }

    pub fn with_send_buffer_size(mut self, size: Option<usize>) -> Self {
        self.send_buffer_size = size;
        self
    }

    pub fn with_receive_buffer_size(mut self, size: Option<usize>) -> Self {
        self.receive_buffer_size = size;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_keepalive(mut self, idle: Option<Duration>) -> Self {
        self.keepalive = idle;
        self
    }

    /// 设置 `SO_LINGER`；Linux 上精度为秒。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    /// 在一个已连接（或已接受）的套接字上一次性应用全部选项。
    pub fn apply(&self, socket: &Socket) -> Result<(), ChannelError> {
        self.apply_buffers(socket)
            .and_then(|()| self.apply_connected(socket))
            .map_err(|err| error::io_error(error::CONFIGURE, err))
    }

    pub(crate) fn apply_before_connect(&self, socket: &Socket) -> Result<(), ChannelError> {
        self.apply_buffers(socket)
            .map_err(|err| error::io_error(error::CONFIGURE, err))
    }

    pub(crate) fn apply_after_connect(&self, socket: &Socket) -> Result<(), ChannelError> {
        self.apply_connected(socket)
            .map_err(|err| error::io_error(error::CONFIGURE, err))
    }

    fn apply_buffers(&self, socket: &Socket) -> io::Result<()> {
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.receive_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        Ok(())
    }

    fn apply_connected(&self, socket: &Socket) -> io::Result<()> {
        socket.set_tcp_nodelay(self.nodelay)?;
        match self.keepalive {
            Some(idle) => {
                socket.set_keepalive(true)?;
                socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
            }
            None => socket.set_keepalive(false)?,
        }
        socket.set_linger(self.linger)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => {
                let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
                serializer.serialize_some(&millis)
            }
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
