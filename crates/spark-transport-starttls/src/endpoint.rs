use std::{
    fmt,
    io,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
};

use rustls::pki_types::ServerName;

use crate::error::{self, ChannelError};

/// 通道的目标端点：主机名（或 IP 字面量）加端口。
///
/// 主机名按原样保留，TLS 升级时作为 SNI 与证书名称匹配的依据；
/// 解析到 socket 地址发生在每次建连时，因此 DNS 变更会在重连后生效。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .map(str::to_owned)
            .unwrap_or(host);
        Self { host, port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 解析为候选地址列表，保持解析器返回的顺序。
    pub(crate) fn resolve(&self) -> Result<Vec<SocketAddr>, ChannelError> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|err| error::connection_error(error::RESOLVE, self, err))?
            .collect();
        if addrs.is_empty() {
            return Err(error::connection_error(
                error::RESOLVE,
                self,
                io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"),
            ));
        }
        Ok(addrs)
    }

    /// 推导 TLS 使用的服务器名；`override_name` 优先于端点主机名。
    pub(crate) fn server_name(
        &self,
        override_name: Option<&str>,
    ) -> Result<ServerName<'static>, ChannelError> {
        let name = override_name.unwrap_or(&self.host).to_owned();
        ServerName::try_from(name)
            .map_err(|err| error::config_error(format_args!("tls server name: {err}")))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl From<(IpAddr, u16)> for Endpoint {
    fn from((ip, port): (IpAddr, u16)) -> Self {
        Self::new(ip.to_string(), port)
    }
}

impl From<(&str, u16)> for Endpoint {
    fn from((host, port): (&str, u16)) -> Self {
        Self::new(host, port)
    }
}

impl From<(String, u16)> for Endpoint {
    fn from((host, port): (String, u16)) -> Self {
        Self::new(host, port)
    }
}

impl From<&Endpoint> for Endpoint {
    fn from(endpoint: &Endpoint) -> Self {
        endpoint.clone()
    }
}
