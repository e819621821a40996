//! 通道能力集与具体变体。
//!
//! [`Connect`]、[`Disconnect`]、[`ActiveStreamAccessor`] 描述会话层真正依赖的能力；
//! [`ControlChannel`] 与 [`DataChannel`] 共享同一个 [`Channel`] 内核，只在建连方式上不同。

use std::{
    net::SocketAddr,
    ops::{Deref, DerefMut},
};

use crate::{
    channel::Channel,
    config::{ChannelConfig, ChannelRole},
    endpoint::Endpoint,
    error::ChannelError,
    stream::{ActiveStream, LayerIdentity},
    tls::HotReloadingClientConfig,
};

pub trait Connect {
    fn connect_to(&mut self, endpoint: Endpoint) -> Result<(), ChannelError>;

    fn is_connected(&self) -> bool;
}

pub trait Disconnect {
    fn disconnect(&mut self);

    fn dispose(&mut self);
}

pub trait ActiveStreamAccessor {
    fn active_stream(&mut self) -> Result<ActiveStream<'_>, ChannelError>;

    fn request_secure_stream(&mut self) -> Result<LayerIdentity, ChannelError>;

    fn authenticate_connection(&mut self) -> Result<(), ChannelError>;

    fn is_secure(&self) -> bool;
}

impl Connect for Channel {
    fn connect_to(&mut self, endpoint: Endpoint) -> Result<(), ChannelError> {
        self.connect(endpoint)
    }

    fn is_connected(&self) -> bool {
        self.connected()
    }
}

impl Disconnect for Channel {
    fn disconnect(&mut self) {
        Channel::disconnect(self);
    }

    fn dispose(&mut self) {
        Channel::dispose(self);
    }
}

impl ActiveStreamAccessor for Channel {
    fn active_stream(&mut self) -> Result<ActiveStream<'_>, ChannelError> {
        Channel::active_stream(self)
    }

    fn request_secure_stream(&mut self) -> Result<LayerIdentity, ChannelError> {
        Channel::request_secure_stream(self)
    }

    fn authenticate_connection(&mut self) -> Result<(), ChannelError> {
        Channel::authenticate_connection(self)
    }

    fn is_secure(&self) -> bool {
        Channel::is_secure(self)
    }
}

/// 变体通过 `Deref` 暴露内核，能力 trait 全部转发给内核实现。
macro_rules! delegate_capabilities {
    ($variant:ty) => {
        impl Deref for $variant {
            type Target = Channel;

            fn deref(&self) -> &Channel {
                &self.inner
            }
        }

        impl DerefMut for $variant {
            fn deref_mut(&mut self) -> &mut Channel {
                &mut self.inner
            }
        }

        impl AsRef<Channel> for $variant {
            fn as_ref(&self) -> &Channel {
                &self.inner
            }
        }

        impl AsMut<Channel> for $variant {
            fn as_mut(&mut self) -> &mut Channel {
                &mut self.inner
            }
        }

        impl Connect for $variant {
            fn connect_to(&mut self, endpoint: Endpoint) -> Result<(), ChannelError> {
                Connect::connect_to(&mut self.inner, endpoint)
            }

            fn is_connected(&self) -> bool {
                self.inner.connected()
            }
        }

        impl Disconnect for $variant {
            fn disconnect(&mut self) {
                self.inner.disconnect();
            }

            fn dispose(&mut self) {
                self.inner.dispose();
            }
        }

        impl ActiveStreamAccessor for $variant {
            fn active_stream(&mut self) -> Result<ActiveStream<'_>, ChannelError> {
                self.inner.active_stream()
            }

            fn request_secure_stream(&mut self) -> Result<LayerIdentity, ChannelError> {
                self.inner.request_secure_stream()
            }

            fn authenticate_connection(&mut self) -> Result<(), ChannelError> {
                self.inner.authenticate_connection()
            }

            fn is_secure(&self) -> bool {
                self.inner.is_secure()
            }
        }
    };
}

/// 控制连接：始终由本端发起，目标端点在构造时确定。
#[derive(Debug)]
pub struct ControlChannel {
    target: Endpoint,
    inner: Channel,
}

impl ControlChannel {
    pub fn new(target: impl Into<Endpoint>, config: ChannelConfig) -> Self {
        Self::with_tls(target, config, HotReloadingClientConfig::default())
    }

    pub fn with_tls(
        target: impl Into<Endpoint>,
        config: ChannelConfig,
        tls: HotReloadingClientConfig,
    ) -> Self {
        Self {
            target: target.into(),
            inner: Channel::with_tls(config.with_role(ChannelRole::Initiator), tls),
        }
    }

    pub fn target(&self) -> &Endpoint {
        &self.target
    }

    /// 连接到构造时给定的目标。
    pub fn open(&mut self) -> Result<(), ChannelError> {
        self.inner.connect(&self.target)
    }

    pub fn into_inner(self) -> Channel {
        self.inner
    }
}

delegate_capabilities!(ControlChannel);

/// 数据连接的建立方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataMode {
    /// 被动模式：本端连接服务端通告的地址。
    Passive,
    /// 主动模式：本端监听，等待服务端连入。
    Active,
}

/// 数据连接：被动模式下是发起方，主动模式下是接受方。
///
/// 两种模式都由本端作为 TLS 客户端握手，接受方同样如此。
#[derive(Debug)]
pub struct DataChannel {
    mode: DataMode,
    inner: Channel,
}

impl DataChannel {
    pub fn passive(config: ChannelConfig) -> Self {
        Self::passive_with_tls(config, HotReloadingClientConfig::default())
    }

    pub fn passive_with_tls(config: ChannelConfig, tls: HotReloadingClientConfig) -> Self {
        Self {
            mode: DataMode::Passive,
            inner: Channel::with_tls(config.with_role(ChannelRole::Initiator), tls),
        }
    }

    pub fn active(config: ChannelConfig) -> Self {
        Self::active_with_tls(config, HotReloadingClientConfig::default())
    }

    pub fn active_with_tls(config: ChannelConfig, tls: HotReloadingClientConfig) -> Self {
        Self {
            mode: DataMode::Active,
            inner: Channel::with_tls(config.with_role(ChannelRole::Acceptor), tls),
        }
    }

    pub fn mode(&self) -> DataMode {
        self.mode
    }

    /// 绑定监听套接字，返回需要通告给对端的地址。
    pub fn listen(&mut self, endpoint: impl Into<Endpoint>) -> Result<SocketAddr, ChannelError> {
        self.inner.listen(endpoint)
    }

    /// 等待对端连入；被动模式下没有监听套接字，返回 `NotConnected`。
    pub fn accept(&mut self) -> Result<(), ChannelError> {
        self.inner.accept()
    }

    pub fn into_inner(self) -> Channel {
        self.inner
    }
}

delegate_capabilities!(DataChannel);
