use std::{
    fmt,
    io::{self, Read, Write},
    sync::Arc,
};

use arc_swap::ArcSwap;
use rustls::{
    ClientConfig, ClientConnection, RootCertStore, SupportedProtocolVersion,
    client::Resumption,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
};

use crate::{
    certificate::CertificateInfo,
    error::{self, ChannelError},
    verifier::{CertificateSlot, DeferredVerifier},
};

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// 客户端 TLS 参数：信任根、可选客户端证书与协议版本。
///
/// 这里只保存“原料”，真正的 `ClientConfig` 在每次构建安全层时现做，
/// 因为第一阶段校验器需要绑定当前安全层独占的证书记录槽。
pub struct TlsClientSettings {
    roots: Arc<RootCertStore>,
    client_auth: Option<ClientAuth>,
    tls13_only: bool,
}

struct ClientAuth {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsClientSettings {
    pub fn new(roots: RootCertStore) -> Self {
        Self {
            roots: Arc::new(roots),
            client_auth: None,
            tls13_only: false,
        }
    }

    /// 附加客户端证书（服务端要求双向认证时使用）。
    pub fn with_client_auth(
        mut self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Self {
        self.client_auth = Some(ClientAuth { chain, key });
        self
    }

    /// 仅协商 TLS 1.3。
    pub fn tls13_only(mut self) -> Self {
        self.tls13_only = true;
        self
    }

    pub fn roots(&self) -> &RootCertStore {
        &self.roots
    }

    /// 为一个新的安全层生成客户端配置，校验结果写入 `slot`。
    ///
    /// 会话恢复被关闭：恢复的会话不会重新出示证书，第一阶段回调也就不会运行，
    /// 新安全层将拿不到证书记录。
    pub(crate) fn build(&self, slot: CertificateSlot) -> Result<Arc<ClientConfig>, ChannelError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = Arc::new(DeferredVerifier::new(
            Arc::clone(&self.roots),
            Arc::clone(&provider),
            slot,
        ));
        let versions = if self.tls13_only {
            TLS13_ONLY
        } else {
            rustls::ALL_VERSIONS
        };

        let builder = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(versions)
            .map_err(|err| error::config_error(format_args!("tls protocol versions: {err}")))?
            .dangerous()
            .with_custom_certificate_verifier(verifier);

        let mut config = match &self.client_auth {
            Some(auth) => builder
                .with_client_auth_cert(auth.chain.clone(), auth.key.clone_key())
                .map_err(|err| error::config_error(format_args!("tls client certificate: {err}")))?,
            None => builder.with_no_client_auth(),
        };
        config.resumption = Resumption::disabled();
        Ok(Arc::new(config))
    }
}

impl Default for TlsClientSettings {
    /// 空信任根：任何证书都会带 `CHAIN_ERRORS`，需观察者显式放行。
    fn default() -> Self {
        Self::new(RootCertStore::empty())
    }
}

impl fmt::Debug for TlsClientSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsClientSettings")
            .field("roots", &self.roots.len())
            .field("client_auth", &self.client_auth.is_some())
            .field("tls13_only", &self.tls13_only)
            .finish()
    }
}

/// TLS 客户端参数的热更新容器。
///
/// # 设计动机（Why）
/// - 长会话中根证书或客户端证书可能轮换，控制连接与数据连接共享一份参数，
///   替换后无需重建通道。
///
/// # 核心契约（What）
/// - `replace` 只影响之后新建的安全层；已握手的安全层继续持有旧配置；
/// - 克隆得到的句柄共享同一存储。
///
/// # 实现逻辑（How）
/// - `ArcSwap` 读路径无锁，`snapshot` 仅增加引用计数。
#[derive(Clone)]
pub struct HotReloadingClientConfig {
    inner: Arc<ArcSwap<TlsClientSettings>>,
}

impl HotReloadingClientConfig {
    pub fn new(initial: Arc<TlsClientSettings>) -> Self {
        Self {
            inner: Arc::new(ArcSwap::new(initial)),
        }
    }

    #[inline]
    pub fn from_settings(initial: TlsClientSettings) -> Self {
        Self::new(Arc::new(initial))
    }

    #[inline]
    pub fn snapshot(&self) -> Arc<TlsClientSettings> {
        self.inner.load_full()
    }

    /// 替换参数并返回旧值。
    #[inline]
    pub fn replace(&self, next: Arc<TlsClientSettings>) -> Arc<TlsClientSettings> {
        self.inner.swap(next)
    }
}

impl Default for HotReloadingClientConfig {
    fn default() -> Self {
        Self::from_settings(TlsClientSettings::default())
    }
}

impl fmt::Debug for HotReloadingClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HotReloadingClientConfig")
            .field(&*self.inner.load())
            .finish()
    }
}

/// 安全流层：一次连接代内唯一的 TLS 客户端会话。
///
/// 创建时不握手；`handshake` 至多成功一次，`authenticated` 由通道在第二阶段判定后置位。
pub(crate) struct SecureLayer {
    session: ClientConnection,
    slot: CertificateSlot,
    server_name: String,
    handshaken: bool,
    authenticated: bool,
}

impl SecureLayer {
    pub(crate) fn new(
        settings: &TlsClientSettings,
        server_name: ServerName<'static>,
    ) -> Result<Self, ChannelError> {
        let slot = CertificateSlot::default();
        let config = settings.build(Arc::clone(&slot))?;
        let name = server_name.to_str().into_owned();
        let session = ClientConnection::new(config, server_name)
            .map_err(|err| error::config_error(format_args!("tls client session: {err}")))?;
        Ok(Self {
            session,
            slot,
            server_name: name,
            handshaken: false,
            authenticated: false,
        })
    }

    /// 驱动握手直到完成，并把残留的握手记录写出。
    pub(crate) fn handshake<IO>(&mut self, io: &mut IO) -> Result<(), ChannelError>
    where
        IO: Read + Write,
    {
        if self.handshaken {
            return Ok(());
        }
        while self.session.is_handshaking() {
            self.session
                .complete_io(io)
                .map_err(error::handshake_error)?;
        }
        while self.session.wants_write() {
            self.session
                .complete_io(io)
                .map_err(error::handshake_error)?;
        }
        self.handshaken = true;
        Ok(())
    }

    /// 取走第一阶段的校验记录；握手完成却没有记录说明对端未出示证书。
    pub(crate) fn take_certificate_info(&mut self) -> CertificateInfo {
        self.slot
            .lock()
            .take()
            .unwrap_or_else(|| CertificateInfo::not_available(self.server_name.clone()))
    }

    pub(crate) fn mark_authenticated(&mut self) {
        self.authenticated = true;
    }

    /// 会话已加密且已通过信任判定。
    pub(crate) fn is_encrypted(&self) -> bool {
        self.handshaken && self.authenticated && !self.session.is_handshaking()
    }

    pub(crate) fn session_mut(&mut self) -> &mut ClientConnection {
        &mut self.session
    }

    /// 发送 close_notify；未握手的会话没有可关闭的记录层，直接跳过。
    pub(crate) fn send_close_notify<IO>(&mut self, io: &mut IO) -> io::Result<()>
    where
        IO: Write,
    {
        if !self.handshaken {
            return Ok(());
        }
        self.session.send_close_notify();
        while self.session.wants_write() {
            self.session.write_tls(io)?;
        }
        io.flush()
    }
}

impl fmt::Debug for SecureLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureLayer")
            .field("server_name", &self.server_name)
            .field("handshaken", &self.handshaken)
            .field("authenticated", &self.authenticated)
            .finish()
    }
}
