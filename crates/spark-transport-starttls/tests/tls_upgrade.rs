//! 显式 TLS 升级与两阶段证书信任。
//!
//! 服务端在明文阶段回复 `234` 之后切换到 rustls，测试覆盖：受信任证书的正常升级、
//! 不受信任证书在无观察者时被拒、观察者放行、名称不匹配、拒绝后注册放行并重试，
//! 以及对端发送非 TLS 数据时的握手失败。

mod support;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread::JoinHandle,
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use spark_transport_starttls::{
    CertificateErrors, Channel, ChannelError, ChannelState, ErrorCategory,
    HotReloadingClientConfig, LayerIdentity,
};

/// 完成明文阶段：读问候、发送 `AUTH TLS`、读 `234`。
fn negotiate(channel: &mut Channel) -> Result<()> {
    assert_eq!(
        channel.read_line()?.as_deref(),
        Some("220 starttls test server")
    );
    channel.write_line("AUTH TLS")?;
    assert_eq!(
        channel.read_line()?.as_deref(),
        Some("234 AUTH TLS successful")
    );
    Ok(())
}

/// 等待服务端线程结束并取回会话结束方式。
fn join_session(
    server: JoinHandle<Result<support::TlsSessionEnd>>,
) -> Result<support::TlsSessionEnd> {
    server
        .join()
        .map_err(|_| anyhow::anyhow!("服务端线程 panic"))?
        .context("服务端会话失败")
}

fn echo(channel: &mut Channel, line: &str) -> Result<()> {
    channel.write_line(line)?;
    assert_eq!(
        channel.read_line()?.as_deref(),
        Some(format!("ECHO {line}").as_str())
    );
    Ok(())
}

#[test]
fn trusted_certificate_upgrades_the_active_stream() -> Result<()> {
    let pki = support::localhost_pki()?;
    let (addr, server) = support::spawn_starttls_server(Arc::clone(&pki.server_config))?;
    let mut channel = Channel::with_tls(support::localhost_config(), support::trusting(&pki.cert)?);
    channel.connect(addr).context("连接 TLS 服务端失败")?;
    negotiate(&mut channel)?;

    let identity = channel.request_secure_stream()?;
    assert_eq!(identity, LayerIdentity::Secure { generation: 1 });
    assert_eq!(channel.request_secure_stream()?, identity, "重复请求返回同一安全层");
    assert_eq!(channel.state(), ChannelState::ConnectedSecure);
    assert!(!channel.is_secure(), "握手前安全层尚未加密");
    assert!(matches!(
        channel.read_line(),
        Err(ChannelError::NotAuthenticated { .. })
    ));
    assert!(channel.peer_certificate().is_none(), "握手前不应有证书信息");

    channel.authenticate_connection().context("TLS 认证失败")?;
    assert!(channel.is_secure());
    assert!(channel.certificate_errors().is_empty());
    assert_eq!(channel.peer_certificate(), Some(&pki.cert));
    assert_eq!(
        channel.certificate_info().map(|info| info.server_name()),
        Some("localhost")
    );
    channel.authenticate_connection()?;

    let plaintext_read = channel.bytes_read();
    echo(&mut channel, "FEAT")?;
    assert!(channel.bytes_read() > plaintext_read + "ECHO FEAT\r\n".len() as u64);
    {
        let stream = channel.active_stream()?;
        assert!(stream.is_secure());
        assert_eq!(stream.identity(), identity);
    }

    channel.disconnect();
    assert!(!channel.is_secure());
    assert!(channel.peer_certificate().is_none());
    assert!(channel.certificate_errors().is_empty());
    assert!(channel.last_teardown_warnings().is_empty());
    let end = join_session(server)?;
    assert!(end.close_notify, "断开时应先发送 close_notify 再关闭传输");
    assert_eq!(end.lines_echoed, 1);
    Ok(())
}

#[test]
fn untrusted_certificate_is_rejected_without_observer() -> Result<()> {
    let pki = support::localhost_pki()?;
    let (addr, _server) = support::spawn_starttls_server(Arc::clone(&pki.server_config))?;
    let mut channel =
        Channel::with_tls(support::localhost_config(), HotReloadingClientConfig::default());
    channel.connect(addr)?;
    negotiate(&mut channel)?;

    let err = channel
        .authenticate_connection()
        .expect_err("空信任根下证书应被拒绝");
    let errors = err.certificate_errors().context("应为证书校验错误")?;
    assert!(errors.contains(CertificateErrors::CHAIN_ERRORS));
    assert!(!errors.contains(CertificateErrors::NAME_MISMATCH));
    assert_eq!(err.category(), ErrorCategory::Security);
    assert_eq!(err.code(), "spark.transport.starttls.certificate_rejected");

    assert!(!channel.is_secure());
    assert_eq!(channel.certificate_errors(), errors, "拒绝后错误集合仍可查询");
    assert_eq!(channel.peer_certificate(), Some(&pki.cert));
    assert!(matches!(
        channel.write_line("PBSZ 0"),
        Err(ChannelError::NotAuthenticated { .. })
    ));

    channel.disconnect();
    assert!(channel.certificate_errors().is_empty());
    assert!(channel.peer_certificate().is_none());
    Ok(())
}

#[test]
fn observer_can_ignore_certificate_errors() -> Result<()> {
    let pki = support::localhost_pki()?;
    let (addr, server) = support::spawn_starttls_server(Arc::clone(&pki.server_config))?;
    let mut channel =
        Channel::with_tls(support::localhost_config(), HotReloadingClientConfig::default());

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        channel.notifier().on_invalid_certificate(move |channel, decision| {
            assert!(channel.connected());
            assert_eq!(channel.certificate_errors(), decision.errors());
            assert!(decision.certificate().is_some());
            assert!(!decision.ignore(), "默认决定为拒绝");
            seen.lock().push(decision.errors());
            decision.set_ignore(true);
        });
    }

    channel.connect(addr)?;
    negotiate(&mut channel)?;
    channel.authenticate_connection().context("观察者放行后认证应成功")?;

    assert!(channel.is_secure());
    assert!(channel.certificate_errors().contains(CertificateErrors::CHAIN_ERRORS));
    assert_eq!(seen.lock().len(), 1, "每次判定只调用一次观察者");
    echo(&mut channel, "PWD")?;

    channel.disconnect();
    assert!(join_session(server)?.close_notify);
    Ok(())
}

#[test]
fn later_observer_overrides_earlier_decision() -> Result<()> {
    let pki = support::localhost_pki()?;
    let (addr, _server) = support::spawn_starttls_server(Arc::clone(&pki.server_config))?;
    let mut channel =
        Channel::with_tls(support::localhost_config(), HotReloadingClientConfig::default());
    channel
        .notifier()
        .on_invalid_certificate(|_, decision| decision.set_ignore(true));
    channel
        .notifier()
        .on_invalid_certificate(|_, decision| decision.set_ignore(false));

    channel.connect(addr)?;
    negotiate(&mut channel)?;
    let err = channel.authenticate_connection().expect_err("最后一个观察者拒绝");
    assert!(matches!(err, ChannelError::CertificateValidation { .. }));
    Ok(())
}

#[test]
fn name_mismatch_is_reported_with_trusted_root() -> Result<()> {
    let pki = support::localhost_pki()?;
    let (addr, _server) = support::spawn_starttls_server(Arc::clone(&pki.server_config))?;
    let config = support::localhost_config().with_tls_server_name("ftp.other.test");
    let mut channel = Channel::with_tls(config, support::trusting(&pki.cert)?);
    channel.connect(addr)?;
    negotiate(&mut channel)?;

    let err = channel.authenticate_connection().expect_err("名称不匹配应被拒绝");
    assert_eq!(err.certificate_errors(), Some(CertificateErrors::NAME_MISMATCH));
    assert_eq!(
        channel.certificate_info().map(|info| info.server_name()),
        Some("ftp.other.test")
    );
    Ok(())
}

#[test]
fn rejected_upgrade_can_be_retried_after_registering_override() -> Result<()> {
    let pki = support::localhost_pki()?;
    let (addr, server) = support::spawn_starttls_server(Arc::clone(&pki.server_config))?;
    let mut channel =
        Channel::with_tls(support::localhost_config(), HotReloadingClientConfig::default());
    channel.connect(addr)?;
    negotiate(&mut channel)?;

    assert!(channel.authenticate_connection().is_err());
    let handshake_bytes = channel.bytes_read();

    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = Arc::clone(&calls);
        channel.notifier().on_invalid_certificate(move |_, decision| {
            calls.fetch_add(1, Ordering::SeqCst);
            decision.set_ignore(true);
        });
    }
    channel.authenticate_connection().context("重试认证失败")?;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(channel.bytes_read(), handshake_bytes, "重试只重做判定，不重新握手");
    assert!(channel.is_secure());
    echo(&mut channel, "SYST")?;

    channel.disconnect();
    assert!(join_session(server)?.close_notify);
    Ok(())
}

#[test]
fn non_tls_peer_fails_the_handshake() -> Result<()> {
    let (addr, _server) = support::spawn_bogus_tls_server()?;
    let mut channel =
        Channel::with_tls(support::localhost_config(), HotReloadingClientConfig::default());
    channel.connect(addr)?;
    negotiate(&mut channel)?;

    let err = channel.authenticate_connection().expect_err("对端不是 TLS");
    assert!(matches!(err, ChannelError::Handshake { .. }), "unexpected error: {err}");
    assert_eq!(err.code(), "spark.transport.starttls.handshake_failed");
    assert!(!channel.is_secure());
    assert!(channel.certificate_errors().is_empty(), "握手失败不产生证书信息");

    channel.disconnect();
    assert!(!channel.connected());
    Ok(())
}

#[test]
fn replaced_tls_settings_apply_to_next_secure_layer() -> Result<()> {
    let pki = support::localhost_pki()?;
    let tls = HotReloadingClientConfig::default();
    let mut channel = Channel::with_tls(support::localhost_config(), tls.clone());

    let (addr, _server) = support::spawn_starttls_server(Arc::clone(&pki.server_config))?;
    channel.connect(addr)?;
    negotiate(&mut channel)?;
    assert!(channel.authenticate_connection().is_err());
    channel.disconnect();

    tls.replace(support::trusting(&pki.cert)?.snapshot());
    let (addr, server) = support::spawn_starttls_server(Arc::clone(&pki.server_config))?;
    channel.connect(addr)?;
    negotiate(&mut channel)?;
    channel.authenticate_connection().context("替换信任根后认证应成功")?;
    assert!(channel.certificate_errors().is_empty());
    echo(&mut channel, "QUIT")?;

    channel.disconnect();
    assert!(join_session(server)?.close_notify);
    Ok(())
}
