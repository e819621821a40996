//! 集成测试共用的环回服务端与证书工具。
//!
//! 服务端全部基于阻塞 `std::net` 与 `rustls::ServerConnection`，在独立线程中运行；
//! 每个连接都设置读超时，避免客户端断言失败时测试进程挂死。

#![allow(dead_code)]

use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use rustls::{
    RootCertStore, ServerConfig, ServerConnection, StreamOwned,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
};
use spark_transport_starttls::{
    ChannelConfig, HotReloadingClientConfig, TlsClientSettings,
};

pub const SERVER_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// 自签名证书及据此构造的服务端配置。
pub struct TestPki {
    pub cert: CertificateDer<'static>,
    pub server_config: Arc<ServerConfig>,
}

pub fn localhost_pki() -> Result<TestPki> {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])
        .context("生成自签名证书失败")?;
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    let server_config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .context("选择协议版本失败")?
            .with_no_client_auth()
            .with_single_cert(vec![cert.clone()], key)
            .context("装载服务端证书失败")?;
    Ok(TestPki {
        cert,
        server_config: Arc::new(server_config),
    })
}

/// 只信任给定证书的客户端参数。
pub fn trusting(cert: &CertificateDer<'static>) -> Result<HotReloadingClientConfig> {
    let mut roots = RootCertStore::empty();
    roots
        .add(cert.clone())
        .context("将自签名证书加入 RootCertStore 失败")?;
    Ok(HotReloadingClientConfig::from_settings(TlsClientSettings::new(roots)))
}

/// 客户端连接 127.0.0.1，但以 `localhost` 作为证书名称。
pub fn localhost_config() -> ChannelConfig {
    ChannelConfig::default().with_tls_server_name("localhost")
}

/// 逐字节读取一行，保证不会越过行尾多读（之后的字节可能属于 TLS 握手）。
///
/// 只有 `Ok(0)` 视为对端正常关闭；TLS 流在缺少 `close_notify` 时返回的
/// `UnexpectedEof` 原样上抛。
pub fn read_line_exact<R: Read>(source: &mut R) -> io::Result<Option<String>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match source.read(&mut byte) {
            Ok(0) if line.is_empty() => return Ok(None),
            Ok(0) => break,
            Ok(_) if byte[0] == b'\n' => break,
            Ok(_) => line.push(byte[0]),
            Err(err) => return Err(err),
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

fn echo_lines<S: Read + Write>(stream: &mut S, echoed: &mut usize) -> io::Result<()> {
    while let Some(line) = read_line_exact(stream)? {
        stream.write_all(format!("ECHO {line}\r\n").as_bytes())?;
        stream.flush()?;
        *echoed += 1;
    }
    Ok(())
}

/// TLS 会话的结束方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsSessionEnd {
    pub lines_echoed: usize,
    /// 客户端在关闭传输前发送了 `close_notify`。
    pub close_notify: bool,
}

fn bind_loopback() -> Result<TcpListener> {
    TcpListener::bind("127.0.0.1:0").context("绑定环回监听失败")
}

/// 明文服务端：每个连接先发送 `220 <banner> #<序号>`，随后逐行回显，直到对端关闭。
pub fn spawn_plain_server(banner: &'static str) -> Result<SocketAddr> {
    let listener = bind_loopback()?;
    let addr = listener.local_addr()?;
    thread::spawn(move || {
        for (index, stream) in listener.incoming().enumerate() {
            let Ok(mut stream) = stream else { continue };
            thread::spawn(move || -> io::Result<()> {
                stream.set_read_timeout(Some(SERVER_IO_TIMEOUT))?;
                stream.write_all(format!("220 {banner} #{}\r\n", index + 1).as_bytes())?;
                echo_lines(&mut stream, &mut 0)
            });
        }
    });
    Ok(addr)
}

/// 接受连接但从不发送任何字节的服务端，用于读超时测试。
pub fn spawn_silent_server() -> Result<SocketAddr> {
    let listener = bind_loopback()?;
    let addr = listener.local_addr()?;
    thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming().flatten() {
            held.push(stream);
        }
    });
    Ok(addr)
}

/// 接受一个连接、发送问候后立即关闭。
pub fn spawn_closing_server() -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
    let listener = bind_loopback()?;
    let addr = listener.local_addr()?;
    let handle = thread::spawn(move || -> Result<()> {
        let (mut stream, _) = listener.accept().context("接受连接失败")?;
        stream.write_all(b"421 closing\r\n")?;
        Ok(())
    });
    Ok((addr, handle))
}

/// 显式 TLS 服务端：`220` 问候，收到 `AUTH TLS` 回复 `234`，随后在 TLS 上逐行回显。
///
/// 客户端未发送 `close_notify` 就关闭传输时，线程返回 `close_notify: false`；
/// 其余 I/O 错误作为会话失败返回。
pub fn spawn_starttls_server(
    config: Arc<ServerConfig>,
) -> Result<(SocketAddr, JoinHandle<Result<TlsSessionEnd>>)> {
    let listener = bind_loopback()?;
    let addr = listener.local_addr()?;
    let handle = thread::spawn(move || -> Result<TlsSessionEnd> {
        let (mut stream, _) = listener.accept().context("接受连接失败")?;
        stream.set_read_timeout(Some(SERVER_IO_TIMEOUT))?;
        negotiate_auth_tls(&mut stream)?;
        let session = ServerConnection::new(config).context("创建服务端 TLS 会话失败")?;
        let mut tls = StreamOwned::new(session, stream);
        let mut lines_echoed = 0;
        let close_notify = match echo_lines(&mut tls, &mut lines_echoed) {
            Ok(()) => true,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => false,
            Err(err) => return Err(err).context("TLS 回显失败"),
        };
        Ok(TlsSessionEnd {
            lines_echoed,
            close_notify,
        })
    });
    Ok((addr, handle))
}

/// 回复 `234` 之后发送非 TLS 字节的服务端，用于握手失败测试。
pub fn spawn_bogus_tls_server() -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
    let listener = bind_loopback()?;
    let addr = listener.local_addr()?;
    let handle = thread::spawn(move || -> Result<()> {
        let (mut stream, _) = listener.accept().context("接受连接失败")?;
        stream.set_read_timeout(Some(SERVER_IO_TIMEOUT))?;
        negotiate_auth_tls(&mut stream)?;
        let mut client_hello = [0u8; 512];
        let _ = stream.read(&mut client_hello)?;
        stream.write_all(b"this is definitely not a tls record\r\n")?;
        Ok(())
    });
    Ok((addr, handle))
}

fn negotiate_auth_tls(stream: &mut TcpStream) -> Result<()> {
    stream.write_all(b"220 starttls test server\r\n")?;
    match read_line_exact(stream)? {
        Some(line) if line == "AUTH TLS" => {}
        other => bail!("期望 AUTH TLS，实际收到 {other:?}"),
    }
    stream.write_all(b"234 AUTH TLS successful\r\n")?;
    Ok(())
}
