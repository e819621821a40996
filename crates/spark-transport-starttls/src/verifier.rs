use std::sync::Arc;

use parking_lot::Mutex;
use rustls::{
    DigitallySignedStruct, Error as RustlsError, RootCertStore, SignatureScheme,
    client::{
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        verify_server_cert_signed_by_trust_anchor, verify_server_name,
    },
    crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, ServerName, UnixTime},
    server::ParsedCertificate,
};

use crate::certificate::{CertificateErrors, CertificateInfo};

/// 握手回调与通道之间共享的证书记录槽。
pub(crate) type CertificateSlot = Arc<Mutex<Option<CertificateInfo>>>;

/// 两阶段信任协议的第一阶段：校验并记录，但始终向 rustls 报告通过。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - rustls 在回调返回错误时直接中止握手，调用方只能拿到一个笼统的 `InvalidCertificate`，
///   既看不到证书本身，也无法让策略层“看过之后放行”；
/// - 因此回调只负责把校验结果写入 [`CertificateSlot`]，拒绝与否延后到握手完成后的
///   [`crate::certificate::decide`]。
///
/// ## 逻辑（How）
/// - 证书链与主机名分两次独立校验，两类错误可同时记录；
/// - 握手签名（TLS1.2/1.3 的 CertificateVerify）仍按 provider 的算法严格验证：
///   签名不成立意味着对端不持有私钥，属于握手失败而非信任问题。
///
/// ## 契约（What）
/// - `verify_server_cert` 永远返回 `Ok(ServerCertVerified::assertion())`；
/// - 每次调用覆盖写入槽位，槽位由安全层在握手后取走。
#[derive(Debug)]
pub(crate) struct DeferredVerifier {
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
    slot: CertificateSlot,
}

impl DeferredVerifier {
    pub(crate) fn new(
        roots: Arc<RootCertStore>,
        provider: Arc<CryptoProvider>,
        slot: CertificateSlot,
    ) -> Self {
        Self {
            roots,
            provider,
            slot,
        }
    }

    fn evaluate(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        now: UnixTime,
    ) -> (CertificateErrors, Vec<String>) {
        let mut errors = CertificateErrors::NONE;
        let mut details = Vec::new();

        let parsed = match ParsedCertificate::try_from(end_entity) {
            Ok(parsed) => parsed,
            Err(err) => {
                errors |= CertificateErrors::CHAIN_ERRORS;
                details.push(format!("unparsable end-entity certificate: {err}"));
                return (errors, details);
            }
        };

        if let Err(err) = verify_server_cert_signed_by_trust_anchor(
            &parsed,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        ) {
            errors |= CertificateErrors::CHAIN_ERRORS;
            details.push(err.to_string());
        }

        if let Err(err) = verify_server_name(&parsed, server_name) {
            errors |= CertificateErrors::NAME_MISMATCH;
            details.push(err.to_string());
        }

        (errors, details)
    }
}

impl ServerCertVerifier for DeferredVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        let (errors, details) = self.evaluate(end_entity, intermediates, server_name, now);
        let info = CertificateInfo::new(
            server_name.to_str().into_owned(),
            end_entity.clone().into_owned(),
            intermediates
                .iter()
                .map(|cert| cert.clone().into_owned())
                .collect(),
            errors,
            details,
        );
        *self.slot.lock() = Some(info);
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier_with(roots: RootCertStore) -> (DeferredVerifier, CertificateSlot) {
        let slot = CertificateSlot::default();
        let verifier = DeferredVerifier::new(
            Arc::new(roots),
            Arc::new(rustls::crypto::ring::default_provider()),
            slot.clone(),
        );
        (verifier, slot)
    }

    fn self_signed(host: &str) -> CertificateDer<'static> {
        let cert = rcgen::generate_simple_self_signed([host.to_owned()]).expect("生成自签名证书失败");
        cert.cert.der().clone()
    }

    #[test]
    fn untrusted_and_misnamed_certificate_is_recorded_but_accepted() {
        let (verifier, slot) = verifier_with(RootCertStore::empty());
        let cert = self_signed("alpha.test");
        let name = ServerName::try_from("beta.test").expect("合法主机名");

        let verdict = verifier.verify_server_cert(&cert, &[], &name, &[], UnixTime::now());
        assert!(verdict.is_ok(), "第一阶段必须始终放行");

        let info = slot.lock().take().expect("校验结果应写入槽位");
        assert_eq!(
            info.errors(),
            CertificateErrors::CHAIN_ERRORS | CertificateErrors::NAME_MISMATCH
        );
        assert_eq!(info.server_name(), "beta.test");
        assert_eq!(info.peer_certificate(), Some(&cert));
        assert_eq!(info.details().len(), 2);
    }

    #[test]
    fn trusted_certificate_records_empty_error_set() {
        let cert = self_signed("alpha.test");
        let mut roots = RootCertStore::empty();
        roots.add(cert.clone()).expect("加入根证书失败");
        let (verifier, slot) = verifier_with(roots);
        let name = ServerName::try_from("alpha.test").expect("合法主机名");

        verifier
            .verify_server_cert(&cert, &[], &name, &[], UnixTime::now())
            .expect("第一阶段必须始终放行");

        let info = slot.lock().take().expect("校验结果应写入槽位");
        assert!(info.errors().is_empty(), "unexpected: {:?}", info.details());
    }
}
