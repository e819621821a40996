//! 证书信息与两阶段信任决策的第二阶段。
//!
//! 第一阶段（握手期间的校验回调，见 `verifier` 模块）只记录、永远放行；
//! 本模块的 [`decide`] 在握手完成后被调用一次，是真正拒绝证书的地方。
//! “回调放行”不代表“证书可信”。

use std::{
    fmt,
    ops::{BitOr, BitOrAssign},
};

use rustls::pki_types::CertificateDer;

/// 证书校验错误集合（位集）。
///
/// 三类错误可以同时出现，例如自签名证书同时签发给了错误的主机名。
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CertificateErrors(u8);

impl CertificateErrors {
    pub const NONE: Self = Self(0);
    /// 对端未提供证书。
    pub const NOT_AVAILABLE: Self = Self(1);
    /// 证书未签发给所连接的主机名。
    pub const NAME_MISMATCH: Self = Self(1 << 1);
    /// 证书链无法追溯到受信任根，或已过期、被吊销、签名无效。
    pub const CHAIN_ERRORS: Self = Self(1 << 2);

    const NAMED: [(Self, &'static str); 3] = [
        (Self::NOT_AVAILABLE, "NOT_AVAILABLE"),
        (Self::NAME_MISMATCH, "NAME_MISMATCH"),
        (Self::CHAIN_ERRORS, "CHAIN_ERRORS"),
    ];

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for CertificateErrors {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CertificateErrors {
    fn bitor_assign(&mut self, rhs: Self) {
        self.insert(rhs);
    }
}

impl fmt::Display for CertificateErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (flag, name) in Self::NAMED {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for CertificateErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertificateErrors({self})")
    }
}

/// 一次安全层握手记录下的对端证书与校验结果。
///
/// 每个安全层只写入一次；断开连接时清空。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateInfo {
    server_name: String,
    end_entity: Option<CertificateDer<'static>>,
    intermediates: Vec<CertificateDer<'static>>,
    errors: CertificateErrors,
    details: Vec<String>,
}

impl CertificateInfo {
    pub(crate) fn new(
        server_name: String,
        end_entity: CertificateDer<'static>,
        intermediates: Vec<CertificateDer<'static>>,
        errors: CertificateErrors,
        details: Vec<String>,
    ) -> Self {
        Self {
            server_name,
            end_entity: Some(end_entity),
            intermediates,
            errors,
            details,
        }
    }

    /// 握手完成但校验回调从未收到证书时的记录。
    pub(crate) fn not_available(server_name: String) -> Self {
        Self {
            server_name,
            end_entity: None,
            intermediates: Vec::new(),
            errors: CertificateErrors::NOT_AVAILABLE,
            details: vec!["peer presented no certificate".to_owned()],
        }
    }

    /// 校验时使用的主机名（SNI 与名称匹配共用）。
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn peer_certificate(&self) -> Option<&CertificateDer<'static>> {
        self.end_entity.as_ref()
    }

    pub fn intermediates(&self) -> &[CertificateDer<'static>] {
        &self.intermediates
    }

    pub fn errors(&self) -> CertificateErrors {
        self.errors
    }

    /// 底层校验器给出的逐条原因，供日志与排障使用。
    pub fn details(&self) -> &[String] {
        &self.details
    }
}

/// 交给 invalid-certificate 观察者的决策对象，默认“不忽略”（即拒绝）。
#[derive(Debug)]
pub struct CertificateDecision<'a> {
    info: &'a CertificateInfo,
    ignore: bool,
}

impl<'a> CertificateDecision<'a> {
    pub(crate) fn new(info: &'a CertificateInfo) -> Self {
        Self {
            info,
            ignore: false,
        }
    }

    pub fn certificate(&self) -> Option<&'a CertificateDer<'static>> {
        self.info.peer_certificate()
    }

    pub fn errors(&self) -> CertificateErrors {
        self.info.errors()
    }

    pub fn info(&self) -> &'a CertificateInfo {
        self.info
    }

    /// 覆盖决策：为 `true` 时忽略校验错误，认证照常成功。
    ///
    /// 多个观察者依注册顺序写入，最后一次写入生效。
    pub fn set_ignore(&mut self, ignore: bool) {
        self.ignore = ignore;
    }

    pub fn ignore(&self) -> bool {
        self.ignore
    }
}

/// 第二阶段信任判定的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrustVerdict {
    Accept,
    Reject,
}

/// 握手后的信任判定：无错误或观察者显式忽略时接受，否则拒绝。
pub fn decide(errors: CertificateErrors, observer_override: bool) -> TrustVerdict {
    if errors.is_empty() || observer_override {
        TrustVerdict::Accept
    } else {
        TrustVerdict::Reject
    }
}
