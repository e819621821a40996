//! 生命周期通知：四类事件各自独立的观察者列表。
//!
//! 观察者在触发调用的线程上同步执行，按注册顺序依次调用，全部返回后触发调用才返回。
//! 观察者拿到的是 `&Channel`，因此可以在状态迁移途中查询 `connected`、证书错误等，
//! 但无法在回调内注册或移除观察者。

use std::fmt;

use crate::{certificate::CertificateDecision, channel::Channel};

/// 连接、断开、销毁三类事件的观察者签名。
pub type ChannelObserver = dyn FnMut(&Channel) + Send;

/// 证书校验失败时的观察者签名，可通过 [`CertificateDecision::set_ignore`] 放行。
pub type CertificateObserver = dyn FnMut(&Channel, &mut CertificateDecision<'_>) + Send;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Connected,
    Disconnected,
    Disposed,
    InvalidCertificate,
}

/// 注册凭据，用于之后移除对应观察者。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId {
    kind: NotificationKind,
    seq: u64,
}

impl ObserverId {
    pub fn kind(&self) -> NotificationKind {
        self.kind
    }
}

/// 有序观察者列表；空列表即“无观察者”，触发时什么也不做。
pub(crate) struct Observers<F: ?Sized> {
    entries: Vec<(u64, Box<F>)>,
}

impl<F: ?Sized> Observers<F> {
    pub(crate) const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn register(&mut self, seq: u64, observer: Box<F>) {
        self.entries.push((seq, observer));
    }

    fn unregister(&mut self, seq: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(id, _)| *id != seq);
        self.entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<F>> {
        self.entries.iter_mut().map(|(_, observer)| observer)
    }

    /// 分发结束后放回，槽位中已有的条目排在其后。
    fn restore(&mut self, mut taken: Self) {
        taken.entries.append(&mut self.entries);
        *self = taken;
    }
}

impl<F: ?Sized> Default for Observers<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// 通道持有的通知器。
#[derive(Default)]
pub struct LifecycleNotifier {
    next_seq: u64,
    connected: Observers<ChannelObserver>,
    disconnected: Observers<ChannelObserver>,
    disposed: Observers<ChannelObserver>,
    invalid_certificate: Observers<CertificateObserver>,
}

impl LifecycleNotifier {
    pub fn on_connected<F>(&mut self, observer: F) -> ObserverId
    where
        F: FnMut(&Channel) + Send + 'static,
    {
        self.register_channel(NotificationKind::Connected, Box::new(observer))
    }

    pub fn on_disconnected<F>(&mut self, observer: F) -> ObserverId
    where
        F: FnMut(&Channel) + Send + 'static,
    {
        self.register_channel(NotificationKind::Disconnected, Box::new(observer))
    }

    pub fn on_disposed<F>(&mut self, observer: F) -> ObserverId
    where
        F: FnMut(&Channel) + Send + 'static,
    {
        self.register_channel(NotificationKind::Disposed, Box::new(observer))
    }

    pub fn on_invalid_certificate<F>(&mut self, observer: F) -> ObserverId
    where
        F: FnMut(&Channel, &mut CertificateDecision<'_>) + Send + 'static,
    {
        let seq = self.next_seq();
        self.invalid_certificate.register(seq, Box::new(observer));
        ObserverId {
            kind: NotificationKind::InvalidCertificate,
            seq,
        }
    }

    /// 移除观察者；凭据已失效时返回 `false`。
    pub fn remove(&mut self, id: ObserverId) -> bool {
        match id.kind {
            NotificationKind::InvalidCertificate => self.invalid_certificate.unregister(id.seq),
            kind => self
                .channel_observers(kind)
                .is_some_and(|observers| observers.unregister(id.seq)),
        }
    }

    pub fn observer_count(&self, kind: NotificationKind) -> usize {
        match kind {
            NotificationKind::Connected => self.connected.len(),
            NotificationKind::Disconnected => self.disconnected.len(),
            NotificationKind::Disposed => self.disposed.len(),
            NotificationKind::InvalidCertificate => self.invalid_certificate.len(),
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn register_channel(
        &mut self,
        kind: NotificationKind,
        observer: Box<ChannelObserver>,
    ) -> ObserverId {
        let seq = self.next_seq();
        if let Some(observers) = self.channel_observers(kind) {
            observers.register(seq, observer);
        }
        ObserverId { kind, seq }
    }

    fn channel_observers(
        &mut self,
        kind: NotificationKind,
    ) -> Option<&mut Observers<ChannelObserver>> {
        match kind {
            NotificationKind::Connected => Some(&mut self.connected),
            NotificationKind::Disconnected => Some(&mut self.disconnected),
            NotificationKind::Disposed => Some(&mut self.disposed),
            NotificationKind::InvalidCertificate => None,
        }
    }

    /// 取出某类观察者以便在只借用通道的情况下分发。
    pub(crate) fn take_channel_observers(
        &mut self,
        kind: NotificationKind,
    ) -> Observers<ChannelObserver> {
        self.channel_observers(kind)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    pub(crate) fn restore_channel_observers(
        &mut self,
        kind: NotificationKind,
        taken: Observers<ChannelObserver>,
    ) {
        if let Some(observers) = self.channel_observers(kind) {
            observers.restore(taken);
        }
    }

    pub(crate) fn take_certificate_observers(&mut self) -> Observers<CertificateObserver> {
        std::mem::take(&mut self.invalid_certificate)
    }

    pub(crate) fn restore_certificate_observers(&mut self, taken: Observers<CertificateObserver>) {
        self.invalid_certificate.restore(taken);
    }
}

impl fmt::Debug for LifecycleNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleNotifier")
            .field("connected", &self.connected.len())
            .field("disconnected", &self.disconnected.len())
            .field("disposed", &self.disposed.len())
            .field("invalid_certificate", &self.invalid_certificate.len())
            .finish()
    }
}
