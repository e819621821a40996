use std::io::{self, Read, Write};

use rustls::ClientConnection;

use crate::{layers::PlainStream, reader::BufferedReader};

/// 活动流的身份：哪一代连接的哪一层。
///
/// 同一代内重复请求安全流返回同一身份；重连后代号递增，旧身份不再匹配任何层。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LayerIdentity {
    Plain { generation: u64 },
    Secure { generation: u64 },
}

impl LayerIdentity {
    pub fn generation(self) -> u64 {
        match self {
            LayerIdentity::Plain { generation } | LayerIdentity::Secure { generation } => generation,
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, LayerIdentity::Secure { .. })
    }
}

/// 当前最外层活动流的借用视图。
///
/// 安全层已认证时所有读写经过 TLS 会话，否则直接落在明文流层上；
/// 调用方无需关心当前处于哪种模式。若读取器中还有尚未交付的字节，`read` 先交付它们。
pub struct ActiveStream<'a> {
    route: Route<'a>,
    identity: LayerIdentity,
    pending: Option<&'a mut BufferedReader>,
}

enum Route<'a> {
    Plain(PlainStream<'a>),
    Secure {
        session: &'a mut ClientConnection,
        io: PlainStream<'a>,
    },
}

impl<'a> ActiveStream<'a> {
    pub(crate) fn plain(io: PlainStream<'a>, identity: LayerIdentity) -> Self {
        Self {
            route: Route::Plain(io),
            identity,
            pending: None,
        }
    }

    pub(crate) fn secure(
        session: &'a mut ClientConnection,
        io: PlainStream<'a>,
        identity: LayerIdentity,
    ) -> Self {
        Self {
            route: Route::Secure { session, io },
            identity,
            pending: None,
        }
    }

    pub(crate) fn with_pending(mut self, reader: &'a mut BufferedReader) -> Self {
        self.pending = Some(reader);
        self
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.route, Route::Secure { .. })
    }

    pub fn identity(&self) -> LayerIdentity {
        self.identity
    }
}

impl Read for ActiveStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(reader) = self.pending.as_deref_mut()
            && reader.buffered() > 0
        {
            return Ok(reader.drain_into(buf));
        }
        match &mut self.route {
            Route::Plain(io) => io.read(buf),
            Route::Secure { session, io } => rustls::Stream::new(&mut **session, io).read(buf),
        }
    }
}

impl Write for ActiveStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.route {
            Route::Plain(io) => io.write(buf),
            Route::Secure { session, io } => rustls::Stream::new(&mut **session, io).write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.route {
            Route::Plain(io) => io.flush(),
            Route::Secure { session, io } => rustls::Stream::new(&mut **session, io).flush(),
        }
    }
}
