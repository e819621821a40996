use std::io::{self, Read};

use bytes::{Buf, BytesMut};

use crate::stream::LayerIdentity;

const READ_CHUNK: usize = 4096;

/// 面向文本行的读取缓冲，绑定到某一代的某一层活动流。
///
/// 绑定关系用 [`LayerIdentity`] 表示而不是借用：读取器本身不持有流，
/// 每次读取时由通道传入当前活动流；身份不一致即视为失效，整体丢弃重建。
#[derive(Debug)]
pub(crate) struct BufferedReader {
    bound_to: LayerIdentity,
    buffer: BytesMut,
    max_line_length: usize,
}

impl BufferedReader {
    pub(crate) fn new(bound_to: LayerIdentity, max_line_length: usize) -> Self {
        Self {
            bound_to,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            max_line_length,
        }
    }

    /// 取出绑定到 `identity` 的读取器，槽位为空或绑定已过期时重建。
    pub(crate) fn bind(
        slot: &mut Option<Self>,
        identity: LayerIdentity,
        max_line_length: usize,
    ) -> &mut Self {
        if slot
            .as_ref()
            .is_some_and(|reader| reader.bound_to != identity)
        {
            *slot = None;
        }
        let reader = slot.get_or_insert_with(|| Self::new(identity, max_line_length));
        reader.max_line_length = max_line_length;
        reader
    }

    pub(crate) fn bound_to(&self) -> LayerIdentity {
        self.bound_to
    }

    pub(crate) fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// 读取一行，去掉结尾的 `\n` 或 `\r\n`；流结束且无残留数据时返回 `None`。
    ///
    /// 读超时等错误发生时，已缓冲的半行保留在缓冲区，下次调用继续拼接。
    /// 行内容超过 `max_line_length` 时丢弃已缓冲的部分并返回 `InvalidData`，
    /// 此后流已失去行同步，调用方应断开。
    pub(crate) fn read_line<R>(&mut self, source: &mut R) -> io::Result<Option<String>>
    where
        R: Read + ?Sized,
    {
        let mut scanned = 0;
        loop {
            if let Some(offset) = self.buffer[scanned..].iter().position(|byte| *byte == b'\n') {
                let end = scanned + offset;
                let line = self.buffer.split_to(end + 1);
                if end > self.max_line_length {
                    return Err(self.line_too_long(end));
                }
                return Ok(Some(decode_line(&line)));
            }
            scanned = self.buffer.len();
            if scanned > self.max_line_length {
                self.buffer.clear();
                return Err(self.line_too_long(scanned));
            }
            if self.fill(source)? == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let rest = self.buffer.split();
                return Ok(Some(decode_line(&rest)));
            }
        }
    }

    /// 先交付缓冲区里的字节，缓冲区为空时才直接读取活动流。
    pub(crate) fn read<R>(&mut self, source: &mut R, buf: &mut [u8]) -> io::Result<usize>
    where
        R: Read + ?Sized,
    {
        if self.buffer.is_empty() {
            return source.read(buf);
        }
        Ok(self.drain_into(buf))
    }

    pub(crate) fn drain_into(&mut self, buf: &mut [u8]) -> usize {
        let len = buf.len().min(self.buffer.len());
        buf[..len].copy_from_slice(&self.buffer[..len]);
        self.buffer.advance(len);
        len
    }

    fn line_too_long(&self, length: usize) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "line length {length} exceeds limit {}",
                self.max_line_length
            ),
        )
    }

    fn fill<R>(&mut self, source: &mut R) -> io::Result<usize>
    where
        R: Read + ?Sized,
    {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match source.read(&mut chunk) {
                Ok(read) => {
                    self.buffer.extend_from_slice(&chunk[..read]);
                    return Ok(read);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}
