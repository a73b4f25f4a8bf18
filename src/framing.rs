use bytes::{Bytes, BytesMut};
use tracing::trace;

/// Undelivered inbound bytes, segmented into messages.
///
/// With a non-empty delimiter, a message is everything up to (and excluding) the next delimiter.
///  With an empty delimiter the buffer is in raw mode, and the whole buffer is one message.
///
/// Bytes are never dropped: every appended byte is returned by exactly one [FramingBuffer::read]
///  (or discarded explicitly by [FramingBuffer::clear]).
pub struct FramingBuffer {
    buf: BytesMut,
    delimiter: Bytes,
}

impl FramingBuffer {
    pub fn new(delimiter: impl Into<Bytes>) -> FramingBuffer {
        FramingBuffer {
            buf: BytesMut::new(),
            delimiter: delimiter.into(),
        }
    }

    pub fn is_raw(&self) -> bool {
        self.delimiter.is_empty()
    }

    pub fn append(&mut self, chunk: &[u8]) {
        trace!("appending {} bytes to framing buffer of {} bytes", chunk.len(), self.buf.len());
        self.buf.extend_from_slice(chunk);
    }

    /// Removes and returns the first complete message, without its delimiter
    pub fn read(&mut self) -> Option<Bytes> {
        if self.is_raw() {
            if self.buf.is_empty() {
                return None;
            }
            return Some(self.buf.split().freeze());
        }

        let pos = self.find_delimiter(0)?;
        let msg = self.buf.split_to(pos).freeze();
        let _ = self.buf.split_to(self.delimiter.len());
        Some(msg)
    }

    /// Delimited mode: the number of complete messages. Raw mode: the number of buffered bytes.
    pub fn available(&self) -> usize {
        if self.is_raw() {
            return self.buf.len();
        }

        let mut count = 0;
        let mut offset = 0;
        while let Some(pos) = self.find_delimiter(offset) {
            count += 1;
            offset = pos + self.delimiter.len();
        }
        count
    }

    /// Puts a message that was read but could not be delivered back at the front of the buffer,
    ///  restoring the delimiter it was read with.
    pub fn unread(&mut self, msg: &[u8]) {
        let mut restored = BytesMut::with_capacity(msg.len() + self.delimiter.len() + self.buf.len());
        restored.extend_from_slice(msg);
        if !self.is_raw() {
            restored.extend_from_slice(&self.delimiter);
        }
        restored.extend_from_slice(&self.buf);
        self.buf = restored;
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Removes all complete messages, in order
    pub fn drain(&mut self) -> Vec<Bytes> {
        let mut result = Vec::new();
        while let Some(msg) = self.read() {
            result.push(msg);
        }
        result
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn find_delimiter(&self, from: usize) -> Option<usize> {
        if from >= self.buf.len() {
            return None;
        }
        self.buf[from..]
            .windows(self.delimiter.len())
            .position(|w| w == self.delimiter.as_ref())
            .map(|pos| pos + from)
    }
}
