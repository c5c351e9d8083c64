//! # Reused send arena
//!
//! The continuous-memory data path assembles every packet of a batch back
//! to back in one buffer owned by the connection. Exactly one party holds
//! the buffer at a time: `obtain` moves it out, `release` moves it back.
//! Obtaining twice, or releasing while the accessor still holds a buffer,
//! is a programming error and panics immediately.

use bytes::BytesMut;

#[derive(Debug)]
pub struct SendBufAccessor {
    buf: Option<BytesMut>,
    capacity: usize,
}

impl SendBufAccessor {
    pub fn new(capacity: usize) -> Self {
        SendBufAccessor {
            buf: Some(BytesMut::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn owns_buffer(&self) -> bool {
        self.buf.is_some()
    }

    /// Take the buffer. Panics if it is already out.
    pub fn obtain(&mut self) -> BytesMut {
        match self.buf.take() {
            Some(buf) => buf,
            None => panic!("send buffer obtained twice without release"),
        }
    }

    /// Hand the buffer back. Panics if the accessor already holds one.
    pub fn release(&mut self, buf: BytesMut) {
        assert!(
            self.buf.is_none(),
            "send buffer released while accessor still owns one"
        );
        self.buf = Some(buf);
    }

    /// Scoped obtain → `f` → release.
    pub fn with_buf<R>(&mut self, f: impl FnOnce(&mut BytesMut) -> R) -> R {
        let mut buf = self.obtain();
        let out = f(&mut buf);
        self.release(buf);
        out
    }

    /// Bytes currently queued in the arena.
    pub fn len(&self) -> usize {
        match &self.buf {
            Some(buf) => buf.len(),
            None => panic!("send buffer length read while it is obtained"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queued bytes, for the socket write. Panics while the buffer is out.
    pub fn data(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => buf,
            None => panic!("send buffer read while it is obtained"),
        }
    }

    /// Drop the first `n` bytes after they were flushed, keeping anything
    /// queued behind them.
    pub fn consume(&mut self, n: usize) {
        let capacity = self.capacity;
        self.with_buf(|buf| {
            let n = n.min(buf.len());
            if n == buf.len() {
                buf.clear();
            } else {
                let tail = buf.split_off(n);
                buf.clear();
                buf.extend_from_slice(&tail);
            }
            buf.reserve(capacity);
        });
    }

    /// Drop everything past `len`. Used to undo a failed build.
    pub fn rollback_to(&mut self, len: usize) {
        self.with_buf(|buf| buf.truncate(len));
    }

    /// Empty the arena after a flush, keeping its allocation.
    pub fn clear(&mut self) {
        let capacity = self.capacity;
        self.with_buf(|buf| {
            buf.clear();
            buf.reserve(capacity);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obtain_release_cycle() {
        let mut acc = SendBufAccessor::new(64);
        let mut buf = acc.obtain();
        assert!(!acc.owns_buffer());
        buf.extend_from_slice(b"abc");
        acc.release(buf);
        assert!(acc.owns_buffer());
        assert_eq!(acc.len(), 3);
    }

    #[test]
    fn rollback_restores_length() {
        let mut acc = SendBufAccessor::new(64);
        acc.with_buf(|b| b.extend_from_slice(b"first"));
        let before = acc.len();
        acc.with_buf(|b| b.extend_from_slice(b"second"));
        acc.rollback_to(before);
        assert_eq!(acc.len(), before);
    }

    #[test]
    fn consume_keeps_tail() {
        let mut acc = SendBufAccessor::new(64);
        acc.with_buf(|b| b.extend_from_slice(b"flushednext"));
        acc.consume(7);
        assert_eq!(acc.data(), b"next");
        acc.consume(4);
        assert!(acc.is_empty());
    }

    #[test]
    #[should_panic(expected = "obtained twice")]
    fn double_obtain_panics() {
        let mut acc = SendBufAccessor::new(8);
        let _a = acc.obtain();
        let _b = acc.obtain();
    }

    #[test]
    #[should_panic(expected = "still owns")]
    fn double_release_panics() {
        let mut acc = SendBufAccessor::new(8);
        acc.release(BytesMut::new());
    }
}
