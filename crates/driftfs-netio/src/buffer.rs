//! Byte buffer for connection I/O
//!
//! `IoBuffer` is the unit of exchange between the event loop and the
//! state machines: the loop appends received bytes to a connection's
//! input buffer, and drains whatever the state machine wrote to the
//! output buffer. Header blocks are `Key: value` lines terminated by an
//! empty line; `find_header_end` locates that boundary.

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

/// Growable byte buffer with consume-from-the-front semantics.
#[derive(Default)]
pub struct IoBuffer {
    data: BytesMut,
}

impl IoBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes available for consumption.
    pub fn bytes_consumable(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append received or serialized bytes.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
    }

    /// Contiguous view of the unconsumed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Copy up to `out.len()` bytes from the front without consuming.
    /// Returns the number of bytes copied.
    pub fn copy_out(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.data.len());
        out[..n].copy_from_slice(&self.data[..n]);
        n
    }

    /// Drop `n` bytes from the front. `n` beyond the buffered length
    /// clears the buffer.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.advance(n);
    }

    /// Remove and return `n` bytes from the front.
    pub fn split_to(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.data.len());
        self.data.split_to(n).to_vec()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Length of the leading header block including its blank-line
    /// terminator, if a complete block is buffered. Both `\r\n\r\n` and
    /// `\n\n` terminators are recognized.
    pub fn find_header_end(&self) -> Option<usize> {
        let data = &self.data[..];
        let mut i = 0;
        while i < data.len() {
            if data[i] == b'\n' {
                if i + 1 < data.len() && data[i + 1] == b'\n' {
                    return Some(i + 2);
                }
                if i + 2 < data.len() && data[i + 1] == b'\r' && data[i + 2] == b'\n' {
                    return Some(i + 3);
                }
            }
            i += 1;
        }
        None
    }

    /// Iterate over the lines of the first `len` bytes, for request and
    /// response tracing.
    pub fn lines(&self, len: usize) -> impl Iterator<Item = &str> {
        let len = len.min(self.data.len());
        self.data[..len]
            .split(|&b| b == b'\n')
            .filter(|l| !l.is_empty())
            .map(|l| {
                let l = if l.last() == Some(&b'\r') {
                    &l[..l.len() - 1]
                } else {
                    l
                };
                std::str::from_utf8(l).unwrap_or("<binary>")
            })
    }
}

impl fmt::Write for IoBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.data.put_slice(s.as_bytes());
        Ok(())
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IoBuffer({} bytes)", self.data.len())
    }
}
