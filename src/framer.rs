//! Line framing for the reply stream.
//!
//! The serial driver hands over whatever bytes it happened to read, so a
//! single reply may arrive split across several chunks, or several replies in
//! one chunk. [`LineFramer`] reassembles them into newline-terminated lines:
//!
//! - printable ASCII (0x20..=0x7E) is accumulated
//! - `\r` is dropped
//! - `\n` completes the line
//! - every other byte is dropped
//!
//! Lines longer than the configured cap are discarded whole; the framer skips
//! input until the next `\n` so a truncated fragment is never mistaken for a
//! reply.

use tracing::warn;

/// Reassembles newline-terminated lines from arbitrarily chunked bytes.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    max_line_bytes: usize,
    /// Set while skipping the remainder of an oversized line.
    overflowed: bool,
}

impl LineFramer {
    /// Creates a framer that discards lines longer than `max_line_bytes`.
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_line_bytes.min(256)),
            max_line_bytes,
            overflowed: false,
        }
    }

    /// Feed one chunk, calling `emit` once per completed line.
    pub fn feed(&mut self, chunk: &[u8], mut emit: impl FnMut(String)) {
        for &byte in chunk {
            match byte {
                b'\n' => {
                    if self.overflowed {
                        self.overflowed = false;
                    } else {
                        emit(String::from_utf8_lossy(&self.buf).into_owned());
                    }
                    self.buf.clear();
                }
                b'\r' => {}
                0x20..=0x7e => {
                    if self.overflowed {
                        continue;
                    }
                    if self.buf.len() >= self.max_line_bytes {
                        warn!(
                            max_line_bytes = self.max_line_bytes,
                            "Reply line exceeds cap, discarding until next newline"
                        );
                        self.buf.clear();
                        self.overflowed = true;
                        continue;
                    }
                    self.buf.push(byte);
                }
                _ => {}
            }
        }
    }

    /// Convenience wrapper collecting the lines completed by `chunk`.
    pub fn feed_collect(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        self.feed(chunk, |line| lines.push(line));
        lines
    }

    /// Bytes of the line currently being accumulated.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Forget any partial line, e.g. when the port is reopened.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.overflowed = false;
    }
}
