//! Growable byte buffer shared by the parsers and connections.
//!
//! Storage is a [`BytesMut`] that grows in steps of a configurable increment
//! and never shrinks unless [`Buffer::free`] or [`Buffer::shrink_to`] is called.

use std::fmt;

use bytes::{Bytes, BytesMut};

/// Default growth step in bytes.
pub const DEFAULT_INCREMENT: usize = 512;

#[derive(Clone)]
pub struct Buffer {
    data: BytesMut,
    increment: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_increment(DEFAULT_INCREMENT)
    }

    pub fn with_increment(increment: usize) -> Self {
        Self {
            data: BytesMut::new(),
            increment: increment.max(1),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut buf = Self::new();
        buf.reserve(capacity);
        buf
    }

    pub fn set_increment(&mut self, increment: usize) {
        self.increment = increment.max(1);
    }

    /// Number of bytes in use.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Makes room for `additional` bytes, rounding the new capacity up to the increment.
    pub fn reserve(&mut self, additional: usize) {
        let free = self.data.capacity() - self.data.len();
        if free >= additional {
            return;
        }

        let needed = additional - free;
        let steps = needed.div_ceil(self.increment);
        self.data.reserve(free + steps * self.increment);
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.data.extend_from_slice(bytes);
    }

    pub fn push(&mut self, byte: u8) {
        self.reserve(1);
        self.data.extend_from_slice(&[byte]);
    }

    /// Appends formatted text, e.g. `buf.format(format_args!("{} {}", a, b))`.
    pub fn format(&mut self, args: fmt::Arguments<'_>) {
        // Writing into memory cannot fail.
        let _ = fmt::Write::write_fmt(self, args);
    }

    /// Extends the buffer by `n` zeroed bytes and returns them for filling in.
    ///
    /// Callers shrink back with [`Buffer::truncate`] once they know how many
    /// bytes were actually produced.
    pub fn extend_zeroed(&mut self, n: usize) -> &mut [u8] {
        self.reserve(n);
        let start = self.data.len();
        self.data.resize(start + n, 0);
        &mut self.data[start..]
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Empties the buffer, keeping its capacity.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Removes the first `n` bytes, moving the rest to the front.
    pub fn discard_front(&mut self, n: usize) {
        let n = n.min(self.data.len());
        if n == self.data.len() {
            self.data.clear();
        } else if n > 0 {
            let _ = self.data.split_to(n);
        }
    }

    /// Releases the storage entirely.
    pub fn free(&mut self) {
        self.data = BytesMut::new();
    }

    /// Empties the buffer and releases its storage if it grew beyond `baseline`.
    pub fn shrink_to(&mut self, baseline: usize) {
        if self.data.capacity() > baseline {
            self.data = BytesMut::new();
        } else {
            self.data.clear();
        }
    }

    /// Converts into an immutable, cheaply clonable body.
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }

    /// Takes the content, leaving the buffer empty with the same increment.
    pub fn take(&mut self) -> Buffer {
        Buffer {
            data: self.data.split(),
            increment: self.increment,
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.data.len())
            .field("capacity", &self.data.capacity())
            .finish()
    }
}

impl fmt::Write for Buffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.append(s.as_bytes());
        Ok(())
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl std::ops::Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl From<&[u8]> for Buffer {
    fn from(bytes: &[u8]) -> Self {
        let mut buf = Buffer::new();
        buf.append(bytes);
        buf
    }
}
