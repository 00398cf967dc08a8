//! Message bodies held in memory or spooled to a temporary file.

use std::io;

use bytes::Bytes;

use crate::http::buffer::Buffer;
use crate::proxy::fastcgi::{self, RecordType};
use crate::server::tmpfiles::{TempFile, TempFiles};

/// A complete request or response body.
#[derive(Debug, Default)]
pub enum Body {
    #[default]
    Empty,
    Memory(Bytes),
    Spool(TempFile),
}

impl Body {
    /// Bytes on the wire.
    pub fn len(&self) -> u64 {
        match self {
            Body::Empty => 0,
            Body::Memory(bytes) => bytes.len() as u64,
            Body::Spool(tmp) => tmp.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a spooled file to the pool.
    pub fn release(self, tmpfiles: &mut TempFiles) {
        if let Body::Spool(tmp) = self {
            tmpfiles.release(tmp);
        }
    }
}

/// How data written to a [`Spool`] is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Raw,
    /// Wrapped in FastCGI `Stdin` records as it arrives.
    FcgiStdin,
}

/// Collects a body of unknown or large size.
///
/// Data stays in memory until it would exceed `threshold`, then
/// everything moves to a temporary file.
#[derive(Debug)]
pub struct Spool {
    memory: Buffer,
    file: Option<TempFile>,
    threshold: usize,
    framing: Framing,
    payload_len: u64,
    scratch: Buffer,
}

impl Spool {
    pub fn new(threshold: usize, framing: Framing) -> Self {
        Self {
            memory: Buffer::new(),
            file: None,
            threshold,
            framing,
            payload_len: 0,
            scratch: Buffer::new(),
        }
    }

    /// Unframed bytes written so far.
    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    pub fn is_spooled(&self) -> bool {
        self.file.is_some()
    }

    pub fn write(&mut self, data: &[u8], tmpfiles: &mut TempFiles) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.payload_len += data.len() as u64;

        let framed: &[u8] = match self.framing {
            Framing::Raw => data,
            Framing::FcgiStdin => {
                self.scratch.clear();
                fastcgi::stream(&mut self.scratch, RecordType::Stdin, fastcgi::REQUEST_ID, data);
                &self.scratch
            }
        };

        if self.file.is_none() && self.memory.len() + framed.len() > self.threshold {
            let mut tmp = tmpfiles.open()?;
            tmp.write(&self.memory)?;
            self.memory.free();
            self.file = Some(tmp);
        }

        match &mut self.file {
            Some(tmp) => tmp.write(framed),
            None => {
                self.memory.append(framed);
                Ok(())
            }
        }
    }

    /// Completes the body; FastCGI framing gets its terminating record.
    pub fn finish(mut self) -> io::Result<Body> {
        if self.framing == Framing::FcgiStdin {
            self.scratch.clear();
            fastcgi::end_stream(&mut self.scratch, RecordType::Stdin, fastcgi::REQUEST_ID);
            match &mut self.file {
                Some(tmp) => tmp.write(&self.scratch)?,
                None => self.memory.append(&self.scratch),
            }
        }

        Ok(match self.file.take() {
            Some(tmp) => Body::Spool(tmp),
            None if self.memory.is_empty() => Body::Empty,
            None => Body::Memory(self.memory.take().freeze()),
        })
    }

    /// Drops the content, returning any temporary file to the pool.
    pub fn discard(mut self, tmpfiles: &mut TempFiles) {
        if let Some(tmp) = self.file.take() {
            tmpfiles.release(tmp);
        }
    }
}
