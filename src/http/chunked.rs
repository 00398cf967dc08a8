//! Chunked transfer-coding decoder.
//!
//! Decoded payload slices are handed to a sink as soon as they are
//! recognized; nothing is buffered inside the parser.

use thiserror::Error;

use crate::http::buffer::Buffer;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkedError {
    #[error("invalid chunked encoding at byte {offset}")]
    Invalid { offset: u64 },
    #[error("chunk sink rejected data")]
    Sink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkedStatus {
    NotDone,
    /// The last chunk and trailers ended within the input; `usize` bytes of it were consumed.
    Done(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SizeStart,
    Size,
    Extension,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    TrailerStart,
    Trailer,
    FinalLf,
}

#[derive(Debug, Clone)]
pub struct ChunkedParser {
    state: State,
    size: u64,
    remaining: u64,
    position: u64,
}

impl Default for ChunkedParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedParser {
    pub fn new() -> Self {
        Self {
            state: State::SizeStart,
            size: 0,
            remaining: 0,
            position: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Total bytes of encoded input consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Feeds the next slice of encoded input.
    ///
    /// Every byte of `input` is consumed unless the body ends inside it, in
    /// which case the returned count tells where the next message starts.
    pub fn parse<F>(&mut self, input: &[u8], mut sink: F) -> Result<ChunkedStatus, ChunkedError>
    where
        F: FnMut(&[u8]) -> bool,
    {
        let mut i = 0;
        while i < input.len() {
            let c = input[i];
            match self.state {
                State::SizeStart | State::Size => match hex_value(c) {
                    Some(v) => {
                        self.size = self
                            .size
                            .checked_mul(16)
                            .and_then(|s| s.checked_add(u64::from(v)))
                            .ok_or_else(|| self.invalid())?;
                        self.state = State::Size;
                    }
                    None if self.state == State::SizeStart => return Err(self.invalid()),
                    None => match c {
                        b';' | b' ' | b'\t' => self.state = State::Extension,
                        b'\r' => self.state = State::SizeLf,
                        b'\n' => self.end_size_line(),
                        _ => return Err(self.invalid()),
                    },
                },
                State::Extension => match c {
                    b'\r' => self.state = State::SizeLf,
                    b'\n' => self.end_size_line(),
                    b'\t' => {}
                    0..=31 | 127 => return Err(self.invalid()),
                    _ => {}
                },
                State::SizeLf => {
                    if c != b'\n' {
                        return Err(self.invalid());
                    }
                    self.end_size_line();
                }
                State::Data => {
                    let available = (input.len() - i) as u64;
                    let take = available.min(self.remaining) as usize;
                    if !sink(&input[i..i + take]) {
                        return Err(ChunkedError::Sink);
                    }
                    self.remaining -= take as u64;
                    if self.remaining == 0 {
                        self.state = State::DataCr;
                    }
                    i += take;
                    self.position += take as u64;
                    continue;
                }
                State::DataCr => match c {
                    b'\r' => self.state = State::DataLf,
                    b'\n' => self.state = State::SizeStart,
                    _ => return Err(self.invalid()),
                },
                State::DataLf => {
                    if c != b'\n' {
                        return Err(self.invalid());
                    }
                    self.state = State::SizeStart;
                }
                State::TrailerStart => match c {
                    b'\r' => self.state = State::FinalLf,
                    b'\n' => return Ok(self.done(i)),
                    33..=126 => self.state = State::Trailer,
                    _ => return Err(self.invalid()),
                },
                State::Trailer => match c {
                    b'\n' => self.state = State::TrailerStart,
                    b'\r' | b'\t' => {}
                    0..=31 | 127 => return Err(self.invalid()),
                    _ => {}
                },
                State::FinalLf => {
                    if c != b'\n' {
                        return Err(self.invalid());
                    }
                    return Ok(self.done(i));
                }
            }

            i += 1;
            self.position += 1;
        }

        Ok(ChunkedStatus::NotDone)
    }

    fn end_size_line(&mut self) {
        if self.size == 0 {
            self.state = State::TrailerStart;
        } else {
            self.remaining = self.size;
            self.size = 0;
            self.state = State::Data;
        }
    }

    fn done(&mut self, i: usize) -> ChunkedStatus {
        self.position += 1;
        self.state = State::SizeStart;
        ChunkedStatus::Done(i + 1)
    }

    fn invalid(&self) -> ChunkedError {
        ChunkedError::Invalid {
            offset: self.position,
        }
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Encodes `data` as chunks of at most `chunk_size` bytes followed by the last chunk.
pub fn encode(data: &[u8], chunk_size: usize, out: &mut Buffer) {
    for chunk in data.chunks(chunk_size.max(1)) {
        out.format(format_args!("{:x}\r\n", chunk.len()));
        out.append(chunk);
        out.append(b"\r\n");
    }
    out.append(b"0\r\n\r\n");
}
