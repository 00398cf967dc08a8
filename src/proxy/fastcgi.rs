//! FastCGI record framing.
//!
//! Every record starts with an 8-byte header:
//!
//! ```text
//! version | type | request id (2) | content length (2) | padding | reserved
//! ```
//!
//! followed by the content and up to 7 bytes of padding. Streams (`Params`,
//! `Stdin`, `Stdout`, ...) are a sequence of records ended by an empty one.

use thiserror::Error;

use crate::http::buffer::Buffer;

pub const VERSION_1: u8 = 1;
pub const HEADER_LEN: usize = 8;
pub const MAX_CONTENT_LEN: usize = 0xffff;

/// The gateway runs one request per backend connection.
pub const REQUEST_ID: u16 = 1;

/// The only role the gateway asks for.
pub const ROLE_RESPONDER: u16 = 1;

pub const KEEP_CONN: u8 = 1;

pub const REQUEST_COMPLETE: u8 = 0;
pub const CANT_MPX_CONN: u8 = 1;
pub const OVERLOADED: u8 = 2;
pub const UNKNOWN_ROLE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl RecordType {
    pub fn from_u8(value: u8) -> Option<RecordType> {
        use RecordType::*;
        Some(match value {
            1 => BeginRequest,
            2 => AbortRequest,
            3 => EndRequest,
            4 => Params,
            5 => Stdin,
            6 => Stdout,
            7 => Stderr,
            8 => Data,
            9 => GetValues,
            10 => GetValuesResult,
            11 => UnknownType,
            _ => return None,
        })
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FcgiError {
    #[error("record handler for {0:?} failed")]
    Sink(RecordType),
    #[error("malformed name-value pairs")]
    InvalidPairs,
    #[error("invalid record header (version {version}, type {kind})")]
    InvalidRecord { version: u8, kind: u8 },
}

/// Content of an `EndRequest` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequest {
    pub app_status: u32,
    pub protocol_status: u8,
}

fn padding(len: usize) -> usize {
    (8 - len % 8) % 8
}

fn header(out: &mut Buffer, kind: RecordType, request_id: u16, content_len: usize, padding: usize) {
    let [id_hi, id_lo] = request_id.to_be_bytes();
    let [len_hi, len_lo] = (content_len as u16).to_be_bytes();
    out.append(&[VERSION_1, kind as u8, id_hi, id_lo, len_hi, len_lo, padding as u8, 0]);
}

pub fn begin_request(out: &mut Buffer, request_id: u16, role: u16, keep_conn: bool) {
    header(out, RecordType::BeginRequest, request_id, 8, 0);
    let [role_hi, role_lo] = role.to_be_bytes();
    let flags = if keep_conn { KEEP_CONN } else { 0 };
    out.append(&[role_hi, role_lo, flags, 0, 0, 0, 0, 0]);
}

/// Writes `data` as records of at most 65535 bytes, each padded to a multiple of 8.
///
/// Empty input writes nothing; use [`end_stream`] for the terminator.
pub fn stream(out: &mut Buffer, kind: RecordType, request_id: u16, data: &[u8]) {
    for chunk in data.chunks(MAX_CONTENT_LEN) {
        let pad = padding(chunk.len());
        header(out, kind, request_id, chunk.len(), pad);
        out.append(chunk);
        out.append(&[0u8; 8][..pad]);
    }
}

/// Empty record closing a stream.
pub fn end_stream(out: &mut Buffer, kind: RecordType, request_id: u16) {
    header(out, kind, request_id, 0, 0);
}

fn encode_len(out: &mut Vec<u8>, len: usize) {
    if len <= 127 {
        out.push(len as u8);
    } else {
        let len = len as u32 | 0x8000_0000;
        out.extend_from_slice(&len.to_be_bytes());
    }
}

/// Appends one name-value pair with 1- or 4-byte lengths.
pub fn encode_pair(out: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    encode_len(out, name.len());
    encode_len(out, value.len());
    out.extend_from_slice(name);
    out.extend_from_slice(value);
}

fn decode_len(data: &[u8], pos: &mut usize) -> Result<usize, FcgiError> {
    let first = *data.get(*pos).ok_or(FcgiError::InvalidPairs)?;
    if first < 0x80 {
        *pos += 1;
        return Ok(first as usize);
    }
    let bytes = data.get(*pos..*pos + 4).ok_or(FcgiError::InvalidPairs)?;
    *pos += 4;
    let len = u32::from_be_bytes([bytes[0] & 0x7f, bytes[1], bytes[2], bytes[3]]);
    Ok(len as usize)
}

pub fn decode_pairs(data: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, FcgiError> {
    let mut pairs = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let name_len = decode_len(data, &mut pos)?;
        let value_len = decode_len(data, &mut pos)?;
        let end = pos
            .checked_add(name_len)
            .and_then(|n| n.checked_add(value_len))
            .filter(|&end| end <= data.len())
            .ok_or(FcgiError::InvalidPairs)?;
        let name = data[pos..pos + name_len].to_vec();
        let value = data[pos + name_len..end].to_vec();
        pairs.push((name, value));
        pos = end;
    }
    Ok(pairs)
}

/// Accumulates CGI parameters.
#[derive(Debug, Default)]
pub struct Params {
    data: Vec<u8>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, value: impl AsRef<[u8]>) {
        encode_pair(&mut self.data, name.as_bytes(), value.as_ref());
    }

    /// Adds a request header as `HTTP_<NAME>`, upper-casing and mapping `-` to `_`.
    pub fn add_header(&mut self, name: &[u8], value: &[u8]) {
        let mut param = Vec::with_capacity(5 + name.len());
        param.extend_from_slice(b"HTTP_");
        param.extend(name.iter().map(|&c| match c {
            b'-' => b'_',
            c => c.to_ascii_uppercase(),
        }));
        encode_pair(&mut self.data, &param, value);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Writes the whole `Params` stream, terminator included.
    pub fn write(&self, out: &mut Buffer, request_id: u16) {
        stream(out, RecordType::Params, request_id, &self.data);
        end_stream(out, RecordType::Params, request_id);
    }
}

/// Receives complete records from [`parse_records`]. Returning `false` aborts parsing.
pub trait RecordSink {
    fn stdout(&mut self, data: &[u8]) -> bool;

    fn stderr(&mut self, data: &[u8]) -> bool {
        tracing::warn!(stderr = %String::from_utf8_lossy(data), "FastCGI application error output");
        true
    }

    fn end_request(&mut self, end: EndRequest) -> bool;

    fn get_values_result(&mut self, _pairs: Vec<(Vec<u8>, Vec<u8>)>) -> bool {
        true
    }

    /// Records an application does not normally send.
    fn unexpected(&mut self, kind: RecordType, request_id: u16, content: &[u8]) -> bool {
        tracing::error!(?kind, request_id, len = content.len(), "Unexpected FastCGI record");
        true
    }
}

/// Consumes every complete record at the front of `buf`.
///
/// An incomplete trailing record stays in `buf` for the next read. A record
/// with a bad version or type fails the stream and discards the buffer.
pub fn parse_records<S: RecordSink + ?Sized>(
    buf: &mut Buffer,
    sink: &mut S,
) -> Result<(), FcgiError> {
    let mut offset = 0;
    let result = loop {
        let rest = &buf[offset..];
        if rest.len() < HEADER_LEN {
            break Ok(());
        }

        let kind = match (rest[0], RecordType::from_u8(rest[1])) {
            (VERSION_1, Some(kind)) => kind,
            (version, _) => {
                let kind = rest[1];
                tracing::error!(version, kind, "Received invalid FastCGI record");
                buf.clear();
                return Err(FcgiError::InvalidRecord { version, kind });
            }
        };

        let request_id = u16::from_be_bytes([rest[2], rest[3]]);
        let content_len = u16::from_be_bytes([rest[4], rest[5]]) as usize;
        let total = HEADER_LEN + content_len + rest[6] as usize;
        if rest.len() < total {
            break Ok(());
        }

        let content = &rest[HEADER_LEN..HEADER_LEN + content_len];
        let ok = match kind {
            RecordType::Stdout => content.is_empty() || sink.stdout(content),
            RecordType::Stderr => content.is_empty() || sink.stderr(content),
            RecordType::EndRequest if content_len == 8 => sink.end_request(EndRequest {
                app_status: u32::from_be_bytes([content[0], content[1], content[2], content[3]]),
                protocol_status: content[4],
            }),
            RecordType::EndRequest => {
                tracing::error!(request_id, content_len, "Invalid FastCGI end-request record");
                true
            }
            RecordType::GetValuesResult => {
                if content.is_empty() {
                    true
                } else {
                    match decode_pairs(content) {
                        Ok(pairs) => sink.get_values_result(pairs),
                        Err(e) => break Err(e),
                    }
                }
            }
            _ => sink.unexpected(kind, request_id, content),
        };
        if !ok {
            break Err(FcgiError::Sink(kind));
        }

        offset += total;
    };

    buf.discard_front(offset);
    result
}
