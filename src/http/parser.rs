//! Request-line and status-line parsers.
//!
//! Both are resumable automata: they are handed the whole line seen so far
//! and continue from the byte where the previous call stopped.

use std::ops::Range;

use thiserror::Error;

use crate::http::request::{Method, Version};

/// Longest request target accepted (414 beyond).
pub const URI_MAX_LEN: usize = 8 * 1024;

/// Longest request line accepted (413 beyond).
pub const REQUEST_LINE_MAX_LEN: usize = URI_MAX_LEN + 100;

/// Longest backend status line accepted.
pub const STATUS_LINE_MAX_LEN: usize = 1024;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid request line")]
    InvalidRequest,
    #[error("unknown method")]
    InvalidMethod,
    #[error("unsupported HTTP version")]
    InvalidVersion,
    #[error("request target too long")]
    UriTooLong,
    #[error("request line too long")]
    LineTooLong,
    #[error("invalid status line")]
    InvalidStatusLine,
    #[error("invalid Content-Length")]
    InvalidContentLength,
}

/// Outcome of feeding a line parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress<T> {
    NeedMoreData,
    /// The parsed value and the number of bytes consumed, line terminator included.
    Complete(T, usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    /// Location of the request target in the parsed input.
    pub uri: Range<usize>,
    pub version: Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineState {
    Start,
    LeadingCr,
    Method,
    BeforeUri,
    Uri,
    BeforeVersion,
    Protocol(u8),
    Major,
    Dot,
    Minor,
    AfterVersion,
    Cr,
}

const HTTP_SLASH: &[u8] = b"HTTP/";

/// Parser for `METHOD SP target SP HTTP/x.y CRLF`.
///
/// Leading empty lines are skipped and a bare LF is accepted as terminator.
#[derive(Debug, Clone)]
pub struct RequestLineParser {
    state: LineState,
    offset: usize,
    token: usize,
    method: Option<Method>,
    uri: Range<usize>,
    major: u8,
    minor: u8,
}

impl Default for RequestLineParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestLineParser {
    pub fn new() -> Self {
        Self {
            state: LineState::Start,
            offset: 0,
            token: 0,
            method: None,
            uri: 0..0,
            major: 0,
            minor: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn parse(&mut self, buf: &[u8]) -> Result<Progress<RequestLine>, ParseError> {
        while self.offset < buf.len() {
            if self.offset >= REQUEST_LINE_MAX_LEN {
                return Err(ParseError::LineTooLong);
            }

            let c = buf[self.offset];
            match self.state {
                LineState::Start => match c {
                    b'A'..=b'Z' => {
                        self.token = self.offset;
                        self.state = LineState::Method;
                    }
                    b'\r' => self.state = LineState::LeadingCr,
                    b'\n' | b' ' | b'\t' => {}
                    _ => return Err(ParseError::InvalidRequest),
                },
                LineState::LeadingCr => {
                    if c != b'\n' {
                        return Err(ParseError::InvalidRequest);
                    }
                    self.state = LineState::Start;
                }
                LineState::Method => match c {
                    b'A'..=b'Z' => {}
                    b' ' | b'\t' => {
                        let method = Method::from_bytes(&buf[self.token..self.offset])
                            .ok_or(ParseError::InvalidMethod)?;
                        self.method = Some(method);
                        self.state = LineState::BeforeUri;
                    }
                    _ => return Err(ParseError::InvalidRequest),
                },
                LineState::BeforeUri => match c {
                    b' ' | b'\t' => {}
                    33..=255 if c != 127 => {
                        self.uri = self.offset..self.offset + 1;
                        self.state = LineState::Uri;
                    }
                    _ => return Err(ParseError::InvalidRequest),
                },
                LineState::Uri => match c {
                    b' ' | b'\t' => self.state = LineState::BeforeVersion,
                    33..=255 if c != 127 => {
                        self.uri.end = self.offset + 1;
                        if self.uri.len() > URI_MAX_LEN {
                            return Err(ParseError::UriTooLong);
                        }
                    }
                    _ => return Err(ParseError::InvalidRequest),
                },
                LineState::BeforeVersion => match c {
                    b' ' | b'\t' => {}
                    b'H' | b'h' => self.state = LineState::Protocol(1),
                    _ => return Err(ParseError::InvalidRequest),
                },
                LineState::Protocol(i) => {
                    if !c.eq_ignore_ascii_case(&HTTP_SLASH[i as usize]) {
                        return Err(ParseError::InvalidRequest);
                    }
                    self.state = if i as usize + 1 == HTTP_SLASH.len() {
                        LineState::Major
                    } else {
                        LineState::Protocol(i + 1)
                    };
                }
                LineState::Major => match c {
                    b'0'..=b'1' => {
                        self.major = c - b'0';
                        self.state = LineState::Dot;
                    }
                    b'2'..=b'9' => return Err(ParseError::InvalidVersion),
                    _ => return Err(ParseError::InvalidRequest),
                },
                LineState::Dot => {
                    if c != b'.' {
                        return Err(ParseError::InvalidRequest);
                    }
                    self.state = LineState::Minor;
                }
                LineState::Minor => match c {
                    b'0'..=b'9' => {
                        self.minor = c - b'0';
                        if self.major == 1 && self.minor > 1 {
                            return Err(ParseError::InvalidVersion);
                        }
                        self.state = LineState::AfterVersion;
                    }
                    _ => return Err(ParseError::InvalidRequest),
                },
                LineState::AfterVersion => match c {
                    b' ' | b'\t' => {}
                    b'\r' => self.state = LineState::Cr,
                    b'\n' => return self.complete(),
                    b'0'..=b'9' => return Err(ParseError::InvalidVersion),
                    _ => return Err(ParseError::InvalidRequest),
                },
                LineState::Cr => {
                    if c != b'\n' {
                        return Err(ParseError::InvalidRequest);
                    }
                    return self.complete();
                }
            }

            self.offset += 1;
        }

        Ok(Progress::NeedMoreData)
    }

    fn complete(&mut self) -> Result<Progress<RequestLine>, ParseError> {
        let method = self.method.ok_or(ParseError::InvalidRequest)?;
        // HTTP/0.x requests are served with 1.0 semantics.
        let version = if self.major == 0 {
            Version::HTTP_10
        } else {
            Version {
                major: self.major,
                minor: self.minor,
            }
        };
        self.offset += 1;
        Ok(Progress::Complete(
            RequestLine {
                method,
                uri: self.uri.clone(),
                version,
            },
            self.offset,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: Version,
    pub code: u16,
    /// Reason phrase location in the parsed input; may be empty.
    pub reason: Range<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusState {
    Start,
    Protocol(u8),
    Major,
    Dot,
    Minor,
    BeforeCode,
    Code(u8),
    BeforeReason,
    Reason,
    Cr,
}

/// Parser for a backend's `HTTP/x.y SP code [SP reason] CRLF`.
#[derive(Debug, Clone)]
pub struct StatusLineParser {
    state: StatusState,
    offset: usize,
    version: Version,
    code: u16,
    reason: Range<usize>,
}

impl Default for StatusLineParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusLineParser {
    pub fn new() -> Self {
        Self {
            state: StatusState::Start,
            offset: 0,
            version: Version::HTTP_11,
            code: 0,
            reason: 0..0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn parse(&mut self, buf: &[u8]) -> Result<Progress<StatusLine>, ParseError> {
        use StatusState::*;

        while self.offset < buf.len() {
            if self.offset >= STATUS_LINE_MAX_LEN {
                return Err(ParseError::InvalidStatusLine);
            }

            let c = buf[self.offset];
            match self.state {
                Start => match c {
                    b' ' | b'\t' | b'\r' | b'\n' => {}
                    b'H' | b'h' => self.state = Protocol(1),
                    _ => return Err(ParseError::InvalidStatusLine),
                },
                Protocol(i) => {
                    if !c.eq_ignore_ascii_case(&HTTP_SLASH[i as usize]) {
                        return Err(ParseError::InvalidStatusLine);
                    }
                    self.state = if i as usize + 1 == HTTP_SLASH.len() {
                        Major
                    } else {
                        Protocol(i + 1)
                    };
                }
                Major => match c {
                    b'0'..=b'1' => {
                        self.version.major = c - b'0';
                        self.state = Dot;
                    }
                    _ => return Err(ParseError::InvalidStatusLine),
                },
                Dot => {
                    if c != b'.' {
                        return Err(ParseError::InvalidStatusLine);
                    }
                    self.state = Minor;
                }
                Minor => match c {
                    b'0'..=b'9' => {
                        self.version.minor = c - b'0';
                        if self.version.major == 1 && self.version.minor > 1 {
                            return Err(ParseError::InvalidStatusLine);
                        }
                        self.state = BeforeCode;
                    }
                    _ => return Err(ParseError::InvalidStatusLine),
                },
                BeforeCode => match c {
                    b' ' | b'\t' => {}
                    b'1'..=b'5' => {
                        self.code = u16::from(c - b'0');
                        self.state = Code(1);
                    }
                    _ => return Err(ParseError::InvalidStatusLine),
                },
                Code(n) => match c {
                    b'0'..=b'9' if n < 3 => {
                        self.code = self.code * 10 + u16::from(c - b'0');
                        self.state = Code(n + 1);
                    }
                    b' ' | b'\t' if n == 3 => self.state = BeforeReason,
                    b'\r' if n == 3 => self.state = Cr,
                    b'\n' if n == 3 => return self.complete(),
                    _ => return Err(ParseError::InvalidStatusLine),
                },
                BeforeReason => match c {
                    b' ' | b'\t' => {}
                    b'\r' => self.state = Cr,
                    b'\n' => return self.complete(),
                    0..=31 | 127 => return Err(ParseError::InvalidStatusLine),
                    _ => {
                        self.reason = self.offset..self.offset + 1;
                        self.state = Reason;
                    }
                },
                Reason => match c {
                    b'\r' => self.state = Cr,
                    b'\n' => return self.complete(),
                    b'\t' => {}
                    0..=31 | 127 => return Err(ParseError::InvalidStatusLine),
                    _ => self.reason.end = self.offset + 1,
                },
                Cr => {
                    if c != b'\n' {
                        return Err(ParseError::InvalidStatusLine);
                    }
                    return self.complete();
                }
            }

            self.offset += 1;
        }

        Ok(Progress::NeedMoreData)
    }

    fn complete(&mut self) -> Result<Progress<StatusLine>, ParseError> {
        if !(100..=599).contains(&self.code) {
            return Err(ParseError::InvalidStatusLine);
        }
        self.offset += 1;
        Ok(Progress::Complete(
            StatusLine {
                version: self.version,
                code: self.code,
                reason: self.reason.clone(),
            },
            self.offset,
        ))
    }
}
