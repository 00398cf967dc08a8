//! Request-target parser.
//!
//! Accepts origin-form (`/path?query`) and absolute-form
//! (`scheme://host[:port]/path?query`) targets. The path is percent-decoded
//! and normalized: duplicate slashes and `.` segments are dropped and `..`
//! removes the previous segment. A `..` that would climb above the root is
//! rejected as forbidden.

use std::ops::Range;

use thiserror::Error;

pub const HOST_MAX_LEN: usize = 255;
pub const PATH_MAX_LEN: usize = 4096;
pub const QUERY_MAX_LEN: usize = 4096;
pub const FRAGMENT_MAX_LEN: usize = 4096;

pub const HTTP_DEFAULT_PORT: u16 = 80;

/// Capacities kept across [`Url::reset`]; larger buffers are released.
const PATH_MEAN_SIZE: usize = 128;
const QUERY_MEAN_SIZE: usize = 64;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UrlError {
    #[error("malformed URL")]
    Malformed,
    #[error("URL escapes the document root")]
    Forbidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Ftp,
    Http,
    Https,
    Telnet,
}

impl Scheme {
    fn from_bytes(name: &[u8]) -> Option<Scheme> {
        [
            (&b"ftp"[..], Scheme::Ftp),
            (&b"http"[..], Scheme::Http),
            (&b"https"[..], Scheme::Https),
            (&b"telnet"[..], Scheme::Telnet),
        ]
        .into_iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, s)| s)
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Ftp => 21,
            Scheme::Http => HTTP_DEFAULT_PORT,
            Scheme::Https => 443,
            Scheme::Telnet => 23,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Url {
    scheme: Option<Scheme>,
    host: Option<String>,
    port: u16,
    path: Vec<u8>,
    extension: Option<Range<usize>>,
    query: Vec<u8>,
    has_query: bool,
    fragment: Option<Vec<u8>>,
    target: Vec<u8>,
}

impl Url {
    pub fn parse(input: &[u8]) -> Result<Url, UrlError> {
        let mut url = Url::default();
        url.parse_into(input)?;
        Ok(url)
    }

    pub fn reset(&mut self) {
        self.scheme = None;
        self.host = None;
        self.port = 0;
        reset_buffer(&mut self.path, PATH_MEAN_SIZE);
        self.extension = None;
        reset_buffer(&mut self.query, QUERY_MEAN_SIZE);
        self.has_query = false;
        self.fragment = None;
        reset_buffer(&mut self.target, PATH_MEAN_SIZE + QUERY_MEAN_SIZE);
    }


    pub fn scheme(&self) -> Option<Scheme> {
        self.scheme
    }

    /// Host of an absolute-form target.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Port of an absolute-form target (the scheme's default if omitted); 0 otherwise.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Decoded, normalized path; always starts with `/`.
    pub fn path(&self) -> &[u8] {
        &self.path
    }

    /// Extension of the last path segment, without the dot.
    pub fn extension(&self) -> Option<&[u8]> {
        self.extension.clone().map(|r| &self.path[r])
    }

    /// Query string without the leading `?`.
    pub fn query(&self) -> Option<&[u8]> {
        self.has_query.then_some(self.query.as_slice())
    }

    pub fn fragment(&self) -> Option<&[u8]> {
        self.fragment.as_deref()
    }

    /// Raw path and query as received, suitable for forwarding upstream.
    pub fn target(&self) -> &[u8] {
        &self.target
    }

    pub fn parse_into(&mut self, input: &[u8]) -> Result<(), UrlError> {
        self.reset();

        let rest = match input.first() {
            Some(b'/') => input,
            Some(c) if c.is_ascii_alphabetic() => self.parse_authority(input)?,
            _ => return Err(UrlError::Malformed),
        };

        if rest.is_empty() {
            self.path.push(b'/');
            self.target.push(b'/');
            return Ok(());
        }

        self.parse_path(rest)
    }

    /// Parses `scheme://host[:port]`, returning what follows.
    fn parse_authority<'a>(&mut self, input: &'a [u8]) -> Result<&'a [u8], UrlError> {
        let colon = input
            .iter()
            .position(|&c| c == b':')
            .ok_or(UrlError::Malformed)?;
        let name = &input[..colon];
        if !name
            .iter()
            .all(|&c| c.is_ascii_alphanumeric() || c == b'+' || c == b'-' || c == b'.')
        {
            return Err(UrlError::Malformed);
        }
        let scheme = Scheme::from_bytes(name).ok_or(UrlError::Malformed)?;

        let after = &input[colon + 1..];
        if !after.starts_with(b"//") {
            return Err(UrlError::Malformed);
        }
        let authority = &after[2..];

        let end = authority
            .iter()
            .position(|&c| c == b'/')
            .unwrap_or(authority.len());
        let (hostport, rest) = authority.split_at(end);

        let (raw_host, raw_port) = match hostport.iter().position(|&c| c == b':') {
            Some(p) => (&hostport[..p], Some(&hostport[p + 1..])),
            None => (hostport, None),
        };

        let host = decode_host(raw_host)?;
        self.port = match raw_port {
            Some(digits) => parse_port(digits)?,
            None => scheme.default_port(),
        };
        self.scheme = Some(scheme);
        self.host = Some(host);

        Ok(rest)
    }

    fn parse_path(&mut self, raw: &[u8]) -> Result<(), UrlError> {
        let target_end = raw.iter().position(|&c| c == b'#').unwrap_or(raw.len());
        let path_end = raw[..target_end]
            .iter()
            .position(|&c| c == b'?')
            .unwrap_or(target_end);

        if path_end < target_end {
            let query = &raw[path_end + 1..target_end];
            if query.len() > QUERY_MAX_LEN || query.iter().any(|&c| c <= b' ' || c == 127) {
                return Err(UrlError::Malformed);
            }
            self.query.extend_from_slice(query);
            self.has_query = true;
        }

        if target_end < raw.len() {
            let fragment = &raw[target_end + 1..];
            if fragment.len() > FRAGMENT_MAX_LEN
                || fragment.iter().any(|&c| c <= b' ' || c == 127)
            {
                return Err(UrlError::Malformed);
            }
            self.fragment = Some(fragment.to_vec());
        }

        let decoded = percent_decode(&raw[..path_end])?;
        normalize(&decoded, &mut self.path)?;
        if self.path.len() > PATH_MAX_LEN {
            return Err(UrlError::Malformed);
        }

        self.extension = find_extension(&self.path);
        self.target.extend_from_slice(&raw[..target_end]);
        Ok(())
    }
}

fn reset_buffer(buf: &mut Vec<u8>, mean_size: usize) {
    if buf.capacity() > mean_size {
        *buf = Vec::new();
    } else {
        buf.clear();
    }
}

fn hex(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn percent_decode(raw: &[u8]) -> Result<Vec<u8>, UrlError> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let c = raw[i];
        let byte = if c == b'%' {
            let hi = raw.get(i + 1).copied().and_then(hex).ok_or(UrlError::Malformed)?;
            let lo = raw.get(i + 2).copied().and_then(hex).ok_or(UrlError::Malformed)?;
            i += 3;
            hi * 16 + lo
        } else {
            i += 1;
            c
        };
        if byte < b' ' || byte == 127 {
            return Err(UrlError::Malformed);
        }
        out.push(byte);
    }
    Ok(out)
}

fn decode_host(raw: &[u8]) -> Result<String, UrlError> {
    let decoded = percent_decode(raw)?;
    if decoded.is_empty() || decoded.len() > HOST_MAX_LEN {
        return Err(UrlError::Malformed);
    }
    let first = decoded[0];
    let last = decoded[decoded.len() - 1];
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return Err(UrlError::Malformed);
    }
    if decoded
        .iter()
        .any(|&c| c <= b' ' || c >= 127 || matches!(c, b':' | b'/' | b'%' | b'?' | b'#'))
    {
        return Err(UrlError::Malformed);
    }
    String::from_utf8(decoded).map_err(|_| UrlError::Malformed)
}

fn parse_port(digits: &[u8]) -> Result<u16, UrlError> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(UrlError::Malformed);
    }
    let mut port: u32 = 0;
    for &d in digits {
        port = port * 10 + u32::from(d - b'0');
        if port > 65535 {
            return Err(UrlError::Malformed);
        }
    }
    if port == 0 {
        return Err(UrlError::Malformed);
    }
    Ok(port as u16)
}

/// Rebuilds `decoded` into `out` without empty, `.` and `..` segments.
fn normalize(decoded: &[u8], out: &mut Vec<u8>) -> Result<(), UrlError> {
    let mut segments: Vec<&[u8]> = Vec::new();
    let mut trailing_slash = false;

    for segment in decoded.split(|&c| c == b'/').skip(1) {
        match segment {
            b"" | b"." => trailing_slash = true,
            b".." => {
                if segments.pop().is_none() {
                    return Err(UrlError::Forbidden);
                }
                trailing_slash = true;
            }
            _ => {
                segments.push(segment);
                trailing_slash = false;
            }
        }
    }

    out.clear();
    for segment in &segments {
        out.push(b'/');
        out.extend_from_slice(segment);
    }
    if segments.is_empty() || trailing_slash {
        out.push(b'/');
    }
    Ok(())
}

fn find_extension(path: &[u8]) -> Option<Range<usize>> {
    let start = path.iter().rposition(|&c| c == b'/').map_or(0, |p| p + 1);
    let segment = &path[start..];
    match segment.iter().rposition(|&c| c == b'.') {
        Some(dot) if dot > 0 && dot + 1 < segment.len() => Some(start + dot + 1..path.len()),
        _ => None,
    }
}
