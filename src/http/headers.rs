//! HTTP header fields: the known-header table, the ordered collection, and
//! the incremental header-block parser.
//!
//! Known header names are resolved by a case-insensitive binary search over a
//! static sorted table. The table entry decides how repeated fields are
//! merged and whether the value may hold more than one token.

use std::cmp::Ordering;

use thiserror::Error;

use crate::http::buffer::Buffer;

/// Default limit for a request or response header block.
pub const MAX_HEADERS_SIZE: usize = 8 * 1024;

/// Serialized lines longer than this are folded.
pub const HEADER_MAX_LINE_LEN: usize = 10 * 1024;

/// Header field categories; fields serialize in this order, unknown fields last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HeaderKind {
    General,
    Request,
    Response,
    Entity,
}

macro_rules! known_headers {
    ($(
        $variant:ident => $name:literal, $kind:ident,
        $commas:literal, $single:literal, $multiple:literal;
    )*) => {
        /// Header names with dedicated handling.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Header {
            $($variant,)*
        }

        static KNOWN_HEADERS: &[KnownHeader] = &[
            $(KnownHeader {
                header: Header::$variant,
                name: $name,
                kind: HeaderKind::$kind,
                might_have_commas: $commas,
                single_token: $single,
                force_multiple: $multiple,
            },)*
        ];
    };
}

known_headers! {
    Accept => "Accept", Request, true, false, false;
    AcceptCharset => "Accept-Charset", Request, true, false, false;
    AcceptEncoding => "Accept-Encoding", Request, true, false, false;
    AcceptLanguage => "Accept-Language", Request, true, false, false;
    AcceptRanges => "Accept-Ranges", Response, true, false, false;
    Age => "Age", Response, false, true, false;
    Allow => "Allow", Entity, true, false, false;
    Authorization => "Authorization", Request, false, false, false;
    CacheControl => "Cache-Control", General, true, false, false;
    Connection => "Connection", General, true, false, false;
    ContentEncoding => "Content-Encoding", Entity, true, false, false;
    ContentLanguage => "Content-Language", Entity, true, false, false;
    ContentLength => "Content-Length", Entity, false, true, false;
    ContentLocation => "Content-Location", Entity, false, true, false;
    ContentMd5 => "Content-MD5", Entity, false, true, false;
    ContentRange => "Content-Range", Entity, false, false, false;
    ContentType => "Content-Type", Entity, false, false, false;
    Cookie => "Cookie", Request, true, false, true;
    Date => "Date", General, true, false, false;
    ETag => "ETag", Response, false, true, false;
    Expect => "Expect", Request, true, false, false;
    Expires => "Expires", Entity, true, false, false;
    From => "From", Request, false, true, false;
    Host => "Host", Request, false, true, false;
    IfMatch => "If-Match", Request, true, false, false;
    IfModifiedSince => "If-Modified-Since", Request, true, false, false;
    IfNoneMatch => "If-None-Match", Request, true, false, false;
    IfRange => "If-Range", Request, true, false, false;
    IfUnmodifiedSince => "If-Unmodified-Since", Request, true, false, false;
    KeepAlive => "Keep-Alive", General, true, false, false;
    LastModified => "Last-Modified", Entity, true, false, false;
    Location => "Location", Response, false, true, false;
    MaxForwards => "Max-Forwards", Request, false, true, false;
    Pragma => "Pragma", General, true, false, false;
    ProxyAuthenticate => "Proxy-Authenticate", Response, true, false, false;
    ProxyAuthorization => "Proxy-Authorization", Request, false, false, false;
    ProxyConnection => "Proxy-Connection", General, true, false, false;
    Range => "Range", Request, true, false, false;
    Referer => "Referer", Request, false, true, false;
    RetryAfter => "Retry-After", Response, true, false, false;
    Server => "Server", Response, true, false, false;
    SetCookie => "Set-Cookie", Response, true, false, true;
    Status => "Status", Response, true, false, false;
    Te => "TE", Request, true, false, false;
    Trailer => "Trailer", General, true, false, false;
    TransferEncoding => "Transfer-Encoding", General, true, false, false;
    Upgrade => "Upgrade", General, true, false, false;
    UserAgent => "User-Agent", Request, true, false, false;
    Vary => "Vary", Response, true, false, false;
    Via => "Via", General, true, false, false;
    Warning => "Warning", General, true, false, false;
    WwwAuthenticate => "WWW-Authenticate", Response, true, false, false;
}

#[derive(Debug)]
pub struct KnownHeader {
    pub header: Header,
    pub name: &'static str,
    pub kind: HeaderKind,
    pub might_have_commas: bool,
    pub single_token: bool,
    pub force_multiple: bool,
}

impl Header {
    pub fn info(self) -> &'static KnownHeader {
        &KNOWN_HEADERS[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Case-insensitive lookup of a header name.
    pub fn lookup(name: &[u8]) -> Option<Header> {
        KNOWN_HEADERS
            .binary_search_by(|entry| compare_ignore_case(entry.name.as_bytes(), name))
            .ok()
            .map(|i| KNOWN_HEADERS[i].header)
    }
}

fn compare_ignore_case(a: &[u8], b: &[u8]) -> Ordering {
    let common = a.len().min(b.len());
    for i in 0..common {
        match a[i].to_ascii_lowercase().cmp(&b[i].to_ascii_lowercase()) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

/// Returns true if `haystack` contains `needle`, ignoring ASCII case.
pub fn contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    known: Option<Header>,
    name: Vec<u8>,
    value: Vec<u8>,
}

impl Field {
    pub fn known(&self) -> Option<Header> {
        self.known
    }

    pub fn name(&self) -> &[u8] {
        match self.known {
            Some(h) => h.name().as_bytes(),
            None => &self.name,
        }
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    fn rank(&self) -> u8 {
        match self.known {
            Some(h) => h.info().kind as u8,
            None => 4,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    #[error("malformed header block")]
    Malformed,
    #[error("header block too large")]
    TooLarge,
    #[error("header {0} must not be repeated")]
    Repeated(&'static str),
    #[error("header {0} must hold a single token")]
    NotSingleToken(&'static str),
}

/// Ordered header collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<Field>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    pub fn get(&self, header: Header) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|f| f.known == Some(header))
            .map(|f| f.value.as_slice())
    }

    pub fn get_str(&self, header: Header) -> Option<&str> {
        self.get(header).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Lookup by name; known names go through the table.
    pub fn get_by_name(&self, name: &str) -> Option<&[u8]> {
        match Header::lookup(name.as_bytes()) {
            Some(h) => self.get(h),
            None => self
                .fields
                .iter()
                .find(|f| f.known.is_none() && f.name.eq_ignore_ascii_case(name.as_bytes()))
                .map(|f| f.value.as_slice()),
        }
    }

    pub fn contains(&self, header: Header) -> bool {
        self.get(header).is_some()
    }

    /// Adds a field without merging.
    pub fn add(&mut self, header: Header, value: impl AsRef<[u8]>) {
        self.insert(Field {
            known: Some(header),
            name: Vec::new(),
            value: value.as_ref().to_vec(),
        });
    }

    /// Adds a field by name, resolving known names.
    pub fn add_raw(&mut self, name: &[u8], value: impl AsRef<[u8]>) {
        match Header::lookup(name) {
            Some(h) => self.add(h, value),
            None => self.insert(Field {
                known: None,
                name: name.to_vec(),
                value: value.as_ref().to_vec(),
            }),
        }
    }

    /// Replaces every occurrence of `header` with a single field.
    pub fn set(&mut self, header: Header, value: impl AsRef<[u8]>) {
        self.remove(header);
        self.add(header, value);
    }

    pub fn remove(&mut self, header: Header) {
        self.fields.retain(|f| f.known != Some(header));
    }

    fn insert(&mut self, field: Field) {
        let rank = field.rank();
        let pos = self
            .fields
            .iter()
            .rposition(|f| f.rank() <= rank)
            .map(|p| p + 1)
            .unwrap_or(0);
        self.fields.insert(pos, field);
    }

    /// Merges a parsed field according to the table's repetition rules.
    fn merge(&mut self, name: &[u8], value: Vec<u8>) -> Result<(), HeaderError> {
        let known = Header::lookup(name);

        if let Some(h) = known {
            let info = h.info();
            if info.single_token && value.contains(&b' ') {
                return Err(HeaderError::NotSingleToken(info.name));
            }

            if !info.force_multiple {
                if let Some(existing) = self.fields.iter_mut().find(|f| f.known == Some(h)) {
                    if !info.might_have_commas {
                        return Err(HeaderError::Repeated(info.name));
                    }
                    if !value.is_empty() {
                        if !existing.value.is_empty() {
                            existing.value.extend_from_slice(b", ");
                        }
                        existing.value.extend_from_slice(&value);
                    }
                    return Ok(());
                }
            }

            self.insert(Field {
                known,
                name: Vec::new(),
                value,
            });
            return Ok(());
        }

        if let Some(existing) = self
            .fields
            .iter_mut()
            .find(|f| f.known.is_none() && f.name.eq_ignore_ascii_case(name))
        {
            if !value.is_empty() {
                if !existing.value.is_empty() {
                    existing.value.extend_from_slice(b", ");
                }
                existing.value.extend_from_slice(&value);
            }
            return Ok(());
        }

        self.insert(Field {
            known: None,
            name: name.to_vec(),
            value,
        });
        Ok(())
    }

    /// Writes `Name: value\r\n` lines and the terminating blank line.
    ///
    /// Lines longer than `max_line_len` are folded at spaces with `\r\n\t`.
    pub fn serialize(&self, out: &mut Buffer, max_line_len: usize) {
        let mut line = Vec::new();
        for field in &self.fields {
            line.clear();
            line.extend_from_slice(field.name());
            line.extend_from_slice(b": ");
            line.extend_from_slice(&field.value);

            let mut start = 0;
            let mut space = None;
            for i in 0..line.len() {
                if line[i] == b' ' && i > start {
                    space = Some(i);
                }
                if i - start >= max_line_len {
                    if let Some(sp) = space.take() {
                        out.append(&line[start..sp]);
                        out.append(b"\r\n\t");
                        start = sp + 1;
                    }
                }
            }
            out.append(&line[start..]);
            out.append(b"\r\n");
        }
        out.append(b"\r\n");
    }
}

/// Outcome of feeding the header parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStatus {
    /// More input is needed; `offset` bytes have been examined.
    NeedMoreData(usize),
    /// The block ended; the body starts at this offset.
    Complete(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    LineStart,
    Name,
    BeforeValue,
    Value,
    ValueCr,
    BlankCr,
}

/// Resumable header-block parser.
///
/// Each call receives the whole block seen so far (starting at the first
/// header line) and continues from where the previous call stopped.
#[derive(Debug, Clone)]
pub struct HeaderParser {
    state: State,
    offset: usize,
    max_size: usize,
    name_start: usize,
    name: Vec<u8>,
    value: Vec<u8>,
    pending: bool,
    space: bool,
}

impl Default for HeaderParser {
    fn default() -> Self {
        Self::new(MAX_HEADERS_SIZE)
    }
}

impl HeaderParser {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: State::LineStart,
            offset: 0,
            max_size,
            name_start: 0,
            name: Vec::new(),
            value: Vec::new(),
            pending: false,
            space: false,
        }
    }

    pub fn reset(&mut self) {
        self.state = State::LineStart;
        self.offset = 0;
        self.name_start = 0;
        self.name.clear();
        self.value.clear();
        self.pending = false;
        self.space = false;
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    fn commit(&mut self, headers: &mut Headers) -> Result<(), HeaderError> {
        if self.pending {
            self.pending = false;
            let value = std::mem::take(&mut self.value);
            headers.merge(&self.name, value)?;
            self.name.clear();
        }
        Ok(())
    }

    pub fn parse(
        &mut self,
        headers: &mut Headers,
        buf: &[u8],
    ) -> Result<HeaderStatus, HeaderError> {
        while self.offset < buf.len() {
            if self.offset >= self.max_size {
                return Err(HeaderError::TooLarge);
            }

            let c = buf[self.offset];
            match self.state {
                State::LineStart => match c {
                    b' ' | b'\t' if self.pending => {
                        // Obsolete line folding continues the previous value.
                        self.space = true;
                        self.state = State::Value;
                    }
                    b'\r' => {
                        self.commit(headers)?;
                        self.state = State::BlankCr;
                    }
                    b'\n' => {
                        self.commit(headers)?;
                        self.offset += 1;
                        return Ok(HeaderStatus::Complete(self.offset));
                    }
                    b':' => return Err(HeaderError::Malformed),
                    33..=126 => {
                        self.commit(headers)?;
                        self.name_start = self.offset;
                        self.state = State::Name;
                    }
                    _ => return Err(HeaderError::Malformed),
                },
                State::Name => match c {
                    b':' => {
                        self.name.clear();
                        self.name.extend_from_slice(&buf[self.name_start..self.offset]);
                        self.value.clear();
                        self.space = false;
                        self.pending = true;
                        self.state = State::BeforeValue;
                    }
                    33..=126 => {}
                    _ => return Err(HeaderError::Malformed),
                },
                State::BeforeValue | State::Value => match c {
                    b' ' | b'\t' => self.space = true,
                    b'\r' => self.state = State::ValueCr,
                    b'\n' => self.state = State::LineStart,
                    0..=31 | 127 => return Err(HeaderError::Malformed),
                    _ => {
                        if self.space && !self.value.is_empty() {
                            self.value.push(b' ');
                        }
                        self.space = false;
                        self.value.push(c);
                        self.state = State::Value;
                    }
                },
                State::ValueCr => {
                    if c != b'\n' {
                        return Err(HeaderError::Malformed);
                    }
                    self.state = State::LineStart;
                }
                State::BlankCr => {
                    if c != b'\n' {
                        return Err(HeaderError::Malformed);
                    }
                    self.offset += 1;
                    return Ok(HeaderStatus::Complete(self.offset));
                }
            }

            self.offset += 1;
        }

        Ok(HeaderStatus::NeedMoreData(self.offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_sorted() {
        for pair in KNOWN_HEADERS.windows(2) {
            assert_eq!(
                compare_ignore_case(pair[0].name.as_bytes(), pair[1].name.as_bytes()),
                Ordering::Less,
                "{} / {}",
                pair[0].name,
                pair[1].name
            );
        }
        for (i, entry) in KNOWN_HEADERS.iter().enumerate() {
            assert_eq!(entry.header as usize, i);
        }
    }

    #[test]
    fn lookup_ignores_case() {
        assert_eq!(Header::lookup(b"content-length"), Some(Header::ContentLength));
        assert_eq!(Header::lookup(b"WWW-AUTHENTICATE"), Some(Header::WwwAuthenticate));
        assert_eq!(Header::lookup(b"X-Custom"), None);
    }

    #[test]
    fn folds_long_lines() {
        let mut headers = Headers::new();
        headers.add_raw(b"X-Long", "aaaa bbbb cccc");
        let mut out = Buffer::new();
        headers.serialize(&mut out, 12);
        assert_eq!(out.as_slice(), b"X-Long: aaaa\r\n\tbbbb cccc\r\n\r\n");
    }
}
