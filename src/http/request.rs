use crate::http::headers::{Header, Headers, contains_ignore_case};
use crate::http::parser::ParseError;
use crate::http::url::Url;

/// HTTP request methods.
///
/// The set is closed: a request line naming any other method is rejected
/// with 400 Bad Request. Variants are ordered alphabetically, and a variant's
/// index is its bit in a [`MethodSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    CONNECT,
    COPY,
    DELETE,
    GET,
    HEAD,
    LOCK,
    MKCOL,
    MOVE,
    OPTIONS,
    POST,
    PROPFIND,
    PROPPATCH,
    PUT,
    TRACE,
    UNLOCK,
}

const METHODS: [(Method, &str); 15] = [
    (Method::CONNECT, "CONNECT"),
    (Method::COPY, "COPY"),
    (Method::DELETE, "DELETE"),
    (Method::GET, "GET"),
    (Method::HEAD, "HEAD"),
    (Method::LOCK, "LOCK"),
    (Method::MKCOL, "MKCOL"),
    (Method::MOVE, "MOVE"),
    (Method::OPTIONS, "OPTIONS"),
    (Method::POST, "POST"),
    (Method::PROPFIND, "PROPFIND"),
    (Method::PROPPATCH, "PROPPATCH"),
    (Method::PUT, "PUT"),
    (Method::TRACE, "TRACE"),
    (Method::UNLOCK, "UNLOCK"),
];

impl Method {
    /// Parses an HTTP method from its token.
    ///
    /// # Arguments
    ///
    /// * `token` - Method token from the request line (case-sensitive)
    ///
    /// # Returns
    ///
    /// `Some(Method)` if the token names a known method, `None` otherwise.
    ///
    /// # Example
    ///
    /// ```
    /// # use sentinel_gateway::http::request::Method;
    /// assert_eq!(Method::from_bytes(b"GET"), Some(Method::GET));
    /// assert_eq!(Method::from_bytes(b"get"), None);
    /// ```
    pub fn from_bytes(token: &[u8]) -> Option<Self> {
        METHODS
            .binary_search_by(|(_, name)| name.as_bytes().cmp(token))
            .ok()
            .map(|i| METHODS[i].0)
    }

    pub fn as_str(&self) -> &'static str {
        METHODS[*self as usize].1
    }

    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Bit set of methods, used by method-based routing rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodSet(u32);

impl MethodSet {
    pub fn insert(&mut self, method: Method) {
        self.0 |= method.bit();
    }

    pub fn contains(&self, method: Method) -> bool {
        self.0 & method.bit() != 0
    }
}

/// HTTP protocol version from a request or status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const HTTP_10: Version = Version { major: 1, minor: 0 };
    pub const HTTP_11: Version = Version { major: 1, minor: 1 };

    pub fn is_http11(&self) -> bool {
        *self == Version::HTTP_11
    }
}

impl Default for Version {
    fn default() -> Self {
        Version::HTTP_11
    }
}

/// Request-scoped state of a client connection.
///
/// Everything here is cleared by [`Request::reset`] between keep-alive
/// requests.
#[derive(Debug, Default)]
pub struct Request {
    /// The HTTP method; `None` until the request line parsed.
    pub method: Option<Method>,
    pub version: Version,
    /// Raw request target as received.
    pub uri: Vec<u8>,
    /// Parsed and normalized target.
    pub url: Url,
    pub headers: Headers,
    /// Host name used for virtual-host selection.
    pub host: String,
    /// Port from the absolute URI or the Host header.
    pub port: u16,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    /// HEAD responses never carry a body.
    pub fn is_head(&self) -> bool {
        self.method == Some(Method::HEAD)
    }

    /// Decides connection persistence from the Connection header and version.
    ///
    /// `close` wins over `Keep-Alive`; without either token, only HTTP/1.1
    /// keeps the connection open.
    pub fn keep_alive(&self) -> bool {
        if let Some(value) = self.headers.get(Header::Connection) {
            if contains_ignore_case(value, b"close") {
                return false;
            }
            if contains_ignore_case(value, b"keep-alive") {
                return true;
            }
        }
        self.version.is_http11()
    }

    /// Content-Length header value; a value that is not a number is an error.
    pub fn content_length(&self) -> Result<Option<u64>, ParseError> {
        match self.headers.get(Header::ContentLength) {
            None => Ok(None),
            Some(v) => std::str::from_utf8(v)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Some)
                .ok_or(ParseError::InvalidContentLength),
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.headers
            .get(Header::TransferEncoding)
            .is_some_and(|v| contains_ignore_case(v, b"chunked"))
    }

    /// Clears request-scoped fields; buffers above their mean size are released.
    pub fn reset(&mut self) {
        const HOST_MEAN_SIZE: usize = 32;
        const URI_MEAN_SIZE: usize = 256;

        self.method = None;
        self.version = Version::default();
        if self.uri.capacity() > URI_MEAN_SIZE {
            self.uri = Vec::new();
        } else {
            self.uri.clear();
        }
        self.url.reset();
        self.headers.clear();
        if self.host.capacity() > HOST_MEAN_SIZE {
            self.host = String::new();
        } else {
            self.host.clear();
        }
        self.port = 0;
    }
}
