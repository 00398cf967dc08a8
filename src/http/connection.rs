//! Client-facing HTTP connection.
//!
//! [`HttpConnection::advance`] runs the state machine until it has to wait
//! for the socket, needs the event loop to start a backend request, or the
//! connection is done. Backend responses come back through
//! [`HttpConnection::deliver`].

use std::ffi::OsStr;
use std::fs::{self, File, Metadata};
use std::io;
use std::net::SocketAddr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use mio::net::TcpStream;

use crate::http::access_log::AccessRecord;
use crate::http::body::{Body, Framing, Spool};
use crate::http::buffer::Buffer;
use crate::http::chunked::{ChunkedError, ChunkedParser, ChunkedStatus};
use crate::http::dirlisting;
use crate::http::headers::{
    HEADER_MAX_LINE_LEN, Header, HeaderError, HeaderParser, HeaderStatus, Headers,
};
use crate::http::parser::{ParseError, Progress, RequestLineParser};
use crate::http::range::{self, ByteRange, RangeList};
use crate::http::request::{Method, Request};
use crate::http::response::{SERVER_NAME, StatusCode};
use crate::http::url::{HTTP_DEFAULT_PORT, UrlError};
use crate::http::vhost::HandlerKind;
use crate::http::writer;
use crate::proxy::fastcgi::{self, Params, RecordType};
use crate::proxy::{CompletedResponse, Reply, UpstreamRequest};
use crate::server::io::{IoStatus, READ_CHUNK, Socket};
use crate::server::tmpfiles::{TempFile, TempFiles};
use crate::server::{Env, Settings};

const MAX_TRANSITIONS: usize = 32;

/// Input buffers above this are released between requests.
const INPUT_MEAN_SIZE: usize = 2 * READ_CHUNK;
const OUTPUT_MEAN_SIZE: usize = 2048;

const HTML_CONTENT_TYPE: &str = "text/html; charset=UTF-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitingRequestLine,
    ReadingHeaders,
    Routing,
    ReadingBody,
    ReadingChunkedBody,
    PreparingUpstreamRequest,
    AwaitingBackend,
    PreparingErrorPage,
    SendingHeaders,
    SendingBody,
    SendingBackendHeaders,
    SendingBackendBody,
    Completed,
}

/// What the event loop should do after [`HttpConnection::advance`].
#[derive(Debug)]
pub enum Step {
    /// Waiting for the socket.
    Suspend,
    /// More work is ready; run again before the next wait.
    Revisit,
    Close,
    /// Start a backend request; the connection waits for [`HttpConnection::deliver`].
    Forward(UpstreamRequest),
}

enum Flow {
    Continue,
    Suspend,
    Close,
    Forward(UpstreamRequest),
}

enum Fault {
    /// Answered with an error page.
    Status(StatusCode),
    /// The connection is closed.
    Io(io::Error),
}

impl From<StatusCode> for Fault {
    fn from(status: StatusCode) -> Self {
        Fault::Status(status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartPhase {
    Start,
    Header,
    Data,
    Footer,
}

#[derive(Debug)]
struct Multipart {
    file: File,
    ranges: RangeList,
    index: usize,
    boundary: String,
    content_type: String,
    size: u64,
    offset: u64,
    phase: PartPhase,
}

/// Response body after the head.
#[derive(Debug, Default)]
enum Payload {
    #[default]
    None,
    Memory(Bytes),
    File {
        file: File,
        offset: u64,
        end: u64,
    },
    Multipart(Box<Multipart>),
    Spool {
        tmp: TempFile,
        offset: u64,
    },
}

impl Payload {
    fn is_file(&self) -> bool {
        matches!(self, Payload::File { .. } | Payload::Multipart(_) | Payload::Spool { .. })
    }
}

#[derive(Debug)]
pub struct HttpConnection {
    socket: Socket<TcpStream>,
    peer: SocketAddr,
    state: State,

    input: Buffer,
    line_parser: RequestLineParser,
    header_parser: HeaderParser,
    request: Request,
    keep_alive: bool,

    host: Option<usize>,
    rule: Option<usize>,
    handler: HandlerKind,
    spool: Option<Spool>,
    remaining: u64,
    chunked: ChunkedParser,
    body: Body,
    payload_len: u64,

    out: Buffer,
    out_cursor: usize,
    payload: Payload,
    corked: bool,
    status: u16,
    body_size: u64,
    error: Option<StatusCode>,
    location: Option<String>,
    last_modified: Option<String>,
}

impl HttpConnection {
    pub fn new(stream: TcpStream, peer: SocketAddr, settings: &Settings) -> Self {
        let mut socket = Socket::new(stream);
        socket.set_max_per_call(settings.max_bytes_per_call);
        Self {
            socket,
            peer,
            state: State::AwaitingRequestLine,
            input: Buffer::new(),
            line_parser: RequestLineParser::new(),
            header_parser: HeaderParser::default(),
            request: Request::new(),
            keep_alive: false,
            host: None,
            rule: None,
            handler: HandlerKind::Local,
            spool: None,
            remaining: 0,
            chunked: ChunkedParser::new(),
            body: Body::Empty,
            payload_len: 0,
            out: Buffer::new(),
            out_cursor: 0,
            payload: Payload::None,
            corked: false,
            status: 0,
            body_size: 0,
            error: None,
            location: None,
            last_modified: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn source_mut(&mut self) -> &mut TcpStream {
        self.socket.get_mut()
    }

    pub fn last_activity(&self) -> Instant {
        self.socket.last_activity()
    }

    pub fn is_awaiting_backend(&self) -> bool {
        self.state == State::AwaitingBackend
    }

    pub fn advance(&mut self, env: &mut Env<'_>) -> Step {
        for _ in 0..MAX_TRANSITIONS {
            let flow = match self.state {
                State::AwaitingRequestLine => self.read_request_line(),
                State::ReadingHeaders => self.read_headers(),
                State::Routing => self.route(env),
                State::ReadingBody => self.read_body(env),
                State::ReadingChunkedBody => self.read_chunked_body(env),
                State::PreparingUpstreamRequest => self.prepare_upstream(env),
                State::AwaitingBackend => Ok(Flow::Suspend),
                State::PreparingErrorPage => Ok(self.prepare_error_page(env)),
                State::SendingHeaders | State::SendingBackendHeaders => self.send_headers(),
                State::SendingBody | State::SendingBackendBody => self.send_body(),
                State::Completed => Ok(self.complete(env)),
            };

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Suspend) => return Step::Suspend,
                Ok(Flow::Close) => return Step::Close,
                Ok(Flow::Forward(request)) => return Step::Forward(request),
                Err(Fault::Status(status)) => self.fail(status, env),
                Err(Fault::Io(e)) => {
                    tracing::debug!(peer = %self.peer, error = %e, "Closing client connection");
                    return Step::Close;
                }
            }
        }
        Step::Revisit
    }

    /// Takes over a backend's reply. Ignored unless the connection is waiting for one.
    pub fn deliver(&mut self, reply: Reply, env: &mut Env<'_>) {
        if self.state != State::AwaitingBackend {
            reply.release(env.tmpfiles);
            return;
        }

        let response = match reply {
            Reply::Error(status) => {
                self.error = Some(status);
                self.state = State::PreparingErrorPage;
                return;
            }
            Reply::Response(response) => response,
        };

        let CompletedResponse {
            code,
            reason,
            mut headers,
            body,
        } = response;

        headers.set(Header::Connection, writer::connection_value(self.keep_alive));
        headers.remove(Header::TransferEncoding);
        headers.remove(Header::KeepAlive);
        headers.remove(Header::Status);
        headers.set(Header::Server, SERVER_NAME);

        let bodyless =
            self.request.is_head() || (100..200).contains(&code) || code == 204 || code == 304;
        if !bodyless {
            headers.set(Header::ContentLength, body.len().to_string());
        }
        if !headers.contains(Header::Date) {
            headers.add(Header::Date, env.clock.http_date());
        }

        self.out.clear();
        self.out_cursor = 0;
        writer::status_line(&mut self.out, code, &reason);
        headers.serialize(&mut self.out, HEADER_MAX_LINE_LEN);

        self.status = code;
        self.body_size = if bodyless { 0 } else { body.len() };
        self.payload = match body {
            Body::Empty => Payload::None,
            Body::Memory(bytes) => Payload::Memory(bytes),
            Body::Spool(tmp) => Payload::Spool { tmp, offset: 0 },
        };
        if bodyless {
            self.release_payload(env.tmpfiles);
        }
        self.state = State::SendingBackendHeaders;
    }

    /// Returns every temporary file held by the connection.
    pub fn release(&mut self, tmpfiles: &mut TempFiles) {
        if let Some(spool) = self.spool.take() {
            spool.discard(tmpfiles);
        }
        std::mem::take(&mut self.body).release(tmpfiles);
        self.release_payload(tmpfiles);
    }

    fn release_payload(&mut self, tmpfiles: &mut TempFiles) {
        if let Payload::Spool { tmp, .. } = std::mem::take(&mut self.payload) {
            tmpfiles.release(tmp);
        }
    }

    fn fail(&mut self, status: StatusCode, env: &mut Env<'_>) {
        let unread_body = match self.state {
            State::AwaitingRequestLine
            | State::ReadingHeaders
            | State::ReadingBody
            | State::ReadingChunkedBody => true,
            State::Routing => self.body_pending(),
            _ => false,
        };
        if unread_body {
            self.keep_alive = false;
        }
        tracing::debug!(peer = %self.peer, status = status.as_u16(), "Request failed");

        if let Some(spool) = self.spool.take() {
            spool.discard(env.tmpfiles);
        }
        std::mem::take(&mut self.body).release(env.tmpfiles);
        self.error = Some(status);
        self.state = State::PreparingErrorPage;
    }

    /// The request announced a body that has not been read.
    fn body_pending(&self) -> bool {
        self.request.is_chunked() || !matches!(self.request.content_length(), Ok(None | Some(0)))
    }

    /// Reads once; `Ok(false)` means no data is available yet.
    fn fill(&mut self) -> Result<bool, Fault> {
        match self.socket.read(&mut self.input) {
            Ok(IoStatus::Progress(_)) => Ok(true),
            Ok(IoStatus::WouldBlock) => Ok(false),
            Err(e) => Err(Fault::Io(e)),
        }
    }

    fn fill_or_suspend(&mut self) -> Result<Flow, Fault> {
        Ok(if self.fill()? { Flow::Continue } else { Flow::Suspend })
    }

    fn read_request_line(&mut self) -> Result<Flow, Fault> {
        match self.line_parser.parse(&self.input) {
            Ok(Progress::Complete(line, consumed)) => {
                self.request.method = Some(line.method);
                self.request.version = line.version;
                self.request.uri.clear();
                self.request.uri.extend_from_slice(&self.input[line.uri]);
                self.input.discard_front(consumed);
                self.header_parser.reset();
                self.state = State::ReadingHeaders;
                Ok(Flow::Continue)
            }
            Ok(Progress::NeedMoreData) => self.fill_or_suspend(),
            Err(e) => {
                tracing::debug!(peer = %self.peer, error = %e, "Invalid request line");
                Err(match e {
                    ParseError::UriTooLong => StatusCode::UriTooLong,
                    ParseError::LineTooLong => StatusCode::PayloadTooLarge,
                    _ => StatusCode::BadRequest,
                }
                .into())
            }
        }
    }

    fn read_headers(&mut self) -> Result<Flow, Fault> {
        match self.header_parser.parse(&mut self.request.headers, &self.input) {
            Ok(HeaderStatus::Complete(consumed)) => {
                self.input.discard_front(consumed);
                self.keep_alive = self.request.keep_alive();
                self.state = State::Routing;
                Ok(Flow::Continue)
            }
            Ok(HeaderStatus::NeedMoreData(_)) => self.fill_or_suspend(),
            Err(HeaderError::TooLarge) => Err(StatusCode::PayloadTooLarge.into()),
            Err(e) => {
                tracing::debug!(peer = %self.peer, error = %e, "Invalid request headers");
                Err(StatusCode::BadRequest.into())
            }
        }
    }

    fn route(&mut self, env: &mut Env<'_>) -> Result<Flow, Fault> {
        let request = &mut self.request;
        if let Err(e) = request.url.parse_into(&request.uri) {
            return Err(match e {
                UrlError::Forbidden => StatusCode::Forbidden,
                UrlError::Malformed => StatusCode::BadRequest,
            }
            .into());
        }

        let host = self.resolve_host(env)?;
        let vhost = env.hosts.get(host).ok_or(StatusCode::NotFound)?;
        self.host = Some(host);
        self.rule = vhost.find_rule(&self.request);
        self.handler = vhost.handler(self.rule);

        match self.handler {
            HandlerKind::Local => self.serve_local(env),
            HandlerKind::Http | HandlerKind::FastCgi => self.begin_forward(env),
        }
    }

    /// Picks the virtual host from the absolute URI, the Host header, or the default.
    fn resolve_host(&mut self, env: &Env<'_>) -> Result<usize, StatusCode> {
        let listen_port = env.listen_port;
        let http11 = self.request.version.is_http11();
        let host_header = self.request.headers.get_str(Header::Host).map(str::to_owned);

        let (name, port) = if let Some(name) = self.request.url.host() {
            if http11 && host_header.is_none() {
                return Err(StatusCode::BadRequest);
            }
            if self.request.url.port() != listen_port {
                return Err(StatusCode::NotFound);
            }
            (name.to_string(), listen_port)
        } else if let Some(value) = host_header {
            split_host_port(&value, listen_port)?
        } else if http11 {
            return Err(StatusCode::BadRequest);
        } else {
            let index = env.hosts.default_host().ok_or(StatusCode::NotFound)?;
            let vhost = env.hosts.get(index).ok_or(StatusCode::NotFound)?;
            (vhost.name.clone(), listen_port)
        };

        self.request.host = name;
        self.request.port = port;
        env.hosts.lookup(&self.request.host).ok_or(StatusCode::NotFound)
    }

    fn serve_local(&mut self, env: &mut Env<'_>) -> Result<Flow, Fault> {
        if !matches!(self.request.method, Some(Method::GET | Method::HEAD)) {
            return Err(StatusCode::NotImplemented.into());
        }
        if self.body_pending() {
            self.keep_alive = false;
        }

        let host = self.host.ok_or(StatusCode::InternalServerError)?;
        let (root, dir_listing) = {
            let vhost = env.hosts.get(host).ok_or(StatusCode::NotFound)?;
            (vhost.root.clone(), vhost.dir_listing)
        };

        let url_path = self.request.url.path().to_vec();
        let relative = url_path.strip_prefix(b"/").unwrap_or(&url_path);
        let mut path = root.join(OsStr::from_bytes(relative));
        let mut meta = fs::metadata(&path).map_err(fs_status)?;

        if meta.is_dir() {
            if !url_path.ends_with(b"/") {
                let target = self.request.url.target();
                let raw_path = target.split(|&c| c == b'?').next().unwrap_or(&b"/"[..]);
                let location = redirect_location(&self.request.host, self.request.port, raw_path);
                self.location = Some(location);
                return Err(StatusCode::MovedPermanently.into());
            }
            match find_index(&path, &env.settings.index_files) {
                Some((index, index_meta)) => {
                    path = index;
                    meta = index_meta;
                }
                None if dir_listing => return self.serve_listing(&path, &url_path, env),
                None => return Err(StatusCode::NotFound.into()),
            }
        }
        if !meta.is_file() {
            return Err(StatusCode::NotFound.into());
        }

        let mtime = meta.modified().unwrap_or(UNIX_EPOCH);
        let last_modified = httpdate::fmt_http_date(mtime);
        if let Some(since) = self.request.headers.get_str(Header::IfModifiedSince) {
            if let Ok(since) = httpdate::parse_http_date(since) {
                if unix_seconds(since) >= unix_seconds(mtime) {
                    self.last_modified = Some(last_modified);
                    return Err(StatusCode::NotModified.into());
                }
            }
        }

        let file = File::open(&path).map_err(fs_status)?;
        let size = meta.len();
        let content_type = env
            .mime
            .lookup_path(path.extension().map(|ext| ext.as_bytes()))
            .to_string();

        let ranges = match (self.request.method, self.request.headers.get(Header::Range)) {
            (Some(Method::GET), Some(value)) => {
                let ranges =
                    range::parse(value, size).map_err(|_| StatusCode::RangeNotSatisfiable)?;
                if ranges.is_empty() {
                    return Err(StatusCode::RangeNotSatisfiable.into());
                }
                Some(ranges)
            }
            _ => None,
        };

        let mut headers = Headers::new();
        writer::common_headers(&mut headers, env.clock.http_date(), self.keep_alive);
        headers.set(Header::AcceptRanges, "bytes");
        headers.set(Header::LastModified, &last_modified);

        let (status, length, payload) = match ranges {
            None => {
                headers.set(Header::ContentType, &content_type);
                (StatusCode::Ok, size, Payload::File { file, offset: 0, end: size })
            }
            Some(ranges) if ranges.len() == 1 => {
                let range: ByteRange =
                    ranges.get(0).copied().ok_or(StatusCode::RangeNotSatisfiable)?;
                headers.set(Header::ContentType, &content_type);
                headers.set(Header::ContentRange, writer::content_range(&range, size));
                let payload = Payload::File {
                    file,
                    offset: range.from,
                    end: range.to + 1,
                };
                (StatusCode::PartialContent, range.size(), payload)
            }
            Some(ranges) => {
                let boundary = env.next_boundary();
                let length = writer::multipart_length(&ranges, &boundary, &content_type, size);
                headers.set(Header::ContentType, writer::multipart_content_type(&boundary));
                let payload = Payload::Multipart(Box::new(Multipart {
                    file,
                    ranges,
                    index: 0,
                    boundary,
                    content_type,
                    size,
                    offset: 0,
                    phase: PartPhase::Start,
                }));
                (StatusCode::PartialContent, length, payload)
            }
        };
        headers.set(Header::ContentLength, length.to_string());

        self.out.clear();
        self.out_cursor = 0;
        writer::write_head(&mut self.out, status, &headers);
        self.status = status.as_u16();
        self.body_size = length;
        self.payload = if self.request.is_head() { Payload::None } else { payload };
        self.state = State::SendingHeaders;
        Ok(Flow::Continue)
    }

    fn serve_listing(
        &mut self,
        dir: &Path,
        url_path: &[u8],
        env: &mut Env<'_>,
    ) -> Result<Flow, Fault> {
        let mut page = Buffer::new();
        dirlisting::build(dir, &String::from_utf8_lossy(url_path), &mut page).map_err(|e| {
            tracing::debug!(dir = %dir.display(), error = %e, "Directory listing failed");
            fs_status(e)
        })?;
        let page = page.freeze();

        let mut headers = Headers::new();
        writer::common_headers(&mut headers, env.clock.http_date(), self.keep_alive);
        headers.set(Header::ContentLength, page.len().to_string());
        headers.set(Header::ContentType, HTML_CONTENT_TYPE);

        self.out.clear();
        self.out_cursor = 0;
        writer::write_head(&mut self.out, StatusCode::Ok, &headers);
        self.status = StatusCode::Ok.as_u16();
        self.body_size = page.len() as u64;
        self.payload = if self.request.is_head() {
            Payload::None
        } else {
            Payload::Memory(page)
        };
        self.state = State::SendingHeaders;
        Ok(Flow::Continue)
    }

    fn begin_forward(&mut self, env: &mut Env<'_>) -> Result<Flow, Fault> {
        let framing = match self.handler {
            HandlerKind::FastCgi => Framing::FcgiStdin,
            _ => Framing::Raw,
        };

        match self.request.method {
            Some(Method::GET | Method::HEAD) => {
                if self.body_pending() {
                    self.keep_alive = false;
                }
                self.body = Body::Empty;
                self.state = State::PreparingUpstreamRequest;
                return Ok(Flow::Continue);
            }
            Some(Method::POST | Method::PUT) => {}
            _ => return Err(StatusCode::NotImplemented.into()),
        }

        if self.request.is_chunked() {
            self.spool = Some(Spool::new(0, framing));
            self.chunked.reset();
            self.state = State::ReadingChunkedBody;
            return Ok(Flow::Continue);
        }

        let length = match self.request.content_length() {
            Ok(Some(length)) => length,
            Ok(None) => return Err(StatusCode::LengthRequired.into()),
            Err(_) => return Err(StatusCode::BadRequest.into()),
        };

        if self.input.len() as u64 >= length {
            let length = length as usize;
            let mut spool = Spool::new(usize::MAX, framing);
            spool
                .write(&self.input[..length], env.tmpfiles)
                .map_err(resource_failure)?;
            self.input.discard_front(length);
            self.finish_body(spool)?;
        } else {
            self.spool = Some(Spool::new(env.settings.max_payload_in_memory, framing));
            self.remaining = length;
            self.state = State::ReadingBody;
        }
        Ok(Flow::Continue)
    }

    fn finish_body(&mut self, spool: Spool) -> Result<(), Fault> {
        self.payload_len = spool.payload_len();
        self.body = spool.finish().map_err(resource_failure)?;
        self.state = State::PreparingUpstreamRequest;
        Ok(())
    }

    fn read_body(&mut self, env: &mut Env<'_>) -> Result<Flow, Fault> {
        let spool = self.spool.as_mut().ok_or(StatusCode::InternalServerError)?;
        if !self.input.is_empty() && self.remaining > 0 {
            let take = (self.input.len() as u64).min(self.remaining) as usize;
            spool
                .write(&self.input[..take], env.tmpfiles)
                .map_err(resource_failure)?;
            self.input.discard_front(take);
            self.remaining -= take as u64;
        }

        if self.remaining == 0 {
            if let Some(spool) = self.spool.take() {
                self.finish_body(spool)?;
            }
            return Ok(Flow::Continue);
        }
        self.fill_or_suspend()
    }

    fn read_chunked_body(&mut self, env: &mut Env<'_>) -> Result<Flow, Fault> {
        if !self.input.is_empty() {
            let spool = self.spool.as_mut().ok_or(StatusCode::InternalServerError)?;
            let tmpfiles = &mut *env.tmpfiles;
            let mut failure = None;
            let status = self.chunked.parse(&self.input, |data| match spool.write(data, tmpfiles) {
                Ok(()) => true,
                Err(e) => {
                    failure = Some(e);
                    false
                }
            });

            match status {
                Ok(ChunkedStatus::NotDone) => self.input.clear(),
                Ok(ChunkedStatus::Done(consumed)) => {
                    self.input.discard_front(consumed);
                    if let Some(spool) = self.spool.take() {
                        self.finish_body(spool)?;
                    }
                    return Ok(Flow::Continue);
                }
                Err(ChunkedError::Sink) => {
                    let e = failure.unwrap_or_else(|| io::ErrorKind::Other.into());
                    return Err(resource_failure(e));
                }
                Err(e) => {
                    tracing::debug!(peer = %self.peer, error = %e, "Invalid chunked request body");
                    return Err(StatusCode::BadRequest.into());
                }
            }
        }
        self.fill_or_suspend()
    }

    fn prepare_upstream(&mut self, env: &mut Env<'_>) -> Result<Flow, Fault> {
        let host = self.host.ok_or(StatusCode::InternalServerError)?;
        let rule = self.rule.ok_or(StatusCode::InternalServerError)?;

        let mut head = Buffer::new();
        match self.handler {
            HandlerKind::Http => self.write_http_head(&mut head),
            HandlerKind::FastCgi => self.write_fcgi_head(&mut head, host, env)?,
            HandlerKind::Local => return Err(StatusCode::InternalServerError.into()),
        }

        self.state = State::AwaitingBackend;
        Ok(Flow::Forward(UpstreamRequest {
            handler: self.handler,
            host,
            rule,
            head,
            body: std::mem::take(&mut self.body),
            is_head: self.request.is_head(),
        }))
    }

    fn has_body(&self) -> bool {
        matches!(self.request.method, Some(Method::POST | Method::PUT))
    }

    fn write_http_head(&self, head: &mut Buffer) {
        let method = self.request.method.map_or("GET", |m| m.as_str());
        head.append(method.as_bytes());
        head.push(b' ');
        head.append(self.request.url.target());
        head.append(b" HTTP/1.1\r\n");

        let mut headers = self.request.headers.clone();
        headers.remove(Header::KeepAlive);
        headers.remove(Header::ProxyConnection);
        headers.remove(Header::TransferEncoding);
        headers.set(Header::Connection, "close");
        headers.set(Header::Host, host_value(&self.request.host, self.request.port));
        if self.has_body() {
            headers.set(Header::ContentLength, self.payload_len.to_string());
        } else {
            headers.remove(Header::ContentLength);
        }
        headers.serialize(head, HEADER_MAX_LINE_LEN);
    }

    fn write_fcgi_head(&self, head: &mut Buffer, host: usize, env: &Env<'_>) -> Result<(), Fault> {
        let vhost = env.hosts.get(host).ok_or(StatusCode::InternalServerError)?;
        let root = vhost.root.as_os_str().as_bytes();
        let path = self.request.url.path();
        let method = self.request.method.map_or("GET", |m| m.as_str());

        let mut script = root.to_vec();
        if script.ends_with(b"/") {
            script.pop();
        }
        script.extend_from_slice(path);

        let mut params = Params::new();
        params.add("SERVER_NAME", &vhost.name);
        params.add("SERVER_PORT", env.listen_port.to_string());
        params.add("REQUEST_METHOD", method);
        params.add("REMOTE_ADDR", self.peer.ip().to_string());
        params.add("REMOTE_PORT", self.peer.port().to_string());
        params.add("DOCUMENT_ROOT", root);
        params.add("REQUEST_URI", self.request.url.target());
        params.add("SCRIPT_FILENAME", &script);
        params.add("SCRIPT_NAME", path);
        params.add("QUERY_STRING", self.request.url.query().unwrap_or(b""));
        params.add("SERVER_PROTOCOL", "HTTP/1.1");
        params.add("GATEWAY_INTERFACE", "CGI/1.1");
        if let Some(content_type) = self.request.headers.get(Header::ContentType) {
            params.add("CONTENT_TYPE", content_type);
        }
        if self.has_body() {
            params.add("CONTENT_LENGTH", self.payload_len.to_string());
        }
        for field in self.request.headers.iter() {
            params.add_header(field.name(), field.value());
        }

        fastcgi::begin_request(head, fastcgi::REQUEST_ID, fastcgi::ROLE_RESPONDER, false);
        params.write(head, fastcgi::REQUEST_ID);
        if self.body.is_empty() {
            fastcgi::end_stream(head, RecordType::Stdin, fastcgi::REQUEST_ID);
        }
        Ok(())
    }

    fn prepare_error_page(&mut self, env: &mut Env<'_>) -> Flow {
        let status = self.error.take().unwrap_or(StatusCode::InternalServerError);
        self.release_payload(env.tmpfiles);

        let mut headers = Headers::new();
        writer::common_headers(&mut headers, env.clock.http_date(), self.keep_alive);
        if let Some(location) = self.location.take() {
            headers.set(Header::Location, location);
        }

        if status == StatusCode::NotModified {
            if let Some(last_modified) = self.last_modified.take() {
                headers.set(Header::LastModified, last_modified);
            }
            self.body_size = 0;
        } else {
            let page = env.pages.get(status);
            headers.set(Header::ContentLength, page.len().to_string());
            headers.set(Header::ContentType, HTML_CONTENT_TYPE);
            self.body_size = page.len() as u64;
            if !self.request.is_head() {
                self.payload = Payload::Memory(page);
            }
        }

        self.out.clear();
        self.out_cursor = 0;
        writer::write_head(&mut self.out, status, &headers);
        self.status = status.as_u16();
        self.state = State::SendingHeaders;
        Flow::Continue
    }

    fn send_headers(&mut self) -> Result<Flow, Fault> {
        if self.payload.is_file() && !self.corked {
            if let Err(e) = self.socket.cork() {
                tracing::debug!(error = %e, "Failed to cork socket");
            }
            self.corked = true;
        }

        loop {
            let status = match &self.payload {
                Payload::Memory(body) => {
                    if self.out_cursor >= self.out.len() + body.len() {
                        break;
                    }
                    self.socket.writev(&[self.out.as_slice(), &body[..]], &mut self.out_cursor)
                }
                _ => {
                    if self.out_cursor >= self.out.len() {
                        break;
                    }
                    self.socket.write(self.out.as_slice(), &mut self.out_cursor)
                }
            };
            if status.map_err(Fault::Io)? == IoStatus::WouldBlock {
                return Ok(Flow::Suspend);
            }
        }

        self.state = match (&self.payload, self.state) {
            (Payload::None | Payload::Memory(_), _) => State::Completed,
            (_, State::SendingBackendHeaders) => State::SendingBackendBody,
            _ => State::SendingBody,
        };
        Ok(Flow::Continue)
    }

    fn send_body(&mut self) -> Result<Flow, Fault> {
        loop {
            let status = match &mut self.payload {
                Payload::File { file, offset, end } => {
                    if *offset >= *end {
                        break;
                    }
                    self.socket.sendfile(file, offset, *end)
                }
                Payload::Spool { tmp, offset } => {
                    let end = tmp.len();
                    if *offset >= end {
                        break;
                    }
                    self.socket.sendfile(tmp.file(), offset, end)
                }
                Payload::Multipart(part) => match part.phase {
                    PartPhase::Start => {
                        let Some(first) = part.ranges.get(0).copied() else {
                            break;
                        };
                        self.out.clear();
                        self.out_cursor = 0;
                        writer::part_header(
                            &mut self.out,
                            &part.boundary,
                            &part.content_type,
                            &first,
                            part.size,
                        );
                        part.offset = first.from;
                        part.phase = PartPhase::Header;
                        continue;
                    }
                    PartPhase::Header | PartPhase::Footer => {
                        if self.out_cursor >= self.out.len() {
                            if part.phase == PartPhase::Footer {
                                break;
                            }
                            part.phase = PartPhase::Data;
                            continue;
                        }
                        self.socket.write(self.out.as_slice(), &mut self.out_cursor)
                    }
                    PartPhase::Data => {
                        let Some(range) = part.ranges.get(part.index).copied() else {
                            break;
                        };
                        let end = range.to + 1;
                        if part.offset >= end {
                            part.index += 1;
                            self.out.clear();
                            self.out_cursor = 0;
                            match part.ranges.get(part.index).copied() {
                                Some(next) => {
                                    writer::part_header(
                                        &mut self.out,
                                        &part.boundary,
                                        &part.content_type,
                                        &next,
                                        part.size,
                                    );
                                    part.offset = next.from;
                                    part.phase = PartPhase::Header;
                                }
                                None => {
                                    writer::multipart_footer(&mut self.out, &part.boundary);
                                    part.phase = PartPhase::Footer;
                                }
                            }
                            continue;
                        }
                        self.socket.sendfile(&part.file, &mut part.offset, end)
                    }
                },
                Payload::None | Payload::Memory(_) => break,
            };
            if status.map_err(Fault::Io)? == IoStatus::WouldBlock {
                return Ok(Flow::Suspend);
            }
        }

        self.state = State::Completed;
        Ok(Flow::Continue)
    }

    fn complete(&mut self, env: &mut Env<'_>) -> Flow {
        if self.corked {
            if let Err(e) = self.socket.uncork() {
                tracing::debug!(error = %e, "Failed to uncork socket");
            }
            self.corked = false;
        }
        self.log_access(env);
        self.release(env.tmpfiles);

        if !self.keep_alive {
            return Flow::Close;
        }
        self.reset();
        Flow::Continue
    }

    fn log_access(&self, env: &mut Env<'_>) {
        let Some(host) = self.host else { return };
        let Some(vhost) = env.hosts.get_mut(host) else {
            return;
        };
        if !vhost.log_requests {
            return;
        }
        let Some(log) = vhost.access_log.as_mut() else {
            return;
        };
        log.log(&AccessRecord {
            peer: self.peer,
            date: env.clock.http_date(),
            method: self.request.method.map_or("-", |m| m.as_str()),
            host: &self.request.host,
            path: &self.request.uri,
            version: self.request.version,
            status: self.status,
            body_size: self.body_size,
            user_agent: self.request.headers.get(Header::UserAgent),
        });
    }

    /// Clears request-scoped state; pipelined input is kept.
    fn reset(&mut self) {
        self.state = State::AwaitingRequestLine;
        self.line_parser.reset();
        self.header_parser.reset();
        self.request.reset();
        self.keep_alive = false;
        self.host = None;
        self.rule = None;
        self.handler = HandlerKind::Local;
        self.remaining = 0;
        self.chunked.reset();
        self.payload_len = 0;
        self.out.shrink_to(OUTPUT_MEAN_SIZE);
        self.out_cursor = 0;
        self.status = 0;
        self.body_size = 0;
        self.error = None;
        self.location = None;
        self.last_modified = None;
        if self.input.is_empty() {
            self.input.shrink_to(INPUT_MEAN_SIZE);
        }
    }
}

/// Splits a Host header into name and port; a port must match the listener.
fn split_host_port(value: &str, listen_port: u16) -> Result<(String, u16), StatusCode> {
    if value.is_empty() {
        return Err(StatusCode::BadRequest);
    }
    match value.rfind(':') {
        Some(colon) if !value.ends_with(']') => {
            let port = value[colon + 1..]
                .parse::<u16>()
                .ok()
                .filter(|&p| p != 0)
                .ok_or(StatusCode::BadRequest)?;
            if port != listen_port {
                return Err(StatusCode::NotFound);
            }
            Ok((value[..colon].to_string(), port))
        }
        _ => Ok((value.to_string(), listen_port)),
    }
}

fn host_value(host: &str, port: u16) -> String {
    if port == HTTP_DEFAULT_PORT || port == 0 {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    }
}

fn redirect_location(host: &str, port: u16, path: &[u8]) -> String {
    format!("http://{}{}/", host_value(host, port), String::from_utf8_lossy(path))
}

fn find_index(dir: &Path, names: &[String]) -> Option<(PathBuf, Metadata)> {
    names.iter().map(|name| dir.join(name)).find_map(|candidate| {
        fs::metadata(&candidate)
            .ok()
            .filter(Metadata::is_file)
            .map(|meta| (candidate, meta))
    })
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

fn fs_status(e: io::Error) -> StatusCode {
    match e.kind() {
        io::ErrorKind::PermissionDenied => StatusCode::Forbidden,
        _ => StatusCode::NotFound,
    }
}

fn resource_failure(e: io::Error) -> Fault {
    tracing::error!(error = %e, "Failed to store request body");
    Fault::Status(StatusCode::InternalServerError)
}
