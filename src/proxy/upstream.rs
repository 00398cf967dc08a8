//! HTTP backend connection
//!
//! Forwards one request to an upstream HTTP server and collects the
//! response. Framing of the response body is decided from the status and
//! headers:
//!
//! - `HEAD` requests and 1xx/204/304 responses have no body.
//! - `Content-Length` gives a fixed length.
//! - `Transfer-Encoding: chunked` is decoded into a temporary file.
//! - Otherwise the body runs until the backend closes. A 302 without length
//!   is taken as empty, and a backend that promised to keep the connection
//!   open cannot delimit its body this way, which is a bad gateway.

use std::io;
use std::time::{Duration, Instant};

use mio::net::TcpStream;

use crate::http::body::{Body, Framing, Spool};
use crate::http::buffer::Buffer;
use crate::http::chunked::{ChunkedParser, ChunkedStatus};
use crate::http::headers::{Header, HeaderParser, HeaderStatus, Headers, contains_ignore_case};
use crate::http::parser::{Progress, StatusLineParser};
use crate::http::request::Version;
use crate::http::response::StatusCode;
use crate::proxy::{
    BackendRef, BackendStep, CompletedResponse, Connect, Outgoing, Reply, UpstreamRequest,
    poll_connect,
};
use crate::server::Env;
use crate::server::io::{IoStatus, Socket};
use crate::server::tmpfiles::TempFiles;

const MAX_TRANSITIONS: usize = 32;

/// Statuses that carry no body when the backend gives no length.
const EMPTY_WITHOUT_LENGTH: [u16; 1] = [302];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    SendingHeaders,
    SendingBody,
    ReadingStatusLine,
    ReadingHeaders,
    ReadingBody,
    ReadingChunkedBody,
    ReadingUnknownLengthBody,
    Completed,
}

enum Flow {
    Continue,
    Suspend,
    Done(Reply),
}

/// How the response body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    None,
    Length(u64),
    Chunked,
    UntilClose,
}

/// Applies the framing rules to a parsed response head.
pub(crate) fn body_framing(
    code: u16,
    version: Version,
    headers: &Headers,
    is_head: bool,
) -> Result<BodyFraming, StatusCode> {
    if is_head || (100..200).contains(&code) || code == 204 || code == 304 {
        return Ok(BodyFraming::None);
    }

    if let Some(value) = headers.get(Header::ContentLength) {
        return std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(BodyFraming::Length)
            .ok_or(StatusCode::BadGateway);
    }

    if headers
        .get(Header::TransferEncoding)
        .is_some_and(|v| contains_ignore_case(v, b"chunked"))
    {
        return Ok(BodyFraming::Chunked);
    }

    if EMPTY_WITHOUT_LENGTH.contains(&code) {
        return Ok(BodyFraming::None);
    }

    let keeps_open = match headers.get(Header::Connection) {
        Some(value) => contains_ignore_case(value, b"keep-alive"),
        None => version.is_http11(),
    };
    if keeps_open {
        return Err(StatusCode::BadGateway);
    }
    Ok(BodyFraming::UntilClose)
}

#[derive(Debug)]
pub struct ProxyConnection {
    socket: Socket<TcpStream>,
    target: BackendRef,
    state: State,
    outgoing: Outgoing,
    is_head: bool,

    input: Buffer,
    status_parser: StatusLineParser,
    header_parser: HeaderParser,
    version: Version,
    code: u16,
    reason: Vec<u8>,
    headers: Headers,

    spool: Option<Spool>,
    remaining: u64,
    chunked: ChunkedParser,
}

impl ProxyConnection {
    pub fn new(stream: TcpStream, request: UpstreamRequest, target: BackendRef) -> Self {
        Self {
            socket: Socket::new(stream),
            target,
            state: State::Connecting,
            outgoing: Outgoing::new(request.head, request.body),
            is_head: request.is_head,
            input: Buffer::new(),
            status_parser: StatusLineParser::new(),
            header_parser: HeaderParser::default(),
            version: Version::HTTP_11,
            code: 0,
            reason: Vec::new(),
            headers: Headers::new(),
            spool: None,
            remaining: 0,
            chunked: ChunkedParser::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn target(&self) -> BackendRef {
        self.target
    }

    pub fn source_mut(&mut self) -> &mut TcpStream {
        self.socket.get_mut()
    }

    pub fn last_activity(&self) -> Instant {
        self.socket.last_activity()
    }

    pub fn is_stalled(&self, idle: Duration, threshold: Duration) -> bool {
        self.state == State::ReadingUnknownLengthBody
            && self.spool.as_ref().is_some_and(|s| s.payload_len() > 0)
            && idle > threshold
    }

    pub fn advance(&mut self, env: &mut Env<'_>) -> BackendStep {
        for _ in 0..MAX_TRANSITIONS {
            let flow = match self.state {
                State::Connecting => self.connecting(env),
                State::SendingHeaders => self.send_headers(),
                State::SendingBody => self.send_body(env),
                State::ReadingStatusLine => self.read_status_line(),
                State::ReadingHeaders => self.read_headers(env),
                State::ReadingBody => self.read_body(env),
                State::ReadingChunkedBody => self.read_chunked_body(env),
                State::ReadingUnknownLengthBody => self.read_until_close(env),
                State::Completed => Ok(Flow::Done(self.complete(env))),
            };

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Suspend) => return BackendStep::Suspend,
                Ok(Flow::Done(reply)) => return BackendStep::Done(reply),
                Err(status) => {
                    self.release(env.tmpfiles);
                    self.state = State::Completed;
                    return BackendStep::Done(Reply::Error(status));
                }
            }
        }
        BackendStep::Revisit
    }

    pub fn force_complete(&mut self, env: &mut Env<'_>) -> Reply {
        tracing::debug!(backend = self.target.backend, "Completing stalled response body");
        self.complete(env)
    }

    pub fn release(&mut self, tmpfiles: &mut TempFiles) {
        self.outgoing.release(tmpfiles);
        if let Some(spool) = self.spool.take() {
            spool.discard(tmpfiles);
        }
    }

    fn connecting(&mut self, env: &mut Env<'_>) -> Result<Flow, StatusCode> {
        match poll_connect(self.socket.get_ref()) {
            Connect::Pending => Ok(Flow::Suspend),
            Connect::Connected => {
                if let Some(list) = env.hosts.backends_mut(self.target.host, self.target.rule) {
                    list.connection_succeeded(self.target.backend);
                }
                self.socket.touch();
                self.state = State::SendingHeaders;
                Ok(Flow::Continue)
            }
            Connect::Failed(e) => {
                tracing::warn!(error = %e, "Backend connection failed");
                if let Some(list) = env.hosts.backends_mut(self.target.host, self.target.rule) {
                    list.connection_failed(self.target.backend, env.clock.now);
                }
                Err(StatusCode::GatewayTimeout)
            }
        }
    }

    fn send_headers(&mut self) -> Result<Flow, StatusCode> {
        match self.outgoing.send_head(&mut self.socket) {
            Ok(true) => {
                self.state = State::SendingBody;
                Ok(Flow::Continue)
            }
            Ok(false) => Ok(Flow::Suspend),
            Err(e) => Err(io_failure(e)),
        }
    }

    fn send_body(&mut self, env: &mut Env<'_>) -> Result<Flow, StatusCode> {
        match self.outgoing.send_body(&mut self.socket) {
            Ok(true) => {
                self.outgoing.release(env.tmpfiles);
                self.state = State::ReadingStatusLine;
                Ok(Flow::Continue)
            }
            Ok(false) => Ok(Flow::Suspend),
            Err(e) => Err(io_failure(e)),
        }
    }

    /// Reads once; `Ok(false)` means no data is available yet.
    fn fill(&mut self) -> Result<bool, StatusCode> {
        match self.socket.read(&mut self.input) {
            Ok(IoStatus::Progress(_)) => Ok(true),
            Ok(IoStatus::WouldBlock) => Ok(false),
            Err(e) => Err(io_failure(e)),
        }
    }

    fn read_status_line(&mut self) -> Result<Flow, StatusCode> {
        match self.status_parser.parse(&self.input) {
            Ok(Progress::Complete(line, consumed)) => {
                self.version = line.version;
                self.code = line.code;
                self.reason = self.input[line.reason].to_vec();
                self.input.discard_front(consumed);
                self.state = State::ReadingHeaders;
                Ok(Flow::Continue)
            }
            Ok(Progress::NeedMoreData) => self.fill().map(continue_or_suspend),
            Err(e) => {
                tracing::debug!(error = %e, "Invalid backend status line");
                Err(StatusCode::BadGateway)
            }
        }
    }

    fn read_headers(&mut self, env: &mut Env<'_>) -> Result<Flow, StatusCode> {
        match self.header_parser.parse(&mut self.headers, &self.input) {
            Ok(HeaderStatus::Complete(consumed)) => {
                self.input.discard_front(consumed);
                self.start_body(env)
            }
            Ok(HeaderStatus::NeedMoreData(_)) => self.fill().map(continue_or_suspend),
            Err(e) => {
                tracing::debug!(error = %e, "Invalid backend headers");
                Err(StatusCode::BadGateway)
            }
        }
    }

    fn start_body(&mut self, env: &mut Env<'_>) -> Result<Flow, StatusCode> {
        let framing = body_framing(self.code, self.version, &self.headers, self.is_head)?;
        let threshold = env.settings.max_payload_in_memory;
        self.state = match framing {
            BodyFraming::None => State::Completed,
            BodyFraming::Length(0) => State::Completed,
            BodyFraming::Length(len) => {
                self.remaining = len;
                self.spool = Some(Spool::new(threshold, Framing::Raw));
                State::ReadingBody
            }
            BodyFraming::Chunked => {
                self.spool = Some(Spool::new(0, Framing::Raw));
                State::ReadingChunkedBody
            }
            BodyFraming::UntilClose => {
                self.spool = Some(Spool::new(threshold, Framing::Raw));
                State::ReadingUnknownLengthBody
            }
        };
        Ok(Flow::Continue)
    }

    fn read_body(&mut self, env: &mut Env<'_>) -> Result<Flow, StatusCode> {
        let spool = self.spool.as_mut().ok_or(StatusCode::InternalServerError)?;
        if !self.input.is_empty() {
            let take = (self.input.len() as u64).min(self.remaining) as usize;
            spool
                .write(&self.input[..take], env.tmpfiles)
                .map_err(resource_failure)?;
            self.remaining -= take as u64;
            // Bytes past the declared length are dropped.
            self.input.clear();
        }
        if self.remaining == 0 {
            self.state = State::Completed;
            return Ok(Flow::Continue);
        }
        self.fill().map(continue_or_suspend)
    }

    fn read_chunked_body(&mut self, env: &mut Env<'_>) -> Result<Flow, StatusCode> {
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
            if let Some(e) = failure {
                return Err(resource_failure(e));
            }
            match status {
                Ok(ChunkedStatus::NotDone) => self.input.clear(),
                Ok(ChunkedStatus::Done(_)) => {
                    self.input.clear();
                    self.state = State::Completed;
                    return Ok(Flow::Continue);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Invalid chunked body from backend");
                    return Err(StatusCode::BadGateway);
                }
            }
        }
        self.fill().map(continue_or_suspend)
    }

    fn read_until_close(&mut self, env: &mut Env<'_>) -> Result<Flow, StatusCode> {
        let spool = self.spool.as_mut().ok_or(StatusCode::InternalServerError)?;
        if !self.input.is_empty() {
            spool.write(&self.input, env.tmpfiles).map_err(resource_failure)?;
            self.input.clear();
        }
        match self.socket.read(&mut self.input) {
            Ok(IoStatus::Progress(_)) => Ok(Flow::Continue),
            Ok(IoStatus::WouldBlock) => Ok(Flow::Suspend),
            // Only an orderly close ends this body.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.state = State::Completed;
                Ok(Flow::Continue)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Backend failed during an unterminated body");
                Err(StatusCode::BadGateway)
            }
        }
    }

    fn complete(&mut self, env: &mut Env<'_>) -> Reply {
        self.state = State::Completed;
        let body = match self.spool.take() {
            None => Ok(Body::Empty),
            Some(spool) => spool.finish(),
        };
        match body {
            Ok(body) => Reply::Response(CompletedResponse {
                code: self.code,
                reason: std::mem::take(&mut self.reason),
                headers: std::mem::take(&mut self.headers),
                body,
            }),
            Err(e) => {
                tracing::error!(error = %e, "Failed to finish response spool");
                self.release(env.tmpfiles);
                Reply::Error(StatusCode::InternalServerError)
            }
        }
    }
}

fn continue_or_suspend(progressed: bool) -> Flow {
    if progressed { Flow::Continue } else { Flow::Suspend }
}

fn io_failure(e: io::Error) -> StatusCode {
    tracing::debug!(error = %e, "Backend I/O failed");
    StatusCode::GatewayTimeout
}

fn resource_failure(e: io::Error) -> StatusCode {
    tracing::error!(error = %e, "Failed to spool backend response");
    StatusCode::InternalServerError
}
