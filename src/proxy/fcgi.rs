//! FastCGI backend connection.
//!
//! The request (begin record, params and stdin) is prebuilt by the client
//! connection. The response arrives as `Stdout` records holding a CGI
//! header block followed by the body, and ends with `EndRequest`.

use std::io;
use std::time::Instant;

use mio::net::TcpStream;

use crate::http::body::{Framing, Spool};
use crate::http::buffer::Buffer;
use crate::http::headers::{Header, HeaderError, HeaderParser, HeaderStatus, Headers};
use crate::http::response::StatusCode;
use crate::proxy::fastcgi::{self, EndRequest, RecordSink};
use crate::proxy::{
    BackendRef, BackendStep, CompletedResponse, Connect, Outgoing, Reply, UpstreamRequest,
    poll_connect,
};
use crate::server::Env;
use crate::server::io::{IoStatus, Socket};
use crate::server::tmpfiles::TempFiles;

const MAX_TRANSITIONS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    SendingRequest,
    SendingStdin,
    ReadingHeaders,
    ReadingBody,
    Completed,
}

enum Flow {
    Continue,
    Suspend,
    Done(Reply),
}

/// Response decoded from `Stdout` records.
#[derive(Debug)]
struct Response {
    parser: HeaderParser,
    block: Buffer,
    headers: Headers,
    headers_done: bool,
    spool: Option<Spool>,
    end: Option<EndRequest>,
    failure: Option<StatusCode>,
}

impl Response {
    fn new() -> Self {
        Self {
            parser: HeaderParser::default(),
            block: Buffer::new(),
            headers: Headers::new(),
            headers_done: false,
            spool: None,
            end: None,
            failure: None,
        }
    }
}

struct StdoutSink<'a> {
    response: &'a mut Response,
    tmpfiles: &'a mut TempFiles,
    threshold: usize,
}

impl StdoutSink<'_> {
    fn spool(&mut self, data: &[u8]) -> bool {
        let threshold = self.threshold;
        let spool = self
            .response
            .spool
            .get_or_insert_with(|| Spool::new(threshold, Framing::Raw));
        match spool.write(data, self.tmpfiles) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Failed to spool FastCGI response");
                self.response.failure = Some(StatusCode::InternalServerError);
                false
            }
        }
    }
}

impl RecordSink for StdoutSink<'_> {
    fn stdout(&mut self, data: &[u8]) -> bool {
        if self.response.headers_done {
            return self.spool(data);
        }

        let response = &mut *self.response;
        response.block.append(data);
        match response.parser.parse(&mut response.headers, &response.block) {
            Ok(HeaderStatus::NeedMoreData(_)) => true,
            Ok(HeaderStatus::Complete(offset)) => {
                response.headers_done = true;
                let block = response.block.take();
                self.spool(&block[offset..])
            }
            Err(e) => {
                match e {
                    HeaderError::TooLarge => tracing::debug!("FastCGI headers too large"),
                    _ => tracing::debug!(error = %e, "Invalid FastCGI headers"),
                }
                self.response.failure = Some(StatusCode::BadGateway);
                false
            }
        }
    }

    fn end_request(&mut self, end: EndRequest) -> bool {
        self.response.end = Some(end);
        true
    }
}

#[derive(Debug)]
pub struct FcgiConnection {
    socket: Socket<TcpStream>,
    target: BackendRef,
    state: State,
    outgoing: Outgoing,
    input: Buffer,
    response: Response,
}

impl FcgiConnection {
    pub fn new(stream: TcpStream, request: UpstreamRequest, target: BackendRef) -> Self {
        Self {
            socket: Socket::new(stream),
            target,
            state: State::Connecting,
            outgoing: Outgoing::new(request.head, request.body),
            input: Buffer::new(),
            response: Response::new(),
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

    pub fn advance(&mut self, env: &mut Env<'_>) -> BackendStep {
        for _ in 0..MAX_TRANSITIONS {
            let flow = match self.state {
                State::Connecting => self.connecting(env),
                State::SendingRequest => self.send_request(),
                State::SendingStdin => self.send_stdin(env),
                State::ReadingHeaders | State::ReadingBody => self.read_response(env),
                State::Completed => self.complete(),
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

    pub fn release(&mut self, tmpfiles: &mut TempFiles) {
        self.outgoing.release(tmpfiles);
        if let Some(spool) = self.response.spool.take() {
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
                self.state = State::SendingRequest;
                Ok(Flow::Continue)
            }
            Connect::Failed(e) => {
                tracing::warn!(error = %e, "FastCGI backend connection failed");
                if let Some(list) = env.hosts.backends_mut(self.target.host, self.target.rule) {
                    list.connection_failed(self.target.backend, env.clock.now);
                }
                Err(StatusCode::GatewayTimeout)
            }
        }
    }

    fn send_request(&mut self) -> Result<Flow, StatusCode> {
        match self.outgoing.send_head(&mut self.socket) {
            Ok(true) => {
                self.state = State::SendingStdin;
                Ok(Flow::Continue)
            }
            Ok(false) => Ok(Flow::Suspend),
            Err(e) => Err(io_failure(e)),
        }
    }

    fn send_stdin(&mut self, env: &mut Env<'_>) -> Result<Flow, StatusCode> {
        match self.outgoing.send_body(&mut self.socket) {
            Ok(true) => {
                self.outgoing.release(env.tmpfiles);
                self.state = State::ReadingHeaders;
                Ok(Flow::Continue)
            }
            Ok(false) => Ok(Flow::Suspend),
            Err(e) => Err(io_failure(e)),
        }
    }

    fn read_response(&mut self, env: &mut Env<'_>) -> Result<Flow, StatusCode> {
        match self.socket.read(&mut self.input) {
            Ok(IoStatus::Progress(_)) => {}
            Ok(IoStatus::WouldBlock) => return Ok(Flow::Suspend),
            Err(e) => return Err(io_failure(e)),
        }

        let mut sink = StdoutSink {
            response: &mut self.response,
            tmpfiles: &mut *env.tmpfiles,
            threshold: env.settings.max_payload_in_memory,
        };
        if let Err(e) = fastcgi::parse_records(&mut self.input, &mut sink) {
            tracing::debug!(error = %e, "FastCGI response rejected");
            return Err(self.response.failure.unwrap_or(StatusCode::BadGateway));
        }

        if self.response.headers_done {
            self.state = State::ReadingBody;
        }
        if self.response.end.is_some() {
            self.state = State::Completed;
        }
        Ok(Flow::Continue)
    }

    fn complete(&mut self) -> Result<Flow, StatusCode> {
        let end = self.response.end.ok_or(StatusCode::BadGateway)?;
        match end.protocol_status {
            fastcgi::REQUEST_COMPLETE => {}
            fastcgi::OVERLOADED => return Err(StatusCode::ServiceUnavailable),
            status @ (fastcgi::CANT_MPX_CONN | fastcgi::UNKNOWN_ROLE) => {
                tracing::warn!(status, "FastCGI backend refused the request");
                return Err(StatusCode::BadGateway);
            }
            status => {
                tracing::warn!(status, "Unknown FastCGI protocol status");
                return Err(StatusCode::BadGateway);
            }
        }
        if !self.response.headers_done {
            tracing::debug!("FastCGI response ended before its headers");
            return Err(StatusCode::BadGateway);
        }

        let mut headers = std::mem::take(&mut self.response.headers);
        let (code, reason) = parse_status(headers.get(Header::Status))?;
        headers.remove(Header::Status);

        let body = match self.response.spool.take() {
            Some(spool) => spool.finish().map_err(|e| {
                tracing::error!(error = %e, "Failed to finish FastCGI response");
                StatusCode::InternalServerError
            })?,
            None => Default::default(),
        };
        Ok(Flow::Done(Reply::Response(CompletedResponse {
            code,
            reason,
            headers,
            body,
        })))
    }
}

/// Splits a CGI `Status` value such as `404 Not Found`; absent means 200.
pub fn parse_status(value: Option<&[u8]>) -> Result<(u16, Vec<u8>), StatusCode> {
    let Some(value) = value else {
        return Ok((200, b"OK".to_vec()));
    };
    let (code, reason) = match value.iter().position(|&c| c == b' ') {
        Some(sp) => (&value[..sp], &value[sp + 1..]),
        None => (value, &b""[..]),
    };
    let code = std::str::from_utf8(code)
        .ok()
        .filter(|c| c.len() == 3)
        .and_then(|c| c.parse::<u16>().ok())
        .filter(|c| (100..=599).contains(c))
        .ok_or(StatusCode::BadGateway)?;
    Ok((code, reason.to_vec()))
}

fn io_failure(e: io::Error) -> StatusCode {
    tracing::debug!(error = %e, "FastCGI backend I/O failed");
    StatusCode::GatewayTimeout
}
