//! Backend-facing side of the gateway.
//!
//! A client connection that routes to a backend hands an [`UpstreamRequest`]
//! to the event loop, which picks a backend from the rule's
//! [`BackendList`](backend::BackendList) and drives a [`BackendConnection`]
//! until it produces a [`Reply`]. The reply owns the response body, so the
//! client takes it over without the two connections sharing state.

pub mod backend;
pub mod fastcgi;
pub mod fcgi;
pub mod upstream;

use std::io;
use std::time::{Duration, Instant};

use mio::net::TcpStream;

use crate::http::body::Body;
use crate::http::buffer::Buffer;
use crate::http::headers::Headers;
use crate::http::response::StatusCode;
use crate::http::vhost::HandlerKind;
use crate::server::Env;
use crate::server::io::{IoStatus, Socket};
use crate::server::tmpfiles::TempFiles;

pub use fcgi::FcgiConnection;
pub use upstream::ProxyConnection;

/// A request ready to be written to a backend.
#[derive(Debug)]
pub struct UpstreamRequest {
    pub handler: HandlerKind,
    pub host: usize,
    pub rule: usize,
    /// Request line and headers, or the FastCGI begin and params records.
    pub head: Buffer,
    pub body: Body,
    pub is_head: bool,
}

/// Which backend of which rule a connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendRef {
    pub host: usize,
    pub rule: usize,
    pub backend: usize,
}

/// A backend response, ready to be relayed.
#[derive(Debug)]
pub struct CompletedResponse {
    pub code: u16,
    pub reason: Vec<u8>,
    pub headers: Headers,
    pub body: Body,
}

#[derive(Debug)]
pub enum Reply {
    Response(CompletedResponse),
    Error(StatusCode),
}

impl Reply {
    pub fn release(self, tmpfiles: &mut TempFiles) {
        if let Reply::Response(response) = self {
            response.body.release(tmpfiles);
        }
    }
}

#[derive(Debug)]
pub enum BackendStep {
    Suspend,
    Revisit,
    Done(Reply),
}

#[derive(Debug)]
pub enum BackendConnection {
    Fcgi(FcgiConnection),
    Proxy(ProxyConnection),
}

impl BackendConnection {
    pub fn new(stream: TcpStream, request: UpstreamRequest, target: BackendRef) -> Self {
        match request.handler {
            HandlerKind::FastCgi => {
                BackendConnection::Fcgi(FcgiConnection::new(stream, request, target))
            }
            _ => BackendConnection::Proxy(ProxyConnection::new(stream, request, target)),
        }
    }

    pub fn advance(&mut self, env: &mut Env<'_>) -> BackendStep {
        match self {
            BackendConnection::Fcgi(conn) => conn.advance(env),
            BackendConnection::Proxy(conn) => conn.advance(env),
        }
    }

    pub fn source_mut(&mut self) -> &mut TcpStream {
        match self {
            BackendConnection::Fcgi(conn) => conn.source_mut(),
            BackendConnection::Proxy(conn) => conn.source_mut(),
        }
    }

    pub fn last_activity(&self) -> Instant {
        match self {
            BackendConnection::Fcgi(conn) => conn.last_activity(),
            BackendConnection::Proxy(conn) => conn.last_activity(),
        }
    }

    pub fn target(&self) -> BackendRef {
        match self {
            BackendConnection::Fcgi(conn) => conn.target(),
            BackendConnection::Proxy(conn) => conn.target(),
        }
    }

    /// An unknown-length body that received data but has gone quiet.
    pub fn is_stalled(&self, idle: Duration, threshold: Duration) -> bool {
        match self {
            BackendConnection::Proxy(conn) => conn.is_stalled(idle, threshold),
            BackendConnection::Fcgi(_) => false,
        }
    }

    /// Ends a stalled unknown-length body with what has arrived.
    pub fn force_complete(&mut self, env: &mut Env<'_>) -> Reply {
        match self {
            BackendConnection::Proxy(conn) => conn.force_complete(env),
            BackendConnection::Fcgi(_) => Reply::Error(StatusCode::GatewayTimeout),
        }
    }

    /// Returns every temporary file still held.
    pub fn release(&mut self, tmpfiles: &mut TempFiles) {
        match self {
            BackendConnection::Fcgi(conn) => conn.release(tmpfiles),
            BackendConnection::Proxy(conn) => conn.release(tmpfiles),
        }
    }
}

/// Outcome of checking a non-blocking connect.
#[derive(Debug)]
pub(crate) enum Connect {
    Pending,
    Connected,
    Failed(io::Error),
}

pub(crate) fn poll_connect(stream: &TcpStream) -> Connect {
    match stream.take_error() {
        Ok(Some(e)) | Err(e) => return Connect::Failed(e),
        Ok(None) => {}
    }
    match stream.peer_addr() {
        Ok(_) => Connect::Connected,
        Err(e) if matches!(e.kind(), io::ErrorKind::NotConnected | io::ErrorKind::WouldBlock) => {
            Connect::Pending
        }
        Err(e) => Connect::Failed(e),
    }
}

/// Request bytes on their way to a backend.
#[derive(Debug)]
pub(crate) struct Outgoing {
    head: Buffer,
    body: Body,
    cursor: usize,
    file_offset: u64,
}

impl Outgoing {
    pub fn new(head: Buffer, body: Body) -> Self {
        Self {
            head,
            body,
            cursor: 0,
            file_offset: 0,
        }
    }

    /// Writes the head, and an in-memory body with it. `Ok(true)` once sent.
    pub fn send_head(&mut self, socket: &mut Socket<TcpStream>) -> io::Result<bool> {
        let Outgoing { head, body, cursor, .. } = self;
        loop {
            let status = match body {
                Body::Memory(bytes) => {
                    if *cursor >= head.len() + bytes.len() {
                        return Ok(true);
                    }
                    socket.writev(&[head.as_slice(), &bytes[..]], cursor)?
                }
                _ => {
                    if *cursor >= head.len() {
                        return Ok(true);
                    }
                    socket.write(head.as_slice(), cursor)?
                }
            };
            if status == IoStatus::WouldBlock {
                return Ok(false);
            }
        }
    }

    /// Sends a spooled body. `Ok(true)` once sent or if there is none.
    pub fn send_body(&mut self, socket: &mut Socket<TcpStream>) -> io::Result<bool> {
        let Body::Spool(tmp) = &self.body else {
            return Ok(true);
        };
        while self.file_offset < tmp.len() {
            let status = socket.sendfile(tmp.file(), &mut self.file_offset, tmp.len())?;
            if status == IoStatus::WouldBlock {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn release(&mut self, tmpfiles: &mut TempFiles) {
        std::mem::take(&mut self.body).release(tmpfiles);
        self.head.free();
    }
}
