//! Backend server management
//!
//! A [`BackendList`] round-robins over the upstream servers of one routing
//! rule. A backend whose connection fails is marked down and skipped until
//! its retry interval has elapsed.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Opens non-blocking connections to backends.
pub trait Connector {
    type Stream;

    fn connect(&mut self, addr: SocketAddr) -> io::Result<Self::Stream>;
}

/// Connects with [`mio::net::TcpStream::connect`]; the handshake completes later.
#[derive(Debug, Default, Clone, Copy)]
pub struct MioConnector;

impl Connector for MioConnector {
    type Stream = mio::net::TcpStream;

    fn connect(&mut self, addr: SocketAddr) -> io::Result<Self::Stream> {
        mio::net::TcpStream::connect(addr)
    }
}

/// An upstream server with its availability record
#[derive(Debug, Clone)]
pub struct Backend {
    /// Resolved address
    pub addr: SocketAddr,

    /// `host:port` as configured, for logging
    pub name: String,

    available: bool,
    downtime: Option<Instant>,
}

impl Backend {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            addr,
            name: name.into(),
            available: true,
            downtime: None,
        }
    }

    /// Check if backend is marked available
    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn downtime(&self) -> Option<Instant> {
        self.downtime
    }

    /// A down backend becomes eligible again once `retry_interval` has passed.
    fn eligible(&self, now: Instant, retry_interval: Duration) -> bool {
        self.available
            || self
                .downtime
                .is_none_or(|down| now.saturating_duration_since(down) >= retry_interval)
    }

    fn mark_down(&mut self, now: Instant) {
        self.available = false;
        self.downtime = Some(now);
        tracing::warn!(backend = %self.name, "Backend marked as down");
    }

    fn mark_up(&mut self) {
        if !self.available {
            self.available = true;
            self.downtime = None;
            tracing::info!(backend = %self.name, "Backend recovered");
        }
    }
}

/// Backends of one rule
#[derive(Debug, Clone)]
pub struct BackendList {
    backends: Vec<Backend>,
    current: usize,
    retry_interval: Duration,
}

impl BackendList {
    pub fn new(backends: Vec<Backend>, retry_interval: Duration) -> Self {
        Self {
            backends,
            current: 0,
            retry_interval,
        }
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Backend> {
        self.backends.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Backend> {
        self.backends.iter()
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Connects to the next eligible backend in round-robin order.
    ///
    /// Each backend is tried at most once. One that refuses the connection
    /// is marked down and the scan goes on. Returns the backend's index and
    /// the new stream, or `None` after a full unsuccessful pass.
    pub fn connect_next<C: Connector>(
        &mut self,
        connector: &mut C,
        now: Instant,
    ) -> Option<(usize, C::Stream)> {
        let count = self.backends.len();
        for step in 0..count {
            let index = (self.current + step) % count;
            let backend = &mut self.backends[index];
            if !backend.eligible(now, self.retry_interval) {
                continue;
            }

            match connector.connect(backend.addr) {
                Ok(stream) => {
                    self.current = (index + 1) % count;
                    tracing::debug!(backend = %backend.name, "Connecting to backend");
                    return Some((index, stream));
                }
                Err(e) => {
                    tracing::debug!(backend = %backend.name, error = %e, "Connect failed");
                    backend.mark_down(now);
                }
            }
        }

        tracing::error!("No available backends in pool");
        None
    }

    /// Records a failure noticed after `connect_next` returned, e.g. a refused handshake.
    pub fn connection_failed(&mut self, index: usize, now: Instant) {
        if let Some(backend) = self.backends.get_mut(index) {
            backend.mark_down(now);
        }
    }

    /// Records a completed handshake.
    pub fn connection_succeeded(&mut self, index: usize) {
        if let Some(backend) = self.backends.get_mut(index) {
            backend.mark_up();
        }
    }
}
