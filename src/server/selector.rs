//! Readiness multiplexer over `mio`.
//!
//! mio registrations are persistent and edge-triggered on every platform,
//! so the only mechanism difference left to absorb is re-arming: a source
//! registered as resumable can be re-registered to get a fresh event while
//! it is still ready, which the listener needs when it stops accepting
//! before draining its backlog.

use std::collections::HashSet;
use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token};

/// Receives readiness notifications from [`Selector::run_once`].
pub trait Handler {
    fn on_readable(&mut self, token: Token);
    fn on_writable(&mut self, token: Token);
    /// The source failed; it should be torn down and deregistered.
    fn on_error(&mut self, token: Token);
}

/// Owned handle for (de)registering sources while the selector is polling.
#[derive(Debug)]
pub struct Registrar {
    registry: Registry,
    resumable: HashSet<Token>,
}

impl Registrar {
    pub fn register<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
        resumable: bool,
    ) -> io::Result<()> {
        self.registry.register(source, token, interest)?;
        if resumable {
            self.resumable.insert(token);
        }
        Ok(())
    }

    pub fn deregister<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
    ) -> io::Result<()> {
        self.resumable.remove(&token);
        self.registry.deregister(source)
    }

    /// Requests a new event for a resumable source that may still be ready.
    ///
    /// Other sources keep their registration and are only re-armed by
    /// draining them to `WouldBlock`, so this is a no-op for them.
    pub fn rearm<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        if self.resumable.contains(&token) {
            self.registry.reregister(source, token, interest)
        } else {
            Ok(())
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[derive(Debug)]
pub struct Selector {
    poll: Poll,
    events: Events,
}

impl Selector {
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity.max(1)),
        })
    }

    pub fn registrar(&self) -> io::Result<Registrar> {
        Ok(Registrar {
            registry: self.poll.registry().try_clone()?,
            resumable: HashSet::new(),
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Waits for readiness (or `timeout`) and dispatches every event.
    ///
    /// A readable and a writable report for the same source produce one
    /// call each. An error report produces only `on_error`. An interrupted
    /// wait returns `Ok(0)`; any other wait failure is returned.
    pub fn run_once<H: Handler>(
        &mut self,
        timeout: Option<Duration>,
        handler: &mut H,
    ) -> io::Result<usize> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            tracing::error!(error = %e, "Selector wait failed");
            return Err(e);
        }

        let mut count = 0;
        for event in self.events.iter() {
            count += 1;
            let token = event.token();
            if event.is_error() {
                handler.on_error(token);
                continue;
            }
            if event.is_readable() || event.is_read_closed() {
                handler.on_readable(token);
            }
            if event.is_writable() || event.is_write_closed() {
                handler.on_writable(token);
            }
        }
        Ok(count)
    }
}
