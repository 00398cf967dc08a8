//! The event loop.
//!
//! One thread owns the listening socket, every client and backend
//! connection, and the loop-wide resources. Readiness events only queue a
//! connection on the ready list; the list is drained once per iteration, so
//! a connection that still has work after its transition budget is visited
//! again before the next wait without starving the others.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token, Waker};
use tracing::{debug, info, warn};

use crate::http::connection::{HttpConnection, Step};
use crate::http::mime::MimeTypes;
use crate::http::response::{ErrorPages, StatusCode};
use crate::http::vhost::VirtualHosts;
use crate::proxy::backend::MioConnector;
use crate::proxy::{BackendConnection, BackendRef, BackendStep, Reply, UpstreamRequest};
use crate::server::context::Clock;
use crate::server::selector::{Handler, Registrar, Selector};
use crate::server::slab::{Handle, Slab};
use crate::server::tmpfiles::TempFiles;
use crate::server::{Env, Gateway, Settings};

const LISTENER: Token = Token(usize::MAX);
const WAKER: Token = Token(usize::MAX - 1);

const TICK: Duration = Duration::from_secs(1);
const EVENTS_CAPACITY: usize = 1024;
/// Connections accepted per readiness event before yielding to the others.
const ACCEPT_BUDGET: usize = 64;

/// Stops a running [`Server`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            tracing::error!(error = %e, "Failed to wake the event loop");
        }
    }
}

/// Loop-wide resources lent to a state machine through [`Env`].
struct Shared {
    clock: Clock,
    settings: Settings,
    hosts: VirtualHosts,
    tmpfiles: TempFiles,
    pages: ErrorPages,
    mime: MimeTypes,
    boundary: u64,
    listen_port: u16,
}

impl Shared {
    fn env(&mut self) -> Env<'_> {
        Env {
            clock: &self.clock,
            settings: &self.settings,
            hosts: &mut self.hosts,
            tmpfiles: &mut self.tmpfiles,
            pages: &self.pages,
            mime: &self.mime,
            boundary: &mut self.boundary,
            listen_port: self.listen_port,
        }
    }
}

enum Conn {
    Client(Box<HttpConnection>),
    Backend(Box<BackendConnection>),
}

impl Conn {
    fn source_mut(&mut self) -> &mut TcpStream {
        match self {
            Conn::Client(conn) => conn.source_mut(),
            Conn::Backend(conn) => conn.source_mut(),
        }
    }
}

struct Slot {
    conn: Conn,
    /// The other end of a client/backend pair.
    peer: Option<Handle>,
    queued: bool,
}

struct Core {
    listener: TcpListener,
    registrar: Registrar,
    shared: Shared,
    slots: Slab<Slot>,
    ready: VecDeque<Handle>,
    next_tick: Instant,
    last_log_sync: Instant,
}

pub struct Server {
    selector: Selector,
    core: Core,
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Server {
    pub fn bind(gateway: Gateway) -> io::Result<Self> {
        let selector = Selector::new(EVENTS_CAPACITY)?;
        let mut registrar = selector.registrar()?;

        let mut listener = TcpListener::bind(gateway.listen)?;
        let local_addr = listener.local_addr()?;
        registrar.register(&mut listener, LISTENER, Interest::READABLE, true)?;
        let waker = Arc::new(Waker::new(selector.registry(), WAKER)?);
        info!("Listening on {}", local_addr);

        let clock = Clock::new();
        let now = clock.now;
        let capacity = gateway.settings.max_connections;
        let core = Core {
            listener,
            registrar,
            shared: Shared {
                clock,
                settings: gateway.settings,
                hosts: gateway.hosts,
                tmpfiles: gateway.tmpfiles,
                pages: ErrorPages::new(),
                mime: gateway.mime,
                boundary: 0,
                listen_port: local_addr.port(),
            },
            slots: Slab::with_capacity(capacity),
            ready: VecDeque::new(),
            next_tick: now + TICK,
            last_log_sync: now,
        };

        Ok(Self {
            selector,
            core,
            local_addr,
            stop: Arc::new(AtomicBool::new(false)),
            waker,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Runs until stopped through a [`ShutdownHandle`] or the selector fails.
    pub fn run(mut self) -> io::Result<()> {
        let result = self.run_loop();
        self.core.shutdown();
        result
    }

    fn run_loop(&mut self) -> io::Result<()> {
        while !self.stop.load(Ordering::SeqCst) {
            let timeout = if self.core.ready.is_empty() {
                self.core.next_tick.saturating_duration_since(Instant::now())
            } else {
                Duration::ZERO
            };
            self.selector.run_once(Some(timeout), &mut self.core)?;
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            self.core.drain_ready();
            if Instant::now() >= self.core.next_tick {
                self.core.tick();
            }
        }
        Ok(())
    }
}

impl Handler for Core {
    fn on_readable(&mut self, token: Token) {
        match token {
            LISTENER => self.accept(),
            WAKER => {}
            token => self.enqueue(Handle::from_token(token)),
        }
    }

    fn on_writable(&mut self, token: Token) {
        if token != LISTENER && token != WAKER {
            self.enqueue(Handle::from_token(token));
        }
    }

    fn on_error(&mut self, token: Token) {
        match token {
            LISTENER => warn!("Listening socket reported an error"),
            WAKER => {}
            token => {
                let handle = Handle::from_token(token);
                match self.slots.get(handle).map(|slot| &slot.conn) {
                    Some(Conn::Client(_)) => self.close(handle),
                    // The backend finds the error itself and answers its client.
                    Some(Conn::Backend(_)) => self.enqueue(handle),
                    None => {}
                }
            }
        }
    }
}

impl Core {
    fn enqueue(&mut self, handle: Handle) {
        if let Some(slot) = self.slots.get_mut(handle) {
            if !slot.queued {
                slot.queued = true;
                self.ready.push_back(handle);
            }
        }
    }

    fn accept(&mut self) {
        for _ in 0..ACCEPT_BUDGET {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    return;
                }
            }
        }
        // The backlog may still hold connections.
        if let Err(e) = self.registrar.rearm(&mut self.listener, LISTENER, Interest::READABLE) {
            warn!(error = %e, "Failed to rearm listener");
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.slots.len() >= self.shared.settings.max_connections {
            warn!(peer = %peer, "Connection limit reached, dropping connection");
            return;
        }

        let conn = HttpConnection::new(stream, peer, &self.shared.settings);
        let handle = self.slots.insert(Slot {
            conn: Conn::Client(Box::new(conn)),
            peer: None,
            queued: false,
        });
        if let Err(e) = self.register(handle) {
            warn!(peer = %peer, error = %e, "Failed to register connection");
            self.slots.remove(handle);
            return;
        }
        debug!(peer = %peer, "Accepted connection");
        self.enqueue(handle);
    }

    fn register(&mut self, handle: Handle) -> io::Result<()> {
        let Some(slot) = self.slots.get_mut(handle) else {
            return Err(io::ErrorKind::NotFound.into());
        };
        self.registrar.register(
            slot.conn.source_mut(),
            handle.token(),
            Interest::READABLE | Interest::WRITABLE,
            false,
        )
    }

    fn drain_ready(&mut self) {
        for _ in 0..self.ready.len() {
            let Some(handle) = self.ready.pop_front() else {
                break;
            };
            let Some(slot) = self.slots.get_mut(handle) else {
                continue;
            };
            slot.queued = false;
            if matches!(slot.conn, Conn::Client(_)) {
                self.advance_client(handle);
            } else {
                self.advance_backend(handle);
            }
        }
    }

    fn advance_client(&mut self, handle: Handle) {
        let step = match self.slots.get_mut(handle) {
            Some(Slot {
                conn: Conn::Client(client),
                ..
            }) => client.advance(&mut self.shared.env()),
            _ => return,
        };
        match step {
            Step::Suspend => {}
            Step::Revisit => self.enqueue(handle),
            Step::Close => self.close(handle),
            Step::Forward(request) => self.spawn_backend(handle, request),
        }
    }

    fn advance_backend(&mut self, handle: Handle) {
        let step = match self.slots.get_mut(handle) {
            Some(Slot {
                conn: Conn::Backend(backend),
                ..
            }) => backend.advance(&mut self.shared.env()),
            _ => return,
        };
        match step {
            BackendStep::Suspend => {}
            BackendStep::Revisit => self.enqueue(handle),
            BackendStep::Done(reply) => self.finish_backend(handle, reply),
        }
    }

    fn spawn_backend(&mut self, client: Handle, request: UpstreamRequest) {
        let now = self.shared.clock.now;
        let connected = self
            .shared
            .hosts
            .backends_mut(request.host, request.rule)
            .and_then(|list| list.connect_next(&mut MioConnector, now));
        let Some((backend, stream)) = connected else {
            request.body.release(&mut self.shared.tmpfiles);
            self.deliver(client, Reply::Error(StatusCode::GatewayTimeout));
            return;
        };

        let target = BackendRef {
            host: request.host,
            rule: request.rule,
            backend,
        };
        let handle = self.slots.insert(Slot {
            conn: Conn::Backend(Box::new(BackendConnection::new(stream, request, target))),
            peer: Some(client),
            queued: false,
        });
        if let Err(e) = self.register(handle) {
            warn!(error = %e, "Failed to register backend connection");
            self.remove(handle);
            self.deliver(client, Reply::Error(StatusCode::InternalServerError));
            return;
        }
        if let Some(slot) = self.slots.get_mut(client) {
            slot.peer = Some(handle);
        }
        self.enqueue(handle);
    }

    fn finish_backend(&mut self, handle: Handle, reply: Reply) {
        match self.remove(handle).and_then(|slot| slot.peer) {
            Some(client) => self.deliver(client, reply),
            None => reply.release(&mut self.shared.tmpfiles),
        }
    }

    /// Hands a backend's reply to its client and queues the client.
    fn deliver(&mut self, client: Handle, reply: Reply) {
        if let Some(Slot {
            conn: Conn::Client(conn),
            peer,
            ..
        }) = self.slots.get_mut(client)
        {
            *peer = None;
            conn.deliver(reply, &mut self.shared.env());
        } else {
            reply.release(&mut self.shared.tmpfiles);
            return;
        }
        self.enqueue(client);
    }

    /// Deregisters a slot and returns its temporary files.
    fn remove(&mut self, handle: Handle) -> Option<Slot> {
        let mut slot = self.slots.remove(handle)?;
        if let Err(e) = self.registrar.deregister(slot.conn.source_mut(), handle.token()) {
            debug!(error = %e, "Deregister failed");
        }
        match &mut slot.conn {
            Conn::Client(conn) => conn.release(&mut self.shared.tmpfiles),
            Conn::Backend(conn) => conn.release(&mut self.shared.tmpfiles),
        }
        Some(slot)
    }

    /// Closes a connection together with its peer.
    fn close(&mut self, handle: Handle) {
        let Some(slot) = self.remove(handle) else {
            return;
        };
        if let Conn::Client(conn) = &slot.conn {
            debug!(peer = %conn.peer(), "Connection closed");
        }
        if let Some(peer) = slot.peer {
            self.remove(peer);
        }
    }

    fn tick(&mut self) {
        self.shared.clock.tick();
        let now = self.shared.clock.now;
        self.next_tick = now + TICK;
        self.sweep(now);

        if now.saturating_duration_since(self.last_log_sync)
            >= self.shared.settings.log_sync_interval
        {
            self.shared.hosts.sync_logs();
            self.last_log_sync = now;
        }
    }

    fn sweep(&mut self, now: Instant) {
        let max_idle = self.shared.settings.max_idle_time;
        let max_stall = self.shared.settings.max_idle_time_unknown_size_body;

        let mut idle_clients = Vec::new();
        let mut stalled = Vec::new();
        let mut idle_backends = Vec::new();
        for (handle, slot) in self.slots.iter_mut() {
            match &slot.conn {
                Conn::Client(conn) => {
                    if !conn.is_awaiting_backend()
                        && now.saturating_duration_since(conn.last_activity()) > max_idle
                    {
                        idle_clients.push(handle);
                    }
                }
                Conn::Backend(conn) => {
                    let idle = now.saturating_duration_since(conn.last_activity());
                    if conn.is_stalled(idle, max_stall) {
                        stalled.push(handle);
                    } else if idle > max_idle {
                        idle_backends.push(handle);
                    }
                }
            }
        }

        for handle in idle_clients {
            debug!("Closing idle connection");
            self.close(handle);
        }
        for handle in stalled {
            let reply = match self.slots.get_mut(handle) {
                Some(Slot {
                    conn: Conn::Backend(conn),
                    ..
                }) => conn.force_complete(&mut self.shared.env()),
                _ => continue,
            };
            self.finish_backend(handle, reply);
        }
        for handle in idle_backends {
            warn!("Backend response timed out");
            self.finish_backend(handle, Reply::Error(StatusCode::GatewayTimeout));
        }
    }

    fn shutdown(&mut self) {
        for handle in self.slots.handles() {
            self.remove(handle);
        }
        self.ready.clear();
        self.shared.hosts.sync_logs();
        info!("Gateway stopped");
    }
}
