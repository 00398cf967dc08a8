//! Event loop, socket primitives and loop-wide resources.

pub mod context;
pub mod io;
pub mod listener;
pub mod selector;
pub mod slab;
pub mod tmpfiles;

use std::net::SocketAddr;
use std::time::Duration;

use crate::http::mime::MimeTypes;
use crate::http::response::ErrorPages;
use crate::http::vhost::VirtualHosts;
use context::Clock;
use tmpfiles::TempFiles;

pub use listener::{Server, ShutdownHandle};

/// Loop-wide limits and timeouts.
#[derive(Debug, Clone)]
pub struct Settings {
    pub max_connections: usize,
    pub max_idle_time: Duration,
    /// Idle limit for a proxy backend streaming a body of unknown length.
    pub max_idle_time_unknown_size_body: Duration,
    /// Bodies up to this many bytes stay in memory.
    pub max_payload_in_memory: usize,
    pub log_sync_interval: Duration,
    pub index_files: Vec<String>,
    /// Caps bytes moved per socket call; `None` is unbounded.
    pub max_bytes_per_call: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            max_idle_time: Duration::from_secs(30),
            max_idle_time_unknown_size_body: Duration::from_secs(3),
            max_payload_in_memory: 4 * 1024,
            log_sync_interval: Duration::from_secs(30),
            index_files: vec!["index.html".to_string()],
            max_bytes_per_call: None,
        }
    }
}

/// Everything the gateway needs to start serving.
#[derive(Debug)]
pub struct Gateway {
    pub listen: SocketAddr,
    pub settings: Settings,
    pub hosts: VirtualHosts,
    pub mime: MimeTypes,
    pub tmpfiles: TempFiles,
}

/// Shared state handed to a state machine for one `advance` call.
pub struct Env<'a> {
    pub clock: &'a Clock,
    pub settings: &'a Settings,
    pub hosts: &'a mut VirtualHosts,
    pub tmpfiles: &'a mut TempFiles,
    pub pages: &'a ErrorPages,
    pub mime: &'a MimeTypes,
    /// Counter behind multipart boundaries.
    pub boundary: &'a mut u64,
    pub listen_port: u16,
}

impl Env<'_> {
    /// Next multipart boundary token: an 11-digit counter.
    pub fn next_boundary(&mut self) -> String {
        let token = format!("{:011}", *self.boundary);
        *self.boundary += 1;
        token
    }
}
