//! Sentinel - Event-driven HTTP gateway
//!
//! Serves local files and forwards requests to HTTP or FastCGI backend
//! pools from a single `mio` readiness loop.

pub mod config;
pub mod http;
pub mod proxy;
pub mod server;
