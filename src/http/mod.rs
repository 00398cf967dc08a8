//! HTTP protocol implementation.
//!
//! Everything here is plain data handling on byte buffers; the sockets and
//! the event loop live in [`crate::server`].
//!
//! # Architecture
//!
//! - **`connection`**: The client connection state machine
//! - **`parser`**: Request line and status line parsers
//! - **`headers`**: Header block parser and the header collection
//! - **`chunked`**: Chunked transfer-coding decoder and encoder
//! - **`url`**: Request target parsing, percent-decoding and path normalisation
//! - **`range`**: `Range` header parsing
//! - **`request`**: The parsed request
//! - **`response`**: Status codes and the canned error pages
//! - **`writer`**: Status lines, common headers and multipart framing
//! - **`body`**: Bodies kept in memory or spooled to temporary files
//! - **`vhost`**: Virtual hosts and their routing rules
//! - **`mime`**: MIME type detection based on file extensions
//! - **`dirlisting`**: HTML directory listings
//! - **`access_log`**: Per-host access logs
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────────────┐
//!        │ AwaitingRequestLine │ ← keep-alive loops back here
//!        └──────────┬──────────┘
//!                   ▼
//!        ┌─────────────────────┐
//!        │   ReadingHeaders    │
//!        └──────────┬──────────┘
//!                   ▼
//!        ┌─────────────────────┐  local file or listing
//!        │      Routing        │ ─────────────────────────┐
//!        └──────────┬──────────┘                          │
//!                   │ backend rule                        │
//!                   ▼                                     │
//!        ┌─────────────────────┐                          │
//!        │ Reading(Chunked)Body│                          │
//!        └──────────┬──────────┘                          │
//!                   ▼                                     │
//!        ┌──────────────────────────┐                     │
//!        │ PreparingUpstreamRequest │                     │
//!        └──────────┬───────────────┘                     │
//!                   ▼                                     │
//!        ┌─────────────────────┐  backend error           │
//!        │   AwaitingBackend   │ ───────────┐             │
//!        └──────────┬──────────┘            ▼             ▼
//!                   │              ┌────────────────────┐ ┌────────────────┐
//!                   │              │ PreparingErrorPage │→│ SendingHeaders │
//!                   ▼              └────────────────────┘ └───────┬────────┘
//!        ┌───────────────────────┐                                ▼
//!        │ SendingBackendHeaders │                        ┌─────────────┐
//!        └──────────┬────────────┘                        │ SendingBody │
//!                   ▼                                     └──────┬──────┘
//!        ┌─────────────────────┐                                │
//!        │ SendingBackendBody  │ ──────────► Completed ◄────────┘
//!        └─────────────────────┘
//! ```
//!
//! Any parse or routing failure jumps to `PreparingErrorPage`.

pub mod access_log;
pub mod body;
pub mod buffer;
pub mod chunked;
pub mod connection;
pub mod dirlisting;
pub mod headers;
pub mod mime;
pub mod parser;
pub mod range;
pub mod request;
pub mod response;
pub mod url;
pub mod vhost;
pub mod writer;
