//! # streamgate
//!
//! A small connection-oriented network service runtime: it accepts inbound
//! TCP connections, manages a bounded set of concurrent client sessions
//! behind a password gate, buffers outbound data per connection with
//! backpressure-aware partial writes, and separately runs a periodic UDP
//! presence announcer with bounded-retry backoff.
//!
//! ## Features
//! - Cooperative polling loops: one lifecycle task, one task per admitted
//!   session, one announcer task; no loop ever blocks indefinitely
//! - Admission control (session cap + per-IP connect rate limiting)
//! - Strictly in-order, chunked outbound buffering per session
//! - Two-phase (mark-then-reap) session cleanup without self-join deadlocks
//! - Serialized event delivery to a single [`ServerEvents`] observer
//! - Environment-based configuration loading
//!
//! ## Dependencies
//! - `tokio` for the asynchronous runtime
//! - `tracing` for logging
//! - `config` + `serde` for configuration
//! - `governor` for connect rate limiting

pub mod announcer;
pub mod config;
pub mod server;
pub mod utils;

pub use announcer::{Announcer, AnnouncerConfig, DatagramSink};
pub use config::ServerConfig;
pub use server::{ClientHandle, Server, ServerEvents, ServerReason, Stage};
pub use utils::error::ServerError;
