//! # Streaming proxy
//!
//! ## Responsibility
//! The HTTP boundary: validate incoming chat-completion requests, consult
//! the dedup cache, forward upstream through the payment engine with a
//! fallback chain, and relay the answer back — buffered JSON or SSE with
//! heartbeats, deadlines, and clean disconnect handling.
//!
//! ## Guarantees
//! - Loopback bind only; a second `start` on an owned port delegates.
//! - Every client-visible failure is the uniform error envelope.
//! - A failed request never takes the listener down.
//! - `close()` drains within the grace period and leaves the port
//!   immediately rebindable.
//!
//! ## NOT Responsible For
//! - Routing decisions (see `routing`)
//! - Payment semantics (see `payment`)
//! - On-disk config or the host plugin surface

pub mod forwarder;
pub mod postprocess;
pub mod server;
pub mod sse;
pub mod validate;

// Re-exports for convenience
pub use forwarder::{Forwarder, UpstreamTimeouts};
pub use postprocess::{StripState, ThinkStripper};
pub use server::{resolve_port, start, start_with, ProxyConfig, ProxyHandle, DEFAULT_PORT};
pub use validate::{validate_body, ValidRequest, MAX_BODY_BYTES, MAX_MESSAGES};
