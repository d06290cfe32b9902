//! # clawrouter
//!
//! A local, single-user HTTP proxy that sits between an OpenAI-style chat
//! client and a pay-per-request upstream aggregator.
//!
//! ## Architecture
//!
//! One request flows through four subsystems:
//! ```text
//! client → validate → dedup lookup → route → payment prepare
//!        → forward (402 dance, fallback chain) → relay (JSON or SSE) → publish
//! ```
//!
//! The router is pure and synchronous; everything that touches the network
//! lives in [`proxy`] and [`payment`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod balance;
pub mod catalog;
pub mod dedup;
pub mod payment;
pub mod proxy;
pub mod routing;
pub mod traffic;

// Re-exports
pub use catalog::{Catalog, ModelInfo, Tier};
pub use proxy::{start, start_with, ProxyConfig, ProxyHandle};
pub use routing::{RouteMethod, RoutingDecision, SmartRouter};

/// Proxy-wide error taxonomy.
///
/// Every client-visible failure maps to exactly one HTTP status through
/// [`ProxyError::status_code`]; the forwarder recovers
/// [`ProxyError::UpstreamTransient`] internally via the fallback chain and
/// never surfaces it.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("{0}")]
    Validation(String),

    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("no model satisfies request constraints: {0}")]
    Routing(String),

    /// Second 402 for the same request. Carries the upstream challenge body
    /// so the client sees what the upstream asked for.
    #[error("payment rejected by upstream")]
    PaymentRejected(String),

    /// Network-level failure or upstream 5xx. Recovered by the fallback
    /// chain; becomes [`ProxyError::UpstreamFatal`] once the chain is spent.
    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),

    #[error("upstream failed after all fallbacks: {0}")]
    UpstreamFatal(String),

    #[error("deadline exceeded during {0}")]
    Timeout(&'static str),

    #[error("payment signer failed: {0}")]
    Signer(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// HTTP status this error surfaces as at the client boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::UnknownModel(_) | Self::Routing(_) => 400,
            Self::PaymentRejected(_) => 402,
            Self::BodyTooLarge(_) => 413,
            Self::UpstreamTransient(_) | Self::UpstreamFatal(_) => 502,
            Self::Timeout(_) => 504,
            Self::Signer(_) | Self::Config(_) | Self::Internal(_) => 500,
        }
    }

    /// Machine-readable error type for the client envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::BodyTooLarge(_) => "invalid_request_error",
            Self::UnknownModel(_) | Self::Routing(_) => "invalid_request_error",
            Self::PaymentRejected(_) => "payment_error",
            Self::UpstreamTransient(_) | Self::UpstreamFatal(_) => "upstream_error",
            Self::Timeout(_) => "timeout_error",
            Self::Signer(_) | Self::Config(_) | Self::Internal(_) => "internal_error",
        }
    }
}

/// Uniform client-facing error envelope: `{"error": {"message", "type"}}`.
///
/// Every failure path goes through this shape; stack traces and internal
/// detail never cross the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(message: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                message: message.into(),
                kind: kind.into(),
                code: None,
            },
        }
    }

    pub fn from_error(err: &ProxyError) -> Self {
        Self::new(err.to_string(), err.kind())
    }
}

/// One chat message as the proxy sees it. `content` stays a raw JSON value
/// because multimodal clients send arrays of parts, not strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: serde_json::Value,
}

impl ChatMessage {
    /// The textual content, if this message is plain text.
    pub fn text(&self) -> Option<&str> {
        self.content.as_str()
    }
}

/// Initialise tracing with env-filter support. Call once at binary startup.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}
