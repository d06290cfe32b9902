//! # Smart routing
//!
//! ## Responsibility
//! Map each prompt to a complexity tier and the cheapest capable model.
//! A fixed set of weighted dimensions produces a composite score; three
//! boundaries place the score in one of four tiers; a sigmoid over the
//! distance to the nearest boundary calibrates confidence.
//!
//! ## Guarantees
//! - Deterministic: the same request always produces the same decision,
//!   byte for byte.
//! - Pure: `route()` performs no I/O and never suspends.
//! - Fast: a single O(n) scan over a length-capped prompt window.
//! - Bounded: composite score and confidence are always in `[0,1]`.
//!
//! ## NOT Responsible For
//! - Sending anything upstream (that belongs to `proxy::forwarder`)
//! - Payment (that belongs to `payment`)
//! - Deciding fallback order at runtime (the catalog's tier tables do)

pub mod config;
pub mod features;
pub mod router;

// Re-exports for convenience
pub use config::{validate, DimensionWeights, OverridesConfig, RouterConfig, ScoringConfig};
pub use features::{FeatureExtractor, FeatureVector};
pub use router::{RouteMethod, RouteRequest, RoutingDecision, SmartRouter};
