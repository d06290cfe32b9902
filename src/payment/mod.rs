//! # Payment engine
//!
//! ## Responsibility
//! Authenticate upstream calls through the pay-per-request 402 cycle:
//! parse challenges, obtain signed authorizations from the injected signer,
//! and cache confirmed authorizations so most requests skip the challenge
//! round-trip entirely.
//!
//! ## Guarantees
//! - Exactly one payment retry per request; a second 402 is fatal for that
//!   request only.
//! - One signature per `(endpoint, model)` expiration window under
//!   concurrency (singleflight on the cache key).
//! - Failed requests never populate the pre-auth cache.
//!
//! ## NOT Responsible For
//! - Cryptographic primitives (behind the [`PaymentSigner`] trait)
//! - Wallet balance tracking (see `balance`)

pub mod challenge;
pub mod engine;
pub mod signer;

// Re-exports for convenience
pub use challenge::{parse_challenge, PaymentChallenge};
pub use engine::{PaymentEngine, PAYMENT_HEADER};
pub use signer::{LocalWalletSigner, PaymentSigner};
