//! Payment engine: the 402 challenge / signed-authorization cycle with a
//! pre-authorization cache.
//!
//! Per request the forwarder drives a small state machine:
//!
//! ```text
//!   ATTEMPT ── 2xx ──▶ DONE
//!      │
//!      ├── 402 ──▶ satisfy() ──▶ RETRY ── 2xx ──▶ DONE (cache confirmed)
//!      │                           │
//!      │                           └── 402 ──▶ payment rejected
//!      └── other 4xx/5xx ──▶ surfaced unchanged
//! ```
//!
//! The cache is keyed by `(endpoint host, canonical model id)`. A hit lets
//! the next request attach its authorization up front and skip the 402
//! round-trip entirely. Concurrent requests whose record went stale
//! coalesce on signing: one signature per expiration window.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::ProxyError;

use super::challenge::PaymentChallenge;
use super::signer::PaymentSigner;

/// Header the signed authorization travels in, both directions.
pub const PAYMENT_HEADER: &str = "x-payment";

/// Margin subtracted from `validUntil` so an authorization is never
/// presented right at its expiry edge.
const SAFETY_SKEW: Duration = Duration::from_secs(10);

/// Upper bound on how long a record is trusted without a fresh challenge.
const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Deadline for one signer invocation.
const SIGNER_TIMEOUT: Duration = Duration::from_secs(5);

/// One cached authorization for an `(endpoint, model)` pair.
#[derive(Debug, Clone)]
struct PreAuthRecord {
    header: String,
    last_known_price: f64,
    /// Hard ceiling from the challenge; refreshes never extend past it.
    valid_until: u64,
    expires_at: Instant,
    /// Set once the upstream has accepted this authorization with a 2xx.
    /// Only confirmed records are handed out by [`PaymentEngine::prepare`].
    confirmed: bool,
}

impl PreAuthRecord {
    fn fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Drives 402 authentication for all upstream calls.
pub struct PaymentEngine {
    signer: Arc<dyn PaymentSigner>,
    records: DashMap<String, PreAuthRecord>,
    /// Per-key signing locks: the singleflight discipline for stale-cache
    /// stampedes.
    signing: DashMap<String, Arc<Mutex<()>>>,
    signer_timeout: Duration,
}

impl PaymentEngine {
    pub fn new(signer: Arc<dyn PaymentSigner>) -> Self {
        Self {
            signer,
            records: DashMap::new(),
            signing: DashMap::new(),
            signer_timeout: SIGNER_TIMEOUT,
        }
    }

    /// The wallet address requests are paid from.
    pub fn wallet_address(&self) -> &str {
        self.signer.address()
    }

    /// A confirmed, unexpired authorization header for `(endpoint, model)`,
    /// if the cache holds one. Attaching it lets the request skip the 402
    /// round-trip.
    pub fn prepare(&self, endpoint_host: &str, model: &str) -> Option<String> {
        let key = cache_key(endpoint_host, model);
        let record = self.records.get(&key)?;
        if record.confirmed && record.fresh() {
            debug!(key = %key, "pre-auth cache hit");
            Some(record.header.clone())
        } else {
            None
        }
    }

    /// Sign an authorization for a concrete challenge.
    ///
    /// Singleflight per `(endpoint, model)`: concurrent callers whose
    /// record expired in the same window block on one lock, and all but the
    /// first reuse the freshly signed header instead of invoking the signer
    /// again.
    pub async fn satisfy(
        &self,
        endpoint_host: &str,
        model: &str,
        challenge: &PaymentChallenge,
        request_digest: &[u8],
    ) -> Result<String, ProxyError> {
        let key = cache_key(endpoint_host, model);
        let lock = self
            .signing
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // A coalesced waiter may find the winner's signature already here.
        if let Some(record) = self.records.get(&key) {
            if record.fresh() && record.last_known_price >= challenge.amount {
                debug!(key = %key, "reusing in-window signature");
                return Ok(record.header.clone());
            }
        }

        let header = tokio::time::timeout(
            self.signer_timeout,
            self.signer.sign(challenge, request_digest),
        )
        .await
        .map_err(|_| ProxyError::Timeout("signer"))??;

        self.records.insert(
            key,
            PreAuthRecord {
                header: header.clone(),
                last_known_price: challenge.amount,
                valid_until: challenge.valid_until,
                expires_at: record_expiry(challenge.valid_until),
                confirmed: false,
            },
        );

        Ok(header)
    }

    /// The upstream accepted an authorized request: confirm the record and
    /// refresh its expiry, bounded by the challenge's own `validUntil`.
    pub fn observe_success(&self, endpoint_host: &str, model: &str) {
        let key = cache_key(endpoint_host, model);
        if let Some(mut record) = self.records.get_mut(&key) {
            record.confirmed = true;
            record.expires_at = record_expiry(record.valid_until);
            debug!(key = %key, "pre-auth record confirmed");
        }
    }

    /// The upstream challenged despite (or without) a cached record — the
    /// price or recipient changed. Drop the confirmed record; an in-window
    /// unconfirmed signature is left for coalesced retries to reuse.
    pub fn observe_challenge(&self, endpoint_host: &str, model: &str) {
        let key = cache_key(endpoint_host, model);
        let removed = self
            .records
            .remove_if(&key, |_, record| record.confirmed)
            .is_some();
        if removed {
            warn!(key = %key, "pre-auth record invalidated by fresh 402");
        }
    }

    /// Number of live records, for diagnostics.
    pub fn cached_records(&self) -> usize {
        self.records.len()
    }
}

impl std::fmt::Debug for PaymentEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentEngine")
            .field("wallet", &self.signer.address())
            .field("records", &self.records.len())
            .finish()
    }
}

fn cache_key(endpoint_host: &str, model: &str) -> String {
    format!("{endpoint_host}|{model}")
}

/// `min(validUntil − now − skew, default TTL)` from now. A challenge whose
/// window has already closed yields an immediately stale record.
fn record_expiry(valid_until: u64) -> Instant {
    let now_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let remaining = Duration::from_secs(valid_until.saturating_sub(now_unix))
        .saturating_sub(SAFETY_SKEW);
    Instant::now() + remaining.min(DEFAULT_TTL)
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSigner {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PaymentSigner for CountingSigner {
        fn address(&self) -> &str {
            "0x00000000000000000000000000000000000000aa"
        }

        async fn sign(
            &self,
            challenge: &PaymentChallenge,
            _request_digest: &[u8],
        ) -> Result<String, ProxyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("x402 test:{}", challenge.nonce))
        }
    }

    fn future_challenge(amount: f64) -> PaymentChallenge {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        PaymentChallenge {
            amount,
            asset: "USDC".into(),
            chain: "base".into(),
            recipient: "0xrecipient".into(),
            nonce: "n-1".into(),
            valid_until: now + 3600,
            extra: serde_json::Map::new(),
        }
    }

    fn engine() -> (Arc<PaymentEngine>, Arc<CountingSigner>) {
        let signer = Arc::new(CountingSigner {
            calls: AtomicUsize::new(0),
        });
        (Arc::new(PaymentEngine::new(signer.clone())), signer)
    }

    #[tokio::test]
    async fn test_prepare_misses_before_any_challenge() {
        let (engine, _) = engine();
        assert_eq!(engine.prepare("api.example.com", "m"), None);
    }

    #[tokio::test]
    async fn test_satisfy_then_success_populates_prepare() {
        let (engine, signer) = engine();
        let c = future_challenge(0.01);
        let header = engine
            .satisfy("api.example.com", "m", &c, b"digest")
            .await
            .unwrap_or_else(|e| panic!("satisfy failed: {e}"));
        // Unconfirmed records are not handed out by prepare.
        assert_eq!(engine.prepare("api.example.com", "m"), None);

        engine.observe_success("api.example.com", "m");
        assert_eq!(engine.prepare("api.example.com", "m"), Some(header));
        assert_eq!(signer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_satisfy_coalesces_to_one_signature() {
        let (engine, signer) = engine();
        let c = future_challenge(0.01);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            let c = c.clone();
            handles.push(tokio::spawn(async move {
                engine.satisfy("api.example.com", "m", &c, b"digest").await
            }));
        }
        let mut headers = Vec::new();
        for h in handles {
            headers.push(
                h.await
                    .unwrap_or_else(|e| panic!("join: {e}"))
                    .unwrap_or_else(|e| panic!("satisfy: {e}")),
            );
        }

        assert_eq!(
            signer.calls.load(Ordering::SeqCst),
            1,
            "concurrent stale-cache callers must share one signature"
        );
        assert!(headers.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_distinct_pairs_sign_independently() {
        let (engine, signer) = engine();
        let c = future_challenge(0.01);
        engine
            .satisfy("api.example.com", "model-a", &c, b"d")
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        engine
            .satisfy("api.example.com", "model-b", &c, b"d")
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(signer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_observe_challenge_invalidates_confirmed_record() {
        let (engine, _) = engine();
        let c = future_challenge(0.01);
        engine
            .satisfy("api.example.com", "m", &c, b"d")
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        engine.observe_success("api.example.com", "m");
        assert!(engine.prepare("api.example.com", "m").is_some());

        engine.observe_challenge("api.example.com", "m");
        assert_eq!(engine.prepare("api.example.com", "m"), None);
    }

    #[tokio::test]
    async fn test_observe_challenge_keeps_unconfirmed_signature_for_retry() {
        let (engine, signer) = engine();
        let c = future_challenge(0.01);
        engine
            .satisfy("api.example.com", "m", &c, b"d")
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        // A second concurrent 402 observer must not wipe the in-window
        // signature its sibling just produced.
        engine.observe_challenge("api.example.com", "m");
        engine
            .satisfy("api.example.com", "m", &c, b"d")
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(signer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_challenge_window_yields_stale_record() {
        let (engine, _) = engine();
        let mut c = future_challenge(0.01);
        c.valid_until = 1; // long past
        engine
            .satisfy("api.example.com", "m", &c, b"d")
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        engine.observe_success("api.example.com", "m");
        assert_eq!(
            engine.prepare("api.example.com", "m"),
            None,
            "a record past its validUntil must never be served"
        );
    }

    #[tokio::test]
    async fn test_price_increase_forces_new_signature() {
        let (engine, signer) = engine();
        engine
            .satisfy("api.example.com", "m", &future_challenge(0.01), b"d")
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        // The upstream raised its price: the cached amount no longer covers
        // the new challenge, so satisfy signs again.
        engine
            .satisfy("api.example.com", "m", &future_challenge(0.05), b"d")
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(signer.calls.load(Ordering::SeqCst), 2);
    }
}
