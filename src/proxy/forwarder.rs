//! Upstream forwarding with a fallback chain and the 402 payment dance.
//!
//! One logical send walks the model chain `[primary, fallback…]`. A chain
//! step advances only on network-level failures and upstream 5xx; explicit
//! 4xx responses are surfaced as-is. Within a step the payment cycle runs:
//! attach a cached authorization if one exists, answer a 402 challenge by
//! signing, retry exactly once, and treat a second 402 as a rejection.

use std::time::{Duration, Instant};

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::catalog::ModelInfo;
use crate::payment::{parse_challenge, PaymentEngine, PAYMENT_HEADER};
use crate::ProxyError;

/// Independent upstream deadlines, all absolute from task start.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamTimeouts {
    pub connect: Duration,
    pub first_byte: Duration,
    pub total: Duration,
}

impl Default for UpstreamTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            first_byte: Duration::from_secs(10),
            total: Duration::from_secs(60),
        }
    }
}

/// A successful upstream exchange: the response plus what it took.
pub struct ForwardOutcome {
    pub response: reqwest::Response,
    pub model: &'static ModelInfo,
    /// A payment authorization was attached (cached or freshly signed).
    pub paid: bool,
}

/// Sends chat-completion requests upstream on behalf of the proxy.
pub struct Forwarder {
    http: reqwest::Client,
    completions_url: String,
    /// Host component of the upstream URL; half of the pre-auth cache key.
    host: String,
    payment: Arc<PaymentEngine>,
    timeouts: UpstreamTimeouts,
}

impl Forwarder {
    pub fn new(
        base_url: &str,
        payment: Arc<PaymentEngine>,
        timeouts: UpstreamTimeouts,
    ) -> Result<Self, ProxyError> {
        let base = base_url.trim_end_matches('/');
        let parsed = reqwest::Url::parse(base)
            .map_err(|e| ProxyError::Config(format!("invalid upstream URL {base:?}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| ProxyError::Config(format!("upstream URL {base:?} has no host")))?
            .to_string();

        let http = reqwest::Client::builder()
            .connect_timeout(timeouts.connect)
            .build()
            .map_err(|e| ProxyError::Internal(format!("http client build failed: {e}")))?;

        Ok(Self {
            http,
            completions_url: format!("{base}/chat/completions"),
            host,
            payment,
            timeouts,
        })
    }

    pub fn timeouts(&self) -> UpstreamTimeouts {
        self.timeouts
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Walk the model chain until one attempt yields a response the client
    /// should see. `deadline` bounds the whole walk.
    pub async fn send(
        &self,
        chain: &[&'static ModelInfo],
        body: &mut Value,
        stream: bool,
        deadline: Instant,
    ) -> Result<ForwardOutcome, ProxyError> {
        let mut last_transient = ProxyError::UpstreamFatal("empty model chain".into());

        for (i, model) in chain.iter().enumerate() {
            if let Some(obj) = body.as_object_mut() {
                obj.insert("model".into(), Value::String(model.id.to_string()));
                obj.insert("stream".into(), Value::Bool(stream));
            }

            match self.attempt(*model, body, deadline).await {
                Ok(outcome) => {
                    let status = outcome.response.status();
                    if status.is_server_error() {
                        warn!(model = model.id, %status, "upstream 5xx, advancing fallback chain");
                        last_transient =
                            ProxyError::UpstreamTransient(format!("{} answered {status}", model.id));
                        continue;
                    }
                    if i > 0 {
                        debug!(model = model.id, attempt = i + 1, "fallback model served the request");
                    }
                    return Ok(outcome);
                }
                Err(ProxyError::UpstreamTransient(msg)) => {
                    warn!(model = model.id, error = %msg, "transient upstream failure, advancing");
                    last_transient = ProxyError::UpstreamTransient(msg);
                }
                Err(other) => return Err(other),
            }
        }

        match last_transient {
            ProxyError::UpstreamTransient(msg) | ProxyError::UpstreamFatal(msg) => {
                Err(ProxyError::UpstreamFatal(msg))
            }
            other => Err(other),
        }
    }

    /// One chain step: the payment state machine for a single model.
    async fn attempt(
        &self,
        model: &'static ModelInfo,
        body: &Value,
        deadline: Instant,
    ) -> Result<ForwardOutcome, ProxyError> {
        let payload = serde_json::to_vec(body)
            .map_err(|e| ProxyError::Internal(format!("body serialization failed: {e}")))?;
        let digest = Sha256::digest(&payload);

        let prepared = self.payment.prepare(&self.host, model.id);
        let paid_upfront = prepared.is_some();
        let response = self.post(&payload, prepared, deadline).await?;

        if response.status() != reqwest::StatusCode::PAYMENT_REQUIRED {
            if response.status().is_success() && paid_upfront {
                self.payment.observe_success(&self.host, model.id);
            }
            return Ok(ForwardOutcome {
                response,
                model,
                paid: paid_upfront,
            });
        }

        // First 402: the cached record (if any) is stale. Sign and retry
        // exactly once.
        let challenge_bytes = response
            .bytes()
            .await
            .map_err(|e| ProxyError::UpstreamTransient(format!("reading 402 body: {e}")))?;
        self.payment.observe_challenge(&self.host, model.id);
        let challenge = parse_challenge(&challenge_bytes)
            .map_err(|e| ProxyError::UpstreamTransient(format!("unusable 402 challenge: {e}")))?;
        debug!(
            model = model.id,
            amount = challenge.amount,
            asset = %challenge.asset,
            "satisfying payment challenge"
        );

        let header = self
            .payment
            .satisfy(&self.host, model.id, &challenge, &digest)
            .await?;
        let retry = self.post(&payload, Some(header), deadline).await?;

        if retry.status() == reqwest::StatusCode::PAYMENT_REQUIRED {
            let rejection = retry.text().await.unwrap_or_default();
            warn!(model = model.id, "authorization rejected with a second 402");
            return Err(ProxyError::PaymentRejected(rejection));
        }
        if retry.status().is_success() {
            self.payment.observe_success(&self.host, model.id);
        }
        Ok(ForwardOutcome {
            response: retry,
            model,
            paid: true,
        })
    }

    async fn post(
        &self,
        payload: &[u8],
        payment_header: Option<String>,
        deadline: Instant,
    ) -> Result<reqwest::Response, ProxyError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProxyError::Timeout("upstream send"));
        }

        let mut request = self
            .http
            .post(&self.completions_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(remaining)
            .body(payload.to_vec());
        if let Some(header) = payment_header {
            request = request.header(PAYMENT_HEADER, header);
        }

        request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProxyError::Timeout("upstream send")
            } else {
                ProxyError::UpstreamTransient(format!("upstream request failed: {e}"))
            }
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
