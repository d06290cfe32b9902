//! Proxy server: listener lifecycle, request handlers, and the singleton
//! handle contract.
//!
//! The proxy binds loopback only. A second `start` on a port this process
//! already serves returns a delegating handle whose `close()` is a no-op,
//! so host plugins that instantiate the proxy repeatedly during lifecycle
//! reloads never leak ports or fight over them.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::balance::{BalanceProbe, StaticBalance};
use crate::catalog::Catalog;
use crate::dedup::{fingerprint, DedupCache, DedupConfig, Lookup, OwnerGuard, StreamItem};
use crate::payment::{LocalWalletSigner, PaymentEngine, PaymentSigner};
use crate::routing::{RouteRequest, RouterConfig, RoutingDecision, SmartRouter};
use crate::traffic::{TrafficLog, TrafficRecord};
use crate::{ErrorEnvelope, ProxyError};

use super::forwarder::{Forwarder, UpstreamTimeouts};
use super::postprocess::ThinkStripper;
use super::sse::{relay_sse, respond_from_attached, respond_from_stored, RelayContext, SubscriberOutcome};
use super::validate::{error_response, validate_body, ValidRequest};

/// Fallback port when `PROXY_PORT` is unset or unusable.
pub const DEFAULT_PORT: u16 = 8402;

const DEFAULT_UPSTREAM: &str = "https://api.blockrun.xyz/v1";

// ── Configuration ──────────────────────────────────────────────────────

/// Everything the proxy needs to start. The host assembles this from its
/// own config file; the environment overrides below are applied by
/// [`ProxyConfig::from_env`].
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    pub upstream_base_url: String,
    /// Hex private key (`0x…`). `WALLET_KEY` overrides it.
    pub wallet_key: Option<String>,
    /// When set the proxy serves `/health` but intercepts nothing.
    pub disabled: bool,
    pub timeouts: UpstreamTimeouts,
    pub heartbeat_interval: Duration,
    pub shutdown_grace: Duration,
    pub balance_poll_interval: Duration,
    pub dedup: DedupConfig,
    pub routing: RouterConfig,
    pub traffic_capacity: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            upstream_base_url: DEFAULT_UPSTREAM.into(),
            wallet_key: None,
            disabled: false,
            timeouts: UpstreamTimeouts::default(),
            heartbeat_interval: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(4),
            balance_poll_interval: Duration::from_secs(30),
            dedup: DedupConfig::default(),
            routing: RouterConfig::default(),
            traffic_capacity: 256,
        }
    }
}

impl ProxyConfig {
    /// Apply `WALLET_KEY`, `PROXY_PORT`, and `CLAWROUTER_DISABLED`.
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    pub fn apply_env(mut self) -> Self {
        if let Ok(port) = std::env::var("PROXY_PORT") {
            self.port = resolve_port(Some(&port));
        }
        if let Ok(key) = std::env::var("WALLET_KEY") {
            if !key.is_empty() {
                self.wallet_key = Some(key);
            }
        }
        if let Ok(flag) = std::env::var("CLAWROUTER_DISABLED") {
            self.disabled = is_truthy(&flag);
        }
        self
    }
}

/// Parse a port override; anything invalid, zero, or out of range falls
/// back to [`DEFAULT_PORT`].
pub fn resolve_port(raw: Option<&str>) -> u16 {
    match raw.map(str::trim).and_then(|s| s.parse::<u32>().ok()) {
        Some(p) if (1..=65_535).contains(&p) => p as u16,
        _ => DEFAULT_PORT,
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

// ── Singleton registry ─────────────────────────────────────────────────

/// Ports this process is already serving, with their wallet addresses.
fn registry() -> &'static StdMutex<HashMap<u16, String>> {
    static REGISTRY: OnceLock<StdMutex<HashMap<u16, String>>> = OnceLock::new();
    REGISTRY.get_or_init(|| StdMutex::new(HashMap::new()))
}

// ── Handle ─────────────────────────────────────────────────────────────

/// Handle to a running (or delegated) proxy.
pub struct ProxyHandle {
    port: u16,
    base_url: String,
    wallet_address: String,
    inner: Mutex<HandleInner>,
}

enum HandleInner {
    /// Another handle in this process owns the server.
    Delegated,
    Owned {
        shutdown: watch::Sender<bool>,
        server: tokio::task::JoinHandle<()>,
        background: Vec<tokio::task::JoinHandle<()>>,
        grace: Duration,
    },
    Closed,
}

impl ProxyHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn wallet_address(&self) -> &str {
        &self.wallet_address
    }

    /// Stop accepting connections, let active requests finish within the
    /// grace period, then force-close. Idempotent; a no-op on delegated
    /// handles. The port is rebindable once this returns.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        match std::mem::replace(&mut *inner, HandleInner::Closed) {
            HandleInner::Delegated => {
                *inner = HandleInner::Delegated;
            }
            HandleInner::Closed => {}
            HandleInner::Owned {
                shutdown,
                mut server,
                background,
                grace,
            } => {
                let _ = shutdown.send(true);
                match tokio::time::timeout(grace, &mut server).await {
                    Ok(_) => debug!(port = self.port, "proxy drained and stopped"),
                    Err(_) => {
                        warn!(port = self.port, "grace period elapsed, force-closing");
                        server.abort();
                        let _ = (&mut server).await;
                    }
                }
                for task in background {
                    task.abort();
                }
                if let Ok(mut ports) = registry().lock() {
                    ports.remove(&self.port);
                }
                info!(port = self.port, "proxy closed");
            }
        }
    }
}

// ── Shared state ───────────────────────────────────────────────────────

pub(crate) struct AppState {
    config: ProxyConfig,
    catalog: Arc<Catalog>,
    router: SmartRouter,
    forwarder: Forwarder,
    dedup: Arc<DedupCache>,
    traffic: Arc<TrafficLog>,
    stripper: Arc<ThinkStripper>,
    wallet_empty: watch::Receiver<bool>,
    shutdown_rx: watch::Receiver<bool>,
    wallet_address: String,
}

// ── Startup ────────────────────────────────────────────────────────────

/// Start the proxy with the default signer (built from the configured
/// wallet key) and balance probe.
pub async fn start(config: ProxyConfig) -> Result<ProxyHandle, ProxyError> {
    start_with(config, None, None).await
}

/// Start the proxy with injected collaborators. `signer` falls back to a
/// [`LocalWalletSigner`] over `config.wallet_key`; `probe` falls back to
/// "never empty".
pub async fn start_with(
    config: ProxyConfig,
    signer: Option<Arc<dyn PaymentSigner>>,
    probe: Option<Arc<dyn BalanceProbe>>,
) -> Result<ProxyHandle, ProxyError> {
    let signer: Arc<dyn PaymentSigner> = match signer {
        Some(s) => s,
        None => {
            let key = config
                .wallet_key
                .as_deref()
                .ok_or_else(|| ProxyError::Config("no wallet key configured".into()))?;
            Arc::new(LocalWalletSigner::from_hex(key)?)
        }
    };
    let wallet_address = signer.address().to_string();

    // Reuse a live server on the same port instead of failing the bind.
    {
        let ports = registry()
            .lock()
            .map_err(|_| ProxyError::Internal("port registry poisoned".into()))?;
        if let Some(existing_wallet) = ports.get(&config.port) {
            if *existing_wallet != wallet_address {
                warn!(
                    port = config.port,
                    "proxy already running with a different wallet, delegating to it"
                );
            } else {
                info!(port = config.port, "proxy already running, delegating");
            }
            return Ok(ProxyHandle {
                port: config.port,
                base_url: format!("http://127.0.0.1:{}", config.port),
                wallet_address: existing_wallet.clone(),
                inner: Mutex::new(HandleInner::Delegated),
            });
        }
    }

    let config_errors = crate::routing::validate(&config.routing);
    if !config_errors.is_empty() {
        return Err(ProxyError::Config(config_errors.join("; ")));
    }

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.port));
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            ProxyError::Config(format!("port {} is bound by another process", config.port))
        } else {
            ProxyError::Internal(format!("bind {addr} failed: {e}"))
        }
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let probe = probe.unwrap_or_else(|| Arc::new(StaticBalance(false)));
    let (wallet_empty, balance_task) = crate::balance::spawn(
        probe,
        config.balance_poll_interval,
        shutdown_rx.clone(),
    );

    let payment = Arc::new(PaymentEngine::new(signer));
    let catalog = Arc::new(Catalog::new(&config.routing.tiers));
    let router = SmartRouter::new(config.routing.clone(), catalog.clone());
    let forwarder = Forwarder::new(&config.upstream_base_url, payment, config.timeouts)?;
    let dedup = Arc::new(DedupCache::new(config.dedup.clone()));

    let reaper_task = spawn_reaper(dedup.clone(), shutdown_rx.clone());

    let state = Arc::new(AppState {
        catalog,
        router,
        forwarder,
        dedup,
        traffic: Arc::new(TrafficLog::new(config.traffic_capacity)),
        stripper: Arc::new(ThinkStripper::with_default_delimiters()),
        wallet_empty,
        shutdown_rx: shutdown_rx.clone(),
        wallet_address: wallet_address.clone(),
        config,
    });

    let app = build_router(state.clone());
    let port = state.config.port;
    let grace = state.config.shutdown_grace;

    let mut serve_shutdown = shutdown_rx;
    let server = tokio::spawn(async move {
        let shutdown = async move {
            // Wait for the close signal. A dropped sender means the handle
            // leaked without close(); keep serving in that case.
            loop {
                if *serve_shutdown.borrow() {
                    return;
                }
                if serve_shutdown.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "proxy server terminated abnormally");
        }
    });

    registry()
        .lock()
        .map_err(|_| ProxyError::Internal("port registry poisoned".into()))?
        .insert(port, wallet_address.clone());
    info!(port, wallet = %wallet_address, "proxy listening on loopback");

    Ok(ProxyHandle {
        port,
        base_url: format!("http://127.0.0.1:{port}"),
        wallet_address,
        inner: Mutex::new(HandleInner::Owned {
            shutdown: shutdown_tx,
            server,
            background: vec![balance_task, reaper_task],
            grace,
        }),
    })
}

fn build_router(state: Arc<AppState>) -> Router {
    let router = Router::new().route("/health", get(health));
    let router = if state.config.disabled {
        router
    } else {
        // A wrong method on the chat path must still get the uniform
        // envelope, so the method router carries its own fallback.
        router.route(
            "/v1/chat/completions",
            post(chat_completions).fallback(method_not_allowed),
        )
    };
    router
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn spawn_reaper(
    dedup: Arc<DedupCache>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => dedup.purge_expired(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

// ── Handlers ───────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Response {
    axum::Json(json!({ "status": "ok", "wallet": state.wallet_address })).into_response()
}

async fn not_found() -> Response {
    let envelope = ErrorEnvelope::new("not found", "invalid_request_error");
    (StatusCode::NOT_FOUND, axum::Json(envelope)).into_response()
}

async fn method_not_allowed() -> Response {
    let envelope = ErrorEnvelope::new(
        "method not allowed, use POST",
        "invalid_request_error",
    );
    (StatusCode::METHOD_NOT_ALLOWED, axum::Json(envelope)).into_response()
}

async fn chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let started = Instant::now();

    let valid = match validate_body(&body) {
        Ok(v) => v,
        Err(e) => return error_response(&e),
    };

    let route_request = RouteRequest {
        prompt: &valid.prompt_text,
        requested_model: &valid.raw_model,
        has_tools: !valid.tools.is_empty(),
        wants_structured_output: valid.wants_structured_output,
        max_tokens: valid.max_tokens,
        message_count: valid.messages.len(),
        estimated_context_tokens: valid.estimated_context_tokens,
        non_text_content: valid.non_text_content,
        wallet_empty: *state.wallet_empty.borrow(),
    };
    let decision = match state.router.route(&route_request) {
        Ok(d) => d,
        Err(e) => return error_response(&e),
    };
    debug!(
        model = decision.model.id,
        tier = decision.tier.map(|t| t.as_str()).unwrap_or("-"),
        method = decision.method.as_str(),
        confidence = decision.confidence,
        savings = decision.savings,
        reasoning = %decision.reasoning,
        "routing decision"
    );

    let fp = fingerprint(
        decision.model.id,
        &valid.messages,
        valid.temperature,
        valid.max_tokens,
        &valid.tools,
    );
    let deadline = started + state.config.timeouts.total;

    // One retry: if we attach to an origin that is cancelled before it
    // commits anything, the next lookup makes us the owner.
    for _ in 0..2 {
        match state.dedup.lookup(&fp) {
            Lookup::Owner(guard) => {
                return forward(state, valid, &decision, Some(guard), started).await;
            }
            Lookup::Bypass => {
                return forward(state, valid, &decision, None, started).await;
            }
            Lookup::Replay(stored) => {
                let status = stored.status;
                record(&state, &valid, &decision, status, started, true, false).await;
                return respond_from_stored(stored);
            }
            Lookup::Subscriber(attached) => {
                match respond_from_attached(attached, deadline).await {
                    SubscriberOutcome::Response(response) => {
                        let status = response.status().as_u16();
                        record(&state, &valid, &decision, status, started, true, false).await;
                        return response;
                    }
                    SubscriberOutcome::Retry => continue,
                }
            }
        }
    }
    // Two cancelled origins in a row: serve it ourselves, uncached.
    forward(state, valid, &decision, None, started).await
}

/// Forward upstream as the origin (or as an uncached bypass) and relay.
async fn forward(
    state: Arc<AppState>,
    valid: ValidRequest,
    decision: &RoutingDecision,
    guard: Option<OwnerGuard>,
    started: Instant,
) -> Response {
    let deadline = started + state.config.timeouts.total;
    let chain = model_chain(&state.catalog, decision);
    let mut upstream_body = valid.body.clone();

    let outcome = match state
        .forwarder
        .send(&chain, &mut upstream_body, valid.stream, deadline)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            let status = e.status_code();
            if let Some(guard) = guard {
                let envelope =
                    serde_json::to_string(&ErrorEnvelope::from_error(&e)).unwrap_or_default();
                guard.fail(status, envelope);
            }
            record(&state, &valid, decision, status, started, false, false).await;
            return error_response(&e);
        }
    };

    let status = outcome.response.status();
    let paid = outcome.paid;

    if !status.is_success() {
        // Explicit upstream 4xx: surface body and status unchanged.
        let content_type = outcome
            .response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let bytes = outcome.response.bytes().await.unwrap_or_default();
        if let Some(guard) = guard {
            guard.fail(status.as_u16(), String::from_utf8_lossy(&bytes).into_owned());
        }
        record(&state, &valid, decision, status.as_u16(), started, false, paid).await;
        return Response::builder()
            .status(status.as_u16())
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(bytes))
            .unwrap_or_default();
    }

    let is_sse = outcome
        .response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));

    if valid.stream && is_sse {
        record(&state, &valid, decision, 200, started, false, paid).await;
        return relay_sse(
            outcome.response,
            guard,
            RelayContext {
                stripper: state.stripper.clone(),
                heartbeat: state.config.heartbeat_interval,
                first_byte_timeout: state.config.timeouts.first_byte,
                deadline,
                shutdown: state.shutdown_rx.clone(),
            },
        );
    }

    // Buffered JSON path.
    let content_type = outcome
        .response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let remaining = deadline.saturating_duration_since(Instant::now());
    let bytes = match tokio::time::timeout(remaining, outcome.response.bytes()).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            let err = ProxyError::UpstreamFatal(format!("reading upstream body: {e}"));
            if let Some(guard) = guard {
                let envelope =
                    serde_json::to_string(&ErrorEnvelope::from_error(&err)).unwrap_or_default();
                guard.fail(err.status_code(), envelope);
            }
            record(&state, &valid, decision, err.status_code(), started, false, paid).await;
            return error_response(&err);
        }
        Err(_) => {
            let err = ProxyError::Timeout("upstream body read");
            if let Some(guard) = guard {
                let envelope =
                    serde_json::to_string(&ErrorEnvelope::from_error(&err)).unwrap_or_default();
                guard.fail(err.status_code(), envelope);
            }
            record(&state, &valid, decision, err.status_code(), started, false, paid).await;
            return error_response(&err);
        }
    };

    // Strip thinking tokens from the buffered body when present.
    let bytes = match serde_json::from_slice::<Value>(&bytes) {
        Ok(mut parsed) => {
            if state.stripper.rewrite_response(&mut parsed) {
                Bytes::from(serde_json::to_vec(&parsed).unwrap_or_else(|_| bytes.to_vec()))
            } else {
                bytes
            }
        }
        _ => bytes,
    };

    if let Some(guard) = guard {
        guard.publish(StreamItem::Head {
            status: status.as_u16(),
            content_type: content_type.clone(),
            streaming: false,
        });
        guard.publish(StreamItem::Chunk(bytes.clone()));
        guard.finish();
    }
    record(&state, &valid, decision, status.as_u16(), started, false, paid).await;

    Response::builder()
        .status(status.as_u16())
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(bytes))
        .unwrap_or_default()
}

/// `[decision model, remaining tier chain]`, deduplicated.
fn model_chain(
    catalog: &Catalog,
    decision: &RoutingDecision,
) -> Vec<&'static crate::catalog::ModelInfo> {
    let mut chain = vec![decision.model];
    if let Some(tier) = decision.tier {
        for model in catalog.chain(tier) {
            if model.id != decision.model.id {
                chain.push(model);
            }
        }
    }
    chain
}

async fn record(
    state: &AppState,
    valid: &ValidRequest,
    decision: &RoutingDecision,
    status: u16,
    started: Instant,
    deduped: bool,
    paid: bool,
) {
    let mut entry = TrafficRecord::new(valid.raw_model.clone());
    entry.model_served = decision.model.id.to_string();
    entry.tier = decision.tier.map(|t| t.as_str().to_string());
    entry.method = decision.method.as_str().to_string();
    entry.status = status;
    entry.latency_ms = started.elapsed().as_millis() as u64;
    entry.deduped = deduped;
    entry.paid = paid;
    state.traffic.push(entry).await;
}

// ── Tests ──────────────────────────────────────────────────────────────
