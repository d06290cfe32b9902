//! Server-sent-event relay.
//!
//! Owns the streaming half of the proxy: framing upstream bytes into SSE
//! events, rewriting deltas through the post-processor, heartbeats while
//! the upstream warms up, deadline and disconnect handling, and the
//! response builders for dedup subscribers and replays.
//!
//! Response headers go out before the first upstream byte: intermediaries
//! with idle timeouts see `text/event-stream` immediately, then heartbeat
//! comments every few seconds until real data flows.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::dedup::{Attached, OwnerGuard, StoredResponse, StreamItem};
use crate::ErrorEnvelope;

use super::postprocess::{StripState, ThinkStripper};

/// Everything the relay task needs besides the upstream response itself.
pub struct RelayContext {
    pub stripper: Arc<ThinkStripper>,
    pub heartbeat: Duration,
    pub first_byte_timeout: Duration,
    /// Absolute deadline for the whole upstream read.
    pub deadline: Instant,
    pub shutdown: watch::Receiver<bool>,
}

/// Terminal SSE line per the chat-completions protocol.
const DONE_EVENT: &[u8] = b"data: [DONE]\n\n";

// ── Origin relay ───────────────────────────────────────────────────────

/// Relay an upstream SSE response to the client, publishing every event to
/// the dedup entry when this request owns one.
pub fn relay_sse(
    upstream: reqwest::Response,
    owner: Option<OwnerGuard>,
    ctx: RelayContext,
) -> Response {
    let (tx, rx) = mpsc::channel::<Bytes>(64);
    tokio::spawn(pump(upstream, tx, owner, ctx));

    sse_response(ReceiverStream::new(rx))
}

async fn pump(
    upstream: reqwest::Response,
    tx: mpsc::Sender<Bytes>,
    mut owner: Option<OwnerGuard>,
    ctx: RelayContext,
) {
    if let Some(ref guard) = owner {
        guard.publish(StreamItem::Head {
            status: 200,
            content_type: "text/event-stream".into(),
            streaming: true,
        });
    }

    let mut reader = EventReader::new(upstream);
    let mut strip_state = StripState::default();
    let mut saw_first = false;
    let start = Instant::now();
    let first_byte_deadline = (start + ctx.first_byte_timeout).min(ctx.deadline);
    let mut heartbeat =
        tokio::time::interval_at((start + ctx.heartbeat).into(), ctx.heartbeat);

    let shutdown_signal = wait_for_shutdown(ctx.shutdown.clone());
    tokio::pin!(shutdown_signal);

    loop {
        let event_deadline = if saw_first {
            ctx.deadline
        } else {
            first_byte_deadline
        };

        tokio::select! {
            _ = tx.closed() => {
                // Client disconnected. Dropping the owner guard broadcasts
                // a cancellation; dropping the reader closes the upstream
                // socket.
                debug!("client disconnected mid-stream, cancelling upstream");
                return;
            }
            _ = heartbeat.tick(), if !saw_first => {
                if tx.send(Bytes::from_static(b": heartbeat\n\n")).await.is_err() {
                    return;
                }
            }
            _ = &mut shutdown_signal => {
                finish_with_error(&tx, owner.take(), 502, "proxy shutting down", "upstream_error").await;
                return;
            }
            next = tokio::time::timeout_at(event_deadline.into(), reader.next_event()) => {
                match next {
                    Err(_) => {
                        let phase = if saw_first { "upstream stream" } else { "upstream first byte" };
                        warn!(phase, "upstream deadline exceeded mid-stream");
                        finish_with_error(&tx, owner.take(), 504, &format!("deadline exceeded during {phase}"), "timeout_error").await;
                        return;
                    }
                    Ok(None) => {
                        // Upstream EOF without [DONE]: flush and terminate
                        // the protocol ourselves.
                        flush_tail(&tx, &owner, &ctx.stripper, &mut strip_state).await;
                        send_and_publish(&tx, &owner, Bytes::from_static(DONE_EVENT)).await;
                        if let Some(guard) = owner.take() {
                            guard.finish();
                        }
                        return;
                    }
                    Ok(Some(Err(e))) => {
                        warn!(error = %e, "upstream failed mid-stream");
                        finish_with_error(&tx, owner.take(), 502, "upstream connection failed mid-stream", "upstream_error").await;
                        return;
                    }
                    Ok(Some(Ok(raw))) => {
                        saw_first = true;
                        match rewrite_event(&raw, &ctx.stripper, &mut strip_state) {
                            RelayEvent::Done => {
                                flush_tail(&tx, &owner, &ctx.stripper, &mut strip_state).await;
                                send_and_publish(&tx, &owner, Bytes::from_static(DONE_EVENT)).await;
                                if let Some(guard) = owner.take() {
                                    guard.finish();
                                }
                                return;
                            }
                            RelayEvent::Payload(bytes) => {
                                send_and_publish(&tx, &owner, bytes).await;
                            }
                            RelayEvent::Skip => {}
                        }
                    }
                }
            }
        }
    }
}

/// Resolves when shutdown is signalled; pends forever if the sender is
/// gone (a detached server is never "shutting down").
async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn send_and_publish(tx: &mpsc::Sender<Bytes>, owner: &Option<OwnerGuard>, bytes: Bytes) {
    if let Some(guard) = owner {
        guard.publish(StreamItem::Chunk(bytes.clone()));
    }
    let _ = tx.send(bytes).await;
}

/// Emit whatever the stripper held back as one synthetic delta event.
async fn flush_tail(
    tx: &mpsc::Sender<Bytes>,
    owner: &Option<OwnerGuard>,
    stripper: &ThinkStripper,
    state: &mut StripState,
) {
    let tail = stripper.flush(state);
    if tail.is_empty() {
        return;
    }
    let event = serde_json::json!({
        "choices": [{ "index": 0, "delta": { "content": tail } }]
    });
    send_and_publish(tx, owner, data_event(&event)).await;
}

async fn finish_with_error(
    tx: &mpsc::Sender<Bytes>,
    owner: Option<OwnerGuard>,
    status: u16,
    message: &str,
    kind: &str,
) {
    let envelope = ErrorEnvelope::new(message, kind);
    let payload = serde_json::to_string(&envelope).unwrap_or_default();
    if let Some(guard) = owner {
        guard.fail(status, payload.clone());
    }
    let _ = tx.send(Bytes::from(format!("data: {payload}\n\n"))).await;
}

fn data_event(value: &Value) -> Bytes {
    Bytes::from(format!(
        "data: {}\n\n",
        serde_json::to_string(value).unwrap_or_default()
    ))
}

// ── Event framing and rewriting ────────────────────────────────────────

/// Frames a byte stream into SSE events (terminated by a blank line).
struct EventReader {
    inner: futures::stream::BoxStream<'static, Result<Bytes, reqwest::Error>>,
    buffer: BytesMut,
    eof: bool,
}

impl EventReader {
    fn new(upstream: reqwest::Response) -> Self {
        Self {
            inner: upstream.bytes_stream().boxed(),
            buffer: BytesMut::new(),
            eof: false,
        }
    }

    async fn next_event(&mut self) -> Option<Result<Bytes, reqwest::Error>> {
        loop {
            if let Some(pos) = find_event_boundary(&self.buffer) {
                return Some(Ok(self.buffer.split_to(pos).freeze()));
            }
            if self.eof {
                if self.buffer.is_empty() {
                    return None;
                }
                return Some(Ok(self.buffer.split().freeze()));
            }
            match self.inner.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Some(Err(e)),
                None => self.eof = true,
            }
        }
    }
}

/// Position just past the first blank-line event terminator.
fn find_event_boundary(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|p| p + 2)
}

enum RelayEvent {
    /// Forward these bytes.
    Payload(Bytes),
    /// The terminal `[DONE]` marker.
    Done,
    /// An empty frame, nothing to forward.
    Skip,
}

/// Rewrite one upstream event through the post-processor.
///
/// Data events are parsed, their deltas stripped, and re-serialized;
/// comments and unparseable events pass through untouched so unknown
/// upstream framing is never corrupted.
fn rewrite_event(raw: &[u8], stripper: &ThinkStripper, state: &mut StripState) -> RelayEvent {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return RelayEvent::Skip;
    }

    let Some(data) = trimmed
        .lines()
        .find_map(|line| line.strip_prefix("data:").map(str::trim_start))
    else {
        // A comment or unknown field: forward verbatim.
        return RelayEvent::Payload(Bytes::copy_from_slice(raw));
    };

    if data == "[DONE]" {
        return RelayEvent::Done;
    }

    match serde_json::from_str::<Value>(data) {
        Ok(mut chunk) => {
            if stripper.rewrite_delta(&mut chunk, state) {
                RelayEvent::Payload(data_event(&chunk))
            } else {
                RelayEvent::Payload(Bytes::copy_from_slice(raw))
            }
        }
        Err(_) => RelayEvent::Payload(Bytes::copy_from_slice(raw)),
    }
}

// ── Subscriber and replay responses ────────────────────────────────────

/// What a dedup subscriber ended up with.
pub enum SubscriberOutcome {
    Response(Response),
    /// The origin was cancelled before committing anything; the caller
    /// should retry the cache lookup and likely become the new owner.
    Retry,
}

/// Build a client response from an attached in-flight entry.
pub async fn respond_from_attached(attached: Attached, deadline: Instant) -> SubscriberOutcome {
    let mut items = ItemSource {
        prefix: attached.prefix.into(),
        rx: attached.rx,
    };

    // The first item is always the head; anything else means the entry
    // ended before committing.
    let head = loop {
        match items.next(deadline).await {
            Some(StreamItem::Head {
                status,
                content_type,
                streaming,
            }) => break (status, content_type, streaming),
            Some(StreamItem::Cancelled) | None => return SubscriberOutcome::Retry,
            Some(StreamItem::Error { status, envelope }) => {
                return SubscriberOutcome::Response(envelope_response(status, envelope));
            }
            Some(StreamItem::Done) | Some(StreamItem::Chunk(_)) => continue,
        }
    };
    let (status, content_type, streaming) = head;

    if streaming {
        let (tx, rx) = mpsc::channel::<Bytes>(64);
        tokio::spawn(async move {
            loop {
                match items.next(deadline).await {
                    Some(StreamItem::Chunk(chunk)) => {
                        if tx.send(chunk).await.is_err() {
                            return;
                        }
                    }
                    Some(StreamItem::Done) => return,
                    Some(StreamItem::Error { envelope, .. }) => {
                        let _ = tx.send(Bytes::from(format!("data: {envelope}\n\n"))).await;
                        return;
                    }
                    Some(StreamItem::Cancelled) | None => {
                        let envelope = ErrorEnvelope::new(
                            "origin request ended before completing the stream",
                            "upstream_error",
                        );
                        let payload =
                            serde_json::to_string(&envelope).unwrap_or_default();
                        let _ = tx.send(Bytes::from(format!("data: {payload}\n\n"))).await;
                        return;
                    }
                    Some(StreamItem::Head { .. }) => {}
                }
            }
        });
        return SubscriberOutcome::Response(sse_response(ReceiverStream::new(rx)));
    }

    // Buffered: collect the identical body the origin produced.
    let mut body = Vec::new();
    loop {
        match items.next(deadline).await {
            Some(StreamItem::Chunk(chunk)) => body.extend_from_slice(&chunk),
            Some(StreamItem::Done) => break,
            Some(StreamItem::Error { status, envelope }) => {
                return SubscriberOutcome::Response(envelope_response(status, envelope));
            }
            Some(StreamItem::Cancelled) => {
                if body.is_empty() {
                    return SubscriberOutcome::Retry;
                }
                let err = crate::ProxyError::UpstreamFatal(
                    "origin request was cancelled mid-response".into(),
                );
                return SubscriberOutcome::Response(super::validate::error_response(&err));
            }
            None => {
                let err = crate::ProxyError::Timeout("shared response wait");
                return SubscriberOutcome::Response(super::validate::error_response(&err));
            }
            Some(StreamItem::Head { .. }) => {}
        }
    }

    SubscriberOutcome::Response(bytes_response(status, &content_type, Bytes::from(body)))
}

/// Serve a recorded response byte-identically.
pub fn respond_from_stored(stored: StoredResponse) -> Response {
    if stored.streaming {
        let body = stored.body;
        let stream = futures::stream::once(async move { body });
        sse_response(stream)
    } else {
        bytes_response(stored.status, &stored.content_type, stored.body)
    }
}

/// Merges the buffered prefix with the live broadcast tail.
struct ItemSource {
    prefix: VecDeque<StreamItem>,
    rx: tokio::sync::broadcast::Receiver<StreamItem>,
}

impl ItemSource {
    /// `None` on lag, closed channel, or deadline — all treated as "the
    /// shared stream is gone".
    async fn next(&mut self, deadline: Instant) -> Option<StreamItem> {
        if let Some(item) = self.prefix.pop_front() {
            return Some(item);
        }
        match tokio::time::timeout_at(deadline.into(), self.rx.recv()).await {
            Ok(Ok(item)) => Some(item),
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(n))) => {
                warn!(lagged = n, "subscriber fell behind the shared stream");
                None
            }
            Ok(Err(_)) | Err(_) => None,
        }
    }
}

// ── Response builders ──────────────────────────────────────────────────

fn sse_response<S>(stream: S) -> Response
where
    S: futures::Stream<Item = Bytes> + Send + 'static,
{
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream.map(Ok::<_, Infallible>)))
        .unwrap_or_default()
}

fn bytes_response(status: u16, content_type: &str, body: Bytes) -> Response {
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY))
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap_or_default()
}

fn envelope_response(status: u16, envelope: String) -> Response {
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(envelope))
        .unwrap_or_default()
}

// ── Tests ──────────────────────────────────────────────────────────────
