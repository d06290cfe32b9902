//! Request deduplication and singleflight response cache.
//!
//! Identical requests — retries, double-clicks, parallel tabs — should cost
//! one upstream charge, not N. The cache is content-addressed: a SHA-256
//! fingerprint over the canonicalized request identifies logically equal
//! requests, and at most one upstream send is in flight per fingerprint.
//!
//! Lifecycle per fingerprint:
//! - first lookup misses and becomes the **owner**, which forwards upstream
//!   and publishes every byte it relays;
//! - concurrent lookups **attach** as subscribers and replay the buffered
//!   prefix before receiving live items in order;
//! - lookups after completion **replay** the recorded response until the
//!   TTL (default 30 s) lapses.
//!
//! The owner side works through an [`OwnerGuard`]: dropping the guard
//! without finishing counts as a cancellation, so a client disconnect can
//! never strand subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::ChatMessage;

// ── Configuration ──────────────────────────────────────────────────────

/// Tuning knobs for the dedup cache.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How long a completed response stays replayable.
    pub ttl: Duration,
    /// Maximum number of cache entries. In-flight entries are never
    /// evicted; the cap is enforced against completed ones.
    pub capacity: usize,
    /// Maximum buffered items per in-flight entry. Past this the entry
    /// stops accepting new subscribers and will not be replayable.
    pub replay_buffer: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            capacity: 256,
            replay_buffer: 1024,
        }
    }
}

// ── Fingerprint ────────────────────────────────────────────────────────

/// Compute the content-addressed fingerprint of a request.
///
/// Covers the resolved model id, messages normalized to `(role, trimmed
/// content)`, the tools array sorted by name, temperature, and max-tokens.
/// The stream flag is deliberately excluded: streaming and non-streaming
/// renditions of the same prompt share a fingerprint. Stable under JSON key
/// reordering because only typed fields enter the hash.
pub fn fingerprint(
    model_id: &str,
    messages: &[ChatMessage],
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    tools: &[Value],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model_id.as_bytes());
    hasher.update([0x1e]);

    for message in messages {
        hasher.update(message.role.as_bytes());
        hasher.update([0x1f]);
        match message.content.as_str() {
            Some(text) => hasher.update(text.trim().as_bytes()),
            None => hasher.update(canonical_json(&message.content).as_bytes()),
        }
        hasher.update([0x1e]);
    }

    let mut sorted_tools: Vec<&Value> = tools.iter().collect();
    sorted_tools.sort_by_key(|t| tool_name(t));
    for tool in sorted_tools {
        hasher.update(canonical_json(tool).as_bytes());
        hasher.update([0x1e]);
    }

    if let Some(t) = temperature {
        hasher.update(t.to_bits().to_be_bytes());
    }
    hasher.update([0x1f]);
    if let Some(mt) = max_tokens {
        hasher.update(mt.to_be_bytes());
    }

    hex::encode(hasher.finalize())
}

fn tool_name(tool: &Value) -> String {
    tool.pointer("/function/name")
        .or_else(|| tool.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Serialize with object keys sorted recursively, so two JSON documents
/// that differ only in key order hash identically.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[*k])
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

// ── Stream items ───────────────────────────────────────────────────────

/// One unit of the owner's relayed response, as subscribers see it.
#[derive(Debug, Clone)]
pub enum StreamItem {
    /// Response metadata, published exactly once before any chunk.
    Head {
        status: u16,
        content_type: String,
        streaming: bool,
    },
    /// One relayed body chunk (an SSE event, or the full JSON body).
    Chunk(Bytes),
    /// Normal completion.
    Done,
    /// The origin was cancelled before committing any byte. Subscribers
    /// may restart the request themselves.
    Cancelled,
    /// Upstream or relay failure; the payload is a serialized error
    /// envelope with the status it surfaces as.
    Error { status: u16, envelope: String },
}

/// A completed response, replayable until the TTL lapses.
#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub status: u16,
    pub content_type: String,
    pub streaming: bool,
    pub body: Bytes,
}

/// Prefix plus live tail for an attached subscriber.
pub struct Attached {
    pub prefix: Vec<StreamItem>,
    pub rx: broadcast::Receiver<StreamItem>,
}

/// Result of a cache lookup.
pub enum Lookup {
    /// First request for this fingerprint: forward upstream and publish.
    Owner(OwnerGuard),
    /// An identical request is in flight: consume its stream.
    Subscriber(Attached),
    /// A completed response is still fresh: replay it.
    Replay(StoredResponse),
    /// The in-flight entry's buffer overflowed; proceed without the cache.
    Bypass,
}

// ── Cache internals ────────────────────────────────────────────────────

struct InflightState {
    generation: u64,
    tx: broadcast::Sender<StreamItem>,
    buffer: Vec<StreamItem>,
    overflowed: bool,
    started_at: Instant,
}

struct CompletedState {
    stored: StoredResponse,
    completed_at: Instant,
    last_access: Instant,
}

enum EntryState {
    InFlight(InflightState),
    Completed(CompletedState),
}

/// The dedup cache. Shared process-wide behind an `Arc`; all operations
/// are O(1) map accesses with no await points while a shard lock is held.
pub struct DedupCache {
    entries: DashMap<String, EntryState>,
    config: DedupConfig,
    generations: AtomicU64,
}

impl DedupCache {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            generations: AtomicU64::new(1),
        }
    }

    /// Look up a fingerprint, atomically registering as owner on a miss.
    pub fn lookup(self: &Arc<Self>, fp: &str) -> Lookup {
        // What the occupied-entry inspection decided, computed under a
        // short borrow so the entry can be replaced afterwards.
        enum Found {
            Subscribe(Vec<StreamItem>, broadcast::Receiver<StreamItem>),
            Bypass,
            Replay(StoredResponse),
            Expired,
        }

        let result = match self.entries.entry(fp.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let found = match occupied.get_mut() {
                    EntryState::InFlight(inflight) => {
                        if inflight.overflowed {
                            Found::Bypass
                        } else {
                            Found::Subscribe(inflight.buffer.clone(), inflight.tx.subscribe())
                        }
                    }
                    EntryState::Completed(completed) => {
                        if completed.completed_at.elapsed() < self.config.ttl {
                            completed.last_access = Instant::now();
                            Found::Replay(completed.stored.clone())
                        } else {
                            Found::Expired
                        }
                    }
                };
                match found {
                    Found::Bypass => {
                        debug!(fingerprint = %fp, "in-flight entry overflowed, bypassing");
                        Lookup::Bypass
                    }
                    Found::Subscribe(prefix, rx) => {
                        debug!(fingerprint = %fp, "attaching to in-flight request");
                        Lookup::Subscriber(Attached { prefix, rx })
                    }
                    Found::Replay(stored) => {
                        debug!(fingerprint = %fp, "replaying completed response");
                        Lookup::Replay(stored)
                    }
                    Found::Expired => {
                        let generation = self.next_generation();
                        occupied.insert(EntryState::InFlight(self.new_inflight(generation)));
                        Lookup::Owner(OwnerGuard {
                            cache: Arc::clone(self),
                            fingerprint: fp.to_string(),
                            generation,
                        })
                    }
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let generation = self.next_generation();
                vacant.insert(EntryState::InFlight(self.new_inflight(generation)));
                Lookup::Owner(OwnerGuard {
                    cache: Arc::clone(self),
                    fingerprint: fp.to_string(),
                    generation,
                })
            }
        };

        if matches!(result, Lookup::Owner(_)) {
            self.enforce_capacity();
        }
        result
    }

    fn new_inflight(&self, generation: u64) -> InflightState {
        let (tx, _) = broadcast::channel(self.config.replay_buffer.max(16));
        InflightState {
            generation,
            tx,
            buffer: Vec::new(),
            overflowed: false,
            started_at: Instant::now(),
        }
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    /// Publish one item on an owned entry. Stale generations (the entry was
    /// reaped or replaced) are ignored.
    fn publish(&self, fp: &str, generation: u64, item: StreamItem) {
        if let Some(mut entry) = self.entries.get_mut(fp) {
            if let EntryState::InFlight(inflight) = entry.value_mut() {
                if inflight.generation != generation {
                    return;
                }
                if !inflight.overflowed {
                    if inflight.buffer.len() >= self.config.replay_buffer {
                        warn!(fingerprint = %fp, "replay buffer overflow, entry no longer joinable");
                        inflight.overflowed = true;
                        inflight.buffer.clear();
                        inflight.buffer.shrink_to_fit();
                    } else {
                        inflight.buffer.push(item.clone());
                    }
                }
                let _ = inflight.tx.send(item);
            }
        }
    }

    /// Complete an owned entry: broadcast `Done` and transition to a
    /// replayable record assembled from the buffered items.
    fn finish(&self, fp: &str, generation: u64) {
        let completed = {
            let Some(mut entry) = self.entries.get_mut(fp) else {
                return;
            };
            let replacement = match entry.value_mut() {
                EntryState::InFlight(inflight) if inflight.generation == generation => {
                    let _ = inflight.tx.send(StreamItem::Done);
                    if inflight.overflowed {
                        None
                    } else {
                        Some(assemble_stored(&inflight.buffer))
                    }
                }
                _ => return,
            };
            match replacement {
                Some(stored) => {
                    let now = Instant::now();
                    *entry.value_mut() = EntryState::Completed(CompletedState {
                        stored,
                        completed_at: now,
                        last_access: now,
                    });
                    true
                }
                None => false,
            }
        };

        if !completed {
            // Overflowed entries cannot replay truncated output.
            self.entries
                .remove_if(fp, |_, state| matches!(state, EntryState::InFlight(_)));
        }
    }

    /// Tear down an owned entry. `item` tells subscribers how it ended.
    fn teardown(&self, fp: &str, generation: u64, item: StreamItem) {
        let removed = self.entries.remove_if(fp, |_, state| {
            matches!(state, EntryState::InFlight(inflight) if inflight.generation == generation)
        });
        if let Some((_, EntryState::InFlight(inflight))) = removed {
            let _ = inflight.tx.send(item);
        }
    }

    /// Drop completed entries past the TTL and in-flight entries that have
    /// been stuck far beyond any sane upstream deadline.
    pub fn purge_expired(&self) {
        let ttl = self.config.ttl;
        let stuck_after = ttl.max(Duration::from_secs(60)) * 10;
        let mut removed = 0usize;
        self.entries.retain(|_, state| match state {
            EntryState::Completed(c) => {
                let keep = c.completed_at.elapsed() < ttl;
                removed += usize::from(!keep);
                keep
            }
            EntryState::InFlight(inflight) => {
                let keep = inflight.started_at.elapsed() < stuck_after;
                removed += usize::from(!keep);
                keep
            }
        });
        if removed > 0 {
            debug!(removed, "purged expired dedup entries");
        }
    }

    /// Evict least-recently-used completed entries over capacity. In-flight
    /// entries are exempt until they complete.
    fn enforce_capacity(&self) {
        while self.entries.len() > self.config.capacity {
            let victim = self
                .entries
                .iter()
                .filter_map(|entry| match entry.value() {
                    EntryState::Completed(c) => Some((entry.key().clone(), c.last_access)),
                    EntryState::InFlight(_) => None,
                })
                .min_by_key(|(_, last_access)| *last_access);
            match victim {
                Some((key, _)) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Fold a buffered item sequence into one replayable response.
fn assemble_stored(buffer: &[StreamItem]) -> StoredResponse {
    let mut stored = StoredResponse {
        status: 200,
        content_type: "application/json".into(),
        streaming: false,
        body: Bytes::new(),
    };
    let mut body = Vec::new();
    for item in buffer {
        match item {
            StreamItem::Head {
                status,
                content_type,
                streaming,
            } => {
                stored.status = *status;
                stored.content_type = content_type.clone();
                stored.streaming = *streaming;
            }
            StreamItem::Chunk(chunk) => body.extend_from_slice(chunk),
            _ => {}
        }
    }
    stored.body = Bytes::from(body);
    stored
}

// ── Owner guard ────────────────────────────────────────────────────────

/// Publication handle for the owning request: an opaque (fingerprint,
/// generation) pair into the cache's entry arena — no back-pointers.
///
/// Dropping the guard without calling [`OwnerGuard::finish`] or
/// [`OwnerGuard::fail`] broadcasts a cancellation so attached subscribers
/// are never left waiting.
pub struct OwnerGuard {
    cache: Arc<DedupCache>,
    fingerprint: String,
    generation: u64,
}

impl OwnerGuard {
    pub fn publish(&self, item: StreamItem) {
        self.cache.publish(&self.fingerprint, self.generation, item);
    }

    /// Normal completion: subscribers get `Done` and the entry becomes
    /// replayable for the TTL.
    pub fn finish(self) {
        self.cache.finish(&self.fingerprint, self.generation);
        std::mem::forget(self);
    }

    /// Failure: subscribers get the serialized error envelope and the entry
    /// is removed without becoming replayable.
    pub fn fail(self, status: u16, envelope: String) {
        self.cache.teardown(
            &self.fingerprint,
            self.generation,
            StreamItem::Error { status, envelope },
        );
        std::mem::forget(self);
    }
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        self.cache.teardown(
            &self.fingerprint,
            self.generation,
            StreamItem::Cancelled,
        );
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
