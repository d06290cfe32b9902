//! Thinking-token post-processor.
//!
//! Some upstream providers interleave internal reasoning into the visible
//! output between known delimiters. The stripper removes those regions from
//! both buffered JSON bodies and per-event SSE deltas. With no delimiters
//! configured it is the identity function.
//!
//! Streaming is the interesting case: a delimiter may straddle two SSE
//! chunks. [`StripState`] therefore holds back a tail one byte shorter than
//! the longest delimiter and prepends it to the next chunk's content; the
//! tail is flushed verbatim on stream end.

use serde_json::Value;

/// Delimiter configuration for one stream direction.
#[derive(Debug, Clone)]
pub struct ThinkStripper {
    /// `(open, close)` pairs; everything between a pair is removed.
    pairs: Vec<(String, String)>,
    /// Standalone tokens removed wherever they appear.
    tokens: Vec<String>,
    /// Longest delimiter length, sizing the carry-over tail.
    max_len: usize,
}

/// Per-stream carry-over state. One per relayed stream; never shared.
#[derive(Debug, Clone, Default)]
pub struct StripState {
    /// Index into `pairs` when currently inside an open delimiter.
    inside: Option<usize>,
    carry: String,
}

impl ThinkStripper {
    pub fn new(pairs: Vec<(String, String)>, tokens: Vec<String>) -> Self {
        let max_len = pairs
            .iter()
            .flat_map(|(o, c)| [o.len(), c.len()])
            .chain(tokens.iter().map(|t| t.len()))
            .max()
            .unwrap_or(0);
        Self { pairs, tokens, max_len }
    }

    /// The delimiters observed in the wild for reasoning-capable providers.
    pub fn with_default_delimiters() -> Self {
        Self::new(
            vec![
                ("<think>".into(), "</think>".into()),
                ("<reasoning>".into(), "</reasoning>".into()),
                ("[THINKING]".into(), "[/THINKING]".into()),
            ],
            Vec::new(),
        )
    }

    /// Identity stripper.
    pub fn disabled() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    pub fn is_identity(&self) -> bool {
        self.pairs.is_empty() && self.tokens.is_empty()
    }

    /// Strip a complete text in one shot (non-streaming responses).
    pub fn strip_all(&self, text: &str) -> String {
        let mut state = StripState::default();
        let mut out = self.feed(&mut state, text);
        out.push_str(&self.flush(&mut state));
        out
    }

    /// Feed one chunk of streamed text, returning the emittable part.
    /// Unemitted bytes stay in `state` until the next feed or [`Self::flush`].
    pub fn feed(&self, state: &mut StripState, input: &str) -> String {
        if self.is_identity() {
            return input.to_string();
        }

        let text = format!("{}{}", state.carry, input);
        state.carry.clear();
        let mut out = String::with_capacity(text.len());
        let mut pos = 0;

        loop {
            if let Some(pair_idx) = state.inside {
                let close = &self.pairs[pair_idx].1;
                match text[pos..].find(close.as_str()) {
                    Some(at) => {
                        pos += at + close.len();
                        state.inside = None;
                    }
                    None => {
                        // Still inside: keep enough tail to catch a close
                        // delimiter split across the boundary, drop the rest.
                        let hold = holdback(&text, pos, close.len() - 1);
                        state.carry = text[hold..].to_string();
                        return out;
                    }
                }
                continue;
            }

            match self.earliest_match(&text, pos) {
                Some(Match::Open { at, pair_idx, len }) => {
                    out.push_str(&text[pos..at]);
                    pos = at + len;
                    state.inside = Some(pair_idx);
                }
                Some(Match::Token { at, len }) => {
                    out.push_str(&text[pos..at]);
                    pos = at + len;
                }
                None => {
                    // No delimiter in sight: emit everything except a tail
                    // that could begin one.
                    let hold = holdback(&text, pos, self.max_len.saturating_sub(1));
                    out.push_str(&text[pos..hold]);
                    state.carry = text[hold..].to_string();
                    return out;
                }
            }
        }
    }

    /// End of stream: release whatever is held back. Content still inside
    /// an unterminated thinking block is dropped.
    pub fn flush(&self, state: &mut StripState) -> String {
        let carry = std::mem::take(&mut state.carry);
        if state.inside.is_some() {
            String::new()
        } else {
            carry
        }
    }

    fn earliest_match(&self, text: &str, from: usize) -> Option<Match> {
        let mut best: Option<Match> = None;
        for (idx, (open, _)) in self.pairs.iter().enumerate() {
            if let Some(at) = text[from..].find(open.as_str()) {
                let m = Match::Open {
                    at: from + at,
                    pair_idx: idx,
                    len: open.len(),
                };
                if best.as_ref().map_or(true, |b| m.at() < b.at()) {
                    best = Some(m);
                }
            }
        }
        for token in &self.tokens {
            if let Some(at) = text[from..].find(token.as_str()) {
                let m = Match::Token {
                    at: from + at,
                    len: token.len(),
                };
                if best.as_ref().map_or(true, |b| m.at() < b.at()) {
                    best = Some(m);
                }
            }
        }
        best
    }

    // ── JSON payload rewriting ─────────────────────────────────────────

    /// Rewrite a buffered chat-completion body, stripping every
    /// `choices[].message.content` string. Returns `None` when nothing
    /// changed.
    pub fn rewrite_response(&self, body: &mut Value) -> bool {
        self.rewrite_content_at(body, "message")
    }

    /// Rewrite one SSE chunk object, stripping `choices[].delta.content`
    /// with carry-over across events.
    pub fn rewrite_delta(&self, chunk: &mut Value, state: &mut StripState) -> bool {
        if self.is_identity() {
            return false;
        }
        let mut changed = false;
        if let Some(choices) = chunk.get_mut("choices").and_then(Value::as_array_mut) {
            for choice in choices {
                if let Some(content) = choice
                    .pointer_mut("/delta/content")
                    .filter(|c| c.is_string())
                {
                    let text = content.as_str().unwrap_or_default();
                    let stripped = self.feed(state, text);
                    if stripped != text {
                        changed = true;
                    }
                    *content = Value::String(stripped);
                }
            }
        }
        changed
    }

    fn rewrite_content_at(&self, body: &mut Value, container: &str) -> bool {
        if self.is_identity() {
            return false;
        }
        let pointer = format!("/{container}/content");
        let mut changed = false;
        if let Some(choices) = body.get_mut("choices").and_then(Value::as_array_mut) {
            for choice in choices {
                if let Some(content) = choice.pointer_mut(&pointer).filter(|c| c.is_string()) {
                    let text = content.as_str().unwrap_or_default();
                    let stripped = self.strip_all(text);
                    if stripped != text {
                        changed = true;
                        *content = Value::String(stripped);
                    }
                }
            }
        }
        changed
    }
}

enum Match {
    Open { at: usize, pair_idx: usize, len: usize },
    Token { at: usize, len: usize },
}

impl Match {
    fn at(&self) -> usize {
        match self {
            Self::Open { at, .. } | Self::Token { at, .. } => *at,
        }
    }
}

/// Largest char-boundary position at or above `len - want_tail`, never
/// below `from`.
fn holdback(text: &str, from: usize, want_tail: usize) -> usize {
    let mut pos = text.len().saturating_sub(want_tail).max(from);
    while pos < text.len() && !text.is_char_boundary(pos) {
        pos += 1;
    }
    pos
}

// ── Tests ──────────────────────────────────────────────────────────────
