//! Model catalog: static model metadata, tier tables, and alias resolution.
//!
//! The catalog is immutable for the life of the process. Tier tables
//! (primary + ordered fallbacks per tier) are the only part that can be
//! overridden from configuration; model descriptors themselves are baked in.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Canonical id of the zero-cost fallback model.
pub const FREE_MODEL: &str = "meta-llama/llama-4-scout:free";

/// Host prefix stripped during alias resolution, so clients may send either
/// `blockrun/anthropic/claude-sonnet-4.6` or the bare canonical id.
pub const HOST_PREFIX: &str = "blockrun/";

/// Pseudo-model meaning "let the router decide".
pub const AUTO_MODEL: &str = "auto";

// ── Tiers ──────────────────────────────────────────────────────────────

/// Complexity bucket a prompt lands in. Ordered cheapest first; tie-breaks
/// in the router always prefer the cheaper tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    Simple,
    Medium,
    Complex,
    Reasoning,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "SIMPLE",
            Self::Medium => "MEDIUM",
            Self::Complex => "COMPLEX",
            Self::Reasoning => "REASONING",
        }
    }

    /// Parse a tier keyword as clients may send it in the `model` field.
    pub fn from_keyword(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "simple" => Some(Self::Simple),
            "medium" => Some(Self::Medium),
            "complex" => Some(Self::Complex),
            "reasoning" => Some(Self::Reasoning),
            _ => None,
        }
    }

    pub const ALL: [Tier; 4] = [Tier::Simple, Tier::Medium, Tier::Complex, Tier::Reasoning];
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Model descriptors ──────────────────────────────────────────────────

/// Static metadata for one upstream model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    /// Canonical `provider/name` id.
    pub id: &'static str,
    pub display_name: &'static str,
    pub context_window: u32,
    pub max_output_tokens: u32,
    /// USD per million input tokens.
    pub input_cost_per_mtok: f64,
    /// USD per million output tokens.
    pub output_cost_per_mtok: f64,
    pub reasoning: bool,
    pub supports_tools: bool,
    pub supports_streaming: bool,
    pub tier_affinity: Tier,
}

/// Every model the proxy knows how to route to.
static MODELS: &[ModelInfo] = &[
    ModelInfo {
        id: "anthropic/claude-opus-4.6",
        display_name: "Claude Opus 4.6",
        context_window: 500_000,
        max_output_tokens: 64_000,
        input_cost_per_mtok: 18.0,
        output_cost_per_mtok: 90.0,
        reasoning: true,
        supports_tools: true,
        supports_streaming: true,
        tier_affinity: Tier::Reasoning,
    },
    ModelInfo {
        id: "deepseek/deepseek-r2",
        display_name: "DeepSeek R2",
        context_window: 160_000,
        max_output_tokens: 32_000,
        input_cost_per_mtok: 0.6,
        output_cost_per_mtok: 2.4,
        reasoning: true,
        supports_tools: true,
        supports_streaming: true,
        tier_affinity: Tier::Reasoning,
    },
    ModelInfo {
        id: "anthropic/claude-sonnet-4.6",
        display_name: "Claude Sonnet 4.6",
        context_window: 200_000,
        max_output_tokens: 64_000,
        input_cost_per_mtok: 3.0,
        output_cost_per_mtok: 15.0,
        reasoning: true,
        supports_tools: true,
        supports_streaming: true,
        tier_affinity: Tier::Complex,
    },
    ModelInfo {
        id: "openai/gpt-5.2",
        display_name: "GPT-5.2",
        context_window: 400_000,
        max_output_tokens: 32_000,
        input_cost_per_mtok: 2.5,
        output_cost_per_mtok: 10.0,
        reasoning: true,
        supports_tools: true,
        supports_streaming: true,
        tier_affinity: Tier::Complex,
    },
    ModelInfo {
        id: "openai/gpt-5-mini",
        display_name: "GPT-5 Mini",
        context_window: 200_000,
        max_output_tokens: 16_000,
        input_cost_per_mtok: 0.45,
        output_cost_per_mtok: 1.8,
        reasoning: false,
        supports_tools: true,
        supports_streaming: true,
        tier_affinity: Tier::Medium,
    },
    ModelInfo {
        id: "anthropic/claude-haiku-4.5",
        display_name: "Claude Haiku 4.5",
        context_window: 200_000,
        max_output_tokens: 32_000,
        input_cost_per_mtok: 1.0,
        output_cost_per_mtok: 5.0,
        reasoning: false,
        supports_tools: true,
        supports_streaming: true,
        tier_affinity: Tier::Medium,
    },
    ModelInfo {
        id: "google/gemini-3-flash",
        display_name: "Gemini 3 Flash",
        context_window: 1_000_000,
        max_output_tokens: 16_000,
        input_cost_per_mtok: 0.10,
        output_cost_per_mtok: 0.40,
        reasoning: false,
        supports_tools: true,
        supports_streaming: true,
        tier_affinity: Tier::Simple,
    },
    ModelInfo {
        id: "openai/gpt-5-nano",
        display_name: "GPT-5 Nano",
        context_window: 128_000,
        max_output_tokens: 8_000,
        input_cost_per_mtok: 0.05,
        output_cost_per_mtok: 0.20,
        reasoning: false,
        supports_tools: false,
        supports_streaming: true,
        tier_affinity: Tier::Simple,
    },
    ModelInfo {
        id: FREE_MODEL,
        display_name: "Llama 4 Scout (free)",
        context_window: 128_000,
        max_output_tokens: 8_000,
        input_cost_per_mtok: 0.0,
        output_cost_per_mtok: 0.0,
        reasoning: false,
        supports_tools: false,
        supports_streaming: true,
        tier_affinity: Tier::Simple,
    },
];

/// Versioned shorthands clients commonly send, mapped to canonical ids.
static ALIASES: &[(&str, &str)] = &[
    ("opus-4.6", "anthropic/claude-opus-4.6"),
    ("claude-opus-4.6", "anthropic/claude-opus-4.6"),
    ("sonnet-4.6", "anthropic/claude-sonnet-4.6"),
    ("claude-sonnet-4.6", "anthropic/claude-sonnet-4.6"),
    ("haiku-4.5", "anthropic/claude-haiku-4.5"),
    ("claude-haiku-4.5", "anthropic/claude-haiku-4.5"),
    ("gpt-5.2", "openai/gpt-5.2"),
    ("gpt-5-mini", "openai/gpt-5-mini"),
    ("gpt-5-nano", "openai/gpt-5-nano"),
    ("gemini-flash", "google/gemini-3-flash"),
    ("gemini-3-flash", "google/gemini-3-flash"),
    ("deepseek-r2", "deepseek/deepseek-r2"),
    ("r2", "deepseek/deepseek-r2"),
    ("free", FREE_MODEL),
];

// ── Alias resolution ───────────────────────────────────────────────────

/// Outcome of resolving a client-supplied model id.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// `auto` — the router decides.
    Auto,
    /// A real catalog model, requested explicitly.
    Model(&'static ModelInfo),
    /// A tier keyword (`simple`, `reasoning`, ...) — route within that tier.
    TierKeyword(Tier),
    /// Nothing in the catalog matches.
    Unknown(String),
}

/// Resolve a raw model id: strip the host prefix, apply the shorthand
/// table, then look the result up in the catalog.
pub fn resolve_alias(raw: &str) -> Resolved {
    let trimmed = raw.trim();
    let stripped = trimmed.strip_prefix(HOST_PREFIX).unwrap_or(trimmed);

    if stripped.eq_ignore_ascii_case(AUTO_MODEL) {
        return Resolved::Auto;
    }
    if let Some(tier) = Tier::from_keyword(stripped) {
        return Resolved::TierKeyword(tier);
    }

    let canonical = ALIASES
        .iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(&stripped))
        .map(|(_, id)| *id)
        .unwrap_or(stripped);

    match lookup(canonical) {
        Some(info) => Resolved::Model(info),
        None => Resolved::Unknown(trimmed.to_string()),
    }
}

fn lookup(id: &str) -> Option<&'static ModelInfo> {
    MODELS.iter().find(|m| m.id == id)
}

// ── Tier tables ────────────────────────────────────────────────────────

/// Ordered model list for one tier: primary first, then fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierTable {
    pub primary: String,
    #[serde(default)]
    pub fallback: Vec<String>,
}

impl TierTable {
    fn new(primary: &str, fallback: &[&str]) -> Self {
        Self {
            primary: primary.to_string(),
            fallback: fallback.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Per-tier model tables, overridable from configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TiersConfig {
    #[serde(rename = "SIMPLE", default = "default_simple_tier")]
    pub simple: TierTable,
    #[serde(rename = "MEDIUM", default = "default_medium_tier")]
    pub medium: TierTable,
    #[serde(rename = "COMPLEX", default = "default_complex_tier")]
    pub complex: TierTable,
    #[serde(rename = "REASONING", default = "default_reasoning_tier")]
    pub reasoning: TierTable,
}

fn default_simple_tier() -> TierTable {
    TierTable::new("google/gemini-3-flash", &["openai/gpt-5-nano", FREE_MODEL])
}

fn default_medium_tier() -> TierTable {
    TierTable::new(
        "openai/gpt-5-mini",
        &["anthropic/claude-haiku-4.5", "google/gemini-3-flash"],
    )
}

fn default_complex_tier() -> TierTable {
    TierTable::new(
        "anthropic/claude-sonnet-4.6",
        &["openai/gpt-5.2", "openai/gpt-5-mini"],
    )
}

fn default_reasoning_tier() -> TierTable {
    TierTable::new(
        "anthropic/claude-opus-4.6",
        &["deepseek/deepseek-r2", "anthropic/claude-sonnet-4.6"],
    )
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            simple: default_simple_tier(),
            medium: default_medium_tier(),
            complex: default_complex_tier(),
            reasoning: default_reasoning_tier(),
        }
    }
}

// ── Catalog ────────────────────────────────────────────────────────────

/// The process-wide model catalog: descriptors plus tier tables.
#[derive(Debug, Clone)]
pub struct Catalog {
    chains: HashMap<Tier, Vec<&'static ModelInfo>>,
}

impl Catalog {
    /// Build a catalog from tier tables. Table entries that do not name a
    /// known model are dropped with a warning rather than failing startup.
    pub fn new(tiers: &TiersConfig) -> Self {
        let mut chains = HashMap::new();
        for tier in Tier::ALL {
            let table = match tier {
                Tier::Simple => &tiers.simple,
                Tier::Medium => &tiers.medium,
                Tier::Complex => &tiers.complex,
                Tier::Reasoning => &tiers.reasoning,
            };
            let mut chain = Vec::with_capacity(1 + table.fallback.len());
            for id in std::iter::once(&table.primary).chain(table.fallback.iter()) {
                match lookup(id) {
                    Some(info) => {
                        if !chain.iter().any(|m: &&ModelInfo| m.id == info.id) {
                            chain.push(info);
                        }
                    }
                    None => {
                        tracing::warn!(tier = %tier, model = %id, "tier table names unknown model, skipping");
                    }
                }
            }
            chains.insert(tier, chain);
        }
        Self { chains }
    }

    pub fn get(&self, id: &str) -> Option<&'static ModelInfo> {
        lookup(id)
    }

    /// The ordered model chain for a tier: `[primary, fallback...]`.
    pub fn chain(&self, tier: Tier) -> &[&'static ModelInfo] {
        self.chains.get(&tier).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn primary(&self, tier: Tier) -> Option<&'static ModelInfo> {
        self.chain(tier).first().copied()
    }

    pub fn free(&self) -> &'static ModelInfo {
        lookup(FREE_MODEL).unwrap_or(&MODELS[MODELS.len() - 1])
    }

    /// The most expensive reasoning model — the cost baseline that savings
    /// are measured against.
    pub fn baseline(&self) -> &'static ModelInfo {
        MODELS
            .iter()
            .filter(|m| m.reasoning)
            .max_by(|a, b| {
                a.output_cost_per_mtok
                    .partial_cmp(&b.output_cost_per_mtok)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(&MODELS[0])
    }

    /// The cheapest model in a tier whose context window covers
    /// `required_context` tokens. Falls back to chain order when none fit.
    pub fn cheapest_fitting(
        &self,
        tier: Tier,
        required_context: u32,
    ) -> Option<&'static ModelInfo> {
        let chain = self.chain(tier);
        chain
            .iter()
            .filter(|m| m.context_window >= required_context)
            .min_by(|a, b| {
                a.input_cost_per_mtok
                    .partial_cmp(&b.input_cost_per_mtok)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .or_else(|| chain.first())
            .copied()
    }

    /// All known model ids, for diagnostics.
    pub fn model_ids(&self) -> Vec<&'static str> {
        MODELS.iter().map(|m| m.id).collect()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new(&TiersConfig::default())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_auto_keyword() {
        assert_eq!(resolve_alias("auto"), Resolved::Auto);
        assert_eq!(resolve_alias("AUTO"), Resolved::Auto);
    }

    #[test]
    fn test_resolve_strips_host_prefix() {
        let r = resolve_alias("blockrun/anthropic/claude-sonnet-4.6");
        match r {
            Resolved::Model(m) => assert_eq!(m.id, "anthropic/claude-sonnet-4.6"),
            other => panic!("expected model, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_versioned_shorthand() {
        match resolve_alias("sonnet-4.6") {
            Resolved::Model(m) => assert_eq!(m.id, "anthropic/claude-sonnet-4.6"),
            other => panic!("expected model, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_tier_keyword() {
        assert_eq!(resolve_alias("reasoning"), Resolved::TierKeyword(Tier::Reasoning));
        assert_eq!(resolve_alias("SIMPLE"), Resolved::TierKeyword(Tier::Simple));
    }

    #[test]
    fn test_resolve_unknown_model() {
        match resolve_alias("totally/unknown-model") {
            Resolved::Unknown(id) => assert_eq!(id, "totally/unknown-model"),
            other => panic!("expected unknown, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_free_alias() {
        match resolve_alias("free") {
            Resolved::Model(m) => assert_eq!(m.id, FREE_MODEL),
            other => panic!("expected free model, got {other:?}"),
        }
    }

    #[test]
    fn test_default_chains_are_nonempty_and_known() {
        let catalog = Catalog::default();
        for tier in Tier::ALL {
            let chain = catalog.chain(tier);
            assert!(!chain.is_empty(), "tier {tier} has empty chain");
            assert_eq!(chain[0].id, catalog.primary(tier).map(|m| m.id).unwrap_or(""));
        }
    }

    #[test]
    fn test_baseline_is_priciest_reasoning_model() {
        let catalog = Catalog::default();
        let baseline = catalog.baseline();
        assert!(baseline.reasoning);
        for m in MODELS.iter().filter(|m| m.reasoning) {
            assert!(baseline.output_cost_per_mtok >= m.output_cost_per_mtok);
        }
    }

    #[test]
    fn test_free_model_costs_nothing() {
        let catalog = Catalog::default();
        let free = catalog.free();
        assert_eq!(free.input_cost_per_mtok, 0.0);
        assert_eq!(free.output_cost_per_mtok, 0.0);
    }

    #[test]
    fn test_cheapest_fitting_prefers_big_window_under_pressure() {
        let catalog = Catalog::default();
        // 300k tokens exceeds every SIMPLE model except Gemini 3 Flash.
        let m = catalog
            .cheapest_fitting(Tier::Simple, 300_000)
            .unwrap_or_else(|| panic!("no candidate"));
        assert_eq!(m.id, "google/gemini-3-flash");
    }

    #[test]
    fn test_cheapest_fitting_falls_back_to_chain_head_when_none_fit() {
        let catalog = Catalog::default();
        let m = catalog
            .cheapest_fitting(Tier::Simple, 2_000_000)
            .unwrap_or_else(|| panic!("no candidate"));
        assert_eq!(m.id, catalog.primary(Tier::Simple).map(|m| m.id).unwrap_or(""));
    }

    #[test]
    fn test_tier_table_unknown_models_are_skipped() {
        let tiers = TiersConfig {
            simple: TierTable::new("nope/missing", &["google/gemini-3-flash"]),
            ..TiersConfig::default()
        };
        let catalog = Catalog::new(&tiers);
        let chain = catalog.chain(Tier::Simple);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].id, "google/gemini-3-flash");
    }

    #[test]
    fn test_tiers_config_toml_roundtrip() {
        let cfg = TiersConfig::default();
        let text = toml::to_string_pretty(&cfg)
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: serialize: {e}")));
        let parsed: TiersConfig = toml::from_str(&text)
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: deserialize: {e}")));
        assert_eq!(cfg, parsed);
    }
}
