//! Routing configuration types.
//!
//! Provides [`RouterConfig`] for tuning the prompt scorer (lexicons, weights,
//! tier boundaries, confidence calibration) and the override rules. All
//! fields have defaults and are (de)serialisable via serde for TOML config
//! files; an absent file yields the built-in behaviour.

use serde::{Deserialize, Serialize};

use crate::catalog::{Tier, TiersConfig};

// ── Default value functions ────────────────────────────────────────────

/// Default number of prompt characters the scorer examines.
fn default_max_scan_chars() -> usize {
    500
}

/// Default token-count normalization breakpoints (whitespace tokens).
fn default_token_count_thresholds() -> [usize; 3] {
    [8, 40, 160]
}

/// Default composite-score boundaries between the four tiers.
fn default_tier_boundaries() -> [f64; 3] {
    [0.25, 0.45, 0.65]
}

/// Default sigmoid slope for confidence calibration.
fn default_confidence_steepness() -> f64 {
    12.0
}

/// Default confidence below which a decision is considered ambiguous.
fn default_confidence_threshold() -> f64 {
    0.70
}

/// Default max-tokens value at which a request is forced to COMPLEX.
fn default_max_tokens_force_complex() -> u32 {
    100_000
}

fn default_structured_output_min_tier() -> Tier {
    Tier::Medium
}

fn default_ambiguous_default_tier() -> Tier {
    Tier::Medium
}

fn strings(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

fn default_code_keywords() -> Vec<String> {
    strings(&[
        "```", "function", "def ", "class ", "impl ", "fn ", "struct", "compile", "debug",
        "stack trace", "regex", "sql", "refactor", "unit test", "segfault", "api endpoint",
    ])
}

fn default_reasoning_keywords() -> Vec<String> {
    strings(&[
        "prove", "derive", "theorem", "step by step", "formally", "rigorous", "contradiction",
        "lemma", "justify", "chain of thought", "reason through", "first principles",
    ])
}

fn default_technical_keywords() -> Vec<String> {
    strings(&[
        "algorithm", "complexity", "latency", "throughput", "database", "kubernetes",
        "concurrency", "mutex", "encryption", "protocol", "distributed", "cache",
        "compiler", "scheduler",
    ])
}

fn default_creative_keywords() -> Vec<String> {
    strings(&[
        "story", "poem", "creative", "imagine", "fiction", "character", "plot", "lyrics",
        "haiku", "screenplay",
    ])
}

fn default_simple_keywords() -> Vec<String> {
    strings(&[
        "what is", "who is", "when did", "where is", "define", "capital of", "how many",
        "translate", "convert", "meaning of", "tell me", "in one sentence",
    ])
}

fn default_imperative_keywords() -> Vec<String> {
    strings(&[
        "write", "create", "build", "implement", "generate", "make", "fix", "optimize",
        "summarize", "list", "design", "draft",
    ])
}

fn default_constraint_keywords() -> Vec<String> {
    strings(&[
        "must", "at least", "at most", "no more than", "exactly", "without using", "limit",
        "ensure", "require", "only use",
    ])
}

fn default_format_keywords() -> Vec<String> {
    strings(&[
        "json", "markdown", "table", "csv", "yaml", "bullet points", "xml", "format as",
        "output as",
    ])
}

fn default_negation_keywords() -> Vec<String> {
    strings(&[
        "don't", "do not", "never", "avoid", "except", "unless", "instead of", "rather than",
    ])
}

fn default_domain_keywords() -> Vec<String> {
    strings(&[
        "legal", "medical", "financial", "quantum", "genomics", "regulatory", "clinical",
        "litigation", "derivatives", "actuarial",
    ])
}

// ── Dimension weights ──────────────────────────────────────────────────

/// The 14 scoring dimension weights. Must sum to 1.0; see [`validate`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DimensionWeights {
    pub token_count: f64,
    pub code_keywords: f64,
    pub reasoning_markers: f64,
    pub technical_terms: f64,
    pub creative_markers: f64,
    pub simple_indicators: f64,
    pub multi_step: f64,
    pub question_complexity: f64,
    pub imperative_verbs: f64,
    pub constraint_indicators: f64,
    pub output_format: f64,
    pub back_references: f64,
    pub negation_complexity: f64,
    pub domain_specificity: f64,
}

impl Default for DimensionWeights {
    fn default() -> Self {
        Self {
            token_count: 0.08,
            code_keywords: 0.12,
            reasoning_markers: 0.14,
            technical_terms: 0.09,
            creative_markers: 0.06,
            simple_indicators: 0.10,
            multi_step: 0.09,
            question_complexity: 0.06,
            imperative_verbs: 0.05,
            constraint_indicators: 0.06,
            output_format: 0.04,
            back_references: 0.04,
            negation_complexity: 0.03,
            domain_specificity: 0.04,
        }
    }
}

impl DimensionWeights {
    /// The weights in canonical feature order.
    pub fn as_array(&self) -> [f64; 14] {
        [
            self.token_count,
            self.code_keywords,
            self.reasoning_markers,
            self.technical_terms,
            self.creative_markers,
            self.simple_indicators,
            self.multi_step,
            self.question_complexity,
            self.imperative_verbs,
            self.constraint_indicators,
            self.output_format,
            self.back_references,
            self.negation_complexity,
            self.domain_specificity,
        ]
    }

    pub fn sum(&self) -> f64 {
        self.as_array().iter().sum()
    }
}

// ── Scoring config ─────────────────────────────────────────────────────

/// Configuration for the prompt scorer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoringConfig {
    /// Prompt characters examined for scoring. Truncation affects only
    /// scoring cost, never correctness of the decision contract.
    #[serde(default = "default_max_scan_chars")]
    pub max_scan_chars: usize,

    /// Breakpoints for normalizing whitespace-token counts into `[0,1]`.
    #[serde(default = "default_token_count_thresholds")]
    pub token_count_thresholds: [usize; 3],

    #[serde(default = "default_code_keywords")]
    pub code_keywords: Vec<String>,
    #[serde(default = "default_reasoning_keywords")]
    pub reasoning_keywords: Vec<String>,
    #[serde(default = "default_technical_keywords")]
    pub technical_keywords: Vec<String>,
    #[serde(default = "default_creative_keywords")]
    pub creative_keywords: Vec<String>,
    #[serde(default = "default_simple_keywords")]
    pub simple_keywords: Vec<String>,
    #[serde(default = "default_imperative_keywords")]
    pub imperative_keywords: Vec<String>,
    #[serde(default = "default_constraint_keywords")]
    pub constraint_keywords: Vec<String>,
    #[serde(default = "default_format_keywords")]
    pub format_keywords: Vec<String>,
    #[serde(default = "default_negation_keywords")]
    pub negation_keywords: Vec<String>,
    #[serde(default = "default_domain_keywords")]
    pub domain_keywords: Vec<String>,

    #[serde(default)]
    pub dimension_weights: DimensionWeights,

    /// Three ascending thresholds splitting the composite score into four
    /// tiers: below the first is SIMPLE, above the last is REASONING.
    #[serde(default = "default_tier_boundaries")]
    pub tier_boundaries: [f64; 3],

    #[serde(default = "default_confidence_steepness")]
    pub confidence_steepness: f64,

    /// Below this confidence the decision method becomes `default` and the
    /// ambiguous default tier is used.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            max_scan_chars: default_max_scan_chars(),
            token_count_thresholds: default_token_count_thresholds(),
            code_keywords: default_code_keywords(),
            reasoning_keywords: default_reasoning_keywords(),
            technical_keywords: default_technical_keywords(),
            creative_keywords: default_creative_keywords(),
            simple_keywords: default_simple_keywords(),
            imperative_keywords: default_imperative_keywords(),
            constraint_keywords: default_constraint_keywords(),
            format_keywords: default_format_keywords(),
            negation_keywords: default_negation_keywords(),
            domain_keywords: default_domain_keywords(),
            dimension_weights: DimensionWeights::default(),
            tier_boundaries: default_tier_boundaries(),
            confidence_steepness: default_confidence_steepness(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

// ── Override rules ─────────────────────────────────────────────────────

/// Hard override rules evaluated before dimensional scoring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverridesConfig {
    /// Requests asking for at least this many output tokens are forced to
    /// COMPLEX regardless of prompt content.
    #[serde(default = "default_max_tokens_force_complex")]
    pub max_tokens_force_complex: u32,

    /// Minimum tier when the request carries tools or structured-output
    /// hints.
    #[serde(default = "default_structured_output_min_tier")]
    pub structured_output_min_tier: Tier,

    /// Tier used when confidence falls below the threshold.
    #[serde(default = "default_ambiguous_default_tier")]
    pub ambiguous_default_tier: Tier,
}

impl Default for OverridesConfig {
    fn default() -> Self {
        Self {
            max_tokens_force_complex: default_max_tokens_force_complex(),
            structured_output_min_tier: default_structured_output_min_tier(),
            ambiguous_default_tier: default_ambiguous_default_tier(),
        }
    }
}

// ── Top-level routing config ───────────────────────────────────────────

/// The full routing configuration: scorer, overrides, and tier tables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RouterConfig {
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub overrides: OverridesConfig,
    #[serde(default)]
    pub tiers: TiersConfig,
}

/// Validate a [`RouterConfig`], returning one human-readable error per
/// violated constraint. An empty `Vec` means the config is usable.
pub fn validate(config: &RouterConfig) -> Vec<String> {
    let mut errors = Vec::new();
    let scoring = &config.scoring;

    let weight_sum = scoring.dimension_weights.sum();
    if (weight_sum - 1.0).abs() > 1e-9 {
        errors.push(format!(
            "dimension_weights must sum to 1.0, got {weight_sum}"
        ));
    }
    for (i, w) in scoring.dimension_weights.as_array().iter().enumerate() {
        if *w < 0.0 {
            errors.push(format!("dimension weight #{i} must be >= 0, got {w}"));
        }
    }

    let [b0, b1, b2] = scoring.tier_boundaries;
    if !(b0 < b1 && b1 < b2) {
        errors.push(format!(
            "tier_boundaries must be strictly ascending, got [{b0}, {b1}, {b2}]"
        ));
    }
    for b in scoring.tier_boundaries {
        if !(0.0..=1.0).contains(&b) {
            errors.push(format!("tier boundary {b} must be in [0.0, 1.0]"));
        }
    }

    if scoring.confidence_steepness <= 0.0 {
        errors.push(format!(
            "confidence_steepness must be > 0, got {}",
            scoring.confidence_steepness
        ));
    }
    if !(0.5..1.0).contains(&scoring.confidence_threshold) {
        errors.push(format!(
            "confidence_threshold must be in [0.5, 1.0), got {}",
            scoring.confidence_threshold
        ));
    }

    let [t0, t1, t2] = scoring.token_count_thresholds;
    if !(t0 > 0 && t0 < t1 && t1 < t2) {
        errors.push(format!(
            "token_count_thresholds must be ascending and nonzero, got [{t0}, {t1}, {t2}]"
        ));
    }

    if scoring.max_scan_chars == 0 {
        errors.push("max_scan_chars must be > 0".to_string());
    }

    errors
}

// ── Tests ──────────────────────────────────────────────────────────────
