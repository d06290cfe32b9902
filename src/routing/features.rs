//! Prompt feature extraction.
//!
//! Turns a prompt string into a 14-dimension feature vector, each dimension
//! clipped to `[0.0, 1.0]`. The composite complexity score is the dot
//! product of this vector with the configured dimension weights.
//!
//! All analysis is a single pass over a lowercased, length-capped copy of
//! the prompt: no I/O, no allocation beyond that copy, deterministic for a
//! given input and configuration.

use super::config::ScoringConfig;

/// One extracted feature vector, in canonical dimension order.
///
/// `reasoning_hits` is a side channel: the raw reasoning-marker count feeds
/// the override rule (two or more markers force the REASONING tier) and is
/// not itself a scored dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    pub token_count: f64,
    pub code_keywords: f64,
    pub reasoning_markers: f64,
    pub technical_terms: f64,
    pub creative_markers: f64,
    /// Inverted density: 1.0 when no simple-query phrasing is present, so
    /// simple phrasing pulls the composite score down.
    pub simple_indicators: f64,
    pub multi_step: f64,
    pub question_complexity: f64,
    pub imperative_verbs: f64,
    pub constraint_indicators: f64,
    pub output_format: f64,
    pub back_references: f64,
    pub negation_complexity: f64,
    pub domain_specificity: f64,

    pub reasoning_hits: usize,
}

impl FeatureVector {
    /// The 14 scored dimensions in canonical order, matching
    /// [`super::config::DimensionWeights::as_array`].
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

    /// Dot product with a weight vector. With weights summing to 1.0 and
    /// every dimension in `[0,1]`, the result is in `[0,1]`.
    pub fn composite(&self, weights: &[f64; 14]) -> f64 {
        self.as_array()
            .iter()
            .zip(weights.iter())
            .map(|(f, w)| f * w)
            .sum::<f64>()
            .clamp(0.0, 1.0)
    }
}

/// Sequencing words that indicate multi-step instructions when no numbered
/// list is present.
const SEQUENCE_WORDS: &[&str] = &["first,", "then ", "next,", "after that", "finally"];

/// Phrases referring back to earlier conversation turns.
const BACK_REFERENCE_PATTERNS: &[&str] = &[
    "the above",
    "previous",
    "as mentioned",
    "earlier",
    "aforementioned",
    "refer back",
];

/// Question words that signal analytical depth beyond a plain lookup.
const DEEP_QUESTION_WORDS: &[&str] = &["why ", "how does", "how would", "explain", "compare", "analyze"];

/// Stateless prompt feature extractor.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    config: ScoringConfig,
}

impl FeatureExtractor {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Extract all dimensions from a prompt.
    ///
    /// `message_count` is the total number of messages in the conversation;
    /// long conversations raise the back-reference dimension.
    pub fn extract(&self, prompt: &str, message_count: usize) -> FeatureVector {
        // Cap the scan window on a char boundary, then lowercase once.
        let scan: String = prompt.chars().take(self.config.max_scan_chars).collect();
        let lower = scan.to_lowercase();

        let reasoning_hits = count_hits(&lower, &self.config.reasoning_keywords);
        let simple_hits = count_hits(&lower, &self.config.simple_keywords);

        FeatureVector {
            token_count: self.token_count_feature(&lower),
            code_keywords: ratio(count_hits(&lower, &self.config.code_keywords), 3),
            reasoning_markers: ratio(reasoning_hits, 3),
            technical_terms: ratio(count_hits(&lower, &self.config.technical_keywords), 3),
            creative_markers: ratio(count_hits(&lower, &self.config.creative_keywords), 2),
            simple_indicators: 1.0 - ratio(simple_hits, 2),
            multi_step: multi_step_feature(&lower),
            question_complexity: question_feature(&lower),
            imperative_verbs: ratio(count_hits(&lower, &self.config.imperative_keywords), 3),
            constraint_indicators: ratio(count_hits(&lower, &self.config.constraint_keywords), 3),
            output_format: ratio(count_hits(&lower, &self.config.format_keywords), 2),
            back_references: back_reference_feature(&lower, message_count),
            negation_complexity: ratio(count_hits(&lower, &self.config.negation_keywords), 3),
            domain_specificity: ratio(count_hits(&lower, &self.config.domain_keywords), 2),
            reasoning_hits,
        }
    }

    /// Piecewise-linear normalization of the whitespace-token count through
    /// the configured breakpoints: 0 at zero tokens, 1/3 at the first
    /// breakpoint, 2/3 at the second, 1.0 at and beyond the third.
    fn token_count_feature(&self, lower: &str) -> f64 {
        let count = lower.split_whitespace().count();
        let [t0, t1, t2] = self.config.token_count_thresholds;
        let (lo_count, hi_count, lo_val, hi_val) = if count <= t0 {
            (0, t0, 0.0, 1.0 / 3.0)
        } else if count <= t1 {
            (t0, t1, 1.0 / 3.0, 2.0 / 3.0)
        } else if count <= t2 {
            (t1, t2, 2.0 / 3.0, 1.0)
        } else {
            return 1.0;
        };
        let span = (hi_count - lo_count).max(1) as f64;
        lo_val + (count - lo_count) as f64 / span * (hi_val - lo_val)
    }
}

/// Total occurrence count of all lexicon entries in the scan window.
fn count_hits(lower: &str, lexicon: &[String]) -> usize {
    lexicon
        .iter()
        .map(|needle| {
            if needle.is_empty() {
                0
            } else {
                lower.matches(needle.as_str()).count()
            }
        })
        .sum()
}

/// `hits / cap`, clipped to `[0,1]`. `cap` is the saturation point.
fn ratio(hits: usize, cap: usize) -> f64 {
    (hits as f64 / cap.max(1) as f64).clamp(0.0, 1.0)
}

/// 1.0 for two or more numbered list items, otherwise a partial signal from
/// sequencing words.
fn multi_step_feature(lower: &str) -> f64 {
    let numbered = lower
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            match trimmed.find('.') {
                Some(pos) if pos > 0 => trimmed[..pos].chars().all(|c| c.is_ascii_digit()),
                _ => false,
            }
        })
        .count();
    if numbered >= 2 {
        return 1.0;
    }
    let sequenced = SEQUENCE_WORDS
        .iter()
        .filter(|w| lower.contains(*w))
        .count();
    ratio(sequenced, 3)
}

/// Question depth: question marks plus analytical question words.
fn question_feature(lower: &str) -> f64 {
    let marks = lower.matches('?').count();
    let deep = DEEP_QUESTION_WORDS
        .iter()
        .filter(|w| lower.contains(*w))
        .count();
    ratio(marks + deep, 4)
}

/// Back-reference density, with a bonus for long conversations where
/// implicit references are likely.
fn back_reference_feature(lower: &str, message_count: usize) -> f64 {
    let hits = BACK_REFERENCE_PATTERNS
        .iter()
        .filter(|p| lower.contains(*p))
        .count();
    let conversation_bonus = usize::from(message_count > 6);
    ratio(hits + conversation_bonus, 3)
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::config::DimensionWeights;

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::new(ScoringConfig::default())
    }

    #[test]
    fn test_empty_prompt_scores_only_inverted_simple() {
        let fv = extractor().extract("", 1);
        assert_eq!(fv.token_count, 0.0);
        assert_eq!(fv.code_keywords, 0.0);
        assert_eq!(fv.reasoning_markers, 0.0);
        // No simple phrasing present either, so the inverted dimension is 1.
        assert_eq!(fv.simple_indicators, 1.0);
        assert_eq!(fv.reasoning_hits, 0);
    }

    #[test]
    fn test_simple_lookup_question_scores_low() {
        let fv = extractor().extract("What is the capital of France?", 1);
        let score = fv.composite(&DimensionWeights::default().as_array());
        assert!(
            score < 0.15,
            "simple lookup should score well below the first boundary, got {score}"
        );
        // "what is" and "capital of" both hit the simple lexicon.
        assert_eq!(fv.simple_indicators, 0.0);
    }

    #[test]
    fn test_reasoning_prompt_counts_markers() {
        let fv = extractor().extract(
            "prove step by step that sqrt(2) is irrational and derive the contradiction formally",
            1,
        );
        assert!(
            fv.reasoning_hits >= 2,
            "expected at least 2 reasoning markers, got {}",
            fv.reasoning_hits
        );
        assert!(fv.reasoning_markers >= 0.6);
    }

    #[test]
    fn test_code_prompt_raises_code_dimension() {
        let fv = extractor().extract("Fix this function:\n```rust\nfn main() {}\n```", 1);
        assert!(fv.code_keywords > 0.0);
    }

    #[test]
    fn test_numbered_list_saturates_multi_step() {
        let fv = extractor().extract("Do the following:\n1. First thing\n2. Second thing", 1);
        assert_eq!(fv.multi_step, 1.0);
    }

    #[test]
    fn test_single_numbered_item_is_partial_at_most() {
        let fv = extractor().extract("1. Only one item", 1);
        assert!(fv.multi_step < 1.0);
    }

    #[test]
    fn test_token_count_normalization_breakpoints() {
        let ex = extractor();
        // 8 tokens is the first breakpoint → exactly 1/3.
        let prompt8 = "a b c d e f g h";
        let fv = ex.extract(prompt8, 1);
        assert!((fv.token_count - 1.0 / 3.0).abs() < 1e-9);

        // Far beyond the last breakpoint saturates at 1.0 (capped by the
        // scan window, so build tokens of single chars).
        let long: String = "x ".repeat(240);
        let fv = ex.extract(&long, 1);
        assert_eq!(fv.token_count, 1.0);
    }

    #[test]
    fn test_long_conversation_raises_back_references() {
        let ex = extractor();
        let short = ex.extract("continue", 2);
        let long = ex.extract("continue", 10);
        assert!(long.back_references > short.back_references);
    }

    #[test]
    fn test_all_dimensions_clipped_to_unit_interval() {
        // A prompt engineered to saturate many dimensions at once.
        let prompt = "prove derive theorem prove derive step by step formally rigorous \
                      ```rust fn impl struct``` function def class algorithm mutex cache \
                      must ensure exactly json table markdown don't never avoid \
                      1. one\n2. two\nwhy how does explain compare analyze????";
        let fv = extractor().extract(prompt, 20);
        for (i, f) in fv.as_array().iter().enumerate() {
            assert!(
                (0.0..=1.0).contains(f),
                "dimension #{i} out of range: {f}"
            );
        }
        let score = fv.composite(&DimensionWeights::default().as_array());
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let ex = extractor();
        let prompt = "Summarize the previous discussion as a markdown table";
        assert_eq!(ex.extract(prompt, 3), ex.extract(prompt, 3));
    }

    #[test]
    fn test_scan_window_caps_work_on_multibyte_input() {
        // Must not panic on non-ASCII input near the cap.
        let prompt = "é".repeat(600);
        let fv = extractor().extract(&prompt, 1);
        assert!(fv.token_count > 0.0);
    }
}
