//! Model routing logic.
//!
//! The [`SmartRouter`] combines the [`FeatureExtractor`](super::FeatureExtractor)
//! with override rules, tier boundaries, and sigmoid confidence calibration
//! to decide which model should serve each request, and at what estimated
//! cost relative to the most expensive reasoning model.

use std::sync::Arc;

use crate::catalog::{Catalog, ModelInfo, Resolved, Tier};
use crate::ProxyError;

use super::config::RouterConfig;
use super::features::FeatureExtractor;

/// How a routing decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMethod {
    /// Dimensional scoring placed the prompt in a tier.
    Scored,
    /// An override rule or an explicit model id decided.
    Forced,
    /// Confidence fell below the threshold; the ambiguous default tier
    /// was used.
    Default,
    /// The wallet is empty; the free model was selected.
    FreeFallback,
}

impl RouteMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scored => "scored",
            Self::Forced => "forced",
            Self::Default => "default",
            Self::FreeFallback => "free-fallback",
        }
    }
}

/// Everything the router needs to know about one request. Assembled by the
/// validator; the router itself never touches the raw body.
#[derive(Debug, Clone)]
pub struct RouteRequest<'a> {
    /// Concatenated user-role text content.
    pub prompt: &'a str,
    /// The raw `model` field from the client.
    pub requested_model: &'a str,
    pub has_tools: bool,
    /// `response_format` / JSON-schema hints.
    pub wants_structured_output: bool,
    pub max_tokens: Option<u32>,
    pub message_count: usize,
    /// Estimated prompt tokens across the whole conversation (chars / 4).
    pub estimated_context_tokens: u32,
    /// Any message carries non-text content parts.
    pub non_text_content: bool,
    pub wallet_empty: bool,
}

impl<'a> RouteRequest<'a> {
    /// A bare prompt with `model=auto` and no hints. Mostly for tests.
    pub fn simple(prompt: &'a str) -> Self {
        Self {
            prompt,
            requested_model: "auto",
            has_tools: false,
            wants_structured_output: false,
            max_tokens: None,
            message_count: 1,
            estimated_context_tokens: (prompt.len() / 4) as u32,
            non_text_content: false,
            wallet_empty: false,
        }
    }
}

/// The routing decision for a single request. Produced once, never mutated.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub model: &'static ModelInfo,
    /// `None` when an explicit model id bypassed tier selection.
    pub tier: Option<Tier>,
    pub confidence: f64,
    pub method: RouteMethod,
    /// Estimated USD cost of serving this request on `model`.
    pub cost_estimate: f64,
    /// Estimated USD cost on the most expensive reasoning model.
    pub baseline_cost: f64,
    /// `1 − cost_estimate / baseline_cost`, clamped to `[0,1]`.
    pub savings: f64,
    /// Short human-readable explanation for logs and diagnostics.
    pub reasoning: String,
}

/// Deterministic prompt router.
///
/// Thread-safe and cheap to share: all state is immutable after
/// construction.
#[derive(Debug, Clone)]
pub struct SmartRouter {
    extractor: FeatureExtractor,
    config: RouterConfig,
    catalog: Arc<Catalog>,
}

impl SmartRouter {
    pub fn new(config: RouterConfig, catalog: Arc<Catalog>) -> Self {
        Self {
            extractor: FeatureExtractor::new(config.scoring.clone()),
            config,
            catalog,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Route a request to a model.
    ///
    /// Pure and synchronous. Returns an error only when the requested model
    /// id resolves to nothing; the validator normally rejects that earlier.
    pub fn route(&self, request: &RouteRequest<'_>) -> Result<RoutingDecision, ProxyError> {
        // 1. Alias resolution. An explicit real model wins over everything.
        let tier_keyword = match crate::catalog::resolve_alias(request.requested_model) {
            Resolved::Model(info) => {
                return Ok(self.decide(
                    info,
                    None,
                    1.0,
                    RouteMethod::Forced,
                    request,
                    format!("explicit model {}", info.id),
                ));
            }
            Resolved::Unknown(id) => return Err(ProxyError::UnknownModel(id)),
            Resolved::TierKeyword(tier) => Some(tier),
            Resolved::Auto => None,
        };

        // 2. Override rules, first match wins.
        if request.wallet_empty {
            let free = self.catalog.free();
            return Ok(self.decide(
                free,
                Some(free.tier_affinity),
                1.0,
                RouteMethod::FreeFallback,
                request,
                "wallet empty, using free model".to_string(),
            ));
        }

        if let Some(tier) = tier_keyword {
            return Ok(self.select_in_tier(
                tier,
                1.0,
                RouteMethod::Forced,
                request,
                format!("explicit tier keyword {tier}"),
            ));
        }

        if request
            .max_tokens
            .is_some_and(|mt| mt >= self.config.overrides.max_tokens_force_complex)
        {
            return Ok(self.select_in_tier(
                Tier::Complex,
                1.0,
                RouteMethod::Forced,
                request,
                format!(
                    "max_tokens >= {} forces COMPLEX",
                    self.config.overrides.max_tokens_force_complex
                ),
            ));
        }

        // Tools and structured output set a floor rather than a terminal
        // tier; scoring may still land higher.
        let tier_floor = (request.has_tools || request.wants_structured_output)
            .then_some(self.config.overrides.structured_output_min_tier);

        let features = self.extractor.extract(request.prompt, request.message_count);
        if features.reasoning_hits >= 2 {
            return Ok(self.select_in_tier(
                Tier::Reasoning,
                0.97,
                RouteMethod::Forced,
                request,
                format!("{} reasoning markers force REASONING", features.reasoning_hits),
            ));
        }

        // 3. Dimensional scoring. Empty prompts skip straight to the
        // conservative default; the tools floor still applies.
        if request.prompt.trim().is_empty() {
            let tier = max_tier(Tier::Simple, tier_floor);
            return Ok(self.select_in_tier(
                tier,
                0.5,
                RouteMethod::Default,
                request,
                format!("empty prompt, defaulting to {tier}"),
            ));
        }

        let weights = self.config.scoring.dimension_weights.as_array();
        let score = features.composite(&weights);

        // 4. Tier assignment; ties prefer the cheaper tier.
        let [b0, b1, b2] = self.config.scoring.tier_boundaries;
        let scored_tier = if score <= b0 {
            Tier::Simple
        } else if score <= b1 {
            Tier::Medium
        } else if score <= b2 {
            Tier::Complex
        } else {
            Tier::Reasoning
        };

        // 5. Confidence calibration.
        let distance = [b0, b1, b2]
            .iter()
            .map(|b| (score - b).abs())
            .fold(f64::INFINITY, f64::min);
        let confidence = sigmoid(distance * self.config.scoring.confidence_steepness);

        if confidence < self.config.scoring.confidence_threshold {
            let tier = max_tier(
                self.config.overrides.ambiguous_default_tier,
                tier_floor,
            );
            return Ok(self.select_in_tier(
                tier,
                confidence,
                RouteMethod::Default,
                request,
                format!("score {score:.3} too close to a boundary, defaulting to {tier}"),
            ));
        }

        let tier = max_tier(scored_tier, tier_floor);
        let method = if tier != scored_tier {
            RouteMethod::Forced
        } else {
            RouteMethod::Scored
        };
        Ok(self.select_in_tier(
            tier,
            confidence,
            method,
            request,
            format!("score {score:.3} → {tier}, confidence {confidence:.2}"),
        ))
    }

    /// Pick the serving model within a tier, honouring context windows and
    /// the non-text-content floor, then attach cost accounting.
    fn select_in_tier(
        &self,
        tier: Tier,
        confidence: f64,
        method: RouteMethod,
        request: &RouteRequest<'_>,
        reasoning: String,
    ) -> RoutingDecision {
        // Non-text parts without a vision-certain tier: be conservative.
        let tier = if request.non_text_content {
            max_tier(tier, Some(Tier::Medium))
        } else {
            tier
        };

        let required_context = request
            .estimated_context_tokens
            .saturating_add(request.max_tokens.unwrap_or(0));

        let model = match self.catalog.primary(tier) {
            Some(primary) if primary.context_window >= required_context => primary,
            _ => self
                .catalog
                .cheapest_fitting(tier, required_context)
                .unwrap_or_else(|| self.catalog.free()),
        };

        self.decide(model, Some(tier), confidence, method, request, reasoning)
    }

    fn decide(
        &self,
        model: &'static ModelInfo,
        tier: Option<Tier>,
        confidence: f64,
        method: RouteMethod,
        request: &RouteRequest<'_>,
        reasoning: String,
    ) -> RoutingDecision {
        let input_tokens = request.estimated_context_tokens as f64;
        let output_tokens = request
            .max_tokens
            .unwrap_or(model.max_output_tokens)
            .min(model.max_output_tokens) as f64;

        let cost_estimate = input_tokens * model.input_cost_per_mtok / 1e6
            + output_tokens * model.output_cost_per_mtok / 1e6;

        let baseline = self.catalog.baseline();
        let baseline_output = request
            .max_tokens
            .unwrap_or(baseline.max_output_tokens)
            .min(baseline.max_output_tokens) as f64;
        let baseline_cost = input_tokens * baseline.input_cost_per_mtok / 1e6
            + baseline_output * baseline.output_cost_per_mtok / 1e6;

        let savings = if baseline_cost > 0.0 {
            (1.0 - cost_estimate / baseline_cost).clamp(0.0, 1.0)
        } else {
            0.0
        };

        RoutingDecision {
            model,
            tier,
            confidence,
            method,
            cost_estimate,
            baseline_cost,
            savings,
            reasoning,
        }
    }
}

/// Logistic sigmoid, 0.5 at x = 0.
fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// The later (more capable) of a tier and an optional floor.
fn max_tier(tier: Tier, floor: Option<Tier>) -> Tier {
    match floor {
        Some(f) if f > tier => f,
        _ => tier,
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
