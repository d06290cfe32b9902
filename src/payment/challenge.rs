//! HTTP 402 challenge parsing.
//!
//! The upstream answers unauthenticated requests with a 402 whose JSON body
//! describes the payment it expects. The body is ephemeral: it lives only
//! inside one request's payment exchange.

use serde_json::Value;

use crate::ProxyError;

/// A parsed 402 challenge body.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentChallenge {
    /// Price for this request, in units of `asset`.
    pub amount: f64,
    pub asset: String,
    pub chain: String,
    pub recipient: String,
    /// Challenge nonce; the signature is bound to it.
    pub nonce: String,
    /// Unix timestamp (seconds) after which the authorization is void.
    pub valid_until: u64,
    /// Fields the proxy does not interpret, preserved verbatim.
    pub extra: serde_json::Map<String, Value>,
}

/// Parse a 402 response body.
///
/// `amount` and `validUntil` are accepted as JSON numbers or numeric
/// strings, since upstream implementations differ on the encoding of
/// stablecoin amounts.
pub fn parse_challenge(body: &[u8]) -> Result<PaymentChallenge, ProxyError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ProxyError::Validation(format!("malformed 402 challenge body: {e}")))?;
    let obj = value
        .as_object()
        .ok_or_else(|| ProxyError::Validation("402 challenge body is not an object".into()))?;

    let amount = number_field(obj, "amount")?;
    if amount < 0.0 {
        return Err(ProxyError::Validation(format!(
            "402 challenge amount must be non-negative, got {amount}"
        )));
    }
    let valid_until = number_field(obj, "validUntil")? as u64;

    let known = ["amount", "asset", "chain", "recipient", "nonce", "validUntil"];
    let extra: serde_json::Map<String, Value> = obj
        .iter()
        .filter(|(k, _)| !known.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(PaymentChallenge {
        amount,
        asset: string_field(obj, "asset")?,
        chain: string_field(obj, "chain")?,
        recipient: string_field(obj, "recipient")?,
        nonce: string_field(obj, "nonce")?,
        valid_until,
        extra,
    })
}

fn string_field(obj: &serde_json::Map<String, Value>, key: &str) -> Result<String, ProxyError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProxyError::Validation(format!("402 challenge missing field `{key}`")))
}

fn number_field(obj: &serde_json::Map<String, Value>, key: &str) -> Result<f64, ProxyError> {
    let value = obj
        .get(key)
        .ok_or_else(|| ProxyError::Validation(format!("402 challenge missing field `{key}`")))?;
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ProxyError::Validation(format!("402 challenge field `{key}` not representable"))),
        Value::String(s) => s.parse::<f64>().map_err(|_| {
            ProxyError::Validation(format!("402 challenge field `{key}` is not numeric: {s:?}"))
        }),
        _ => Err(ProxyError::Validation(format!(
            "402 challenge field `{key}` must be a number or numeric string"
        ))),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
