//! Request validation and the client-facing error boundary.
//!
//! Everything a request must satisfy before any routing or upstream work
//! happens lives here. Failures produce the uniform envelope from
//! [`crate::ErrorEnvelope`]; nothing else ever reaches the client on an
//! error path.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;

use crate::catalog::{resolve_alias, Resolved};
use crate::{ChatMessage, ErrorEnvelope, ProxyError};

/// Hard cap on request body size.
pub const MAX_BODY_BYTES: usize = 150 * 1024;

/// Hard cap on the `messages` array length.
pub const MAX_MESSAGES: usize = 200;

/// A request that passed every validation gate.
#[derive(Debug, Clone)]
pub struct ValidRequest {
    /// The parsed body, ready to be forwarded once `model`/`stream` are
    /// rewritten.
    pub body: Value,
    /// The raw `model` field (defaults to `auto` when absent).
    pub raw_model: String,
    pub resolved: Resolved,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub tools: Vec<Value>,
    pub wants_structured_output: bool,
    /// Concatenated user-role text, the router's scoring input.
    pub prompt_text: String,
    pub non_text_content: bool,
    /// Rough chars/4 token estimate across the whole conversation.
    pub estimated_context_tokens: u32,
}

/// Validate a raw request body end to end.
pub fn validate_body(bytes: &[u8]) -> Result<ValidRequest, ProxyError> {
    if bytes.len() > MAX_BODY_BYTES {
        return Err(ProxyError::BodyTooLarge(MAX_BODY_BYTES));
    }

    let body: Value = serde_json::from_slice(bytes)
        .map_err(|e| ProxyError::Validation(format!("request body is not valid JSON: {e}")))?;
    if !body.is_object() {
        return Err(ProxyError::Validation(
            "request body must be a JSON object".into(),
        ));
    }

    let raw_model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("auto")
        .to_string();
    let resolved = resolve_alias(&raw_model);
    if let Resolved::Unknown(ref id) = resolved {
        return Err(ProxyError::UnknownModel(id.clone()));
    }

    let messages_value = body
        .get("messages")
        .ok_or_else(|| ProxyError::Validation("`messages` is required".into()))?;
    let raw_messages = messages_value
        .as_array()
        .ok_or_else(|| ProxyError::Validation("`messages` must be an array".into()))?;
    if raw_messages.is_empty() {
        return Err(ProxyError::Validation("`messages` must not be empty".into()));
    }
    if raw_messages.len() > MAX_MESSAGES {
        return Err(ProxyError::Validation(format!(
            "`messages` may hold at most {MAX_MESSAGES} entries, got {}",
            raw_messages.len()
        )));
    }

    let mut messages = Vec::with_capacity(raw_messages.len());
    for (i, raw) in raw_messages.iter().enumerate() {
        let role = raw
            .get("role")
            .and_then(Value::as_str)
            .ok_or_else(|| ProxyError::Validation(format!("message #{i} is missing `role`")))?;
        messages.push(ChatMessage {
            role: role.to_string(),
            content: raw.get("content").cloned().unwrap_or(Value::Null),
        });
    }

    let max_tokens = match body.get("max_tokens") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => match n.as_u64() {
            Some(v) if v <= u32::MAX as u64 => Some(v as u32),
            Some(_) => {
                return Err(ProxyError::Validation(
                    "`max_tokens` is out of range".into(),
                ))
            }
            None => {
                return Err(ProxyError::Validation(
                    "`max_tokens` must be a non-negative integer".into(),
                ))
            }
        },
        Some(_) => {
            return Err(ProxyError::Validation(
                "`max_tokens` must be a non-negative integer".into(),
            ))
        }
    };

    let temperature = body.get("temperature").and_then(Value::as_f64);
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let tools: Vec<Value> = body
        .get("tools")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let wants_structured_output = body
        .get("response_format")
        .and_then(|rf| rf.get("type"))
        .and_then(Value::as_str)
        .is_some_and(|t| t == "json_object" || t == "json_schema");

    let mut prompt_parts: Vec<&str> = Vec::new();
    let mut non_text_content = false;
    let mut total_chars = 0usize;
    for message in &messages {
        match &message.content {
            Value::String(text) => {
                total_chars += text.len();
                if message.role == "user" {
                    prompt_parts.push(text);
                }
            }
            Value::Null => {}
            other => {
                non_text_content = true;
                total_chars += other.to_string().len();
            }
        }
    }

    let prompt_text = prompt_parts.join("\n");

    Ok(ValidRequest {
        raw_model,
        resolved,
        messages,
        stream,
        temperature,
        max_tokens,
        tools,
        wants_structured_output,
        prompt_text,
        non_text_content,
        estimated_context_tokens: (total_chars / 4) as u32,
        body,
    })
}

// ── Error boundary ─────────────────────────────────────────────────────

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        error_response(&self)
    }
}

/// Render any [`ProxyError`] as the uniform envelope.
///
/// A rejected payment surfaces the upstream challenge body unchanged so
/// the client sees what the upstream asked for.
pub fn error_response(err: &ProxyError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    if let ProxyError::PaymentRejected(upstream_body) = err {
        if serde_json::from_str::<Value>(upstream_body).is_ok() {
            return (
                status,
                [(header::CONTENT_TYPE, "application/json")],
                upstream_body.clone(),
            )
                .into_response();
        }
    }

    let envelope = ErrorEnvelope::from_error(err);
    (status, axum::Json(envelope)).into_response()
}

// ── Tests ──────────────────────────────────────────────────────────────
