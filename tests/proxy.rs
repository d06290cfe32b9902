//! End-to-end tests: a real proxy instance against a mock upstream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::{json, Value};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

use clawrouter::balance::StaticBalance;
use clawrouter::catalog::FREE_MODEL;
use clawrouter::payment::{PaymentChallenge, PaymentSigner};
use clawrouter::proxy::ProxyConfig;
use clawrouter::ProxyError;

const TEST_KEY: &str = "0x000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

fn config(port: u16, upstream: &str) -> ProxyConfig {
    ProxyConfig {
        port,
        upstream_base_url: upstream.to_string(),
        wallet_key: Some(TEST_KEY.into()),
        ..ProxyConfig::default()
    }
}

fn chat_body(prompt: &str) -> Value {
    json!({
        "model": "auto",
        "messages": [{ "role": "user", "content": prompt }]
    })
}

fn completion_body(content: &str) -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 7, "completion_tokens": 5, "total_tokens": 12 }
    })
}

fn challenge_body() -> Value {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    json!({
        "amount": 0.001,
        "asset": "USDC",
        "chain": "base",
        "recipient": "0x9f3c00000000000000000000000000000000beef",
        "nonce": "n-test-1",
        "validUntil": now + 3600
    })
}

/// Matches requests that carry no payment authorization yet.
struct NoPaymentHeader;

impl Match for NoPaymentHeader {
    fn matches(&self, request: &Request) -> bool {
        !request.headers.contains_key("x-payment")
    }
}

/// Matches requests that do carry a payment authorization.
struct HasPaymentHeader;

impl Match for HasPaymentHeader {
    fn matches(&self, request: &Request) -> bool {
        request.headers.contains_key("x-payment")
    }
}

struct CountingSigner {
    calls: AtomicUsize,
}

#[async_trait]
impl PaymentSigner for CountingSigner {
    fn address(&self) -> &str {
        "0x00000000000000000000000000000000000000bb"
    }

    async fn sign(
        &self,
        challenge: &PaymentChallenge,
        _request_digest: &[u8],
    ) -> Result<String, ProxyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("x402 test:{}", challenge.nonce))
    }
}

// ── Health and validation ──────────────────────────────────────────────

#[tokio::test]
async fn health_reports_wallet_address() {
    let upstream = MockServer::start().await;
    let handle = clawrouter::start(config(18411, &upstream.uri()))
        .await
        .unwrap_or_else(|e| panic!("start: {e}"));

    let resp = reqwest::get(format!("{}/health", handle.base_url()))
        .await
        .unwrap_or_else(|e| panic!("health: {e}"));
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap_or_default();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["wallet"], handle.wallet_address());

    handle.close().await;
}

#[tokio::test]
async fn unknown_paths_get_the_error_envelope() {
    let upstream = MockServer::start().await;
    let handle = clawrouter::start(config(18412, &upstream.uri()))
        .await
        .unwrap_or_else(|e| panic!("start: {e}"));

    let resp = reqwest::get(format!("{}/v1/nope", handle.base_url()))
        .await
        .unwrap_or_else(|e| panic!("request: {e}"));
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap_or_default();
    assert!(body["error"]["message"].is_string());

    handle.close().await;
}

#[tokio::test]
async fn wrong_method_on_chat_path_gets_405_with_envelope() {
    let upstream = MockServer::start().await;
    let handle = clawrouter::start(config(18425, &upstream.uri()))
        .await
        .unwrap_or_else(|e| panic!("start: {e}"));

    let resp = reqwest::get(format!("{}/v1/chat/completions", handle.base_url()))
        .await
        .unwrap_or_else(|e| panic!("request: {e}"));
    assert_eq!(resp.status(), 405);
    let body: Value = resp.json().await.unwrap_or_default();
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap_or_default()
            .contains("POST"),
        "envelope should name the allowed method: {body}"
    );

    handle.close().await;
}

#[tokio::test]
async fn validation_rejects_bad_requests_without_touching_upstream() {
    let upstream = MockServer::start().await;
    let handle = clawrouter::start(config(18413, &upstream.uri()))
        .await
        .unwrap_or_else(|e| panic!("start: {e}"));
    let client = reqwest::Client::new();
    let url = format!("{}/v1/chat/completions", handle.base_url());

    // Empty messages.
    let resp = client
        .post(&url)
        .json(&json!({ "model": "auto", "messages": [] }))
        .send()
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(resp.status(), 400);

    // Negative max_tokens.
    let mut body = chat_body("hi");
    body["max_tokens"] = json!(-1);
    let resp = client.post(&url).json(&body).send().await.unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(resp.status(), 400);

    // Unknown model.
    let mut body = chat_body("hi");
    body["model"] = json!("acme/quantum-brain-9000");
    let resp = client.post(&url).json(&body).send().await.unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(resp.status(), 400);

    // Oversize body.
    let mut body = chat_body("hi");
    body["messages"][0]["content"] = json!("x".repeat(151 * 1024));
    let resp = client.post(&url).json(&body).send().await.unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(resp.status(), 413);

    assert!(
        upstream
            .received_requests()
            .await
            .unwrap_or_default()
            .is_empty(),
        "validation failures must not reach the upstream"
    );
    handle.close().await;
}

// ── Routing ────────────────────────────────────────────────────────────

#[tokio::test]
async fn simple_prompt_routes_to_the_cheap_tier() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("Paris")))
        .mount(&upstream)
        .await;

    let handle = clawrouter::start(config(18414, &upstream.uri()))
        .await
        .unwrap_or_else(|e| panic!("start: {e}"));

    let resp = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", handle.base_url()))
        .json(&chat_body("What is the capital of France?"))
        .send()
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap_or_default();
    assert_eq!(body["choices"][0]["message"]["content"], "Paris");

    let sent = upstream.received_requests().await.unwrap_or_default();
    assert_eq!(sent.len(), 1, "exactly one upstream call expected");
    let sent_body: Value = serde_json::from_slice(&sent[0].body).unwrap_or_default();
    assert_eq!(
        sent_body["model"], "google/gemini-3-flash",
        "a trivial lookup should ride the SIMPLE tier primary"
    );

    handle.close().await;
}

#[tokio::test]
async fn empty_wallet_routes_to_the_free_model() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("ok")))
        .mount(&upstream)
        .await;

    let handle = clawrouter::start_with(
        config(18415, &upstream.uri()),
        None,
        Some(Arc::new(StaticBalance(true))),
    )
    .await
    .unwrap_or_else(|e| panic!("start: {e}"));

    // Give the balance monitor one poll cycle.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", handle.base_url()))
        .json(&chat_body("What is the capital of France?"))
        .send()
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(resp.status(), 200);

    let sent = upstream.received_requests().await.unwrap_or_default();
    let sent_body: Value = serde_json::from_slice(&sent[0].body).unwrap_or_default();
    assert_eq!(sent_body["model"], FREE_MODEL);

    handle.close().await;
}

// ── Payment ────────────────────────────────────────────────────────────

#[tokio::test]
async fn first_402_is_signed_and_retried_then_cached() {
    let upstream = MockServer::start().await;
    // Unpaid requests get challenged; paid requests succeed.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(NoPaymentHeader)
        .respond_with(ResponseTemplate::new(402).set_body_json(challenge_body()))
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(HasPaymentHeader)
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("paid answer")))
        .mount(&upstream)
        .await;

    let signer = Arc::new(CountingSigner {
        calls: AtomicUsize::new(0),
    });
    let handle = clawrouter::start_with(config(18416, &upstream.uri()), Some(signer.clone()), None)
        .await
        .unwrap_or_else(|e| panic!("start: {e}"));
    let client = reqwest::Client::new();
    let url = format!("{}/v1/chat/completions", handle.base_url());

    let resp = client
        .post(&url)
        .json(&chat_body("What is the capital of France?"))
        .send()
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(resp.status(), 200, "402 must be satisfied transparently");
    assert_eq!(signer.calls.load(Ordering::SeqCst), 1);

    // A different prompt on the same (endpoint, model) rides the cached
    // authorization: no second 402, no second signature.
    let resp = client
        .post(&url)
        .json(&chat_body("What is the capital of Spain?"))
        .send()
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(resp.status(), 200);
    assert_eq!(
        signer.calls.load(Ordering::SeqCst),
        1,
        "the cached pre-auth must skip the challenge round-trip"
    );

    let sent = upstream.received_requests().await.unwrap_or_default();
    // First request: challenge + paid retry. Second request: paid direct.
    assert_eq!(sent.len(), 3);
    assert!(sent[2].headers.contains_key("x-payment"));

    handle.close().await;
}

#[tokio::test]
async fn second_402_surfaces_to_the_client() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(402).set_body_json(challenge_body()))
        .mount(&upstream)
        .await;

    let handle = clawrouter::start(config(18417, &upstream.uri()))
        .await
        .unwrap_or_else(|e| panic!("start: {e}"));

    let resp = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", handle.base_url()))
        .json(&chat_body("What is the capital of France?"))
        .send()
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(resp.status(), 402, "a rejected payment surfaces as 402");
    let body: Value = resp.json().await.unwrap_or_default();
    assert_eq!(body["asset"], "USDC", "upstream challenge body passes through");

    handle.close().await;
}

// ── Dedup ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_identical_requests_share_one_upstream_call() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion_body("shared"))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&upstream)
        .await;

    let handle = clawrouter::start(config(18418, &upstream.uri()))
        .await
        .unwrap_or_else(|e| panic!("start: {e}"));
    let client = reqwest::Client::new();
    let url = format!("{}/v1/chat/completions", handle.base_url());
    let body = chat_body("What is the capital of France?");

    let (a, b) = tokio::join!(
        client.post(&url).json(&body).send(),
        client.post(&url).json(&body).send(),
    );
    let a = a.unwrap_or_else(|e| panic!("{e}"));
    let b = b.unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(a.status(), 200);
    assert_eq!(b.status(), 200);
    let body_a = a.bytes().await.unwrap_or_default();
    let body_b = b.bytes().await.unwrap_or_default();
    assert_eq!(body_a, body_b, "subscriber must see byte-identical output");

    assert_eq!(
        upstream.received_requests().await.unwrap_or_default().len(),
        1,
        "identical in-flight requests must coalesce"
    );

    // A third request after completion replays from cache.
    let c = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(c.status(), 200);
    assert_eq!(c.bytes().await.unwrap_or_default(), body_a);
    assert_eq!(
        upstream.received_requests().await.unwrap_or_default().len(),
        1,
        "a replay within the TTL must not hit the upstream"
    );

    handle.close().await;
}

// ── Fallback chain ─────────────────────────────────────────────────────

#[tokio::test]
async fn upstream_5xx_advances_to_the_fallback_model() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("gemini-3-flash"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("gpt-5-nano"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("Paris")))
        .mount(&upstream)
        .await;

    let handle = clawrouter::start(config(18419, &upstream.uri()))
        .await
        .unwrap_or_else(|e| panic!("start: {e}"));

    let resp = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", handle.base_url()))
        .json(&chat_body("What is the capital of France?"))
        .send()
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(resp.status(), 200, "the fallback should have answered");
    let body: Value = resp.json().await.unwrap_or_default();
    assert_eq!(body["choices"][0]["message"]["content"], "Paris");
    assert_eq!(upstream.received_requests().await.unwrap_or_default().len(), 2);

    handle.close().await;
}

#[tokio::test]
async fn explicit_upstream_4xx_is_surfaced_unchanged() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({ "error": { "message": "bad prompt", "type": "invalid_request_error" } })),
        )
        .mount(&upstream)
        .await;

    let handle = clawrouter::start(config(18420, &upstream.uri()))
        .await
        .unwrap_or_else(|e| panic!("start: {e}"));

    let resp = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", handle.base_url()))
        .json(&chat_body("What is the capital of France?"))
        .send()
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap_or_default();
    assert_eq!(body["error"]["message"], "bad prompt");
    assert_eq!(
        upstream.received_requests().await.unwrap_or_default().len(),
        1,
        "4xx must not trigger fallback retries"
    );

    handle.close().await;
}

// ── Streaming ──────────────────────────────────────────────────────────

#[tokio::test]
async fn sse_stream_is_relayed_with_thinking_tokens_stripped() {
    let sse = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hello <think>hidden",
        "\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"chatter</think> world\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
        .mount(&upstream)
        .await;

    let handle = clawrouter::start(config(18421, &upstream.uri()))
        .await
        .unwrap_or_else(|e| panic!("start: {e}"));

    let mut body = chat_body("What is the capital of France?");
    body["stream"] = json!(true);
    let resp = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", handle.base_url()))
        .json(&body)
        .send()
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let text = String::from_utf8_lossy(&resp.bytes().await.unwrap_or_default()).into_owned();
    assert!(text.contains("Hello"), "visible prefix survives: {text}");
    assert!(text.contains("world"), "visible suffix survives: {text}");
    assert!(!text.contains("hidden"), "thinking content stripped: {text}");
    assert!(!text.contains("<think>"), "delimiters stripped: {text}");
    assert!(text.trim_end().ends_with("data: [DONE]"), "stream terminates: {text}");

    handle.close().await;
}

#[tokio::test]
async fn client_disconnect_mid_stream_leaves_the_proxy_healthy() {
    let sse = "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"slow\"}}]}\n\n";
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse, "text/event-stream")
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&upstream)
        .await;

    let handle = clawrouter::start(config(18422, &upstream.uri()))
        .await
        .unwrap_or_else(|e| panic!("start: {e}"));

    let mut body = chat_body("What is the capital of France?");
    body["stream"] = json!(true);
    let client = reqwest::Client::new();
    let pending = client
        .post(format!("{}/v1/chat/completions", handle.base_url()))
        .json(&body)
        .timeout(Duration::from_millis(50))
        .send();
    // The client gives up after 50ms mid-handshake or mid-stream.
    let _ = pending.await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let health = reqwest::get(format!("{}/health", handle.base_url()))
        .await
        .unwrap_or_else(|e| panic!("health after disconnect: {e}"));
    assert_eq!(health.status(), 200, "a dropped client must not hurt the listener");

    handle.close().await;
}

// ── Lifecycle ──────────────────────────────────────────────────────────

#[tokio::test]
async fn second_start_on_same_port_delegates_and_reports_wallet() {
    let upstream = MockServer::start().await;
    let first = clawrouter::start(config(18423, &upstream.uri()))
        .await
        .unwrap_or_else(|e| panic!("start: {e}"));
    let second = clawrouter::start(config(18423, &upstream.uri()))
        .await
        .unwrap_or_else(|e| panic!("second start should delegate: {e}"));

    assert_eq!(second.wallet_address(), first.wallet_address());

    // Closing the delegating handle is a no-op: the server still answers.
    second.close().await;
    let health = reqwest::get(format!("{}/health", first.base_url()))
        .await
        .unwrap_or_else(|e| panic!("health: {e}"));
    assert_eq!(health.status(), 200);

    first.close().await;
}

#[tokio::test]
async fn port_is_rebindable_right_after_close() {
    let upstream = MockServer::start().await;
    let first = clawrouter::start(config(18424, &upstream.uri()))
        .await
        .unwrap_or_else(|e| panic!("start: {e}"));
    first.close().await;

    let second = tokio::time::timeout(
        Duration::from_millis(500),
        clawrouter::start(config(18424, &upstream.uri())),
    )
    .await
    .unwrap_or_else(|_| panic!("rebind took longer than 500ms"))
    .unwrap_or_else(|e| panic!("rebind failed: {e}"));
    second.close().await;
}
