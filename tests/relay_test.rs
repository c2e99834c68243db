//! Wire-level tests for the relay endpoint.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use common::{API_KEY, FakeUpstream, eventually, relay_url, serve, start_relay};
use promptrelay::Router;
use promptrelay::llm::{ChunkStream, CompletionProvider, CompletionRequest, ProviderError, StreamChunk};
use promptrelay::relay::{RelayHandler, StaticCredential};

async fn post(url: &str, body: impl Into<reqwest::Body>) -> reqwest::Response {
    reqwest::Client::new()
        .post(url)
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap()
}

async fn error_message(response: reqwest::Response) -> String {
    let body: Value = response.json().await.unwrap();
    body["error"].as_str().unwrap().to_owned()
}

#[tokio::test]
async fn relays_deltas_in_order() {
    let upstream = FakeUpstream::start().await;
    let relay = start_relay(&upstream, StaticCredential::new(API_KEY)).await;

    let response = post(&relay_url(relay), json!({ "prompt": "hello" }).to_string()).await;

    assert_eq!(response.status(), 200);
    let headers = response.headers();
    assert_eq!(headers["content-type"], "text/event-stream");
    assert_eq!(headers["cache-control"], "no-cache, no-transform");
    assert_eq!(headers["x-accel-buffering"], "no");
    assert!(headers.contains_key("x-request-id"));

    assert_eq!(response.text().await.unwrap(), "You said: hello");

    let calls = upstream.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].authorization.as_deref(), Some("Bearer test-key"));
    assert_eq!(calls[0].body["model"], "test-model");
    assert_eq!(calls[0].body["stream"], true);
    assert_eq!(calls[0].messages(), [("user".to_owned(), "hello".to_owned())]);
}

#[tokio::test]
async fn previous_response_is_sent_as_assistant_turn() {
    let upstream = FakeUpstream::start().await;
    let relay = start_relay(&upstream, StaticCredential::new(API_KEY)).await;

    let body = json!({ "prompt": "next", "previousC1Response": "earlier answer" });
    let response = post(&relay_url(relay), body.to_string()).await;

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "You said: next");
    assert_eq!(
        upstream.calls()[0].messages(),
        [
            ("assistant".to_owned(), "earlier answer".to_owned()),
            ("user".to_owned(), "next".to_owned()),
        ]
    );
}

#[tokio::test]
async fn invalid_prompts_are_rejected_before_upstream() {
    let upstream = FakeUpstream::start().await;
    let relay = start_relay(&upstream, StaticCredential::new(API_KEY)).await;

    for body in [
        json!({}),
        json!({ "prompt": "" }),
        json!({ "prompt": "   \n\t" }),
        json!({ "prompt": 42 }),
        json!({ "prompt": null }),
    ] {
        let response = post(&relay_url(relay), body.to_string()).await;
        assert_eq!(response.status(), 400, "body {body}");
        assert_eq!(
            error_message(response).await,
            "Prompt is required and must be a non-empty string."
        );
    }

    assert!(upstream.calls().is_empty());
}

#[tokio::test]
async fn oversized_prompt_is_rejected() {
    let upstream = FakeUpstream::start().await;
    let relay = start_relay(&upstream, StaticCredential::new(API_KEY)).await;

    let at_limit = json!({ "prompt": "a".repeat(10_000) });
    let over_limit = json!({ "prompt": "a".repeat(10_001) });

    let response = post(&relay_url(relay), over_limit.to_string()).await;
    assert_eq!(response.status(), 400);
    assert_eq!(
        error_message(response).await,
        "Prompt is too long. Maximum 10,000 characters allowed."
    );
    assert!(upstream.calls().is_empty());

    let response = post(&relay_url(relay), at_limit.to_string()).await;
    assert_eq!(response.status(), 200);
    response.text().await.unwrap();
    assert_eq!(upstream.calls().len(), 1);
}

#[tokio::test]
async fn missing_credential_fails_without_upstream_call() {
    let upstream = FakeUpstream::start().await;
    let relay = start_relay(&upstream, StaticCredential::missing()).await;

    let response = post(&relay_url(relay), json!({ "prompt": "hello" }).to_string()).await;

    assert_eq!(response.status(), 500);
    assert_eq!(
        error_message(response).await,
        "Server is missing the upstream API credential."
    );
    assert!(upstream.calls().is_empty());
}

#[tokio::test]
async fn malformed_body_is_a_server_error() {
    let upstream = FakeUpstream::start().await;
    let relay = start_relay(&upstream, StaticCredential::new(API_KEY)).await;

    let response = post(&relay_url(relay), "{ not json").await;

    assert_eq!(response.status(), 500);
    assert_eq!(error_message(response).await, "Failed to process request");
    assert!(upstream.calls().is_empty());
}

#[tokio::test]
async fn upstream_refusal_is_hidden_from_the_client() {
    let upstream = FakeUpstream::start().await;
    let relay = start_relay(&upstream, StaticCredential::new("wrong-key")).await;

    let response = post(&relay_url(relay), json!({ "prompt": "hello" }).to_string()).await;

    assert_eq!(response.status(), 500);
    let message = error_message(response).await;
    assert_eq!(message, "Failed to process request");
    assert!(!message.contains("invalid api key"));
    assert_eq!(upstream.calls().len(), 1);
}

#[tokio::test]
async fn upstream_failure_mid_stream_truncates_the_body() {
    let upstream = FakeUpstream::start().await;
    let relay = start_relay(&upstream, StaticCredential::new(API_KEY)).await;

    let response = post(&relay_url(relay), json!({ "prompt": "explode" }).to_string()).await;
    assert_eq!(response.status(), 200);

    // The chunked body ends without its terminating chunk.
    assert!(response.bytes().await.is_err());
}

#[tokio::test]
async fn routing_fallbacks() {
    let upstream = FakeUpstream::start().await;
    let relay = start_relay(&upstream, StaticCredential::new(API_KEY)).await;
    let client = reqwest::Client::new();

    let health = client.get(format!("http://{relay}/healthz")).send().await.unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.unwrap(), "ok");

    let wrong_method = client.get(relay_url(relay)).send().await.unwrap();
    assert_eq!(wrong_method.status(), 405);
    assert_eq!(wrong_method.headers()["allow"], "POST");

    let unknown = client.get(format!("http://{relay}/nope")).send().await.unwrap();
    assert_eq!(unknown.status(), 404);
}

#[tokio::test]
async fn request_id_is_echoed() {
    let upstream = FakeUpstream::start().await;
    let relay = start_relay(&upstream, StaticCredential::new(API_KEY)).await;

    let response = reqwest::Client::new()
        .post(relay_url(relay))
        .header("X-Request-Id", "trace-123")
        .body(json!({ "prompt": "" }).to_string())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert_eq!(response.headers()["x-request-id"], "trace-123");
}

/// Sets its flag when dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Sends one delta, then never finishes. The stream owns a [`DropFlag`].
struct StallingProvider {
    dropped: Arc<AtomicBool>,
}

#[async_trait]
impl CompletionProvider for StallingProvider {
    fn name(&self) -> &'static str {
        "stalling"
    }

    async fn stream_chat(&self, _request: CompletionRequest) -> Result<ChunkStream, ProviderError> {
        let flag = DropFlag(Arc::clone(&self.dropped));
        let chunks = stream::iter(vec![Ok(StreamChunk::text_delta("hi"))])
            .chain(stream::pending())
            .map(move |chunk| {
                let _held = &flag;
                chunk
            });
        Ok(chunks.boxed())
    }
}

#[tokio::test]
async fn client_hangup_drops_a_stalled_upstream() {
    let dropped = Arc::new(AtomicBool::new(false));
    let provider = StallingProvider {
        dropped: Arc::clone(&dropped),
    };
    let relay = RelayHandler::new(Arc::new(provider), Arc::new(StaticCredential::new(API_KEY)));
    let mut router = Router::new();
    Arc::new(relay).mount(&mut router, common::RELAY_ROUTE);
    let addr = serve(router).await;

    let body = json!({ "prompt": "hello" }).to_string();
    let mut client = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "POST {} HTTP/1.1\r\nHost: relay\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        common::RELAY_ROUTE,
        body.len()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut received = Vec::new();
    while !String::from_utf8_lossy(&received).contains("2\r\nhi\r\n") {
        let mut chunk = [0u8; 1024];
        let n = client.read(&mut chunk).await.unwrap();
        assert!(n > 0, "relay closed before the first delta");
        received.extend_from_slice(&chunk[..n]);
    }
    assert!(!dropped.load(Ordering::SeqCst));

    drop(client);
    eventually(|| dropped.load(Ordering::SeqCst)).await;
}
