//! Shared fixtures: a fake OpenAI-compatible upstream and a relay wired to it,
//! both served by this crate's own server on ephemeral ports.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{StreamExt, stream};
use serde_json::{Value, json};

use promptrelay::client::{ConsumerError, ExchangeObserver};
use promptrelay::context::Context;
use promptrelay::llm::OpenAiCompatibleProvider;
use promptrelay::middleware::LoggerMiddleware;
use promptrelay::relay::{CredentialSource, RelayHandler};
use promptrelay::{Response, Router, Server, StatusCode};

pub const API_KEY: &str = "test-key";
pub const RELAY_ROUTE: &str = "/api/ask";

/// One request the fake upstream received.
#[derive(Debug, Clone)]
pub struct UpstreamCall {
    pub authorization: Option<String>,
    pub body: Value,
}

impl UpstreamCall {
    pub fn messages(&self) -> Vec<(String, String)> {
        self.body["messages"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|m| {
                (
                    m["role"].as_str().unwrap_or_default().to_owned(),
                    m["content"].as_str().unwrap_or_default().to_owned(),
                )
            })
            .collect()
    }
}

/// Fake chat-completions service.
///
/// The reply depends on the last user message:
/// - `stall`: one delta, then nothing until the connection is dropped;
/// - `explode`: one delta, then an inline error event;
/// - anything else: `"You said: "`, an empty delta, then the prompt itself.
///
/// Requests without `Bearer test-key` are refused with a JSON error.
pub struct FakeUpstream {
    pub addr: SocketAddr,
    calls: Arc<Mutex<Vec<UpstreamCall>>>,
}

impl FakeUpstream {
    pub async fn start() -> Self {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut router = Router::new();
        router.post("/v1/chat/completions", {
            let calls = Arc::clone(&calls);
            move |ctx: Context| {
                let calls = Arc::clone(&calls);
                async move { completions(ctx, &calls) }
            }
        });

        let addr = serve(router).await;
        Self { addr, calls }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/v1", self.addr)
    }

    pub fn calls(&self) -> Vec<UpstreamCall> {
        self.calls.lock().unwrap().clone()
    }
}

fn completions(ctx: Context, calls: &Mutex<Vec<UpstreamCall>>) -> Response {
    let authorization = ctx.request().headers().get("Authorization").map(str::to_owned);
    let body: Value = ctx.json().unwrap_or(Value::Null);
    calls.lock().unwrap().push(UpstreamCall {
        authorization: authorization.clone(),
        body: body.clone(),
    });

    if authorization.as_deref() != Some("Bearer test-key") {
        return Response::json(
            StatusCode::BadRequest,
            &json!({ "error": { "message": "invalid api key" } }),
        );
    }

    let prompt = body["messages"]
        .as_array()
        .and_then(|messages| messages.last())
        .and_then(|m| m["content"].as_str())
        .unwrap_or_default()
        .to_owned();

    let sse = Response::new(StatusCode::Ok).header("Content-Type", "text/event-stream");
    match prompt.as_str() {
        "stall" => sse.stream(events(vec![delta("thinking")]).chain(stream::pending())),
        "explode" => sse.stream(events(vec![
            delta("first"),
            json!({ "error": { "message": "model overloaded" } }).to_string(),
        ])),
        _ => sse.stream(events(vec![
            delta("You said: "),
            delta(""),
            delta(&prompt),
            "[DONE]".to_owned(),
        ])),
    }
}

fn delta(text: &str) -> String {
    json!({ "choices": [{ "index": 0, "delta": { "content": text } }] }).to_string()
}

fn events(payloads: Vec<String>) -> impl futures::Stream<Item = io::Result<Bytes>> + Send + 'static {
    stream::iter(
        payloads
            .into_iter()
            .map(|data| Ok(Bytes::from(format!("data: {data}\n\n")))),
    )
}

/// Serves `router` on an ephemeral port.
pub async fn serve(router: Router) -> SocketAddr {
    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    let router = Arc::new(router);
    tokio::spawn(server.run(move |req| {
        let router = Arc::clone(&router);
        async move { router.route(req).await }
    }));
    addr
}

/// Boots a relay in front of `upstream` and returns its address.
pub async fn start_relay(upstream: &FakeUpstream, credentials: impl CredentialSource + 'static) -> SocketAddr {
    let provider = OpenAiCompatibleProvider::new(upstream.base_url(), Duration::from_secs(5)).unwrap();
    let relay = RelayHandler::new(Arc::new(provider), Arc::new(credentials)).with_model("test-model");

    let mut router = Router::new();
    router.layer(LoggerMiddleware);
    router.get("/healthz", |_ctx: Context| async {
        Response::new(StatusCode::Ok).body("ok")
    });
    Arc::new(relay).mount(&mut router, RELAY_ROUTE);

    serve(router).await
}

pub fn relay_url(addr: SocketAddr) -> String {
    format!("http://{addr}{RELAY_ROUTE}")
}

/// Observer that records everything it is told.
#[derive(Default)]
pub struct Recorder {
    updates: Mutex<Vec<String>>,
    loading: Mutex<Vec<bool>>,
    errors: Mutex<Vec<ConsumerError>>,
}

impl Recorder {
    pub fn updates(&self) -> Vec<String> {
        self.updates.lock().unwrap().clone()
    }

    pub fn loading(&self) -> Vec<bool> {
        self.loading.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<ConsumerError> {
        self.errors.lock().unwrap().clone()
    }
}

impl ExchangeObserver for Recorder {
    fn on_response_update(&self, text: &str) {
        self.updates.lock().unwrap().push(text.to_owned());
    }

    fn on_loading_change(&self, loading: bool) {
        self.loading.lock().unwrap().push(loading);
    }

    fn on_error(&self, error: &ConsumerError) {
        self.errors.lock().unwrap().push(error.clone());
    }
}

/// Polls `ready` until it holds, failing the test after a few seconds.
pub async fn eventually(mut ready: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !ready() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
