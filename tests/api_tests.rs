//! End-to-end tests of the HTTP surface against mock and local-network backends.

use std::{convert::Infallible, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    routing::{get, post},
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower::ServiceExt;

use code_assistant_service::{
    AppConfig, BackendKind, DeviceSelection, InferenceBackend, LocalBackend, ModelInfo,
    RemoteBackend,
    backend::{
        BackendHealth, Completion, CompletionRequest, GeneratorLoader, TextGenerator,
        local::FALLBACK_COMPLETION,
    },
    build_router,
    error::ServiceError,
};

fn config_with(pairs: &[(&str, &str)]) -> AppConfig {
    let pairs: Vec<(String, String)> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    AppConfig::from_lookup(|key| {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    })
    .unwrap()
}

/// Records every request and answers with a fixed completion.
struct RecordingBackend {
    info: ModelInfo,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl RecordingBackend {
    fn new() -> Arc<Self> {
        let config = config_with(&[]);
        Arc::new(Self {
            info: ModelInfo::derive(
                &config.model_id,
                &config,
                &DeviceSelection::cpu(),
                BackendKind::Remote,
            ),
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl InferenceBackend for RecordingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn model_info(&self) -> &ModelInfo {
        &self.info
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ServiceError> {
        self.calls.lock().push(request);
        Ok(Completion::Generated("fn answer() -> u32 { 42 }".into()))
    }

    async fn health(&self) -> BackendHealth {
        BackendHealth::Healthy
    }

    async fn catalog(&self) -> Result<Vec<Value>, ServiceError> {
        Ok(vec![json!({"id": self.info.model_name})])
    }
}

async fn spawn_upstream(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}/v1/")
}

fn remote_router(llm_url: &str) -> Router {
    remote_router_with(llm_url, &[])
}

fn remote_router_with(llm_url: &str, extra: &[(&str, &str)]) -> Router {
    let mut pairs = vec![("LLM_URL", llm_url)];
    pairs.extend_from_slice(extra);
    let config = Arc::new(config_with(&pairs));
    let backend = RemoteBackend::new(&config, &DeviceSelection::cpu()).unwrap();
    build_router(config, Arc::new(backend))
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, String) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_req(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn sse_payloads(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect()
}

fn upstream_frame(content: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({"choices": [{"index": 0, "delta": {"content": content}}]})
    )
}

#[tokio::test]
async fn empty_message_is_rejected_before_backend() {
    let backend = RecordingBackend::new();
    let router = build_router(Arc::new(config_with(&[])), backend.clone());

    let (status, body) = send(
        router.clone(),
        post_json("/api/chat", json!({"message": "   ", "stream": false})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Message cannot be empty"));

    let (status, _) = send(router.clone(), post_json("/complete", json!({"code": ""}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(router, post_json("/generate", json!({"code": "x = 1"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(backend.calls.lock().is_empty());
}

#[tokio::test]
async fn chat_applies_model_defaults_and_reports_metrics() {
    let backend = RecordingBackend::new();
    let router = build_router(Arc::new(config_with(&[])), backend.clone());

    let (status, body) = send(
        router,
        post_json("/api/chat", json!({"message": "hello", "stream": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["response"], "fn answer() -> u32 { 42 }");
    assert_eq!(value["tokens_generated"], 7);
    assert_eq!(value["degraded"], false);
    assert_eq!(value["model_info"]["model_size"], "small");

    let calls = backend.calls.lock();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].max_tokens, backend.info.max_tokens);
    assert_eq!(calls[0].temperature, 0.7);
}

#[tokio::test]
async fn generate_forwards_prompt_and_overrides() {
    let backend = RecordingBackend::new();
    let router = build_router(Arc::new(config_with(&[])), backend.clone());

    let (status, body) = send(
        router,
        post_json(
            "/generate",
            json!({"prompt": "write fizzbuzz", "max_tokens": 99, "temperature": 0.1}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["completion"], "fn answer() -> u32 { 42 }");

    let calls = backend.calls.lock();
    assert_eq!(calls[0].prompt.as_deref(), Some("write fizzbuzz"));
    assert_eq!(calls[0].max_tokens, 99);
    assert_eq!(calls[0].temperature, 0.1);
}

#[tokio::test]
async fn upstream_error_status_surfaces_as_500() {
    let upstream = Router::new().route(
        "/v1/chat/completions",
        post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "busy") }),
    );
    let url = spawn_upstream(upstream).await;

    let (status, body) = send(
        remote_router(&url),
        post_json("/api/chat", json!({"message": "hi", "stream": false})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["upstream_status"], 503);
    assert!(value["detail"].as_str().unwrap().contains("503"));
}

#[tokio::test]
async fn non_streaming_relay_extracts_message_content() {
    let upstream = Router::new().route(
        "/v1/chat/completions",
        post(|axum::Json(payload): axum::Json<Value>| async move {
            assert_eq!(payload["stream"], false);
            assert_eq!(payload["messages"][1]["content"], "hi");
            axum::Json(json!({
                "choices": [{"message": {"role": "assistant", "content": "hello there"}}]
            }))
        }),
    );
    let url = spawn_upstream(upstream).await;

    let (status, body) = send(
        remote_router(&url),
        post_json("/api/chat", json!({"message": "hi", "stream": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["response"], "hello there");
}

#[tokio::test]
async fn streaming_relay_reframes_upstream_chunks_in_order() {
    let words = ["Rust", " is", " fast", "."];
    let mut upstream_body = String::new();
    upstream_body.push_str(&upstream_frame(words[0]));
    upstream_body.push_str(&upstream_frame(words[1]));
    upstream_body.push_str("data: {broken\n\n");
    upstream_body.push_str(&upstream_frame(words[2]));
    upstream_body.push_str(&upstream_frame(words[3]));
    upstream_body.push_str("data: [DONE]\n\n");
    upstream_body.push_str(&upstream_frame("after done"));

    let upstream = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let body = upstream_body.clone();
            async move { ([(header::CONTENT_TYPE, "text/event-stream")], body) }
        }),
    );
    let url = spawn_upstream(upstream).await;

    let (status, body) = send(remote_router(&url), post_json("/api/chat", json!({"message": "hi"})))
        .await;
    assert_eq!(status, StatusCode::OK);

    let contents: Vec<String> = sse_payloads(&body)
        .into_iter()
        .map(|payload| payload["content"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(contents, words);
}

#[tokio::test]
async fn slow_stream_outlives_request_timeout() {
    const WORDS: [&str; 4] = ["one", " two", " three", " four"];

    let upstream = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            let frames = async_stream::stream! {
                for word in WORDS {
                    tokio::time::sleep(Duration::from_millis(400)).await;
                    yield Ok::<_, Infallible>(upstream_frame(word));
                }
                yield Ok("data: [DONE]\n\n".to_string());
            };
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(frames),
            )
        }),
    );
    let url = spawn_upstream(upstream).await;

    // Four 400 ms gaps add up to more than the one-second request timeout.
    let router = remote_router_with(&url, &[("REQUEST_TIMEOUT_SECS", "1")]);
    let (status, body) = send(router, post_json("/api/chat", json!({"message": "hi"}))).await;
    assert_eq!(status, StatusCode::OK);

    let payloads = sse_payloads(&body);
    assert!(payloads.iter().all(|payload| payload.get("error").is_none()));
    let contents: Vec<&str> = payloads
        .iter()
        .map(|payload| payload["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, WORDS);
}

#[tokio::test]
async fn streaming_upstream_failure_yields_single_error_event() {
    let upstream = Router::new().route(
        "/v1/chat/completions",
        post(|| async { StatusCode::BAD_GATEWAY }),
    );
    let url = spawn_upstream(upstream).await;

    let (status, body) = send(remote_router(&url), post_json("/api/chat", json!({"message": "hi"})))
        .await;
    assert_eq!(status, StatusCode::OK);

    let payloads = sse_payloads(&body);
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0]["error"], "Model runner error: 502");
}

#[tokio::test]
async fn health_reports_unhealthy_when_runner_unreachable() {
    let (status, body) = send(remote_router("http://127.0.0.1:1/v1/"), get_req("/health")).await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["status"], "unhealthy");
    assert_eq!(value["model_runner"], "disconnected");
    assert!(value["error"].is_string());
}

#[tokio::test]
async fn unreachable_runner_fails_non_streaming_chat_with_500() {
    let (status, body) = send(
        remote_router("http://127.0.0.1:1/v1/"),
        post_json("/api/chat", json!({"message": "hi", "stream": false})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert!(
        value["detail"]
            .as_str()
            .unwrap()
            .starts_with("error communicating with model")
    );
    assert!(value.get("upstream_status").is_none());
}

#[tokio::test]
async fn health_and_model_info_track_runner_status() {
    let upstream = Router::new().route(
        "/v1/models",
        get(|| async { axum::Json(json!({"data": [{"id": "ai/smollm2"}, {"id": "ai/qwen2.5"}]})) }),
    );
    let url = spawn_upstream(upstream).await;

    let (_, body) = send(remote_router(&url), get_req("/health")).await;
    let health: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["model_runner"], "connected");

    let (status, body) = send(remote_router(&url), get_req("/api/model-info")).await;
    assert_eq!(status, StatusCode::OK);
    let info: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(info["status"], "connected");
    assert_eq!(info["available_models"].as_array().unwrap().len(), 2);
    assert_eq!(info["current_model"], "ai/smollm2:1.7B-Q8_0");
    assert_eq!(info["display_name"], "smollm2:1.7B");
}

#[tokio::test]
async fn model_info_reports_error_object_when_runner_fails() {
    let upstream = Router::new().route(
        "/v1/models",
        get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
    );
    let url = spawn_upstream(upstream).await;

    let (status, body) = send(remote_router(&url), get_req("/info")).await;
    assert_eq!(status, StatusCode::OK);
    let info: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(info["status"], "disconnected");
    assert!(info["error"].as_str().unwrap().contains("500"));

    let (_, body) = send(remote_router(&url), get_req("/health")).await;
    let health: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["status"], "degraded");
}

struct BrokenGenerator;

impl TextGenerator for BrokenGenerator {
    fn generate(&self, _: &str, _: usize, _: f64) -> Result<String, ServiceError> {
        Err(ServiceError::Inference("device lost".into()))
    }
}

struct BrokenLoader;

impl GeneratorLoader for BrokenLoader {
    fn load(
        &self,
        _model_id: &str,
        _device: &DeviceSelection,
    ) -> Result<Arc<dyn TextGenerator>, ServiceError> {
        Ok(Arc::new(BrokenGenerator))
    }
}

#[tokio::test]
async fn local_generation_failure_returns_fallback_with_200() {
    let config = Arc::new(config_with(&[("BACKEND", "local")]));
    let backend =
        LocalBackend::initialize(&config, &BrokenLoader, &DeviceSelection::cpu()).unwrap();
    let router = build_router(config, Arc::new(backend));

    let (status, body) = send(
        router.clone(),
        post_json("/complete", json!({"code": "def fib(n):"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["completion"], FALLBACK_COMPLETION);
    assert_eq!(value["degraded"], true);
    assert!(value["fallback_reason"].as_str().unwrap().contains("device lost"));
    assert_eq!(value["model_info"]["backend"], "local");

    let (status, body) = send(router, get_req("/")).await;
    assert_eq!(status, StatusCode::OK);
    let root: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(root["model"], "Salesforce/codegen-350M-mono");
}

#[tokio::test]
async fn local_streamed_fallback_is_marked_degraded() {
    let config = Arc::new(config_with(&[("BACKEND", "local")]));
    let backend =
        LocalBackend::initialize(&config, &BrokenLoader, &DeviceSelection::cpu()).unwrap();
    let router = build_router(config, Arc::new(backend));

    let (status, body) = send(router, post_json("/api/chat", json!({"message": "hi"}))).await;
    assert_eq!(status, StatusCode::OK);

    let payloads = sse_payloads(&body);
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0]["content"], FALLBACK_COMPLETION);
    assert_eq!(payloads[0]["degraded"], true);
    assert!(payloads[0]["reason"].as_str().unwrap().contains("device lost"));
}
