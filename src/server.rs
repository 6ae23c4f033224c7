use std::{convert::Infallible, sync::Arc, time::Instant};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderValue, header},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use futures::StreamExt;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    backend::{BackendHealth, Completion, CompletionRequest, InferenceBackend, StreamEvent, Task},
    config::{AppConfig, BackendKind},
    error::ServiceError,
    types::{
        ChatRequest, ChatResponse, CodeRequest, CodeResponse, HealthResponse, ModelInfoResponse,
        RootResponse, estimate_tokens, tokens_per_second,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub backend: Arc<dyn InferenceBackend>,
}

pub fn build_router(config: Arc<AppConfig>, backend: Arc<dyn InferenceBackend>) -> Router {
    let cors = cors_layer(&config.cors_origins);
    let state = AppState { config, backend };

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/model-info", get(model_info))
        .route("/info", get(model_info))
        .route("/api/chat", post(chat))
        .route("/complete", post(complete_code))
        .route("/generate", post(generate_code))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|origin| origin == "*") {
        AllowOrigin::from(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        AllowOrigin::list(parsed)
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn root(State(state): State<AppState>) -> Json<RootResponse> {
    let info = state.backend.model_info().clone();
    Json(RootResponse {
        message: format!("Code assistant with {} is running!", info.display_name),
        model: info.model_name.clone(),
        backend: state.backend.kind(),
        model_info: info,
    })
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let health = state.backend.health().await;
    let info = state.backend.model_info();
    let kind = state.backend.kind();

    let model_runner = match (kind, &health) {
        (BackendKind::Local, _) => None,
        (BackendKind::Remote, BackendHealth::Healthy) => Some("connected"),
        (BackendKind::Remote, _) => Some("disconnected"),
    };
    let error = match &health {
        BackendHealth::Healthy => None,
        BackendHealth::Degraded { reason } => Some(reason.clone()),
        BackendHealth::Unhealthy { error } => Some(error.clone()),
    };

    Json(HealthResponse {
        status: health.status(),
        backend: kind,
        model: info.model_name.clone(),
        model_loaded: true,
        model_size: info.model_size,
        device: info.device.clone(),
        gpu_enabled: info.gpu_enabled,
        gpu_available: info.gpu_available,
        model_runner,
        error,
    })
}

async fn model_info(State(state): State<AppState>) -> Json<ModelInfoResponse> {
    let info = state.backend.model_info().clone();
    let current_model = info.model_name.clone();

    let response = match state.backend.catalog().await {
        Ok(models) => ModelInfoResponse {
            model_info: info,
            current_model,
            status: "connected",
            available_models: Some(models),
            error: None,
        },
        Err(err) => {
            let status = match err {
                ServiceError::Upstream { .. } => "disconnected",
                _ => "error",
            };
            ModelInfoResponse {
                model_info: info,
                current_model,
                status,
                available_models: None,
                error: Some(err.to_string()),
            }
        }
    };
    Json(response)
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ServiceError> {
    if request.message.trim().is_empty() {
        return Err(ServiceError::BadRequest("Message cannot be empty".into()));
    }

    let completion_request =
        resolve(&state, Task::Chat, request.message, None, request.max_tokens, request.temperature);

    if request.stream {
        return Ok(stream_response(&state, completion_request).await);
    }

    let (completion, elapsed) = timed_completion(&state, completion_request).await?;
    let tokens_generated = estimate_tokens(completion.text());
    Ok(Json(ChatResponse {
        response: completion.text().to_string(),
        model_info: state.backend.model_info().clone(),
        response_time: elapsed,
        tokens_generated,
        tokens_per_second: tokens_per_second(tokens_generated, elapsed),
        degraded: completion.is_degraded(),
        fallback_reason: completion.fallback_reason().map(str::to_string),
    })
    .into_response())
}

async fn complete_code(
    State(state): State<AppState>,
    Json(request): Json<CodeRequest>,
) -> Result<Response, ServiceError> {
    if request.code.trim().is_empty() {
        return Err(ServiceError::BadRequest("Code cannot be empty".into()));
    }
    code_call(state, Task::Complete, request).await
}

async fn generate_code(
    State(state): State<AppState>,
    Json(request): Json<CodeRequest>,
) -> Result<Response, ServiceError> {
    let has_prompt = request
        .prompt
        .as_deref()
        .is_some_and(|prompt| !prompt.trim().is_empty());
    if !has_prompt {
        return Err(ServiceError::BadRequest("Prompt cannot be empty".into()));
    }
    code_call(state, Task::Generate, request).await
}

async fn code_call(
    state: AppState,
    task: Task,
    request: CodeRequest,
) -> Result<Response, ServiceError> {
    let stream = request.stream;
    let prompt = request.prompt.filter(|prompt| !prompt.trim().is_empty());
    let completion_request = resolve(
        &state,
        task,
        request.code,
        prompt,
        request.max_tokens,
        request.temperature,
    );

    if stream {
        return Ok(stream_response(&state, completion_request).await);
    }

    let (completion, elapsed) = timed_completion(&state, completion_request).await?;
    let tokens_generated = estimate_tokens(completion.text());
    Ok(Json(CodeResponse {
        completion: completion.text().to_string(),
        model_info: state.backend.model_info().clone(),
        response_time: elapsed,
        tokens_generated,
        tokens_per_second: tokens_per_second(tokens_generated, elapsed),
        degraded: completion.is_degraded(),
        fallback_reason: completion.fallback_reason().map(str::to_string),
    })
    .into_response())
}

fn resolve(
    state: &AppState,
    task: Task,
    text: String,
    prompt: Option<String>,
    max_tokens: Option<usize>,
    temperature: Option<f64>,
) -> CompletionRequest {
    CompletionRequest {
        task,
        text,
        prompt,
        max_tokens: max_tokens.unwrap_or(state.backend.model_info().max_tokens),
        temperature: temperature.unwrap_or(state.config.temperature),
    }
}

async fn timed_completion(
    state: &AppState,
    request: CompletionRequest,
) -> Result<(Completion, f64), ServiceError> {
    let start = Instant::now();
    let task = request.task;
    let completion = state.backend.complete(request).await?;
    let elapsed = start.elapsed().as_secs_f64();
    info!(
        ?task,
        elapsed_secs = elapsed,
        degraded = completion.is_degraded(),
        "completion served"
    );
    Ok((completion, elapsed))
}

async fn stream_response(state: &AppState, request: CompletionRequest) -> Response {
    info!(task = ?request.task, "streaming completion");
    let events = state
        .backend
        .stream(request)
        .await
        .map(|event| Ok::<Event, Infallible>(to_sse(&event)));

    (
        [(header::CACHE_CONTROL, "no-cache")],
        Sse::new(events),
    )
        .into_response()
}

fn to_sse(event: &StreamEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(data) => Event::default().data(data),
        Err(err) => Event::default().data(
            serde_json::json!({ "error": format!("failed to encode event: {err}") }).to_string(),
        ),
    }
}
