//! Relay to an OpenAI-compatible chat-completions endpoint.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    config::{AppConfig, BackendKind},
    device::DeviceSelection,
    error::ServiceError,
    model_info::ModelInfo,
};

use super::{
    BackendHealth, Completion, CompletionRequest, EventStream, InferenceBackend, StreamEvent,
    Task, sse,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct ChatCompletionPayload<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    max_tokens: usize,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ResponseChoice>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelListResponse {
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

pub struct RemoteBackend {
    client: reqwest::Client,
    base_url: String,
    model_id: String,
    api_key: String,
    system_prompt: String,
    health_timeout: Duration,
    request_timeout: Duration,
    info: ModelInfo,
}

impl RemoteBackend {
    pub fn new(config: &AppConfig, device: &DeviceSelection) -> Result<Self, ServiceError> {
        let info = ModelInfo::derive(&config.model_id, config, device, BackendKind::Remote);
        let request_timeout = Duration::from_secs(info.timeout_secs);
        // Streams may run past the request timeout, so the client only bounds
        // connecting and each read; `complete` adds the total deadline.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(request_timeout)
            .build()
            .map_err(|err| ServiceError::Other(format!("failed to build http client: {err}")))?;

        info!(
            url = %config.llm_url,
            model = %config.model_id,
            size = %info.model_size,
            timeout_secs = info.timeout_secs,
            "remote inference backend configured"
        );

        Ok(Self {
            client,
            base_url: config.llm_url.trim_end_matches('/').to_string(),
            model_id: config.model_id.clone(),
            api_key: config.api_key.clone(),
            system_prompt: config.system_prompt.clone(),
            health_timeout: config.health_timeout,
            request_timeout,
            info,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.base_url)
    }

    fn post_completion(&self, request: &CompletionRequest, stream: bool) -> reqwest::RequestBuilder {
        let user_message = user_message(request);
        let payload = ChatCompletionPayload {
            model: &self.model_id,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &self.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &user_message,
                },
            ],
            stream,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        self.client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&payload)
    }

    async fn list_models(&self) -> Result<reqwest::Response, ServiceError> {
        let response = self
            .client
            .get(self.models_url())
            .bearer_auth(&self.api_key)
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(|err| ServiceError::Transport(err.to_string()))?;
        Ok(response)
    }
}

/// The user turn sent upstream for each kind of call.
fn user_message(request: &CompletionRequest) -> String {
    match (request.task, request.prompt.as_deref()) {
        (Task::Chat, _) => request.text.clone(),
        (Task::Complete, None) => format!(
            "Complete the following code. Reply with the completion only.\n\n{}",
            request.text
        ),
        (Task::Complete, Some(prompt)) | (Task::Generate, Some(prompt)) => {
            if request.text.trim().is_empty() {
                prompt.to_string()
            } else {
                format!("{prompt}\n\n{}", request.text)
            }
        }
        (Task::Generate, None) => request.text.clone(),
    }
}

#[async_trait]
impl InferenceBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn model_info(&self) -> &ModelInfo {
        &self.info
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ServiceError> {
        let response = self
            .post_completion(&request, false)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|err| ServiceError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %body, "model runner rejected completion");
            return Err(ServiceError::upstream_status(status.as_u16()));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| ServiceError::Transport(format!("invalid completion body: {err}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .map(Completion::Generated)
            .ok_or_else(|| ServiceError::Inference("completion response had no content".into()))
    }

    async fn stream(&self, request: CompletionRequest) -> EventStream {
        let response = match self.post_completion(&request, true).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(%err, "model runner unreachable for streaming");
                let event = StreamEvent::Error(format!("Streaming error: {err}"));
                return stream::once(async move { event }).boxed();
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "model runner rejected streaming request");
            let event = StreamEvent::Error(format!("Model runner error: {}", status.as_u16()));
            return stream::once(async move { event }).boxed();
        }

        debug!(model = %self.model_id, "relaying upstream stream");
        sse::relay(response.bytes_stream()).boxed()
    }

    async fn health(&self) -> BackendHealth {
        match self.list_models().await {
            Ok(response) if response.status().is_success() => BackendHealth::Healthy,
            Ok(response) => {
                let status = response.status().as_u16();
                warn!(status, "model runner health probe returned non-success");
                BackendHealth::Degraded {
                    reason: format!("model runner returned {status}"),
                }
            }
            Err(err) => {
                warn!(%err, "model runner health probe failed");
                BackendHealth::Unhealthy {
                    error: err.to_string(),
                }
            }
        }
    }

    async fn catalog(&self) -> Result<Vec<serde_json::Value>, ServiceError> {
        let response = self.list_models().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::upstream_status(status.as_u16()));
        }
        let models: ModelListResponse = response
            .json()
            .await
            .map_err(|err| ServiceError::Transport(format!("invalid model list: {err}")))?;
        Ok(models.data)
    }
}
