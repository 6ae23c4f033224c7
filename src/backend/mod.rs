//! Pluggable inference backends.
//!
//! - [`remote`]: relays to an OpenAI-compatible chat-completions endpoint
//! - [`local`]: runs an in-process text-generation pipeline
//! - [`sse`]: upstream event-stream parsing shared by the relay

pub mod local;
pub mod remote;
pub mod sse;

#[cfg(feature = "tch-backend")]
pub mod torch;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Serialize, Serializer, ser::SerializeMap};

use crate::{config::BackendKind, error::ServiceError, model_info::ModelInfo};

pub use local::{GeneratorLoader, LocalBackend, TextGenerator};
pub use remote::RemoteBackend;

/// Downstream stream of relay events.
pub type EventStream = BoxStream<'static, StreamEvent>;

/// What kind of call produced a [`CompletionRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Chat,
    Complete,
    Generate,
}

/// A validated request with defaults already resolved.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub task: Task,
    pub text: String,
    pub prompt: Option<String>,
    pub max_tokens: usize,
    pub temperature: f64,
}

/// Outcome of a non-streaming call.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Generated(String),
    /// Canned text standing in for a failed or unusable generation.
    Degraded { text: String, reason: String },
}

impl Completion {
    pub fn text(&self) -> &str {
        match self {
            Completion::Generated(text) | Completion::Degraded { text, .. } => text,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Completion::Degraded { .. })
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Completion::Generated(_) => None,
            Completion::Degraded { reason, .. } => Some(reason),
        }
    }
}

/// One SSE frame sent to the client.
///
/// Serialized as `{"content": ...}`, `{"error": ...}`, or for canned text
/// `{"content": ..., "degraded": true, "reason": ...}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Content(String),
    Degraded { content: String, reason: String },
    Error(String),
}

impl From<Completion> for StreamEvent {
    fn from(completion: Completion) -> Self {
        match completion {
            Completion::Generated(text) => StreamEvent::Content(text),
            Completion::Degraded { text, reason } => StreamEvent::Degraded {
                content: text,
                reason,
            },
        }
    }
}

impl Serialize for StreamEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        match self {
            StreamEvent::Content(content) => map.serialize_entry("content", content)?,
            StreamEvent::Degraded { content, reason } => {
                map.serialize_entry("content", content)?;
                map.serialize_entry("degraded", &true)?;
                map.serialize_entry("reason", reason)?;
            }
            StreamEvent::Error(error) => map.serialize_entry("error", error)?,
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendHealth {
    Healthy,
    Degraded { reason: String },
    Unhealthy { error: String },
}

impl BackendHealth {
    pub fn status(&self) -> &'static str {
        match self {
            BackendHealth::Healthy => "healthy",
            BackendHealth::Degraded { .. } => "degraded",
            BackendHealth::Unhealthy { .. } => "unhealthy",
        }
    }
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn model_info(&self) -> &ModelInfo;

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ServiceError>;

    /// Streams the completion. Failures arrive as a final error event.
    async fn stream(&self, request: CompletionRequest) -> EventStream {
        let event = match self.complete(request).await {
            Ok(completion) => StreamEvent::from(completion),
            Err(err) => StreamEvent::Error(err.to_string()),
        };
        stream::once(async move { event }).boxed()
    }

    async fn health(&self) -> BackendHealth;

    /// Models the backend reports as available.
    async fn catalog(&self) -> Result<Vec<serde_json::Value>, ServiceError>;
}
