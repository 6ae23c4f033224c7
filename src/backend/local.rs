//! In-process text-generation pipeline.
//!
//! The generator is loaded once at startup. If the configured model cannot
//! be loaded the baseline model is tried once; if that fails too, startup
//! fails. Generation failures never reach the client as errors: they come
//! back as [`Completion::Degraded`] carrying canned text.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task;
use tracing::{info, warn};

use crate::{
    config::{AppConfig, BackendKind},
    device::DeviceSelection,
    error::ServiceError,
    model_info::ModelInfo,
};

use super::{BackendHealth, Completion, CompletionRequest, InferenceBackend, Task};

pub const FALLBACK_COMPLETION: &str =
    "# Unable to generate a completion right now.\n# Please try again with a shorter input.";
pub const PLACEHOLDER_COMPLETION: &str =
    "# The model returned an incomplete completion.\n# Try rephrasing the prompt or adding context.\npass";

/// Completions shorter than this (after trimming) are replaced by the placeholder.
pub const MIN_COMPLETION_CHARS: usize = 10;

/// A loaded text-generation handle. Calls block the current thread.
pub trait TextGenerator: Send + Sync {
    /// Returns the generated text, which may start with an echo of `input`.
    fn generate(
        &self,
        input: &str,
        max_new_tokens: usize,
        temperature: f64,
    ) -> Result<String, ServiceError>;
}

/// Instantiates generators by model identifier.
pub trait GeneratorLoader {
    fn load(
        &self,
        model_id: &str,
        device: &DeviceSelection,
    ) -> Result<Arc<dyn TextGenerator>, ServiceError>;
}

/// The loader compiled into this binary.
pub fn default_loader(config: &AppConfig) -> Box<dyn GeneratorLoader> {
    #[cfg(feature = "tch-backend")]
    {
        Box::new(super::torch::TorchLoader::new(
            config.model_dir.clone(),
            config.dtype.clone(),
        ))
    }

    #[cfg(not(feature = "tch-backend"))]
    {
        let _ = config;
        Box::new(UnavailableLoader)
    }
}

#[cfg(not(feature = "tch-backend"))]
struct UnavailableLoader;

#[cfg(not(feature = "tch-backend"))]
impl GeneratorLoader for UnavailableLoader {
    fn load(
        &self,
        model_id: &str,
        _device: &DeviceSelection,
    ) -> Result<Arc<dyn TextGenerator>, ServiceError> {
        Err(ServiceError::ModelInit(format!(
            "cannot load '{model_id}': built without the tch-backend feature"
        )))
    }
}

pub struct LocalBackend {
    generator: Arc<dyn TextGenerator>,
    info: ModelInfo,
}

impl LocalBackend {
    pub fn initialize(
        config: &AppConfig,
        loader: &dyn GeneratorLoader,
        device: &DeviceSelection,
    ) -> Result<Self, ServiceError> {
        info!(model = %config.model_id, device = %device.descriptor, "loading local model");

        let (generator, info) = match loader.load(&config.model_id, device) {
            Ok(generator) => {
                let info = ModelInfo::derive(&config.model_id, config, device, BackendKind::Local);
                (generator, info)
            }
            Err(err) => {
                warn!(
                    model = %config.model_id,
                    fallback = %config.fallback_model_id,
                    %err,
                    "model failed to load, trying fallback"
                );
                let generator = loader
                    .load(&config.fallback_model_id, device)
                    .map_err(|fallback_err| {
                        ServiceError::ModelInit(format!(
                            "'{}' failed ({err}); fallback '{}' failed ({fallback_err})",
                            config.model_id, config.fallback_model_id
                        ))
                    })?;
                let info = ModelInfo::derive_with_hint(
                    &config.fallback_model_id,
                    None,
                    config,
                    device,
                    BackendKind::Local,
                )
                .with_fallback_from(config.model_id.as_str());
                (generator, info)
            }
        };

        info!(
            model = %info.model_name,
            size = %info.model_size,
            max_tokens = info.max_tokens,
            "local model ready"
        );

        Ok(Self { generator, info })
    }
}

/// The text handed to the generator.
pub fn build_input(request: &CompletionRequest) -> String {
    match (request.task, request.prompt.as_deref()) {
        (Task::Chat, _) | (_, None) => request.text.clone(),
        (_, Some(prompt)) if request.text.trim().is_empty() => format!("# {prompt}\n"),
        (_, Some(prompt)) => format!("# {prompt}\n{}", request.text),
    }
}

/// Strips the echoed input and rejects near-empty output.
///
/// Tokenizer round trips can alter whitespace in the echo, so when `raw` does
/// not start with `input` verbatim the first `input`-length characters are
/// dropped instead.
pub fn finish_completion(input: &str, raw: &str) -> Completion {
    let remainder = raw
        .strip_prefix(input)
        .unwrap_or_else(|| skip_chars(raw, input.chars().count()))
        .trim();
    if remainder.chars().count() < MIN_COMPLETION_CHARS {
        return Completion::Degraded {
            text: PLACEHOLDER_COMPLETION.to_string(),
            reason: "generated text too short".to_string(),
        };
    }
    Completion::Generated(remainder.to_string())
}

fn skip_chars(text: &str, count: usize) -> &str {
    text.char_indices()
        .nth(count)
        .map_or("", |(offset, _)| &text[offset..])
}

#[async_trait]
impl InferenceBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn model_info(&self) -> &ModelInfo {
        &self.info
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ServiceError> {
        let input = build_input(&request);
        let generator = self.generator.clone();
        let prompt = input.clone();
        let max_new_tokens = request.max_tokens;
        let temperature = request.temperature;

        let outcome = task::spawn_blocking(move || {
            generator.generate(&prompt, max_new_tokens, temperature)
        })
        .await
        .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))
        .and_then(|result| result);

        let completion = match outcome {
            Ok(raw) => finish_completion(&input, &raw),
            Err(err) => {
                warn!(%err, "generation failed, returning fallback completion");
                Completion::Degraded {
                    text: FALLBACK_COMPLETION.to_string(),
                    reason: err.to_string(),
                }
            }
        };
        if let Completion::Degraded { reason, .. } = &completion {
            warn!(reason = %reason, "serving degraded completion");
        }
        Ok(completion)
    }

    async fn health(&self) -> BackendHealth {
        BackendHealth::Healthy
    }

    async fn catalog(&self) -> Result<Vec<serde_json::Value>, ServiceError> {
        Ok(vec![serde_json::json!({
            "id": self.info.model_name,
            "object": "model",
            "owned_by": "local",
        })])
    }
}
