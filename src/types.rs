use serde::{Deserialize, Serialize};

use crate::{config::BackendKind, model_info::ModelInfo};

fn default_stream() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default = "default_stream")]
    pub stream: bool,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct CodeRequest {
    #[serde(default)]
    pub code: String,
    pub prompt: Option<String>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f64>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub model_info: ModelInfo,
    pub response_time: f64,
    pub tokens_generated: usize,
    pub tokens_per_second: f64,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CodeResponse {
    pub completion: String,
    pub model_info: ModelInfo,
    pub response_time: f64,
    pub tokens_generated: usize,
    pub tokens_per_second: f64,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RootResponse {
    pub message: String,
    pub model: String,
    pub backend: BackendKind,
    pub model_info: ModelInfo,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub backend: BackendKind,
    pub model: String,
    pub model_loaded: bool,
    pub model_size: crate::model_info::ModelSize,
    pub device: String,
    pub gpu_enabled: bool,
    pub gpu_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_runner: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ModelInfoResponse {
    #[serde(flatten)]
    pub model_info: ModelInfo,
    pub current_model: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_models: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Whitespace-separated word count, the service's token estimate.
pub fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

pub fn tokens_per_second(tokens: usize, seconds: f64) -> f64 {
    if seconds > 0.0 {
        tokens as f64 / seconds
    } else {
        tokens as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_streams_by_default() {
        let request: ChatRequest = serde_json::from_str(r#"{"message": "hi"}"#).unwrap();
        assert!(request.stream);
        assert!(request.max_tokens.is_none());
    }

    #[test]
    fn code_request_tolerates_missing_code_and_extra_fields() {
        let request: CodeRequest =
            serde_json::from_str(r#"{"prompt": "fizzbuzz", "model_size": "large"}"#).unwrap();
        assert!(request.code.is_empty());
        assert!(!request.stream);
    }

    #[test]
    fn token_estimate_counts_words() {
        assert_eq!(estimate_tokens("  fn main() {\n    println!(); }"), 5);
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(tokens_per_second(10, 2.0), 5.0);
        assert_eq!(tokens_per_second(3, 0.0), 3.0);
    }
}
