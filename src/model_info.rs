//! Model classification and the derived [`ModelInfo`] snapshot.
//!
//! Everything here is a pure function of the model identifier and the
//! process configuration, so the snapshot is computed once at startup.

use std::{fmt, str::FromStr};

use serde::Serialize;

use crate::{
    config::{AppConfig, BackendKind},
    device::DeviceSelection,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    Small,
    Medium,
    Large,
    Unknown,
}

impl FromStr for ModelSize {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            other => Err(format!("unknown model size '{other}'")),
        }
    }
}

impl fmt::Display for ModelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
            ModelSize::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

impl ModelSize {
    /// Default completion budget for the bucket.
    pub fn max_tokens(self) -> usize {
        match self {
            ModelSize::Small => 512,
            ModelSize::Medium => 1024,
            ModelSize::Large => 2048,
            ModelSize::Unknown => 256,
        }
    }

    /// Upstream request timeout for the bucket, in seconds.
    pub fn timeout_secs(self) -> u64 {
        match self {
            ModelSize::Small => 30,
            ModelSize::Medium => 60,
            ModelSize::Large => 120,
            ModelSize::Unknown => 30,
        }
    }
}

// Parameter-count ceilings, in billions, for the small and medium buckets.
const SMALL_MAX_BILLIONS: f64 = 4.0;
const MEDIUM_MAX_BILLIONS: f64 = 10.0;

const NAME_PREFIXES: &[&str] = &[
    "hf.co/",
    "huggingface.co/",
    "docker.io/",
    "ai/",
    "models/",
];

const NAME_SUFFIXES: &[&str] = &[
    ":latest",
    "-gguf",
    "-q8_0",
    "-q6_k",
    "-q5_k_m",
    "-q4_k_m",
    "-q4_0",
    "-f16",
    "-fp16",
];

/// Bucket a model identifier by the parameter count embedded in its name.
pub fn classify(model_id: &str) -> ModelSize {
    match parameter_count(model_id) {
        Some(billions) if billions < SMALL_MAX_BILLIONS => ModelSize::Small,
        Some(billions) if billions < MEDIUM_MAX_BILLIONS => ModelSize::Medium,
        Some(_) => ModelSize::Large,
        None => ModelSize::Unknown,
    }
}

/// Largest `<number>b` or `<number>m` size tag in the identifier, in billions.
///
/// A tag must start at a number boundary and end at a word boundary, so
/// `405b` is never read as `5b` and `7bit` is not a size at all.
pub fn parameter_count(model_id: &str) -> Option<f64> {
    let lower = model_id.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let mut largest: Option<f64> = None;
    let mut i = 0;

    while i < bytes.len() {
        let at_boundary = i == 0 || !(bytes[i - 1].is_ascii_digit() || bytes[i - 1] == b'.');
        if !(bytes[i].is_ascii_digit() && at_boundary) {
            i += 1;
            continue;
        }

        let start = i;
        while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
            i += 1;
        }
        let per_billion = match bytes.get(i) {
            Some(b'b') => 1.0,
            Some(b'm') => 1000.0,
            _ => continue,
        };
        if bytes.get(i + 1).is_some_and(|next| next.is_ascii_alphanumeric()) {
            continue;
        }
        if let Ok(value) = lower[start..i].parse::<f64>() {
            let billions = value / per_billion;
            largest = Some(largest.map_or(billions, |seen| seen.max(billions)));
        }
    }

    largest
}

/// Human-facing name: registry prefixes, organisation and quantisation tags removed.
pub fn display_name(model_id: &str) -> String {
    let mut name = model_id.trim();

    for prefix in NAME_PREFIXES {
        if let Some(rest) = strip_prefix_ignore_case(name, prefix) {
            name = rest;
        }
    }
    if let Some((_, last)) = name.rsplit_once('/') {
        name = last;
    }

    loop {
        let before = name.len();
        for suffix in NAME_SUFFIXES {
            if let Some(rest) = strip_suffix_ignore_case(name, suffix) {
                name = rest;
            }
        }
        if name.len() == before {
            break;
        }
    }

    if name.is_empty() {
        model_id.to_string()
    } else {
        name.to_string()
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &value[prefix.len()..])
}

fn strip_suffix_ignore_case<'a>(value: &'a str, suffix: &str) -> Option<&'a str> {
    let split = value.len().checked_sub(suffix.len())?;
    let tail = value.get(split..)?;
    tail.eq_ignore_ascii_case(suffix).then(|| &value[..split])
}

/// Per-model defaults derived from the identifier alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelProfile {
    pub size: ModelSize,
    pub max_tokens: usize,
    pub timeout_secs: u64,
    pub display_name: String,
}

impl ModelProfile {
    pub fn for_model(model_id: &str, hint: Option<ModelSize>) -> Self {
        let size = hint.unwrap_or_else(|| classify(model_id));
        Self {
            size,
            max_tokens: size.max_tokens(),
            timeout_secs: size.timeout_secs(),
            display_name: display_name(model_id),
        }
    }
}

/// Snapshot of the active model reported by the info and health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model_name: String,
    pub display_name: String,
    pub model_size: ModelSize,
    pub max_tokens: usize,
    pub timeout_secs: u64,
    pub backend: BackendKind,
    pub device: String,
    pub gpu_enabled: bool,
    pub gpu_available: bool,
    pub cuda_available: bool,
    pub gpu_count: usize,
    pub gpu_name: Option<String>,
    pub dtype: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_from: Option<String>,
}

impl ModelInfo {
    pub fn derive(
        model_id: &str,
        config: &AppConfig,
        device: &DeviceSelection,
        backend: BackendKind,
    ) -> Self {
        Self::derive_with_hint(model_id, config.model_size_hint, config, device, backend)
    }

    /// Like [`ModelInfo::derive`], with the size hint given explicitly.
    ///
    /// A substituted fallback model passes `None`: `MODEL_SIZE` describes the
    /// requested model, not the stand-in.
    pub fn derive_with_hint(
        model_id: &str,
        hint: Option<ModelSize>,
        config: &AppConfig,
        device: &DeviceSelection,
        backend: BackendKind,
    ) -> Self {
        let profile = ModelProfile::for_model(model_id, hint);
        Self {
            model_name: model_id.to_string(),
            display_name: profile.display_name,
            model_size: profile.size,
            max_tokens: config.max_tokens.unwrap_or(profile.max_tokens),
            timeout_secs: config.request_timeout_secs.unwrap_or(profile.timeout_secs),
            backend,
            device: device.descriptor.clone(),
            gpu_enabled: device.gpu_enabled,
            gpu_available: device.gpu_available,
            cuda_available: device.gpu_available,
            gpu_count: device.gpu_count,
            gpu_name: device.gpu_name.clone(),
            dtype: config.dtype.clone(),
            fallback_from: None,
        }
    }

    /// Records that `requested` could not be loaded and this model stands in for it.
    pub fn with_fallback_from(mut self, requested: impl Into<String>) -> Self {
        self.fallback_from = Some(requested.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_deterministic() {
        for id in [
            "ai/smollm2:1.7B-Q8_0",
            "ai/qwen2.5:7B-Q4_K_M",
            "deepseek-coder:33b",
            "mystery-model",
        ] {
            let first = ModelProfile::for_model(id, None);
            for _ in 0..5 {
                assert_eq!(ModelProfile::for_model(id, None), first);
            }
        }
    }

    #[test]
    fn buckets_by_size_keyword() {
        assert_eq!(classify("llama3.2:1b"), ModelSize::Small);
        assert_eq!(classify("ai/smollm2:1.7B-Q8_0"), ModelSize::Small);
        assert_eq!(classify("Salesforce/codegen-350M-mono"), ModelSize::Small);
        assert_eq!(classify("ai/qwen2.5:7B-Q4_K_M"), ModelSize::Medium);
        assert_eq!(classify("qwen2.5-coder:14b"), ModelSize::Large);
        assert_eq!(classify("qwen3:30B"), ModelSize::Large);
        assert_eq!(classify("codellama-13b"), ModelSize::Large);
        assert_eq!(classify("gemma2:9b"), ModelSize::Medium);
        assert_eq!(classify("mixtral:8x7b"), ModelSize::Medium);
        assert_eq!(classify("qwen2.5:72b"), ModelSize::Large);
        assert_eq!(classify("llama:65b"), ModelSize::Large);
        assert_eq!(classify("llama3.1:405b"), ModelSize::Large);
        assert_eq!(classify("deepseek-r1:671b"), ModelSize::Large);
        assert_eq!(classify("distilgpt2"), ModelSize::Unknown);
    }

    #[test]
    fn size_tags_need_boundaries() {
        assert_eq!(parameter_count("llama3.1:405b"), Some(405.0));
        assert_eq!(parameter_count("qwen3:30b-a3b"), Some(30.0));
        assert_eq!(parameter_count("codegen-350M-mono"), Some(0.35));
        assert_eq!(parameter_count("mistral-7bit"), None);
        assert_eq!(parameter_count("phi3:mini"), None);
    }

    #[test]
    fn unknown_bucket_is_conservative() {
        let profile = ModelProfile::for_model("distilgpt2", None);
        assert_eq!(profile.size, ModelSize::Unknown);
        assert!(profile.max_tokens <= ModelSize::Small.max_tokens());
        assert_eq!(profile.timeout_secs, 30);
    }

    #[test]
    fn hint_overrides_keyword_match() {
        let profile = ModelProfile::for_model("Salesforce/codegen-2B-mono", Some(ModelSize::Large));
        assert_eq!(profile.size, ModelSize::Large);
        assert_eq!(profile.max_tokens, 2048);
    }

    #[test]
    fn display_name_strips_registry_and_quantisation() {
        assert_eq!(display_name("ai/smollm2:1.7B-Q8_0"), "smollm2:1.7B");
        assert_eq!(display_name("hf.co/bartowski/Qwen2.5-7B-GGUF"), "Qwen2.5-7B");
        assert_eq!(display_name("Salesforce/codegen-350M-mono"), "codegen-350M-mono");
        assert_eq!(display_name("llama3:latest"), "llama3");
        assert_eq!(display_name("ai/"), "ai/");
    }

    #[test]
    fn derive_applies_configured_max_tokens() {
        let mut config = AppConfig::from_lookup(|_| None).unwrap();
        config.max_tokens = Some(77);
        let info = ModelInfo::derive(
            "ai/qwen2.5:7B-Q4_K_M",
            &config,
            &DeviceSelection::cpu(),
            BackendKind::Remote,
        );
        assert_eq!(info.max_tokens, 77);
        assert_eq!(info.model_size, ModelSize::Medium);
        assert_eq!(info.timeout_secs, 60);
        assert_eq!(info.device, "cpu");
        assert!(info.fallback_from.is_none());
    }

    #[test]
    fn request_timeout_override_replaces_bucket_timeout() {
        let mut config = AppConfig::from_lookup(|_| None).unwrap();
        config.request_timeout_secs = Some(3);
        let info = ModelInfo::derive(
            "qwen2.5:72b",
            &config,
            &DeviceSelection::cpu(),
            BackendKind::Remote,
        );
        assert_eq!(info.model_size, ModelSize::Large);
        assert_eq!(info.timeout_secs, 3);
    }

    #[test]
    fn explicit_hint_ignores_configured_size() {
        let mut config = AppConfig::from_lookup(|_| None).unwrap();
        config.model_size_hint = Some(ModelSize::Large);
        let info = ModelInfo::derive_with_hint(
            "distilgpt2",
            None,
            &config,
            &DeviceSelection::cpu(),
            BackendKind::Local,
        );
        assert_eq!(info.model_size, ModelSize::Unknown);
        assert_eq!(info.max_tokens, 256);
    }
}
