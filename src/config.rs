use std::{
    env,
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use serde::Serialize;

use crate::model_info::ModelSize;

const DEFAULT_LLM_URL: &str = "http://host.docker.internal:12434/engines/llama.cpp/v1/";
const DEFAULT_REMOTE_MODEL: &str = "ai/smollm2:1.7B-Q8_0";
const DEFAULT_LOCAL_SMALL_MODEL: &str = "Salesforce/codegen-350M-mono";
const DEFAULT_LOCAL_LARGE_MODEL: &str = "Salesforce/codegen-2B-mono";
const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful coding assistant. Provide clear, concise answers to programming questions.";

/// Which inference backend serves requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Remote,
    Local,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "remote" | "http" | "openai" => Ok(BackendKind::Remote),
            "local" | "pipeline" => Ok(BackendKind::Local),
            other => anyhow::bail!("unknown backend mode '{other}', expected 'remote' or 'local'"),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Remote => f.write_str("remote"),
            BackendKind::Local => f.write_str("local"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub backend: BackendKind,
    pub llm_url: String,
    pub model_id: String,
    pub api_key: String,
    pub use_gpu: bool,
    pub model_size_hint: Option<ModelSize>,
    pub max_tokens: Option<usize>,
    /// Overrides the per-bucket upstream request timeout.
    pub request_timeout_secs: Option<u64>,
    pub temperature: f64,
    pub dtype: String,
    pub system_prompt: String,
    pub health_timeout: Duration,
    pub model_dir: PathBuf,
    pub fallback_model_id: String,
    pub cors_origins: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = match lookup("BACKEND") {
            Some(raw) => raw.parse()?,
            None => BackendKind::Remote,
        };

        let default_port = match backend {
            BackendKind::Remote => 8080,
            BackendKind::Local => 8000,
        };
        let port = parsed(&lookup, "PORT").unwrap_or(default_port);
        let fallback_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let listen_addr = lookup("SERVER_ADDR")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(fallback_addr);

        let model_size_hint = lookup("MODEL_SIZE").and_then(|raw| match raw.parse::<ModelSize>() {
            Ok(size) => Some(size),
            Err(_) => {
                tracing::warn!(value = %raw, "ignoring unrecognised MODEL_SIZE");
                None
            }
        });

        let model_id = lookup("LLM_MODEL")
            .or_else(|| lookup("MODEL_NAME"))
            .unwrap_or_else(|| match backend {
                BackendKind::Remote => DEFAULT_REMOTE_MODEL.to_string(),
                BackendKind::Local => match model_size_hint {
                    Some(ModelSize::Medium) | Some(ModelSize::Large) => {
                        DEFAULT_LOCAL_LARGE_MODEL.to_string()
                    }
                    _ => DEFAULT_LOCAL_SMALL_MODEL.to_string(),
                },
            });

        let cors_origins = lookup("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000".to_string())
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        Ok(Self {
            listen_addr,
            backend,
            llm_url: lookup("LLM_URL").unwrap_or_else(|| DEFAULT_LLM_URL.to_string()),
            model_id,
            api_key: lookup("API_KEY").unwrap_or_else(|| "dockermodelrunner".to_string()),
            use_gpu: lookup("USE_GPU").map(|raw| parse_flag(&raw)).unwrap_or(false),
            model_size_hint,
            max_tokens: parsed(&lookup, "MAX_TOKENS"),
            request_timeout_secs: parsed(&lookup, "REQUEST_TIMEOUT_SECS").filter(|secs| *secs > 0),
            temperature: parsed(&lookup, "TEMPERATURE").unwrap_or(0.7),
            dtype: lookup("TORCH_DTYPE").unwrap_or_else(|| "float32".to_string()),
            system_prompt: lookup("SYSTEM_PROMPT")
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            health_timeout: parsed(&lookup, "HEALTH_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or_else(|| Duration::from_secs(5)),
            model_dir: PathBuf::from(lookup("MODEL_DIR").unwrap_or_else(|| "models".to_string())),
            fallback_model_id: lookup("FALLBACK_MODEL")
                .unwrap_or_else(|| "distilgpt2".to_string()),
            cors_origins,
        })
    }
}

fn parsed<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key).and_then(|v| v.trim().parse().ok())
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
