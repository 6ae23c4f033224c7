use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{message}")]
    Upstream { status: u16, message: String },
    #[error("error communicating with model: {0}")]
    Transport(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("model initialization failed: {0}")]
    ModelInit(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("other: {0}")]
    Other(String),
}

impl ServiceError {
    pub fn upstream_status(status: u16) -> Self {
        ServiceError::Upstream {
            status,
            message: format!("Model runner error: {status}"),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::ModelInit(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Upstream { .. }
            | ServiceError::Transport(_)
            | ServiceError::Inference(_)
            | ServiceError::Tokenizer(_)
            | ServiceError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = match &self {
            ServiceError::Upstream { status, message } => serde_json::json!({
                "detail": message,
                "upstream_status": status,
            }),
            other => serde_json::json!({
                "detail": other.to_string(),
            }),
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_failures_map_to_internal_error() {
        let err = ServiceError::upstream_status(503);
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "Model runner error: 503");
    }

    #[test]
    fn validation_maps_to_bad_request() {
        let err = ServiceError::BadRequest("Message cannot be empty".into());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
