use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde_json::json;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Deployment not found or inactive: {0}")]
    DeploymentNotFound(String),

    #[error("Model schema not available: {0}")]
    SchemaUnavailable(String),

    #[error("Model version not found: {0}")]
    ModelNotFound(String),

    #[error("Model loading error: {0}")]
    ModelLoad(String),

    #[error("Timed out after {waited_ms}ms waiting for model {key} to load")]
    ModelLoadTimeout { key: String, waited_ms: u64 },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Malformed JSON body: {0}")]
    MalformedJson(String),

    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    #[error("Prediction failed: {0}")]
    Inference(String),

    #[error("Rate limit exceeded ({window}: {limit})")]
    RateLimited {
        window: String,
        limit: u64,
        retry_after_seconds: u64,
    },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Stable machine-readable code, distinct for every failure class the
    /// caller has to tell apart.
    pub fn code(&self) -> &'static str {
        match self {
            Error::DeploymentNotFound(_) => "DEPLOYMENT_NOT_FOUND",
            Error::SchemaUnavailable(_) => "SCHEMA_UNAVAILABLE",
            Error::ModelNotFound(_) => "MODEL_NOT_FOUND",
            Error::ModelLoad(_) => "MODEL_LOAD_FAILED",
            Error::ModelLoadTimeout { .. } => "MODEL_LOAD_TIMEOUT",
            Error::Validation(_) => "VALIDATION_FAILED",
            Error::MalformedJson(_) => "INVALID_JSON",
            Error::InvalidBody(_) => "INVALID_REQUEST_BODY",
            Error::Inference(_) => "PREDICTION_FAILED",
            Error::RateLimited { .. } => "RATE_LIMITED",
            Error::Forbidden(_) => "FORBIDDEN",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::DeploymentNotFound(_) | Error::SchemaUnavailable(_) => StatusCode::NOT_FOUND,
            // The deployment exists but points at a version the store does not know.
            Error::ModelNotFound(_) => StatusCode::NOT_FOUND,
            Error::ModelLoad(_) | Error::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::ModelLoadTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::MalformedJson(_) | Error::InvalidBody(_) | Error::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Config(_) | Error::Internal(_) | Error::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Caller errors are surfaced with full detail and never retried internally.
    pub fn is_caller_error(&self) -> bool {
        self.status().is_client_error()
    }
}

// Body extraction failures keep the JSON error shape of every other failure.
impl From<JsonRejection> for Error {
    fn from(rejection: JsonRejection) -> Self {
        match rejection {
            JsonRejection::JsonSyntaxError(e) => Error::MalformedJson(e.body_text()),
            other => Error::InvalidBody(other.body_text()),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_message = match &self {
            Error::Io(_) => "IO error".to_string(),
            Error::Serialization(_) => "Serialization error".to_string(),
            _ => self.to_string(),
        };

        let body = Json(json!({
            "error": error_message,
            "code": self.code(),
            "status": status.as_u16()
        }));

        let mut response = (status, body).into_response();
        if let Error::RateLimited {
            retry_after_seconds,
            ..
        } = self
        {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after_seconds));
        }
        response
    }
}
