//! HTTP-facing errors for the trust registry.

use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::config::ConfigError;
use crate::server::{PublishError, ValidationError};
use crate::storage::StorageError;

/// Errors returned by handlers.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<MultipartError> for ServerError {
    fn from(e: MultipartError) -> Self {
        ServerError::BadRequest(format!("malformed multipart body: {e}"))
    }
}

fn storage_status(e: &StorageError) -> (StatusCode, &'static str) {
    match e {
        StorageError::NotFound(_) => (StatusCode::NOT_FOUND, "METADATA_NOT_FOUND"),
        StorageError::OldVersion(_) => (StatusCode::CONFLICT, "OLD_VERSION"),
        StorageError::BadQuery(_) => (StatusCode::BAD_REQUEST, "INVALID_QUERY"),
        StorageError::Database(_) | StorageError::Corrupt(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE"),
    }
}

impl ServerError {
    fn status(&self) -> (StatusCode, &'static str, Value) {
        match self {
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", Value::Null),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", Value::Null),
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", Value::Null),
            ServerError::Publish(e) => match e {
                PublishError::Invalid(detail) => {
                    let (status, code) = match detail {
                        ValidationError::OldVersion { .. } => (StatusCode::CONFLICT, "OLD_VERSION"),
                        _ => (StatusCode::BAD_REQUEST, "INVALID_UPDATE"),
                    };
                    (status, code, serde_json::to_value(detail).unwrap_or(Value::Null))
                }
                PublishError::NoKey { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "NO_KEY", Value::Null),
                PublishError::NoCryptoService => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "NO_CRYPTO_SERVICE", Value::Null)
                }
                PublishError::InvalidRole(_) => (StatusCode::BAD_REQUEST, "INVALID_ROLE", Value::Null),
                PublishError::NoFilename => (StatusCode::BAD_REQUEST, "NO_FILENAME", Value::Null),
                PublishError::MalformedUpload(_) => (StatusCode::BAD_REQUEST, "MALFORMED_UPLOAD", Value::Null),
                PublishError::TooLarge { .. } => (StatusCode::BAD_REQUEST, "TOO_LARGE", Value::Null),
                PublishError::Crypto(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CRYPTO", Value::Null),
                PublishError::Tuf(_) => (StatusCode::INTERNAL_SERVER_ERROR, "TUF", Value::Null),
                PublishError::Storage(e) => {
                    let (status, code) = storage_status(e);
                    (status, code, Value::Null)
                }
            },
            ServerError::Storage(e) => {
                let (status, code) = storage_status(e);
                (status, code, Value::Null)
            }
            ServerError::Config(e) => match e {
                ConfigError::UnknownItem(_) => (StatusCode::BAD_REQUEST, "UNKNOWN_ITEM", Value::Null),
                ConfigError::Validation { name, .. } => {
                    (StatusCode::BAD_REQUEST, "CONFIG_VALIDATION", json!({ "name": name }))
                }
                ConfigError::NotEditable(name) => (StatusCode::BAD_REQUEST, "NOT_EDITABLE", json!({ "name": name })),
                ConfigError::Rule { rule, .. } => (StatusCode::BAD_REQUEST, "CONFIG_RULE", json!({ "rule": rule })),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG", Value::Null),
            },
            ServerError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", Value::Null),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, code, detail) = self.status();
        if status.is_server_error() {
            tracing::error!("{code}: {self}");
        } else {
            tracing::debug!("{code}: {self}");
        }
        (
            status,
            Json(json!({ "error": self.to_string(), "code": code, "detail": detail })),
        )
            .into_response()
    }
}
