use crate::services::{
    metadata_store::MetadataError, object_storage::StorageError, saga::SagaError,
    upload_engine::UploadError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use std::{fmt, io::ErrorKind};

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Extra structured context merged into the response body.
    pub details: Option<Value>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.message,
            "status": self.status.as_u16()
        });
        if let (Some(Value::Object(extra)), Some(obj)) = (self.details, body.as_object_mut()) {
            obj.extend(extra);
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidObjectName(_) => AppError::bad_request(err.to_string()),
            StorageError::ObjectNotFound(_) => AppError::not_found(err.to_string()),
            _ => AppError::new(StatusCode::BAD_GATEWAY, err.to_string()),
        }
    }
}

impl From<MetadataError> for AppError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound(_) => AppError::not_found(err.to_string()),
            MetadataError::Invalid(_) => AppError::bad_request(err.to_string()),
            MetadataError::Sqlx(_) => AppError::internal(err.to_string()),
        }
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::ConfirmationRequired(candidate) => {
                let message = format!(
                    "an unfinished upload of `{}` exists, confirm resume or discard",
                    candidate.fingerprint.name
                );
                AppError::conflict(message).with_details(json!({ "candidate": candidate }))
            }
            UploadError::InvalidInput(_) => AppError::bad_request(err.to_string()),
            UploadError::Cancelled
            | UploadError::ContentMismatch(_)
            | UploadError::InvalidState(_) => AppError::conflict(err.to_string()),
            UploadError::RemoteSessionExpired => AppError::new(StatusCode::GONE, err.to_string()),
            UploadError::SourceRead(ref io) if io.kind() == ErrorKind::NotFound => {
                AppError::not_found(err.to_string())
            }
            UploadError::SourceRead(_) => AppError::internal(err.to_string()),
            UploadError::SessionFailed { .. } => {
                AppError::new(StatusCode::BAD_GATEWAY, err.to_string())
            }
            UploadError::Storage(storage) => storage.into(),
        }
    }
}

impl From<SagaError> for AppError {
    fn from(err: SagaError) -> Self {
        match err {
            SagaError::MetadataRegistration(meta) | SagaError::MetadataUpdate(meta) => meta.into(),
            SagaError::LedgerUnavailable(_) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            SagaError::InvalidRequest(_) => AppError::bad_request(err.to_string()),
            SagaError::InvalidTransition { .. } => AppError::internal(err.to_string()),
            SagaError::CompensationFailure {
                step,
                dataset_id,
                metadata_reverted,
                object_deleted,
                ref reason,
            } => AppError::internal("inconsistent state, contact support").with_details(json!({
                "step": step,
                "datasetId": dataset_id,
                "metadataReverted": metadata_reverted,
                "objectDeleted": object_deleted,
                "reason": reason,
            })),
        }
    }
}
