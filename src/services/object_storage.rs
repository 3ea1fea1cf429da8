//! Object-storage collaborator: multipart-upload primitives plus object deletion.

use crate::models::session::AckedPart;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{self, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Timeout, connection reset and the like. Safe to retry.
    #[error("transient transfer failure: {0}")]
    Transient(String),
    /// The remote multipart session no longer exists.
    #[error("multipart session `{0}` is no longer valid")]
    SessionExpired(String),
    #[error("part {part_number} rejected: {reason}")]
    PartRejected { part_number: u32, reason: String },
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("invalid object name `{0}`")]
    InvalidObjectName(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Whether the failure is worth another attempt with the same inputs.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Transient(_) => true,
            StorageError::Io(err) => matches!(
                err.kind(),
                ErrorKind::TimedOut
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::Interrupted
                    | ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Result of initiating a multipart upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartInit {
    pub object_name: String,
    pub remote_session_id: String,
}

/// Multipart-upload primitives exposed by the object store.
///
/// `upload_part` is idempotent per part number: re-sending the same part
/// overwrites the previous copy.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn initiate_multipart_upload(&self, file_name: &str) -> StorageResult<MultipartInit>;

    /// Upload one part and return its acknowledgement token.
    async fn upload_part(
        &self,
        remote_session_id: &str,
        part_number: u32,
        bytes: Bytes,
    ) -> StorageResult<String>;

    async fn complete_multipart_upload(
        &self,
        remote_session_id: &str,
        parts: &[AckedPart],
    ) -> StorageResult<()>;

    /// Release server-side storage held by unacked parts.
    async fn abort_multipart_upload(&self, remote_session_id: &str) -> StorageResult<()>;

    async fn delete_object(&self, object_name: &str) -> StorageResult<()>;
}
