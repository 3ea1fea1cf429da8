//! Errors shared by the publish and removal sagas.

use crate::services::{ledger::LedgerError, metadata_store::MetadataError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SagaError {
    /// Registering metadata failed before any side effect needed undoing.
    #[error("failed to register dataset metadata: {0}")]
    MetadataRegistration(#[source] MetadataError),
    #[error("failed to update dataset metadata: {0}")]
    MetadataUpdate(#[source] MetadataError),
    /// A paid dataset needs the ledger, and there is none to talk to.
    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("saga cannot move from {from} on {event}")]
    InvalidTransition { from: String, event: String },
    /// A compensating action failed. Stores disagree and an operator has to
    /// reconcile them by hand.
    #[error(
        "inconsistent state after failed {step} of dataset {dataset_id}: {reason} \
         (metadata reverted: {metadata_reverted}, object deleted: {object_deleted})"
    )]
    CompensationFailure {
        step: &'static str,
        dataset_id: i64,
        metadata_reverted: bool,
        object_deleted: bool,
        reason: String,
    },
}

pub type SagaResult<T> = Result<T, SagaError>;

impl SagaError {
    pub fn is_compensation_failure(&self) -> bool {
        matches!(self, SagaError::CompensationFailure { .. })
    }
}

/// Human-readable reason for a failed ledger step.
pub(crate) fn ledger_reason(err: &LedgerError) -> String {
    match err {
        LedgerError::Reverted(reason) => reason.clone(),
        other => other.to_string(),
    }
}
