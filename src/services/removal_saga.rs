//! Removal saga: soft-delete metadata, remove paid datasets from the ledger,
//! restore the metadata when the ledger refuses.
//!
//! ```text
//! Active -> MetadataSoftDeleted -> Removed
//!                               -> ChainFailed -> Restored
//! ```
//!
//! Stored bytes are never touched here: the soft delete queued them for the
//! outbox reconciler, which is nudged once the removal sticks.

use crate::{
    models::events::SagaOutcome,
    services::{
        ledger::{Ledger, with_deadline},
        metadata_store::MetadataStore,
        outbox::OutboxSignal,
        saga::{SagaError, SagaResult, ledger_reason},
    },
};
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemovalState {
    Active { dataset_id: i64 },
    MetadataSoftDeleted { dataset_id: i64 },
    ChainFailed { dataset_id: i64, reason: String },
    Removed { dataset_id: i64, on_chain: bool },
    Restored { dataset_id: i64, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemovalEvent {
    SoftDeleted,
    /// Free dataset, nothing on the ledger.
    SkipLedger,
    LedgerConfirmed,
    LedgerRejected(String),
    /// Metadata is active again.
    Compensated,
}

impl RemovalState {
    pub fn on(&self, event: &RemovalEvent) -> Option<RemovalState> {
        use RemovalEvent as E;
        use RemovalState as S;
        Some(match (self, event) {
            (S::Active { dataset_id }, E::SoftDeleted) => S::MetadataSoftDeleted {
                dataset_id: *dataset_id,
            },
            (S::MetadataSoftDeleted { dataset_id }, E::SkipLedger) => S::Removed {
                dataset_id: *dataset_id,
                on_chain: false,
            },
            (S::MetadataSoftDeleted { dataset_id }, E::LedgerConfirmed) => S::Removed {
                dataset_id: *dataset_id,
                on_chain: true,
            },
            (S::MetadataSoftDeleted { dataset_id }, E::LedgerRejected(reason)) => {
                S::ChainFailed {
                    dataset_id: *dataset_id,
                    reason: reason.clone(),
                }
            }
            (S::ChainFailed { dataset_id, reason }, E::Compensated) => S::Restored {
                dataset_id: *dataset_id,
                reason: reason.clone(),
            },
            _ => return None,
        })
    }

    pub fn outcome(&self) -> Option<SagaOutcome> {
        match self {
            RemovalState::Removed {
                dataset_id,
                on_chain,
            } => Some(SagaOutcome::Removed {
                dataset_id: *dataset_id,
                on_chain: *on_chain,
            }),
            RemovalState::Restored { dataset_id, reason } => Some(SagaOutcome::Restored {
                dataset_id: *dataset_id,
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct RemovalSaga {
    metadata: Arc<dyn MetadataStore>,
    ledger: Option<Arc<dyn Ledger>>,
    outbox: Arc<dyn OutboxSignal>,
    ledger_timeout: Duration,
    events: broadcast::Sender<SagaOutcome>,
}

impl RemovalSaga {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        ledger: Option<Arc<dyn Ledger>>,
        outbox: Arc<dyn OutboxSignal>,
        events: broadcast::Sender<SagaOutcome>,
    ) -> Self {
        Self {
            metadata,
            ledger,
            outbox,
            ledger_timeout: Duration::from_secs(120),
            events,
        }
    }

    pub fn with_ledger_timeout(mut self, timeout: Duration) -> Self {
        self.ledger_timeout = timeout;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SagaOutcome> {
        self.events.subscribe()
    }

    /// Remove an active dataset. An unknown or already removed id is a
    /// [`SagaError::MetadataUpdate`] carrying `NotFound`.
    ///
    /// A ledger refusal restores the metadata and returns
    /// [`SagaOutcome::Restored`]; a failed restore is a
    /// [`SagaError::CompensationFailure`].
    pub async fn remove(&self, dataset_id: i64) -> SagaResult<SagaOutcome> {
        let record = self
            .metadata
            .get_dataset(dataset_id)
            .await
            .map_err(SagaError::MetadataUpdate)?;
        let ledger = match (&self.ledger, record.is_free) {
            (_, true) => None,
            (Some(ledger), false) => Some(ledger.clone()),
            (None, false) => {
                return Err(SagaError::LedgerUnavailable(
                    "no ledger configured for paid datasets".into(),
                ));
            }
        };

        let mut state = RemovalState::Active { dataset_id };

        self.metadata
            .delete_dataset(dataset_id)
            .await
            .map_err(SagaError::MetadataUpdate)?;
        state = advance(&state, RemovalEvent::SoftDeleted)?;
        info!(dataset_id, object = %record.object_name, "dataset soft-deleted");

        let Some(ledger) = ledger else {
            state = advance(&state, RemovalEvent::SkipLedger)?;
            self.outbox.notify();
            return self.finish(&state);
        };

        match with_deadline(
            self.ledger_timeout,
            ledger.submit_removal_transaction(dataset_id),
        )
        .await
        {
            Ok(receipt) => {
                info!(dataset_id, tx = %receipt.tx_hash, "ledger entry removed");
                state = advance(&state, RemovalEvent::LedgerConfirmed)?;
                self.outbox.notify();
                self.finish(&state)
            }
            Err(err) => {
                let reason = ledger_reason(&err);
                warn!(dataset_id, "ledger refused removal, restoring: {}", err);
                state = advance(&state, RemovalEvent::LedgerRejected(reason.clone()))?;

                if let Err(restore_err) = self.metadata.restore_dataset(dataset_id).await {
                    error!(
                        dataset_id,
                        "restore after refused removal failed, manual intervention required: {}",
                        restore_err
                    );
                    return Err(SagaError::CompensationFailure {
                        step: "removal",
                        dataset_id,
                        metadata_reverted: false,
                        object_deleted: false,
                        reason: format!("{}; restore: {}", reason, restore_err),
                    });
                }
                state = advance(&state, RemovalEvent::Compensated)?;
                self.finish(&state)
            }
        }
    }

    fn finish(&self, state: &RemovalState) -> SagaResult<SagaOutcome> {
        let outcome = state.outcome().ok_or_else(|| SagaError::InvalidTransition {
            from: format!("{:?}", state),
            event: "finish".into(),
        })?;
        info!(dataset_id = outcome.dataset_id(), ?outcome, "removal finished");
        let _ = self.events.send(outcome.clone());
        Ok(outcome)
    }
}

fn advance(state: &RemovalState, event: RemovalEvent) -> SagaResult<RemovalState> {
    state.on(&event).ok_or_else(|| SagaError::InvalidTransition {
        from: format!("{:?}", state),
        event: format!("{:?}", event),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_removal_ends_restored() {
        let s = RemovalState::Active { dataset_id: 5 }
            .on(&RemovalEvent::SoftDeleted)
            .unwrap()
            .on(&RemovalEvent::LedgerRejected("reverted".into()))
            .unwrap();
        assert!(s.outcome().is_none());
        let s = s.on(&RemovalEvent::Compensated).unwrap();
        assert_eq!(
            s.outcome(),
            Some(SagaOutcome::Restored {
                dataset_id: 5,
                reason: "reverted".into()
            })
        );
    }

    #[test]
    fn ledger_is_only_consulted_after_the_soft_delete() {
        assert!(
            RemovalState::Active { dataset_id: 1 }
                .on(&RemovalEvent::LedgerConfirmed)
                .is_none()
        );
        assert!(
            RemovalState::Removed {
                dataset_id: 1,
                on_chain: false
            }
            .on(&RemovalEvent::Compensated)
            .is_none()
        );
    }
}
