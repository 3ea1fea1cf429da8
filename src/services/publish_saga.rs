//! Publish saga: register metadata, record paid datasets on the ledger, undo
//! both stores when the ledger refuses.
//!
//! ```text
//! MetadataPending -> MetadataRegistered -> Published                (free)
//!                                       -> ChainPending -> Published
//!                                                       -> ChainFailed -> RolledBack
//! ```

use crate::{
    models::{
        dataset::{DatasetDetails, NewDataset, parse_ether},
        events::SagaOutcome,
    },
    services::{
        ledger::{CreateDatasetTx, Ledger, with_deadline},
        metadata_store::MetadataStore,
        object_storage::ObjectStorage,
        outbox::OutboxSignal,
        saga::{SagaError, SagaResult, ledger_reason},
        upload_engine::CompletedUpload,
    },
};
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishState {
    MetadataPending,
    MetadataRegistered { dataset_id: i64 },
    ChainPending { dataset_id: i64 },
    ChainFailed { dataset_id: i64, reason: String },
    Published { dataset_id: i64, on_chain: bool },
    RolledBack { dataset_id: i64, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishEvent {
    MetadataRegistered(i64),
    /// The dataset is free; no ledger step.
    SkipLedger,
    LedgerSubmitted,
    LedgerConfirmed,
    LedgerRejected(String),
    /// Metadata and object were both removed.
    Compensated,
}

impl PublishState {
    /// Pure transition function. `None` for an event the state does not accept.
    pub fn on(&self, event: &PublishEvent) -> Option<PublishState> {
        use PublishEvent as E;
        use PublishState as S;
        Some(match (self, event) {
            (S::MetadataPending, E::MetadataRegistered(id)) => {
                S::MetadataRegistered { dataset_id: *id }
            }
            (S::MetadataRegistered { dataset_id }, E::SkipLedger) => S::Published {
                dataset_id: *dataset_id,
                on_chain: false,
            },
            (S::MetadataRegistered { dataset_id }, E::LedgerSubmitted) => S::ChainPending {
                dataset_id: *dataset_id,
            },
            (S::ChainPending { dataset_id }, E::LedgerConfirmed) => S::Published {
                dataset_id: *dataset_id,
                on_chain: true,
            },
            (S::ChainPending { dataset_id }, E::LedgerRejected(reason)) => S::ChainFailed {
                dataset_id: *dataset_id,
                reason: reason.clone(),
            },
            (S::ChainFailed { dataset_id, reason }, E::Compensated) => S::RolledBack {
                dataset_id: *dataset_id,
                reason: reason.clone(),
            },
            _ => return None,
        })
    }

    pub fn is_final(&self) -> bool {
        matches!(self, PublishState::Published { .. } | PublishState::RolledBack { .. })
    }

    pub fn outcome(&self) -> Option<SagaOutcome> {
        match self {
            PublishState::Published {
                dataset_id,
                on_chain,
            } => Some(SagaOutcome::Published {
                dataset_id: *dataset_id,
                on_chain: *on_chain,
            }),
            PublishState::RolledBack { dataset_id, reason } => Some(SagaOutcome::RolledBack {
                dataset_id: *dataset_id,
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}

/// What the rollback managed to undo.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rollback {
    pub metadata_removed: bool,
    pub object_deleted: bool,
    pub errors: Vec<String>,
}

impl Rollback {
    pub fn is_complete(&self) -> bool {
        self.metadata_removed && self.object_deleted
    }
}

#[derive(Clone)]
pub struct PublishSaga {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStorage>,
    ledger: Option<Arc<dyn Ledger>>,
    outbox: Arc<dyn OutboxSignal>,
    ledger_timeout: Duration,
    events: broadcast::Sender<SagaOutcome>,
}

impl PublishSaga {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn ObjectStorage>,
        ledger: Option<Arc<dyn Ledger>>,
        outbox: Arc<dyn OutboxSignal>,
        events: broadcast::Sender<SagaOutcome>,
    ) -> Self {
        Self {
            metadata,
            storage,
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

    /// Publish a completed upload.
    ///
    /// A ledger refusal is not an error: the saga rolls back and returns
    /// [`SagaOutcome::RolledBack`]. Only a rollback that itself fails comes
    /// back as [`SagaError::CompensationFailure`].
    pub async fn publish(
        &self,
        upload: &CompletedUpload,
        details: &DatasetDetails,
    ) -> SagaResult<SagaOutcome> {
        if details.title.trim().is_empty() {
            return Err(SagaError::InvalidRequest("title is required".into()));
        }
        let price_wei = if details.is_free {
            0
        } else {
            let wei = parse_ether(&details.price)
                .map_err(|e| SagaError::InvalidRequest(e.to_string()))?;
            if wei == 0 {
                return Err(SagaError::InvalidRequest(
                    "paid datasets need a price above zero".into(),
                ));
            }
            wei
        };
        let ledger = match (&self.ledger, details.is_free) {
            (_, true) => None,
            (Some(ledger), false) => Some(ledger.clone()),
            (None, false) => {
                return Err(SagaError::LedgerUnavailable(
                    "no ledger configured for paid datasets".into(),
                ));
            }
        };

        let mut state = PublishState::MetadataPending;

        let fields = NewDataset {
            title: details.title.clone(),
            description: details.description.clone(),
            category: details.category.clone(),
            license: details.license.clone(),
            object_name: upload.object_name.clone(),
            file_size: upload.file_size,
            is_free: details.is_free,
            price: if details.is_free {
                "0".into()
            } else {
                details.price.trim().to_string()
            },
        };
        let dataset_id = self
            .metadata
            .create_dataset(&fields)
            .await
            .map_err(SagaError::MetadataRegistration)?;
        state = advance(&state, PublishEvent::MetadataRegistered(dataset_id))?;
        info!(dataset_id, object = %upload.object_name, "dataset metadata registered");

        let Some(ledger) = ledger else {
            state = advance(&state, PublishEvent::SkipLedger)?;
            return self.finish(&state);
        };

        state = advance(&state, PublishEvent::LedgerSubmitted)?;
        let tx = CreateDatasetTx {
            dataset_id,
            title: details.title.clone(),
            description: details.description.clone(),
            price_wei,
            file_size: upload.file_size,
        };
        match with_deadline(self.ledger_timeout, ledger.submit_create_transaction(&tx)).await {
            Ok(receipt) => {
                info!(dataset_id, tx = %receipt.tx_hash, "ledger entry confirmed");
                state = advance(&state, PublishEvent::LedgerConfirmed)?;
                self.finish(&state)
            }
            Err(err) => {
                let reason = ledger_reason(&err);
                warn!(dataset_id, "ledger refused dataset, rolling back: {}", err);
                state = advance(&state, PublishEvent::LedgerRejected(reason.clone()))?;

                let rollback = self.roll_back(dataset_id, &upload.object_name).await;
                if !rollback.is_complete() {
                    error!(
                        dataset_id,
                        object = %upload.object_name,
                        metadata_removed = rollback.metadata_removed,
                        object_deleted = rollback.object_deleted,
                        "publish rollback incomplete, manual intervention required"
                    );
                    return Err(SagaError::CompensationFailure {
                        step: "publish",
                        dataset_id,
                        metadata_reverted: rollback.metadata_removed,
                        object_deleted: rollback.object_deleted,
                        reason: format!("{}; rollback: {}", reason, rollback.errors.join("; ")),
                    });
                }
                state = advance(&state, PublishEvent::Compensated)?;
                self.finish(&state)
            }
        }
    }

    /// Both steps are always attempted, independently of each other.
    async fn roll_back(&self, dataset_id: i64, object_name: &str) -> Rollback {
        let mut rollback = Rollback::default();

        match self.metadata.delete_dataset(dataset_id).await {
            Ok(()) => rollback.metadata_removed = true,
            Err(err) => rollback.errors.push(format!("metadata delete: {}", err)),
        }
        match self.storage.delete_object(object_name).await {
            Ok(()) => rollback.object_deleted = true,
            Err(err) => rollback.errors.push(format!("object delete: {}", err)),
        }

        if rollback.metadata_removed && !rollback.object_deleted {
            // the metadata delete queued the object for the reconciler
            self.outbox.notify();
        }
        rollback
    }

    fn finish(&self, state: &PublishState) -> SagaResult<SagaOutcome> {
        let outcome = state.outcome().ok_or_else(|| SagaError::InvalidTransition {
            from: format!("{:?}", state),
            event: "finish".into(),
        })?;
        info!(dataset_id = outcome.dataset_id(), ?outcome, "publish finished");
        let _ = self.events.send(outcome.clone());
        Ok(outcome)
    }
}

fn advance(state: &PublishState, event: PublishEvent) -> SagaResult<PublishState> {
    state.on(&event).ok_or_else(|| SagaError::InvalidTransition {
        from: format!("{:?}", state),
        event: format!("{:?}", event),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_path_skips_the_ledger() {
        let s = PublishState::MetadataPending
            .on(&PublishEvent::MetadataRegistered(7))
            .unwrap();
        let s = s.on(&PublishEvent::SkipLedger).unwrap();
        assert_eq!(
            s,
            PublishState::Published {
                dataset_id: 7,
                on_chain: false
            }
        );
        assert!(s.is_final());
    }

    #[test]
    fn rejection_only_ends_after_compensation() {
        let s = PublishState::ChainPending { dataset_id: 101 }
            .on(&PublishEvent::LedgerRejected("insufficient funds".into()))
            .unwrap();
        assert!(!s.is_final());
        assert!(s.outcome().is_none());
        let s = s.on(&PublishEvent::Compensated).unwrap();
        assert_eq!(
            s.outcome(),
            Some(SagaOutcome::RolledBack {
                dataset_id: 101,
                reason: "insufficient funds".into()
            })
        );
    }

    #[test]
    fn rejects_out_of_order_events() {
        assert!(PublishState::MetadataPending.on(&PublishEvent::LedgerConfirmed).is_none());
        assert!(
            PublishState::MetadataRegistered { dataset_id: 1 }
                .on(&PublishEvent::Compensated)
                .is_none()
        );
        assert!(
            PublishState::Published {
                dataset_id: 1,
                on_chain: true
            }
            .on(&PublishEvent::LedgerRejected("late".into()))
            .is_none()
        );
        let err = advance(&PublishState::MetadataPending, PublishEvent::SkipLedger).unwrap_err();
        assert!(matches!(err, SagaError::InvalidTransition { .. }));
    }
}
