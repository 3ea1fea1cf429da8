//! Outcome events published by the sagas.

use serde::Serialize;

/// Final state reached by a publish or removal saga.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SagaOutcome {
    Published {
        dataset_id: i64,
        on_chain: bool,
    },
    /// The ledger refused the dataset; metadata and object were both removed.
    RolledBack {
        dataset_id: i64,
        reason: String,
    },
    Removed {
        dataset_id: i64,
        on_chain: bool,
    },
    /// The ledger refused the removal; the metadata record is active again.
    Restored {
        dataset_id: i64,
        reason: String,
    },
}

impl SagaOutcome {
    pub fn dataset_id(&self) -> i64 {
        match self {
            SagaOutcome::Published { dataset_id, .. }
            | SagaOutcome::RolledBack { dataset_id, .. }
            | SagaOutcome::Removed { dataset_id, .. }
            | SagaOutcome::Restored { dataset_id, .. } => *dataset_id,
        }
    }

    /// `true` when the requested change took effect.
    pub fn succeeded(&self) -> bool {
        matches!(
            self,
            SagaOutcome::Published { .. } | SagaOutcome::Removed { .. }
        )
    }
}
