//! Durable resumable-upload state keyed by file fingerprint.
//!
//! The engine's in-memory session is always authoritative; this store only
//! lets a later process pick up where an earlier one stopped. Callers go
//! through [`ResumableStore`], which never lets a persistence failure reach
//! the upload path.

use crate::models::{fingerprint::FileFingerprint, session::SessionSnapshot};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("corrupt session snapshot: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("fingerprint store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Pluggable key-value medium for session snapshots.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    async fn save(&self, fingerprint: &FileFingerprint, snapshot: &SessionSnapshot)
    -> StoreResult<()>;
    async fn load(&self, fingerprint: &FileFingerprint) -> StoreResult<Option<SessionSnapshot>>;
    async fn clear(&self, fingerprint: &FileFingerprint) -> StoreResult<()>;
}

/// SQLite-backed store; one row per fingerprint key holding the JSON snapshot.
#[derive(Clone)]
pub struct SqliteFingerprintStore {
    db: Arc<SqlitePool>,
}

impl SqliteFingerprintStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl FingerprintStore for SqliteFingerprintStore {
    async fn save(
        &self,
        fingerprint: &FileFingerprint,
        snapshot: &SessionSnapshot,
    ) -> StoreResult<()> {
        let raw = serde_json::to_string(snapshot)?;
        sqlx::query(
            r#"
            INSERT INTO upload_sessions (fingerprint_key, snapshot, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(fingerprint_key) DO UPDATE SET
                snapshot = excluded.snapshot,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(fingerprint.store_key())
        .bind(raw)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn load(&self, fingerprint: &FileFingerprint) -> StoreResult<Option<SessionSnapshot>> {
        let raw: Option<String> = sqlx::query_scalar(
            "SELECT snapshot FROM upload_sessions WHERE fingerprint_key = ?",
        )
        .bind(fingerprint.store_key())
        .fetch_optional(&*self.db)
        .await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn clear(&self, fingerprint: &FileFingerprint) -> StoreResult<()> {
        sqlx::query("DELETE FROM upload_sessions WHERE fingerprint_key = ?")
            .bind(fingerprint.store_key())
            .execute(&*self.db)
            .await?;
        Ok(())
    }
}

/// Process-local store, handy for tests and embedding.
#[derive(Default)]
pub struct MemoryFingerprintStore {
    entries: Mutex<HashMap<String, SessionSnapshot>>,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl FingerprintStore for MemoryFingerprintStore {
    async fn save(
        &self,
        fingerprint: &FileFingerprint,
        snapshot: &SessionSnapshot,
    ) -> StoreResult<()> {
        self.entries
            .lock()
            .await
            .insert(fingerprint.store_key(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, fingerprint: &FileFingerprint) -> StoreResult<Option<SessionSnapshot>> {
        Ok(self
            .entries
            .lock()
            .await
            .get(&fingerprint.store_key())
            .cloned())
    }

    async fn clear(&self, fingerprint: &FileFingerprint) -> StoreResult<()> {
        self.entries.lock().await.remove(&fingerprint.store_key());
        Ok(())
    }
}

/// Best-effort facade over a [`FingerprintStore`].
///
/// Reads that fail are treated as "no prior session"; writes that fail are
/// logged and otherwise ignored.
#[derive(Clone)]
pub struct ResumableStore {
    inner: Arc<dyn FingerprintStore>,
}

impl ResumableStore {
    pub fn new(inner: Arc<dyn FingerprintStore>) -> Self {
        Self { inner }
    }

    pub async fn load(&self, fingerprint: &FileFingerprint) -> Option<SessionSnapshot> {
        match self.inner.load(fingerprint).await {
            Ok(found) => found.filter(|snap| snap.fingerprint == *fingerprint),
            Err(err) => {
                warn!(file = %fingerprint.name, "fingerprint store read failed, starting fresh: {}", err);
                None
            }
        }
    }

    pub async fn save(&self, snapshot: &SessionSnapshot) {
        if let Err(err) = self.inner.save(&snapshot.fingerprint, snapshot).await {
            warn!(
                file = %snapshot.fingerprint.name,
                "failed to persist upload progress, resumability lost: {}", err
            );
        }
    }

    pub async fn clear(&self, fingerprint: &FileFingerprint) {
        if let Err(err) = self.inner.clear(fingerprint).await {
            warn!(file = %fingerprint.name, "failed to clear persisted upload state: {}", err);
        }
    }
}
