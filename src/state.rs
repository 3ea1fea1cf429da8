//! Shared application state handed to every handler.

use crate::{
    config::AppConfig,
    models::{events::SagaOutcome, fingerprint::FileFingerprint},
    services::{
        fingerprint_store::{ResumableStore, SqliteFingerprintStore},
        ledger::Ledger,
        metadata_store::{MetadataStore, SqliteMetadataStore},
        outbox::OutboxSignal,
        publish_saga::PublishSaga,
        removal_saga::RemovalSaga,
        retry::RetryPolicy,
        storage_service::StorageService,
        upload_controller::UploadSessionController,
        upload_engine::ChunkUploadEngine,
    },
};
use sqlx::SqlitePool;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub storage: StorageService,
    pub engine: ChunkUploadEngine,
    pub metadata: Arc<dyn MetadataStore>,
    pub publisher: PublishSaga,
    pub removal: RemovalSaga,
    pub events: broadcast::Sender<SagaOutcome>,
    pub uploads: Arc<RwLock<HashMap<Uuid, Arc<UploadSessionController>>>>,
    /// Files whose session is being opened and not yet in `uploads`.
    selecting: Arc<Mutex<HashSet<FileFingerprint>>>,
    pub chunk_size: u64,
    pub concurrency: usize,
}

impl AppState {
    pub fn new(
        cfg: &AppConfig,
        db: Arc<SqlitePool>,
        ledger: Option<Arc<dyn Ledger>>,
        outbox: Arc<dyn OutboxSignal>,
    ) -> Self {
        let storage = StorageService::new(&cfg.storage_dir);
        let metadata: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::new(db.clone()));
        let (events, _) = broadcast::channel(64);

        let engine = ChunkUploadEngine::new(
            Arc::new(storage.clone()),
            ResumableStore::new(Arc::new(SqliteFingerprintStore::new(db.clone()))),
        )
        .with_retry(RetryPolicy::default().with_max_retries(cfg.max_part_retries))
        .with_part_timeout(cfg.part_timeout);

        let publisher = PublishSaga::new(
            metadata.clone(),
            Arc::new(storage.clone()),
            ledger.clone(),
            outbox.clone(),
            events.clone(),
        )
        .with_ledger_timeout(cfg.ledger_timeout);
        let removal = RemovalSaga::new(metadata.clone(), ledger, outbox, events.clone())
            .with_ledger_timeout(cfg.ledger_timeout);

        Self {
            db,
            storage,
            engine,
            metadata,
            publisher,
            removal,
            events,
            uploads: Arc::new(RwLock::new(HashMap::new())),
            selecting: Arc::new(Mutex::new(HashSet::new())),
            chunk_size: cfg.chunk_size,
            concurrency: cfg.concurrency,
        }
    }

    pub fn new_controller(&self) -> UploadSessionController {
        UploadSessionController::new(
            self.engine.clone(),
            self.publisher.clone(),
            self.chunk_size,
            self.concurrency,
        )
    }

    pub async fn controller(&self, id: &Uuid) -> Option<Arc<UploadSessionController>> {
        self.uploads.read().await.get(id).cloned()
    }
    /// Forget an upload once it is settled.
    pub async fn evict_if_settled(&self, id: &Uuid) -> bool {
        let mut uploads = self.uploads.write().await;
        if uploads.get(id).is_some_and(|ctl| ctl.is_settled()) {
            uploads.remove(id);
            return true;
        }
        false
    }

    /// Claim `fingerprint` for a session about to be opened. `None` when the
    /// file is already being uploaded or selected by another request.
    pub async fn reserve(&self, fingerprint: &FileFingerprint) -> Option<Reservation> {
        let mut uploads = self.uploads.write().await;
        uploads.retain(|_, ctl| !ctl.is_settled());
        if uploads
            .values()
            .any(|ctl| ctl.is_active() && ctl.fingerprint().as_ref() == Some(fingerprint))
        {
            return None;
        }
        let mut selecting = self.selecting.lock().unwrap_or_else(PoisonError::into_inner);
        if !selecting.insert(fingerprint.clone()) {
            return None;
        }
        Some(Reservation {
            selecting: self.selecting.clone(),
            fingerprint: fingerprint.clone(),
        })
    }
}

/// Released on drop, whether or not the session was opened.
pub struct Reservation {
    selecting: Arc<Mutex<HashSet<FileFingerprint>>>,
    fingerprint: FileFingerprint,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.selecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.fingerprint);
    }
}
