//! Glue between a seller's actions and the upload engine.
//!
//! One controller drives one selected file: it decides between a fresh and a
//! resumed session, relays pause/resume/cancel, keeps the latest run result
//! and hands the finished object to the publish saga.

use crate::{
    models::{
        dataset::DatasetDetails,
        events::SagaOutcome,
        fingerprint::FileFingerprint,
        session::{SessionStatus, UploadProgress},
    },
    services::{
        publish_saga::PublishSaga,
        saga::{SagaError, SagaResult},
        source::ChunkSource,
        upload_engine::{
            ChunkUploadEngine, CompletedUpload, RunOutcome, SessionHandle, UploadError,
            UploadResult,
        },
    },
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, warn};
use uuid::Uuid;

/// What to do when the selected file matches an unfinished upload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeChoice {
    Resume,
    Discard,
    /// Refuse with [`UploadError::ConfirmationRequired`] so the seller can decide.
    #[default]
    Ask,
}

/// Snapshot of the controller for the UI layer.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReport {
    pub id: Uuid,
    pub file_name: String,
    pub resumed: bool,
    pub progress: UploadProgress,
    pub completed: Option<CompletedUpload>,
    pub error: Option<String>,
    pub published: Option<SagaOutcome>,
}

#[derive(Default)]
struct ControllerState {
    handle: Option<SessionHandle>,
    task: Option<JoinHandle<UploadResult<RunOutcome>>>,
    completed: Option<CompletedUpload>,
    last_error: Option<String>,
    published: Option<SagaOutcome>,
    publishing: bool,
    /// Set after a failed rollback; the stores need an operator first.
    blocked: Option<String>,
}

pub struct UploadSessionController {
    engine: ChunkUploadEngine,
    publisher: PublishSaga,
    chunk_size: u64,
    concurrency: usize,
    state: Mutex<ControllerState>,
}

impl UploadSessionController {
    pub fn new(
        engine: ChunkUploadEngine,
        publisher: PublishSaga,
        chunk_size: u64,
        concurrency: usize,
    ) -> Self {
        Self {
            engine,
            publisher,
            chunk_size,
            concurrency,
            state: Mutex::new(ControllerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self) -> UploadResult<SessionHandle> {
        self.lock()
            .handle
            .clone()
            .ok_or(UploadError::InvalidState("no file selected"))
    }

    pub fn id(&self) -> Option<Uuid> {
        self.lock().handle.as_ref().map(SessionHandle::id)
    }

    pub fn fingerprint(&self) -> Option<FileFingerprint> {
        self.lock()
            .handle
            .as_ref()
            .map(|handle| handle.fingerprint().clone())
    }

    /// A file is selected and its upload is neither completed nor cancelled.
    pub fn is_active(&self) -> bool {
        self.lock()
            .handle
            .as_ref()
            .is_some_and(|handle| !handle.progress().status.is_terminal())
    }

    /// Nothing more can happen to this upload: it was cancelled, or its
    /// publish attempt ended (published, rolled back or left inconsistent).
    pub fn is_settled(&self) -> bool {
        let state = self.lock();
        let cancelled = state
            .handle
            .as_ref()
            .is_some_and(|handle| handle.progress().status == SessionStatus::Cancelled);
        cancelled || state.published.is_some() || state.blocked.is_some()
    }

    /// Open a session for `source` and start uploading.
    ///
    /// Returns `true` when an unfinished upload was resumed.
    pub async fn select_file(
        &self,
        source: Arc<dyn ChunkSource>,
        choice: ResumeChoice,
    ) -> UploadResult<bool> {
        if self.is_active() {
            return Err(UploadError::InvalidState("another upload is still active"));
        }

        if let Some(candidate) = self.engine.find_resumable(source.as_ref()).await? {
            match choice {
                ResumeChoice::Ask => {
                    return Err(UploadError::ConfirmationRequired(Box::new(candidate)));
                }
                ResumeChoice::Resume if candidate.content_matches == Some(false) => {
                    return Err(UploadError::ContentMismatch(candidate.fingerprint.name));
                }
                ResumeChoice::Resume => {}
                ResumeChoice::Discard => {
                    self.engine.discard_resumable(&candidate.fingerprint).await;
                }
            }
        }

        let handle = self
            .engine
            .begin(source, self.chunk_size, self.concurrency)
            .await?;
        let resumed = handle.resumed();
        let task = self.engine.spawn(&handle);

        *self.lock() = ControllerState {
            handle: Some(handle),
            task: Some(task),
            ..ControllerState::default()
        };
        Ok(resumed)
    }

    pub fn pause_clicked(&self) -> UploadResult<()> {
        let handle = self.handle()?;
        self.engine.pause(&handle);
        Ok(())
    }

    pub async fn resume_clicked(&self) -> UploadResult<()> {
        let handle = self.handle()?;
        let task = self.engine.resume(&handle).await?;
        let mut state = self.lock();
        state.task = Some(task);
        state.last_error = None;
        Ok(())
    }

    pub async fn cancel_clicked(&self) -> UploadResult<()> {
        let handle = self.handle()?;
        self.engine.cancel(&handle).await
    }

    pub fn progress(&self) -> Option<watch::Receiver<UploadProgress>> {
        self.lock().handle.as_ref().map(SessionHandle::subscribe)
    }

    /// Wait for the current run to end.
    pub async fn wait_for_completion(&self) -> UploadResult<RunOutcome> {
        let task = self.lock().task.take();
        let Some(task) = task else {
            return match self.lock().completed.clone() {
                Some(done) => Ok(RunOutcome::Completed(done)),
                None => Err(UploadError::InvalidState("no upload running")),
            };
        };
        let result = task
            .await
            .unwrap_or(Err(UploadError::InvalidState("upload task died")));
        self.record(&result);
        result
    }

    fn record(&self, result: &UploadResult<RunOutcome>) {
        let mut state = self.lock();
        match result {
            Ok(RunOutcome::Completed(done)) => {
                state.completed = Some(done.clone());
                state.last_error = None;
            }
            Ok(outcome) => debug!(?outcome, "upload run ended"),
            Err(err) => state.last_error = Some(err.to_string()),
        }
    }

    /// Collect the result of a run that already ended.
    async fn reap(&self) {
        let finished = {
            let mut state = self.lock();
            if state.task.as_ref().is_some_and(JoinHandle::is_finished) {
                state.task.take()
            } else {
                None
            }
        };
        if let Some(task) = finished {
            let result = task
                .await
                .unwrap_or(Err(UploadError::InvalidState("upload task died")));
            self.record(&result);
        }
    }

    pub async fn completed(&self) -> Option<CompletedUpload> {
        self.reap().await;
        self.lock().completed.clone()
    }

    pub async fn report(&self) -> Option<UploadReport> {
        self.reap().await;
        let state = self.lock();
        let handle = state.handle.as_ref()?;
        Some(UploadReport {
            id: handle.id(),
            file_name: handle.fingerprint().name.clone(),
            resumed: handle.resumed(),
            progress: handle.progress(),
            completed: state.completed.clone(),
            error: state.last_error.clone(),
            published: state.published.clone(),
        })
    }

    /// Forward the finished upload and the seller's details to the publish saga.
    pub async fn publish(&self, details: &DatasetDetails) -> SagaResult<SagaOutcome> {
        self.reap().await;
        let completed = {
            let mut state = self.lock();
            if state.published.is_some() || state.publishing {
                return Err(SagaError::InvalidRequest("upload already published".into()));
            }
            if let Some(reason) = &state.blocked {
                return Err(SagaError::InvalidRequest(format!(
                    "upload cannot be published again: {}",
                    reason
                )));
            }
            let completed = state
                .completed
                .clone()
                .ok_or_else(|| SagaError::InvalidRequest("upload has not completed".into()))?;
            state.publishing = true;
            completed
        };

        let result = self.publisher.publish(&completed, details).await;

        let mut state = self.lock();
        state.publishing = false;
        match &result {
            Ok(outcome) => state.published = Some(outcome.clone()),
            // metadata or object may be half gone, publishing again would compound it
            Err(err) if err.is_compensation_failure() => {
                warn!(object = %completed.object_name, "upload left unpublishable: {}", err);
                state.blocked = Some(err.to_string());
            }
            Err(_) => {}
        }
        result
    }
}
