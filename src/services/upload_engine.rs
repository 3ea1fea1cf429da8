//! Resumable chunked upload engine.
//!
//! A file is split into `ceil(size / chunk_size)` parts numbered from 1 and
//! pushed through a bounded worker pool. Every acknowledged part is recorded
//! in the in-memory [`UploadSession`] and persisted through the
//! [`ResumableStore`] while the session lock is held, so the persisted log of
//! acked parts is written by one writer at a time and in order.
//!
//! Pause and cancel are cooperative. Each run observes a stop token at
//! suspension points (before reading a part, while a transfer is in flight,
//! during backoff); an interrupted part goes back to `pending`. A part whose
//! transfer finished before the stop was observed stays acked.

use crate::{
    models::{
        fingerprint::FileFingerprint,
        session::{
            AckedPart, SessionSnapshot, SessionStatus, UploadProgress, UploadSession, part_range,
        },
    },
    services::{
        fingerprint_store::ResumableStore,
        object_storage::{ObjectStorage, StorageError},
        retry::RetryPolicy,
        source::{ChunkSource, SAMPLE_WINDOW},
    },
};
use futures::{StreamExt, stream};
use serde::Serialize;
use std::{
    io,
    sync::{
        Arc, Mutex as StdMutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("part {part} failed after {attempts} attempt(s): {source}")]
    SessionFailed {
        part: u32,
        attempts: u32,
        #[source]
        source: StorageError,
    },
    #[error("remote multipart session expired, the upload has to start over")]
    RemoteSessionExpired,
    #[error("upload was cancelled")]
    Cancelled,
    #[error("an unfinished upload of `{}` exists, confirm resume or discard", .0.fingerprint.name)]
    ConfirmationRequired(Box<ResumeCandidate>),
    #[error("`{0}` differs from the file of the unfinished upload")]
    ContentMismatch(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("failed to read source file: {0}")]
    SourceRead(#[from] io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// A persisted, unfinished upload matching a selected file's fingerprint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeCandidate {
    pub fingerprint: FileFingerprint,
    pub object_name: String,
    pub uploaded_bytes: u64,
    pub total_size: u64,
    /// Whether the sampled head and tail match the persisted upload.
    /// `None` when the persisted record carries no sample.
    pub content_matches: Option<bool>,
}

/// What the publish step needs from a finished upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedUpload {
    pub object_name: String,
    pub file_size: u64,
}

impl From<&UploadSession> for CompletedUpload {
    fn from(session: &UploadSession) -> Self {
        Self {
            object_name: session.object_name.clone(),
            file_size: session.total_size,
        }
    }
}

/// How a run of the worker pool ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(CompletedUpload),
    Paused,
    Cancelled,
}

enum PartOutcome {
    Acked,
    Interrupted,
    Failed(UploadError),
}

struct SessionShared {
    id: Uuid,
    fingerprint: FileFingerprint,
    resumed: bool,
    concurrency: usize,
    source: Arc<dyn ChunkSource>,
    session: Mutex<UploadSession>,
    /// Replaced on resume once cancelled.
    pause: StdMutex<CancellationToken>,
    cancel: CancellationToken,
    /// Set under the session lock while the remote session is being
    /// completed; cancel refuses meanwhile.
    completing: AtomicBool,
    /// Serialises runs: a resume issued while a paused run is still
    /// draining waits for it instead of racing it.
    run_lock: Mutex<()>,
    progress: watch::Sender<UploadProgress>,
}

/// Handle to one upload session. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn fingerprint(&self) -> &FileFingerprint {
        &self.shared.fingerprint
    }

    /// `true` when the session was restored from persisted state.
    pub fn resumed(&self) -> bool {
        self.shared.resumed
    }

    pub fn progress(&self) -> UploadProgress {
        self.shared.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UploadProgress> {
        self.shared.progress.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Copy of the current session state.
    pub async fn session(&self) -> UploadSession {
        self.shared.session.lock().await.clone()
    }

    fn pause_token(&self) -> CancellationToken {
        self.shared
            .pause
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn rearm(&self) {
        let mut token = self
            .shared
            .pause
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    fn publish(&self, session: &UploadSession) {
        self.shared.progress.send_replace(session.progress());
    }
}

/// Drives multipart uploads against an [`ObjectStorage`].
#[derive(Clone)]
pub struct ChunkUploadEngine {
    storage: Arc<dyn ObjectStorage>,
    store: ResumableStore,
    retry: RetryPolicy,
    part_timeout: Duration,
}

impl ChunkUploadEngine {
    pub fn new(storage: Arc<dyn ObjectStorage>, store: ResumableStore) -> Self {
        Self {
            storage,
            store,
            retry: RetryPolicy::default(),
            part_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_part_timeout(mut self, timeout: Duration) -> Self {
        self.part_timeout = timeout;
        self
    }

    /// Look up an unfinished upload for `source` without touching it.
    pub async fn find_resumable(
        &self,
        source: &dyn ChunkSource,
    ) -> UploadResult<Option<ResumeCandidate>> {
        let fingerprint = source.fingerprint();
        let Some(snapshot) = self.store.load(&fingerprint).await else {
            return Ok(None);
        };
        let content_matches = match &snapshot.sample_digest {
            Some(expected) => Some(*expected == source.sample_digest(SAMPLE_WINDOW).await?),
            None => None,
        };
        Ok(Some(ResumeCandidate {
            uploaded_bytes: snapshot.uploaded_bytes(),
            total_size: snapshot.total_size,
            object_name: snapshot.object_name,
            fingerprint,
            content_matches,
        }))
    }

    /// Drop the persisted record for `fingerprint` and release its remote
    /// session. Best effort.
    pub async fn discard_resumable(&self, fingerprint: &FileFingerprint) {
        let Some(snapshot) = self.store.load(fingerprint).await else {
            return;
        };
        self.store.clear(fingerprint).await;
        if let Err(err) = self
            .storage
            .abort_multipart_upload(&snapshot.remote_session_id)
            .await
        {
            debug!(file = %fingerprint.name, "stale multipart session not aborted: {}", err);
        }
        info!(file = %fingerprint.name, "discarded unfinished upload");
    }

    /// Open a session for `source`, resuming a persisted one when the
    /// fingerprint matches, otherwise initiating a new remote session.
    pub async fn begin(
        &self,
        source: Arc<dyn ChunkSource>,
        chunk_size: u64,
        concurrency: usize,
    ) -> UploadResult<SessionHandle> {
        if chunk_size == 0 {
            return Err(UploadError::InvalidInput("chunk size must be positive".into()));
        }
        if concurrency == 0 {
            return Err(UploadError::InvalidInput("concurrency must be at least 1".into()));
        }
        let fingerprint = source.fingerprint();
        if fingerprint.size == 0 {
            return Err(UploadError::InvalidInput(format!(
                "`{}` is empty",
                fingerprint.name
            )));
        }
        let digest = source.sample_digest(SAMPLE_WINDOW).await?;

        let (session, resumed) = match self.restorable(&fingerprint).await {
            Some(snapshot) => {
                if snapshot
                    .sample_digest
                    .as_ref()
                    .is_some_and(|expected| *expected != digest)
                {
                    return Err(UploadError::ContentMismatch(fingerprint.name));
                }
                let mut session = UploadSession::from_snapshot(snapshot);
                session.sample_digest = Some(digest);
                (session, true)
            }
            None => {
                let init = self
                    .storage
                    .initiate_multipart_upload(&fingerprint.name)
                    .await?;
                let session = UploadSession::new(
                    fingerprint.clone(),
                    init.remote_session_id,
                    init.object_name,
                    chunk_size,
                    Some(digest),
                );
                self.store.save(&session.snapshot()).await;
                (session, false)
            }
        };

        let id = Uuid::new_v4();
        info!(
            upload = %id,
            file = %fingerprint.name,
            object = %session.object_name,
            parts = session.parts.len(),
            uploaded = session.uploaded_bytes,
            resumed,
            "upload session opened"
        );

        let (progress, _) = watch::channel(session.progress());
        Ok(SessionHandle {
            shared: Arc::new(SessionShared {
                id,
                fingerprint,
                resumed,
                concurrency,
                source,
                session: Mutex::new(session),
                pause: StdMutex::new(CancellationToken::new()),
                cancel: CancellationToken::new(),
                completing: AtomicBool::new(false),
                run_lock: Mutex::new(()),
                progress,
            }),
        })
    }

    async fn restorable(&self, fingerprint: &FileFingerprint) -> Option<SessionSnapshot> {
        let snapshot = self.store.load(fingerprint).await?;
        if snapshot.chunk_size == 0 || snapshot.total_size != fingerprint.size {
            warn!(file = %fingerprint.name, "ignoring inconsistent persisted upload");
            self.store.clear(fingerprint).await;
            return None;
        }
        Some(snapshot)
    }

    /// Upload every outstanding part, then complete the remote session.
    ///
    /// Returns once all parts are acked and the upload is complete, or the
    /// run was paused or cancelled, or a part exhausted its retry budget.
    pub async fn run(&self, handle: &SessionHandle) -> UploadResult<RunOutcome> {
        let _running = handle.shared.run_lock.lock().await;
        let stop = handle.pause_token().child_token();

        let outstanding = {
            let mut session = handle.shared.session.lock().await;
            match session.status {
                SessionStatus::Cancelled => return Err(UploadError::Cancelled),
                SessionStatus::Completed => {
                    return Ok(RunOutcome::Completed(CompletedUpload::from(&*session)));
                }
                _ => {}
            }
            if session.remote_expired {
                return Err(UploadError::RemoteSessionExpired);
            }
            session.status = SessionStatus::Uploading;
            handle.publish(&session);
            session.take_outstanding()
        };

        debug!(upload = %handle.id(), outstanding = outstanding.len(), "dispatching parts");

        let stop = &stop;
        let outcomes: Vec<PartOutcome> = stream::iter(outstanding)
            .map(move |part| self.upload_part(handle, part, stop))
            .buffer_unordered(handle.shared.concurrency)
            .collect()
            .await;

        let mut session = handle.shared.session.lock().await;
        session.revert_in_flight();

        if handle.is_cancelled() || session.status == SessionStatus::Cancelled {
            return Ok(RunOutcome::Cancelled);
        }

        let failure = outcomes.into_iter().find_map(|outcome| match outcome {
            PartOutcome::Failed(err) => Some(err),
            _ => None,
        });
        if let Some(err) = failure {
            session.status = SessionStatus::Failed;
            handle.publish(&session);
            warn!(upload = %handle.id(), "upload failed: {}", err);
            return Err(err);
        }

        if !session.all_acked() {
            session.status = SessionStatus::Paused;
            handle.publish(&session);
            info!(upload = %handle.id(), uploaded = session.uploaded_bytes, "upload paused");
            return Ok(RunOutcome::Paused);
        }

        handle.shared.completing.store(true, Ordering::SeqCst);
        let remote_session_id = session.remote_session_id.clone();
        let parts = session.acked_parts();
        drop(session);

        let completed = self.complete_remote(&remote_session_id, &parts).await;

        let mut session = handle.shared.session.lock().await;
        handle.shared.completing.store(false, Ordering::SeqCst);
        match completed {
            Ok(()) => {}
            Err(StorageError::SessionExpired(_)) => {
                session.remote_expired = true;
                session.status = SessionStatus::Failed;
                handle.publish(&session);
                return Err(UploadError::RemoteSessionExpired);
            }
            Err(err) => {
                session.status = SessionStatus::Failed;
                handle.publish(&session);
                return Err(err.into());
            }
        }

        debug_assert_eq!(session.acked_bytes(), session.total_size);
        session.status = SessionStatus::Completed;
        handle.publish(&session);
        self.store.clear(&session.fingerprint).await;
        info!(
            upload = %handle.id(),
            object = %session.object_name,
            size = session.total_size,
            "upload completed"
        );
        Ok(RunOutcome::Completed(CompletedUpload::from(&*session)))
    }

    async fn upload_part(
        &self,
        handle: &SessionHandle,
        part: u32,
        stop: &CancellationToken,
    ) -> PartOutcome {
        if stop.is_cancelled() {
            return PartOutcome::Interrupted;
        }

        let (remote_session_id, offset, len) = {
            let mut session = handle.shared.session.lock().await;
            session.mark_in_flight(part);
            let (offset, len) = part_range(part, session.chunk_size, session.total_size);
            (session.remote_session_id.clone(), offset, len)
        };

        let bytes = tokio::select! {
            biased;
            _ = stop.cancelled() => return PartOutcome::Interrupted,
            read = handle.shared.source.read_range(offset, len) => match read {
                Ok(bytes) => bytes,
                Err(err) => {
                    handle.shared.session.lock().await.mark_failed(part);
                    return PartOutcome::Failed(UploadError::SourceRead(err));
                }
            },
        };

        let max_attempts = self.retry.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = stop.cancelled() => return PartOutcome::Interrupted,
                res = tokio::time::timeout(
                    self.part_timeout,
                    self.storage.upload_part(&remote_session_id, part, bytes.clone()),
                ) => res.unwrap_or_else(|_| Err(StorageError::Transient(format!(
                    "part upload timed out after {:?}", self.part_timeout
                )))),
            };

            let err = match result {
                Ok(ack_token) => {
                    let mut session = handle.shared.session.lock().await;
                    if session.status == SessionStatus::Cancelled {
                        return PartOutcome::Interrupted;
                    }
                    if session.ack(part, ack_token) {
                        handle.publish(&session);
                        self.store.save(&session.snapshot()).await;
                    }
                    debug!(upload = %handle.id(), part, attempt, "part acked");
                    return PartOutcome::Acked;
                }
                Err(err) => err,
            };

            if let StorageError::SessionExpired(_) = err {
                let mut session = handle.shared.session.lock().await;
                session.mark_failed(part);
                session.remote_expired = true;
                stop.cancel();
                return PartOutcome::Failed(UploadError::RemoteSessionExpired);
            }

            if !err.is_transient() || attempt >= max_attempts {
                handle.shared.session.lock().await.mark_failed(part);
                stop.cancel();
                return PartOutcome::Failed(UploadError::SessionFailed {
                    part,
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.retry.delay_for_attempt(attempt);
            debug!(upload = %handle.id(), part, attempt, ?delay, "retrying part: {}", err);
            tokio::select! {
                biased;
                _ = stop.cancelled() => return PartOutcome::Interrupted,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn complete_remote(
        &self,
        remote_session_id: &str,
        parts: &[AckedPart],
    ) -> Result<(), StorageError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::time::timeout(
                self.part_timeout,
                self.storage
                    .complete_multipart_upload(remote_session_id, parts),
            )
            .await
            .unwrap_or_else(|_| Err(StorageError::Transient("completion timed out".into())));

            match result {
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts() => {
                    debug!(attempt, "retrying completion: {}", err);
                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                }
                other => return other,
            }
        }
    }

    /// Stop in-flight transfers. Never blocks; the running task notices the
    /// stop, returns interrupted parts to pending and reports `Paused`.
    pub fn pause(&self, handle: &SessionHandle) {
        handle.pause_token().cancel();
        debug!(upload = %handle.id(), "pause requested");
    }

    /// Re-arm the session and launch a new run in the background.
    ///
    /// A session whose remote multipart session expired starts over with a
    /// new remote session and zero progress.
    pub async fn resume(
        &self,
        handle: &SessionHandle,
    ) -> UploadResult<JoinHandle<UploadResult<RunOutcome>>> {
        {
            let mut session = handle.shared.session.lock().await;
            match session.status {
                SessionStatus::Cancelled => return Err(UploadError::Cancelled),
                SessionStatus::Completed => {
                    return Err(UploadError::InvalidState("upload already completed"));
                }
                _ => {}
            }
            if session.remote_expired {
                self.restart_remote(handle, &mut session).await?;
            }
        }
        handle.rearm();
        Ok(self.spawn(handle))
    }

    /// Launch a run in the background.
    pub fn spawn(&self, handle: &SessionHandle) -> JoinHandle<UploadResult<RunOutcome>> {
        let engine = self.clone();
        let handle = handle.clone();
        tokio::spawn(async move { engine.run(&handle).await })
    }

    async fn restart_remote(
        &self,
        handle: &SessionHandle,
        session: &mut UploadSession,
    ) -> UploadResult<()> {
        let init = self
            .storage
            .initiate_multipart_upload(&session.fingerprint.name)
            .await?;
        warn!(
            upload = %handle.id(),
            expired = %session.remote_session_id,
            object = %init.object_name,
            "remote session expired, restarting from zero"
        );
        *session = UploadSession::new(
            session.fingerprint.clone(),
            init.remote_session_id,
            init.object_name,
            session.chunk_size,
            session.sample_digest.clone(),
        );
        self.store.save(&session.snapshot()).await;
        handle.publish(session);
        Ok(())
    }

    /// Terminal. Stops transfers, aborts the remote session once, forgets the
    /// persisted record and resets progress to zero.
    ///
    /// Refused once every part is acked and completion is under way: the
    /// remote session is either completed or left to the run to fail.
    pub async fn cancel(&self, handle: &SessionHandle) -> UploadResult<()> {
        let mut session = handle.shared.session.lock().await;
        match session.status {
            SessionStatus::Cancelled => return Ok(()),
            SessionStatus::Completed => {
                return Err(UploadError::InvalidState("upload already completed"));
            }
            _ => {}
        }
        if handle.shared.completing.load(Ordering::SeqCst) {
            return Err(UploadError::InvalidState("upload is completing"));
        }
        handle.shared.cancel.cancel();
        handle.pause_token().cancel();

        session.status = SessionStatus::Cancelled;
        session.uploaded_bytes = 0;
        handle.publish(&session);

        self.store.clear(&session.fingerprint).await;
        if let Err(err) = self
            .storage
            .abort_multipart_upload(&session.remote_session_id)
            .await
        {
            warn!(upload = %handle.id(), "abort of remote session failed: {}", err);
        }
        info!(upload = %handle.id(), "upload cancelled");
        Ok(())
    }

    pub fn progress(&self, handle: &SessionHandle) -> UploadProgress {
        handle.progress()
    }
}
