//! Recording collaborators shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dataset_publisher::{
    models::{
        dataset::{DatasetRecord, DatasetStatus, NewDataset},
        session::AckedPart,
    },
    services::{
        ledger::{CreateDatasetTx, Ledger, LedgerError, LedgerReceipt, LedgerResult},
        metadata_store::{MetadataError, MetadataResult, MetadataStore},
        object_storage::{MultipartInit, ObjectStorage, StorageError, StorageResult},
        outbox::OutboxSignal,
    },
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::watch;

pub const MIB: u64 = 1024 * 1024;

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Wait until `cond` holds, polling every few milliseconds.
pub async fn eventually<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// =============================================================================
// Object storage
// =============================================================================

#[derive(Default)]
struct StorageInner {
    sessions: HashMap<String, (String, BTreeMap<u32, Bytes>)>,
    objects: HashMap<String, Bytes>,
    /// Every upload_part call, in call order (including failed ones).
    upload_calls: Vec<u32>,
    complete_calls: Vec<Vec<u32>>,
    abort_calls: Vec<String>,
    delete_calls: Vec<String>,
    /// Remaining transient failures per part number.
    transient_failures: HashMap<u32, usize>,
    /// Parts that always fail transiently.
    broken_parts: Vec<u32>,
    /// Parts whose first attempt never returns.
    hang_once: Vec<u32>,
    expire_sessions: bool,
    fail_delete: bool,
}

/// In-memory multipart store that records every call.
///
/// Uploads after the first `pass_through` calls wait for the gate to open,
/// which lets a test pause an upload at a known point.
pub struct RecordingStorage {
    inner: Mutex<StorageInner>,
    initiated: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    pass_through: Mutex<Option<usize>>,
    gate: watch::Sender<bool>,
    completion_gate: watch::Sender<bool>,
}

impl RecordingStorage {
    pub fn new() -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        let (completion_gate, _) = watch::channel(true);
        Arc::new(Self {
            inner: Mutex::new(StorageInner::default()),
            initiated: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            pass_through: Mutex::new(None),
            gate,
            completion_gate,
        })
    }

    /// Let `n` upload calls through, then hold the rest until [`open_gate`].
    pub fn hold_after(&self, n: usize) {
        *self.pass_through.lock().unwrap() = Some(n);
        self.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        *self.pass_through.lock().unwrap() = None;
        self.gate.send_replace(true);
    }

    /// Hold `complete_multipart_upload` after it was recorded.
    pub fn hold_completion(&self) {
        self.completion_gate.send_replace(false);
    }

    pub fn release_completion(&self) {
        self.completion_gate.send_replace(true);
    }

    pub fn fail_transiently(&self, part: u32, times: usize) {
        self.inner.lock().unwrap().transient_failures.insert(part, times);
    }

    pub fn break_part(&self, part: u32) {
        self.inner.lock().unwrap().broken_parts.push(part);
    }

    pub fn heal(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.broken_parts.clear();
        inner.transient_failures.clear();
        inner.expire_sessions = false;
    }

    pub fn hang_first_attempt(&self, part: u32) {
        self.inner.lock().unwrap().hang_once.push(part);
    }

    pub fn expire_sessions(&self) {
        self.inner.lock().unwrap().expire_sessions = true;
    }

    pub fn fail_deletes(&self) {
        self.inner.lock().unwrap().fail_delete = true;
    }

    pub fn initiate_calls(&self) -> usize {
        self.initiated.load(Ordering::SeqCst)
    }

    /// Highest number of `upload_part` calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn upload_calls(&self) -> Vec<u32> {
        self.inner.lock().unwrap().upload_calls.clone()
    }

    pub fn upload_calls_for(&self, part: u32) -> usize {
        self.upload_calls().iter().filter(|p| **p == part).count()
    }

    pub fn complete_calls(&self) -> Vec<Vec<u32>> {
        self.inner.lock().unwrap().complete_calls.clone()
    }

    pub fn abort_calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().abort_calls.clone()
    }

    pub fn delete_calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().delete_calls.clone()
    }

    pub fn object(&self, name: &str) -> Option<Bytes> {
        self.inner.lock().unwrap().objects.get(name).cloned()
    }

    pub fn put_object(&self, name: &str, data: &[u8]) {
        self.inner
            .lock()
            .unwrap()
            .objects
            .insert(name.to_string(), Bytes::copy_from_slice(data));
    }

    /// Part sizes currently stored for an in-progress session.
    pub fn stored_part_sizes(&self, session: &str) -> BTreeMap<u32, usize> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(session)
            .map(|(_, parts)| parts.iter().map(|(n, b)| (*n, b.len())).collect())
            .unwrap_or_default()
    }

    fn should_hold(&self) -> bool {
        let mut pass = self.pass_through.lock().unwrap();
        match pass.as_mut() {
            Some(0) => true,
            Some(n) => {
                *n -= 1;
                false
            }
            None => false,
        }
    }
}

struct InFlight<'a>(&'a RecordingStorage);

impl<'a> InFlight<'a> {
    fn enter(storage: &'a RecordingStorage) -> Self {
        let now = storage.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        storage.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(storage)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStorage for RecordingStorage {
    async fn initiate_multipart_upload(&self, file_name: &str) -> StorageResult<MultipartInit> {
        let n = self.initiated.fetch_add(1, Ordering::SeqCst) + 1;
        let init = MultipartInit {
            object_name: format!("{}-{}", n, file_name),
            remote_session_id: format!("session-{}", n),
        };
        self.inner.lock().unwrap().sessions.insert(
            init.remote_session_id.clone(),
            (init.object_name.clone(), BTreeMap::new()),
        );
        Ok(init)
    }

    async fn upload_part(
        &self,
        remote_session_id: &str,
        part_number: u32,
        bytes: Bytes,
    ) -> StorageResult<String> {
        let _in_flight = InFlight::enter(self);
        let hang = {
            let mut inner = self.inner.lock().unwrap();
            inner.upload_calls.push(part_number);
            if inner.expire_sessions {
                return Err(StorageError::SessionExpired(remote_session_id.into()));
            }
            if inner.broken_parts.contains(&part_number) {
                return Err(StorageError::Transient("connection reset".into()));
            }
            if let Some(left) = inner.transient_failures.get_mut(&part_number) {
                if *left > 0 {
                    *left -= 1;
                    return Err(StorageError::Transient("connection reset".into()));
                }
            }
            match inner.hang_once.iter().position(|p| *p == part_number) {
                Some(idx) => {
                    inner.hang_once.remove(idx);
                    true
                }
                None => false,
            }
        };
        if hang {
            std::future::pending::<()>().await;
        }

        if self.should_hold() {
            let mut gate = self.gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;
        }

        let mut inner = self.inner.lock().unwrap();
        let (_, parts) = inner
            .sessions
            .get_mut(remote_session_id)
            .ok_or_else(|| StorageError::SessionExpired(remote_session_id.into()))?;
        let token = format!("{:x}", md5::compute(&bytes));
        parts.insert(part_number, bytes);
        Ok(token)
    }

    async fn complete_multipart_upload(
        &self,
        remote_session_id: &str,
        parts: &[AckedPart],
    ) -> StorageResult<()> {
        self.inner
            .lock()
            .unwrap()
            .complete_calls
            .push(parts.iter().map(|p| p.part_number).collect());
        let mut gate = self.completion_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let mut inner = self.inner.lock().unwrap();
        let (object_name, stored) = inner
            .sessions
            .remove(remote_session_id)
            .ok_or_else(|| StorageError::SessionExpired(remote_session_id.into()))?;
        let mut data = Vec::new();
        for part in parts {
            let bytes = stored
                .get(&part.part_number)
                .ok_or_else(|| StorageError::PartRejected {
                    part_number: part.part_number,
                    reason: "missing".into(),
                })?;
            data.extend_from_slice(bytes);
        }
        inner.objects.insert(object_name, Bytes::from(data));
        Ok(())
    }

    async fn abort_multipart_upload(&self, remote_session_id: &str) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.abort_calls.push(remote_session_id.to_string());
        inner.sessions.remove(remote_session_id);
        Ok(())
    }

    async fn delete_object(&self, object_name: &str) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.delete_calls.push(object_name.to_string());
        if inner.fail_delete {
            return Err(StorageError::Transient("storage offline".into()));
        }
        inner.objects.remove(object_name);
        Ok(())
    }
}

// =============================================================================
// Metadata store
// =============================================================================

#[derive(Default)]
struct MetadataInner {
    next_id: i64,
    records: HashMap<i64, DatasetRecord>,
    creates: Vec<NewDataset>,
    deletes: Vec<i64>,
    restores: Vec<i64>,
    fail_create: bool,
    fail_delete: bool,
    fail_restore: bool,
}

pub struct RecordingMetadata {
    inner: Mutex<MetadataInner>,
}

impl RecordingMetadata {
    /// Ids are handed out from `first_id` upwards.
    pub fn new(first_id: i64) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MetadataInner {
                next_id: first_id,
                ..MetadataInner::default()
            }),
        })
    }

    pub fn fail_create(&self) {
        self.inner.lock().unwrap().fail_create = true;
    }

    pub fn fail_delete(&self) {
        self.inner.lock().unwrap().fail_delete = true;
    }

    pub fn fail_restore(&self) {
        self.inner.lock().unwrap().fail_restore = true;
    }

    pub fn creates(&self) -> Vec<NewDataset> {
        self.inner.lock().unwrap().creates.clone()
    }

    pub fn deletes(&self) -> Vec<i64> {
        self.inner.lock().unwrap().deletes.clone()
    }

    pub fn restores(&self) -> Vec<i64> {
        self.inner.lock().unwrap().restores.clone()
    }

    pub fn status(&self, id: i64) -> Option<DatasetStatus> {
        self.inner.lock().unwrap().records.get(&id).map(|r| r.status)
    }

    /// Seed an active dataset directly.
    pub fn insert(&self, id: i64, object_name: &str, is_free: bool) {
        let now = Utc::now();
        self.inner.lock().unwrap().records.insert(
            id,
            DatasetRecord {
                id,
                title: format!("dataset {}", id),
                description: String::new(),
                category: String::new(),
                license: String::new(),
                object_name: object_name.into(),
                file_size: 1,
                is_free,
                price: if is_free { "0".into() } else { "1".into() },
                status: DatasetStatus::Active,
                created_at: now,
                updated_at: now,
            },
        );
    }
}

#[async_trait]
impl MetadataStore for RecordingMetadata {
    async fn create_dataset(&self, fields: &NewDataset) -> MetadataResult<i64> {
        let mut inner = self.inner.lock().unwrap();
        inner.creates.push(fields.clone());
        if inner.fail_create {
            return Err(MetadataError::Invalid("database is read-only".into()));
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let now = Utc::now();
        inner.records.insert(
            id,
            DatasetRecord {
                id,
                title: fields.title.clone(),
                description: fields.description.clone(),
                category: fields.category.clone(),
                license: fields.license.clone(),
                object_name: fields.object_name.clone(),
                file_size: fields.file_size as i64,
                is_free: fields.is_free,
                price: fields.price.clone(),
                status: DatasetStatus::Active,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn delete_dataset(&self, dataset_id: i64) -> MetadataResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.deletes.push(dataset_id);
        if inner.fail_delete {
            return Err(MetadataError::Invalid("database is read-only".into()));
        }
        match inner.records.get_mut(&dataset_id) {
            Some(record) if record.status == DatasetStatus::Active => {
                record.status = DatasetStatus::Removed;
                Ok(())
            }
            _ => Err(MetadataError::NotFound(dataset_id)),
        }
    }

    async fn restore_dataset(&self, dataset_id: i64) -> MetadataResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.restores.push(dataset_id);
        if inner.fail_restore {
            return Err(MetadataError::Invalid("database is read-only".into()));
        }
        let record = inner
            .records
            .get_mut(&dataset_id)
            .ok_or(MetadataError::NotFound(dataset_id))?;
        record.status = DatasetStatus::Active;
        Ok(())
    }

    async fn get_dataset(&self, dataset_id: i64) -> MetadataResult<DatasetRecord> {
        self.inner
            .lock()
            .unwrap()
            .records
            .get(&dataset_id)
            .filter(|record| record.status == DatasetStatus::Active)
            .cloned()
            .ok_or(MetadataError::NotFound(dataset_id))
    }
}

// =============================================================================
// Ledger
// =============================================================================

#[derive(Clone, Debug)]
pub enum LedgerScript {
    Confirm,
    Revert(&'static str),
    Hang,
}

pub struct ScriptedLedger {
    script: LedgerScript,
    creates: Mutex<Vec<CreateDatasetTx>>,
    removals: Mutex<Vec<i64>>,
}

impl ScriptedLedger {
    pub fn new(script: LedgerScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            creates: Mutex::new(Vec::new()),
            removals: Mutex::new(Vec::new()),
        })
    }

    pub fn creates(&self) -> Vec<CreateDatasetTx> {
        self.creates.lock().unwrap().clone()
    }

    pub fn removals(&self) -> Vec<i64> {
        self.removals.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.creates().len() + self.removals().len()
    }

    async fn respond(&self, dataset_id: i64) -> LedgerResult<LedgerReceipt> {
        match &self.script {
            LedgerScript::Confirm => Ok(LedgerReceipt {
                tx_hash: format!("0x{:064x}", dataset_id),
            }),
            LedgerScript::Revert(reason) => Err(LedgerError::Reverted((*reason).into())),
            LedgerScript::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl Ledger for ScriptedLedger {
    async fn submit_create_transaction(&self, tx: &CreateDatasetTx) -> LedgerResult<LedgerReceipt> {
        self.creates.lock().unwrap().push(tx.clone());
        self.respond(tx.dataset_id).await
    }

    async fn submit_removal_transaction(&self, dataset_id: i64) -> LedgerResult<LedgerReceipt> {
        self.removals.lock().unwrap().push(dataset_id);
        self.respond(dataset_id).await
    }
}

// =============================================================================
// Outbox
// =============================================================================

#[derive(Default)]
pub struct CountingOutbox {
    signals: AtomicUsize,
}

impl CountingOutbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn signals(&self) -> usize {
        self.signals.load(Ordering::SeqCst)
    }
}

impl OutboxSignal for CountingOutbox {
    fn notify(&self) {
        self.signals.fetch_add(1, Ordering::SeqCst);
    }
}
