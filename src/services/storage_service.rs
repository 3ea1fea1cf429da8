//! src/services/storage_service.rs
//!
//! StorageService — local-disk implementation of the object-storage
//! collaborator. Completed objects are sharded beneath
//! `base_path/objects/{shard}/{shard}/{object_name}`; multipart sessions in
//! progress live under `base_path/multipart/{session_id}/` next to a small
//! JSON manifest naming the target object.

use crate::models::session::AckedPart;
use crate::services::object_storage::{
    MultipartInit, ObjectStorage, StorageError, StorageResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_NAME_LEN: usize = 1024;
const MANIFEST_FILE: &str = "manifest.json";

/// Written when a multipart session is initiated.
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct MultipartManifest {
    object_name: String,
    initiated_at: DateTime<Utc>,
}

/// Filesystem-backed multipart object store.
#[derive(Clone, Debug)]
pub struct StorageService {
    /// Base directory on disk where objects and in-progress parts are stored.
    pub base_path: PathBuf,
}

impl StorageService {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Reject names that could escape the storage root.
    fn ensure_name_safe(&self, name: &str) -> StorageResult<()> {
        let invalid = || StorageError::InvalidObjectName(name.to_string());
        if name.is_empty() || name.len() > MAX_OBJECT_NAME_LEN {
            return Err(invalid());
        }
        if name.starts_with('.') || name.contains('/') || name.contains("..") {
            return Err(invalid());
        }
        if name
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(invalid());
        }
        Ok(())
    }

    /// Session ids are UUIDs we minted; anything else cannot be a live session.
    fn ensure_session_id(&self, session_id: &str) -> StorageResult<Uuid> {
        Uuid::parse_str(session_id)
            .map_err(|_| StorageError::SessionExpired(session_id.to_string()))
    }

    /// Two-level shard identifiers from MD5(object_name).
    fn object_shards(object_name: &str) -> (String, String) {
        let digest = md5::compute(object_name);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn objects_root(&self) -> PathBuf {
        self.base_path.join("objects")
    }

    /// Fully-qualified path of a completed object. Parents may not exist yet.
    pub fn object_path(&self, object_name: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(object_name);
        let mut path = self.objects_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(object_name);
        path
    }

    fn session_dir(&self, session_id: &Uuid) -> PathBuf {
        self.base_path.join("multipart").join(session_id.to_string())
    }

    fn part_path(&self, session_id: &Uuid, part_number: u32) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("part-{:05}", part_number))
    }

    /// `{unix_seconds}_{8 hex}{.ext}` derived from the seller's file name.
    pub fn generate_object_name(file_name: &str) -> String {
        let ext = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| e.bytes().all(|b| b.is_ascii_alphanumeric()))
            .map(|e| format!(".{}", e.to_ascii_lowercase()))
            .unwrap_or_default();
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}_{}{}", Utc::now().timestamp(), &suffix[..8], ext)
    }

    async fn load_manifest(&self, session_id: &str) -> StorageResult<(Uuid, MultipartManifest)> {
        let id = self.ensure_session_id(session_id)?;
        let path = self.session_dir(&id).join(MANIFEST_FILE);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::SessionExpired(session_id.to_string()));
            }
            Err(err) => return Err(StorageError::Io(err)),
        };
        let manifest = serde_json::from_slice(&raw)
            .map_err(|err| StorageError::Io(io::Error::new(ErrorKind::InvalidData, err)))?;
        Ok((id, manifest))
    }

    /// Write `bytes` to a temp file beside `final_path`, fsync, then rename.
    async fn write_atomically(&self, final_path: &Path, bytes: &[u8]) -> StorageResult<()> {
        let parent = final_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "target path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let written = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        Ok(())
    }

    /// Read a completed object back in full.
    pub async fn read_object(&self, object_name: &str) -> StorageResult<Bytes> {
        self.ensure_name_safe(object_name)?;
        match fs::read(self.object_path(object_name)).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StorageError::ObjectNotFound(object_name.to_string()))
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// Recursively remove empty directories up to `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStorage for StorageService {
    async fn initiate_multipart_upload(&self, file_name: &str) -> StorageResult<MultipartInit> {
        let object_name = Self::generate_object_name(file_name);
        self.ensure_name_safe(&object_name)?;

        let session_id = Uuid::new_v4();
        let manifest = MultipartManifest {
            object_name: object_name.clone(),
            initiated_at: Utc::now(),
        };
        let raw = serde_json::to_vec(&manifest)
            .map_err(|err| StorageError::Io(io::Error::new(ErrorKind::InvalidData, err)))?;
        self.write_atomically(&self.session_dir(&session_id).join(MANIFEST_FILE), &raw)
            .await?;

        debug!(session = %session_id, object = %object_name, "initiated multipart upload");
        Ok(MultipartInit {
            object_name,
            remote_session_id: session_id.to_string(),
        })
    }

    async fn upload_part(
        &self,
        remote_session_id: &str,
        part_number: u32,
        bytes: Bytes,
    ) -> StorageResult<String> {
        if part_number == 0 {
            return Err(StorageError::PartRejected {
                part_number,
                reason: "part numbers start at 1".into(),
            });
        }
        let (id, _) = self.load_manifest(remote_session_id).await?;
        self.write_atomically(&self.part_path(&id, part_number), &bytes)
            .await?;
        Ok(format!("{:x}", md5::compute(&bytes)))
    }

    async fn complete_multipart_upload(
        &self,
        remote_session_id: &str,
        parts: &[AckedPart],
    ) -> StorageResult<()> {
        let (id, manifest) = self.load_manifest(remote_session_id).await?;
        if parts.is_empty() {
            return Err(StorageError::PartRejected {
                part_number: 0,
                reason: "no parts to complete".into(),
            });
        }

        let mut sorted = parts.to_vec();
        sorted.sort_by_key(|p| p.part_number);

        let final_path = self.object_path(&manifest.object_name);
        let parent = final_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut out = File::create(&tmp_path).await?;

        for part in &sorted {
            let data = match fs::read(self.part_path(&id, part.part_number)).await {
                Ok(data) => data,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(if err.kind() == ErrorKind::NotFound {
                        StorageError::PartRejected {
                            part_number: part.part_number,
                            reason: "part was never uploaded".into(),
                        }
                    } else {
                        StorageError::Io(err)
                    });
                }
            };
            if format!("{:x}", md5::compute(&data)) != part.ack_token {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::PartRejected {
                    part_number: part.part_number,
                    reason: "ack token does not match stored part".into(),
                });
            }
            if let Err(err) = out.write_all(&data).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }

        let synced = async {
            out.flush().await?;
            out.sync_all().await
        }
        .await;
        if let Err(err) = synced {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        if let Err(err) = fs::remove_dir_all(self.session_dir(&id)).await {
            debug!(session = %id, "failed to remove completed session directory: {}", err);
        }
        debug!(session = %id, object = %manifest.object_name, parts = sorted.len(), "completed multipart upload");
        Ok(())
    }

    async fn abort_multipart_upload(&self, remote_session_id: &str) -> StorageResult<()> {
        let id = match Uuid::parse_str(remote_session_id) {
            Ok(id) => id,
            Err(_) => return Ok(()),
        };
        match fs::remove_dir_all(self.session_dir(&id)).await {
            Ok(_) => debug!(session = %id, "aborted multipart upload"),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(session = %id, "multipart session already gone");
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
        Ok(())
    }

    async fn delete_object(&self, object_name: &str) -> StorageResult<()> {
        self.ensure_name_safe(object_name)?;
        let file_path = self.object_path(object_name);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let root = self.objects_root();
            self.prune_empty_dirs(parent, &root).await;
        }
        Ok(())
    }
}
