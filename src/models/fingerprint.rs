//! Identity of a resumable upload across process restarts.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Identifies a resumable upload session by file name and byte size.
///
/// Content is not hashed: two fingerprints are equal iff `name` and `size`
/// match exactly. `last_modified_hint` is carried for display only and never
/// takes part in equality.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFingerprint {
    /// File name as supplied by the seller (no directory component).
    pub name: String,

    /// Total size in bytes.
    pub size: u64,

    /// Last-modified timestamp (unix millis) reported by the source, if any.
    pub last_modified_hint: Option<i64>,
}

impl FileFingerprint {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            last_modified_hint: None,
        }
    }

    pub fn with_last_modified(mut self, millis: i64) -> Self {
        self.last_modified_hint = Some(millis);
        self
    }

    /// String key under which the session snapshot is persisted.
    pub fn store_key(&self) -> String {
        format!("multipart-upload-{}:{}", self.name, self.size)
    }
}

impl PartialEq for FileFingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.size == other.size
    }
}

impl Eq for FileFingerprint {}

impl Hash for FileFingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.size.hash(state);
    }
}
