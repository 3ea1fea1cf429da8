//! In-memory upload session state and its persisted snapshot.
//!
//! `UploadSession` is owned by the engine and mutated only under the session
//! lock. `SessionSnapshot` is the durable subset written to the fingerprint
//! store after every acknowledged part: it records only acked parts, so a
//! restored session treats every other part as pending.

use crate::models::fingerprint::FileFingerprint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-part transfer state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartStatus {
    Pending,
    InFlight,
    Acked,
    Failed,
}

/// Bookkeeping for one part of the multipart upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartRecord {
    /// Size in bytes (the last part may be shorter than `chunk_size`).
    pub size: u64,
    /// Token returned by the object store when the part was acknowledged.
    pub ack_token: Option<String>,
    pub status: PartStatus,
}

/// Lifecycle of a whole upload session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Ready,
    Uploading,
    Paused,
    Failed,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }
}

/// An acknowledged part as handed to `complete_multipart_upload`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckedPart {
    pub part_number: u32,
    pub ack_token: String,
}

/// Progress event published to the UI layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub uploaded_bytes: u64,
    pub total_size: u64,
    pub status: SessionStatus,
}

/// Persisted form of an acked part.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedPart {
    pub size: u64,
    pub ack_token: String,
}

/// Durable record stored per fingerprint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub fingerprint: FileFingerprint,
    pub object_name: String,
    pub remote_session_id: String,
    pub chunk_size: u64,
    pub total_size: u64,
    pub parts: BTreeMap<u32, PersistedPart>,
    /// md5 over the head and tail of the file, used to detect a different
    /// file hiding behind the same name and size.
    #[serde(default)]
    pub sample_digest: Option<String>,
}

impl SessionSnapshot {
    pub fn uploaded_bytes(&self) -> u64 {
        self.parts.values().map(|p| p.size).sum()
    }
}

/// Number of parts needed for `total_size` bytes split into `chunk_size` parts.
pub fn part_count(total_size: u64, chunk_size: u64) -> u32 {
    total_size.div_ceil(chunk_size) as u32
}

/// Byte range `(offset, len)` covered by a 1-based part number.
pub fn part_range(part_number: u32, chunk_size: u64, total_size: u64) -> (u64, u64) {
    let offset = (part_number as u64 - 1) * chunk_size;
    let len = chunk_size.min(total_size.saturating_sub(offset));
    (offset, len)
}

/// State of one resumable multipart upload.
#[derive(Clone, Debug)]
pub struct UploadSession {
    pub fingerprint: FileFingerprint,
    pub remote_session_id: String,
    /// Assigned once when the remote session is initiated; never reassigned.
    pub object_name: String,
    pub chunk_size: u64,
    pub total_size: u64,
    pub parts: BTreeMap<u32, PartRecord>,
    pub uploaded_bytes: u64,
    pub status: SessionStatus,
    pub sample_digest: Option<String>,
    /// Set when the remote multipart session was reported gone.
    pub remote_expired: bool,
}

impl UploadSession {
    /// Fresh session with every part pending.
    pub fn new(
        fingerprint: FileFingerprint,
        remote_session_id: String,
        object_name: String,
        chunk_size: u64,
        sample_digest: Option<String>,
    ) -> Self {
        let total_size = fingerprint.size;
        let parts = (1..=part_count(total_size, chunk_size))
            .map(|n| {
                let (_, len) = part_range(n, chunk_size, total_size);
                (
                    n,
                    PartRecord {
                        size: len,
                        ack_token: None,
                        status: PartStatus::Pending,
                    },
                )
            })
            .collect();

        Self {
            fingerprint,
            remote_session_id,
            object_name,
            chunk_size,
            total_size,
            parts,
            uploaded_bytes: 0,
            status: SessionStatus::Ready,
            sample_digest,
            remote_expired: false,
        }
    }

    /// Rebuild a session from its persisted snapshot.
    ///
    /// Parts recorded in the snapshot come back acked; everything else is
    /// pending. `uploaded_bytes` is recomputed from the acked parts.
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        let mut session = Self::new(
            snapshot.fingerprint,
            snapshot.remote_session_id,
            snapshot.object_name,
            snapshot.chunk_size,
            snapshot.sample_digest,
        );
        for (n, persisted) in snapshot.parts {
            if let Some(part) = session.parts.get_mut(&n) {
                if part.size == persisted.size {
                    part.ack_token = Some(persisted.ack_token);
                    part.status = PartStatus::Acked;
                }
            }
        }
        session.uploaded_bytes = session.acked_bytes();
        session.status = SessionStatus::Paused;
        session
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let parts = self
            .parts
            .iter()
            .filter(|(_, p)| p.status == PartStatus::Acked)
            .filter_map(|(n, p)| {
                p.ack_token.as_ref().map(|token| {
                    (
                        *n,
                        PersistedPart {
                            size: p.size,
                            ack_token: token.clone(),
                        },
                    )
                })
            })
            .collect();

        SessionSnapshot {
            fingerprint: self.fingerprint.clone(),
            object_name: self.object_name.clone(),
            remote_session_id: self.remote_session_id.clone(),
            chunk_size: self.chunk_size,
            total_size: self.total_size,
            parts,
            sample_digest: self.sample_digest.clone(),
        }
    }

    pub fn acked_bytes(&self) -> u64 {
        self.parts
            .values()
            .filter(|p| p.status == PartStatus::Acked)
            .map(|p| p.size)
            .sum()
    }

    pub fn all_acked(&self) -> bool {
        self.parts.values().all(|p| p.status == PartStatus::Acked)
    }

    /// Part numbers still needing an upload, in ascending order.
    ///
    /// Failed parts are reset to pending so a resumed run retries them.
    pub fn take_outstanding(&mut self) -> Vec<u32> {
        self.parts
            .iter_mut()
            .filter(|(_, p)| p.status != PartStatus::Acked)
            .map(|(n, p)| {
                p.status = PartStatus::Pending;
                *n
            })
            .collect()
    }

    pub fn mark_in_flight(&mut self, part_number: u32) {
        if let Some(part) = self.parts.get_mut(&part_number) {
            if part.status == PartStatus::Pending {
                part.status = PartStatus::InFlight;
            }
        }
    }

    /// Record an acknowledgement. Returns `false` if the part was already acked.
    pub fn ack(&mut self, part_number: u32, ack_token: String) -> bool {
        match self.parts.get_mut(&part_number) {
            Some(part) if part.status != PartStatus::Acked => {
                part.status = PartStatus::Acked;
                part.ack_token = Some(ack_token);
                self.uploaded_bytes += part.size;
                true
            }
            _ => false,
        }
    }

    pub fn mark_failed(&mut self, part_number: u32) {
        if let Some(part) = self.parts.get_mut(&part_number) {
            if part.status != PartStatus::Acked {
                part.status = PartStatus::Failed;
            }
        }
    }

    /// Return interrupted transfers to the queue.
    pub fn revert_in_flight(&mut self) {
        for part in self.parts.values_mut() {
            if part.status == PartStatus::InFlight {
                part.status = PartStatus::Pending;
            }
        }
    }

    pub fn acked_parts(&self) -> Vec<AckedPart> {
        self.parts
            .iter()
            .filter_map(|(n, p)| match (&p.status, &p.ack_token) {
                (PartStatus::Acked, Some(token)) => Some(AckedPart {
                    part_number: *n,
                    ack_token: token.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    pub fn progress(&self) -> UploadProgress {
        UploadProgress {
            uploaded_bytes: self.uploaded_bytes,
            total_size: self.total_size,
            status: self.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn session(size: u64, chunk: u64) -> UploadSession {
        UploadSession::new(
            FileFingerprint::new("data.jsonl", size),
            "remote-1".into(),
            "obj.jsonl".into(),
            chunk,
            None,
        )
    }

    #[test]
    fn splits_into_full_parts_and_a_short_tail() {
        let s = session(52_428_800, 8 * MIB);
        assert_eq!(s.parts.len(), 7);
        for n in 1..=6 {
            assert_eq!(s.parts[&n].size, 8_388_608);
        }
        assert_eq!(s.parts[&7].size, 4_194_304);
        assert_eq!(s.parts.values().map(|p| p.size).sum::<u64>(), 52_428_800);
    }

    #[test]
    fn exact_multiple_has_no_empty_tail() {
        let s = session(16 * MIB, 8 * MIB);
        assert_eq!(s.parts.len(), 2);
        assert_eq!(part_range(2, 8 * MIB, 16 * MIB), (8 * MIB, 8 * MIB));
    }

    #[test]
    fn ack_is_counted_once() {
        let mut s = session(10, 4);
        s.mark_in_flight(1);
        assert!(s.ack(1, "t1".into()));
        assert!(!s.ack(1, "t1-again".into()));
        assert_eq!(s.uploaded_bytes, 4);
        assert_eq!(s.uploaded_bytes, s.acked_bytes());
    }

    #[test]
    fn snapshot_round_trip_keeps_only_acked_parts() {
        let mut s = session(10, 4);
        s.ack(1, "t1".into());
        s.ack(3, "t3".into());
        s.mark_in_flight(2);

        let snap = s.snapshot();
        assert_eq!(snap.parts.len(), 2);
        assert_eq!(snap.uploaded_bytes(), 6);

        let restored = UploadSession::from_snapshot(snap);
        assert_eq!(restored.uploaded_bytes, 6);
        assert_eq!(restored.parts[&2].status, PartStatus::Pending);
        assert_eq!(restored.status, SessionStatus::Paused);
    }

    #[test]
    fn take_outstanding_resets_failed_parts() {
        let mut s = session(12, 4);
        s.ack(2, "t2".into());
        s.mark_failed(3);
        s.mark_in_flight(1);
        s.revert_in_flight();
        assert_eq!(s.take_outstanding(), vec![1, 3]);
        assert_eq!(s.parts[&3].status, PartStatus::Pending);
    }

    #[test]
    fn acked_parts_are_sorted_by_part_number() {
        let mut s = session(12, 4);
        s.ack(3, "c".into());
        s.ack(1, "a".into());
        s.ack(2, "b".into());
        let numbers: Vec<u32> = s.acked_parts().iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(s.all_acked());
    }
}
