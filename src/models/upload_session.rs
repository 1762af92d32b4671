//! Represents a progressive upload session and its persisted row form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::{BTreeMap, BTreeSet};

/// Chunk size applied when the client does not pick one (1 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// A resumable upload of one large object, received in fixed-size chunks.
///
/// The session only tracks bookkeeping; chunk payloads live in the chunk store
/// under `(upload_id, chunk_index)`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UploadSession {
    /// Random identifier handed to the client at initialization.
    pub upload_id: String,

    /// Opaque identifier of whatever this upload belongs to (e.g. a recording).
    pub owner_id: String,

    /// Separate secret that lets a client reattach without knowing `upload_id`.
    pub resume_token: String,

    /// Size of the complete object in bytes.
    pub total_size: u64,

    /// Size of every chunk except possibly the last.
    pub chunk_size: u64,

    /// `ceil(total_size / chunk_size)`, always at least 1.
    pub total_chunks: u32,

    /// Indices received so far.
    pub uploaded_chunks: BTreeSet<u32>,

    /// Client-supplied MD5 digests, only for chunks that carried one.
    pub chunk_digests: BTreeMap<u32, String>,

    pub started_at: DateTime<Utc>,

    /// Bumped on every successful chunk write; drives expiry.
    pub last_activity_at: DateTime<Utc>,

    /// Set once the chunks were merged successfully.
    pub finalized_at: Option<DateTime<Utc>>,
}

/// Number of chunks needed to cover `total_size` bytes, or `None` when either
/// size is zero.
pub fn chunk_count(total_size: u64, chunk_size: u64) -> Option<u64> {
    if total_size == 0 || chunk_size == 0 {
        return None;
    }
    Some(total_size.div_ceil(chunk_size))
}

impl UploadSession {
    pub fn new(
        upload_id: String,
        owner_id: String,
        resume_token: String,
        total_size: u64,
        chunk_size: u64,
        total_chunks: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            upload_id,
            owner_id,
            resume_token,
            total_size,
            chunk_size,
            total_chunks,
            uploaded_chunks: BTreeSet::new(),
            chunk_digests: BTreeMap::new(),
            started_at: now,
            last_activity_at: now,
            finalized_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.uploaded_chunks.len() == self.total_chunks as usize
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }

    /// Expected byte length of chunk `index`; only the last chunk may be short.
    pub fn expected_chunk_len(&self, index: u32) -> u64 {
        let offset = u64::from(index) * self.chunk_size;
        self.total_size.saturating_sub(offset).min(self.chunk_size)
    }

    /// Bytes covered by the chunks received so far.
    pub fn uploaded_size(&self) -> u64 {
        self.uploaded_chunks
            .iter()
            .map(|&index| self.expected_chunk_len(index))
            .sum()
    }

    /// Ascending indices that have not been received yet.
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|index| !self.uploaded_chunks.contains(index))
            .collect()
    }

    /// Record a stored chunk. Re-recording an index does not change the count;
    /// a re-upload without a digest drops the digest of the replaced bytes.
    pub fn record_chunk(&mut self, index: u32, digest: Option<String>, now: DateTime<Utc>) {
        self.uploaded_chunks.insert(index);
        match digest {
            Some(digest) => {
                self.chunk_digests.insert(index, digest);
            }
            None => {
                self.chunk_digests.remove(&index);
            }
        }
        self.last_activity_at = now;
    }
}

/// Row shape of the `upload_sessions` table.
///
/// `uploaded_chunks` holds a JSON array of ascending indices and
/// `chunk_digests` a JSON array of `[index, digest]` pairs.
#[derive(Clone, FromRow, Debug)]
pub struct UploadSessionRow {
    pub upload_id: String,
    pub owner_id: String,
    pub resume_token: String,
    pub total_size: i64,
    pub chunk_size: i64,
    pub total_chunks: i64,
    pub uploaded_chunks: String,
    pub chunk_digests: String,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl UploadSessionRow {
    pub fn from_session(session: &UploadSession) -> Result<Self, serde_json::Error> {
        let uploaded: Vec<u32> = session.uploaded_chunks.iter().copied().collect();
        let digests: Vec<(u32, &str)> = session
            .chunk_digests
            .iter()
            .map(|(index, digest)| (*index, digest.as_str()))
            .collect();

        Ok(Self {
            upload_id: session.upload_id.clone(),
            owner_id: session.owner_id.clone(),
            resume_token: session.resume_token.clone(),
            total_size: session.total_size as i64,
            chunk_size: session.chunk_size as i64,
            total_chunks: i64::from(session.total_chunks),
            uploaded_chunks: serde_json::to_string(&uploaded)?,
            chunk_digests: serde_json::to_string(&digests)?,
            started_at: session.started_at,
            last_activity_at: session.last_activity_at,
            finalized_at: session.finalized_at,
        })
    }

    pub fn into_session(self) -> Result<UploadSession, serde_json::Error> {
        let uploaded: Vec<u32> = serde_json::from_str(&self.uploaded_chunks)?;
        let digests: Vec<(u32, String)> = serde_json::from_str(&self.chunk_digests)?;

        Ok(UploadSession {
            upload_id: self.upload_id,
            owner_id: self.owner_id,
            resume_token: self.resume_token,
            total_size: self.total_size as u64,
            chunk_size: self.chunk_size as u64,
            total_chunks: self.total_chunks as u32,
            uploaded_chunks: uploaded.into_iter().collect(),
            chunk_digests: digests.into_iter().collect(),
            started_at: self.started_at,
            last_activity_at: self.last_activity_at,
            finalized_at: self.finalized_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(total_size: u64, chunk_size: u64) -> UploadSession {
        let total_chunks = chunk_count(total_size, chunk_size).unwrap() as u32;
        UploadSession::new(
            "id".into(),
            "owner".into(),
            "token".into(),
            total_size,
            chunk_size,
            total_chunks,
            Utc::now(),
        )
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunk_count(2_500_000, 1_000_000), Some(3));
        assert_eq!(chunk_count(3_000_000, 1_000_000), Some(3));
        assert_eq!(chunk_count(1, DEFAULT_CHUNK_SIZE), Some(1));
        assert_eq!(chunk_count(0, 10), None);
        assert_eq!(chunk_count(10, 0), None);
    }

    #[test]
    fn last_chunk_is_short() {
        let s = session(2_500_000, 1_000_000);
        assert_eq!(s.expected_chunk_len(0), 1_000_000);
        assert_eq!(s.expected_chunk_len(2), 500_000);
        assert_eq!(s.expected_chunk_len(3), 0);
    }

    #[test]
    fn recording_twice_does_not_double_count() {
        let mut s = session(30, 10);
        let now = Utc::now();
        s.record_chunk(1, Some("aa".into()), now);
        s.record_chunk(1, Some("aa".into()), now);
        assert_eq!(s.uploaded_chunks.len(), 1);
        assert_eq!(s.uploaded_size(), 10);
        assert_eq!(s.missing_chunks(), vec![0, 2]);

        s.record_chunk(1, None, now);
        assert!(s.chunk_digests.is_empty());
    }

    #[test]
    fn complete_once_every_index_is_recorded() {
        let mut s = session(25, 10);
        let now = Utc::now();
        for index in [2, 0] {
            s.record_chunk(index, None, now);
            assert!(!s.is_complete());
        }
        s.record_chunk(1, None, now);
        assert!(s.is_complete());
        assert!(s.missing_chunks().is_empty());
        assert_eq!(s.uploaded_size(), 25);
    }

    #[test]
    fn row_keeps_ordered_lists() {
        let mut s = session(40, 10);
        let now = Utc::now();
        s.record_chunk(3, Some("dd".into()), now);
        s.record_chunk(0, None, now);
        s.record_chunk(1, Some("bb".into()), now);

        let row = UploadSessionRow::from_session(&s).unwrap();
        assert_eq!(row.uploaded_chunks, "[0,1,3]");
        assert_eq!(row.chunk_digests, r#"[[1,"bb"],[3,"dd"]]"#);
        assert_eq!(row.into_session().unwrap(), s);
    }
}
