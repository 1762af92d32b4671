//! src/services/upload_service.rs
//!
//! UploadService: the progressive upload state machine. Session bookkeeping
//! goes through the [`SessionRegistry`] (in-memory slots written through to
//! SQLite), chunk payloads through a [`ChunkStore`], and finished objects are
//! handed to a [`PermanentStore`].
//!
//! Lifecycle: initialize → receive chunks (any order, retries overwrite) →
//! complete → finalize (ordered merge + size check) → cleanup. Abandoned
//! sessions are reclaimed by the cleanup sweeper through the same cleanup path.

use crate::models::{
    cleanup::format_bytes,
    progress::{ChunkReceipt, FinalizedUpload, InitializedUpload, UploadProgress},
    upload_session::{UploadSession, chunk_count},
};
use crate::services::{
    chunk_store::ChunkStore,
    permanent_store::PermanentStore,
    session_registry::{SessionRegistry, SessionSlot, live},
    tokens::{generate_resume_token, generate_upload_id, is_well_formed_upload_id},
};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use std::{
    collections::HashSet,
    io,
    sync::{Arc, Mutex, PoisonError},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(String),
    #[error("chunk index {index} is out of range for an upload of {total_chunks} chunks")]
    OutOfRange { index: u32, total_chunks: u32 },
    #[error("upload `{0}` not found")]
    NotFound(String),
    #[error("upload session not found or expired")]
    ResumeTokenNotFound,
    #[error("chunk {index} digest mismatch: expected {expected}, computed {actual}")]
    IntegrityMismatch {
        index: u32,
        expected: String,
        actual: String,
    },
    #[error("upload `{upload_id}` is not complete ({uploaded}/{total} chunks received)")]
    NotComplete {
        upload_id: String,
        uploaded: u32,
        total: u32,
    },
    #[error("upload `{0}` is already finalized")]
    AlreadyFinalized(String),
    #[error("merged size mismatch for upload `{upload_id}`: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        upload_id: String,
        expected: u64,
        actual: u64,
    },
    #[error("chunk {index} of upload `{upload_id}` is missing from storage")]
    ChunkMissing { upload_id: String, index: u32 },
    #[error("permanent storage hand-off failed: {0}")]
    HandOff(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Merged bytes of a complete upload.
#[derive(Debug)]
pub struct MergedUpload {
    pub upload_id: String,
    pub owner_id: String,
    pub data: Bytes,
}

const MAX_OWNER_ID_LEN: usize = 128;

/// Chunk deletions issued concurrently while cleaning up one upload.
const CLEANUP_CONCURRENCY: usize = 16;

/// Uploads whose merged bytes are on their way to permanent storage. Not
/// persisted: after a restart an interrupted hand-off can simply be retried.
#[derive(Default)]
struct HandOffs(Mutex<HashSet<String>>);

impl HandOffs {
    /// Claim the hand-off of `upload_id`, or `None` if another caller holds it.
    fn begin(self: &Arc<Self>, upload_id: &str) -> Option<HandOffClaim> {
        let mut active = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(upload_id.to_string()) {
            return None;
        }
        Some(HandOffClaim {
            handoffs: self.clone(),
            upload_id: upload_id.to_string(),
        })
    }

    fn contains(&self, upload_id: &str) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(upload_id)
    }
}

/// Released on drop, including when the request future is cancelled.
struct HandOffClaim {
    handoffs: Arc<HandOffs>,
    upload_id: String,
}

impl Drop for HandOffClaim {
    fn drop(&mut self) {
        self.handoffs
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.upload_id);
    }
}

/// Owns the upload state machine. Cheap to clone; every clone shares the same
/// registry and stores.
#[derive(Clone)]
pub struct UploadService {
    registry: Arc<SessionRegistry>,
    chunks: Arc<dyn ChunkStore>,
    permanent: Arc<dyn PermanentStore>,
    handoffs: Arc<HandOffs>,
    default_chunk_size: u64,
    max_chunk_size: u64,
}

impl UploadService {
    /// `max_chunk_size` is the largest chunk a client can actually deliver,
    /// i.e. the request body limit.
    pub fn new(
        registry: Arc<SessionRegistry>,
        chunks: Arc<dyn ChunkStore>,
        permanent: Arc<dyn PermanentStore>,
        default_chunk_size: u64,
        max_chunk_size: u64,
    ) -> Self {
        Self {
            registry,
            chunks,
            permanent,
            handoffs: Arc::new(HandOffs::default()),
            default_chunk_size,
            max_chunk_size,
        }
    }

    pub fn chunk_store(&self) -> &Arc<dyn ChunkStore> {
        &self.chunks
    }

    /// Owner ids are opaque but end up in permanent-store paths, so keep them
    /// to a conservative character set.
    fn ensure_owner_id_safe(&self, owner_id: &str) -> UploadResult<()> {
        if owner_id.is_empty() {
            return Err(UploadError::Validation("owner id is required".into()));
        }
        if owner_id.len() > MAX_OWNER_ID_LEN {
            return Err(UploadError::Validation(format!(
                "owner id must be at most {} characters",
                MAX_OWNER_ID_LEN
            )));
        }
        if owner_id == "." || owner_id == ".." {
            return Err(UploadError::Validation("owner id is not allowed".into()));
        }
        if !owner_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        {
            return Err(UploadError::Validation(
                "owner id may only contain letters, digits, '-', '_' and '.'".into(),
            ));
        }
        Ok(())
    }

    /// Look up the slot for `upload_id`; malformed ids are simply unknown.
    async fn slot(&self, upload_id: &str) -> UploadResult<Arc<SessionSlot>> {
        if !is_well_formed_upload_id(upload_id) {
            return Err(UploadError::NotFound(upload_id.to_string()));
        }
        self.registry
            .slot(upload_id)
            .await?
            .ok_or_else(|| UploadError::NotFound(upload_id.to_string()))
    }

    /// Create a session for an object of `total_size` bytes.
    ///
    /// Nothing is written to the chunk store until the first chunk arrives.
    pub async fn initialize_upload(
        &self,
        owner_id: &str,
        total_size: u64,
        chunk_size: Option<u64>,
    ) -> UploadResult<InitializedUpload> {
        self.ensure_owner_id_safe(owner_id)?;
        let chunk_size = chunk_size.unwrap_or(self.default_chunk_size);

        if total_size == 0 {
            return Err(UploadError::Validation(
                "total size must be a positive number".into(),
            ));
        }
        if chunk_size == 0 {
            return Err(UploadError::Validation(
                "chunk size must be a positive number".into(),
            ));
        }
        if chunk_size > self.max_chunk_size {
            return Err(UploadError::Validation(format!(
                "chunk size must be at most {} bytes",
                self.max_chunk_size
            )));
        }
        if i64::try_from(total_size).is_err() || i64::try_from(chunk_size).is_err() {
            return Err(UploadError::Validation("size is too large".into()));
        }
        let total_chunks = chunk_count(total_size, chunk_size)
            .and_then(|count| u32::try_from(count).ok())
            .ok_or_else(|| {
                UploadError::Validation("chunk size is too small for this total size".into())
            })?;

        let session = UploadSession::new(
            generate_upload_id(),
            owner_id.to_string(),
            generate_resume_token(),
            total_size,
            chunk_size,
            total_chunks,
            Utc::now(),
        );
        let initialized = InitializedUpload {
            upload_id: session.upload_id.clone(),
            resume_token: session.resume_token.clone(),
            total_chunks,
            chunk_size,
        };

        self.registry.register(session).await?;

        info!(
            "Progressive upload initialized: {} for owner {} ({} chunks, {})",
            initialized.upload_id,
            owner_id,
            total_chunks,
            format_bytes(total_size)
        );
        Ok(initialized)
    }

    /// Accept one chunk.
    ///
    /// The payload is verified against `digest` (MD5, hex) when given, written
    /// to the chunk store without holding the session lock, and only then
    /// recorded in the session. Re-uploading an index replaces its bytes and
    /// does not change the count.
    pub async fn upload_chunk(
        &self,
        upload_id: &str,
        chunk_index: u32,
        payload: Bytes,
        digest: Option<&str>,
    ) -> UploadResult<ChunkReceipt> {
        let slot = self.slot(upload_id).await?;

        let (total_chunks, expected_len) = {
            let mut guard = slot.lock().await;
            let session = live(&mut guard, upload_id)?;
            if session.is_finalized() {
                return Err(UploadError::AlreadyFinalized(upload_id.to_string()));
            }
            (
                session.total_chunks,
                session.expected_chunk_len(chunk_index),
            )
        };

        if chunk_index >= total_chunks {
            return Err(UploadError::OutOfRange {
                index: chunk_index,
                total_chunks,
            });
        }
        if payload.is_empty() {
            return Err(UploadError::Validation("chunk data is required".into()));
        }
        if payload.len() as u64 > expected_len {
            return Err(UploadError::Validation(format!(
                "chunk {} is {} bytes, more than the {} bytes it covers",
                chunk_index,
                payload.len(),
                expected_len
            )));
        }

        let digest = match digest {
            Some(expected) => {
                let expected = expected.trim().to_ascii_lowercase();
                let actual = md5_hex(&payload);
                if expected != actual {
                    warn!(
                        "Chunk {} of upload {} rejected: digest mismatch",
                        chunk_index, upload_id
                    );
                    return Err(UploadError::IntegrityMismatch {
                        index: chunk_index,
                        expected,
                        actual,
                    });
                }
                Some(expected)
            }
            None => None,
        };

        self.chunks
            .put_chunk(upload_id, chunk_index, &payload)
            .await?;

        let now = Utc::now();
        let mut guard = slot.lock().await;
        let mut updated = live(&mut guard, upload_id)?.clone();
        if updated.is_finalized() {
            return Err(UploadError::AlreadyFinalized(upload_id.to_string()));
        }
        updated.record_chunk(chunk_index, digest, now);

        if let Err(err) = self.registry.persist(&updated).await {
            if matches!(err, UploadError::NotFound(_)) {
                *guard = None;
                drop(guard);
                self.registry.evict(upload_id).await;
            }
            return Err(err);
        }

        let progress = UploadProgress::from_session(&updated, now);
        *guard = Some(updated);
        drop(guard);

        debug!(
            "Chunk {}/{} uploaded for upload {} ({:.1}%)",
            chunk_index + 1,
            progress.total_chunks,
            upload_id,
            progress.percent_complete
        );
        if progress.is_complete {
            info!("Upload {} received all {} chunks", upload_id, total_chunks);
        }

        Ok(ChunkReceipt {
            chunk_index,
            is_complete: progress.is_complete,
            progress,
        })
    }

    /// Merge all chunks in index order.
    ///
    /// Holds the session lock for the duration so the set of chunks cannot
    /// change underneath the merge. The session is marked finalized but kept,
    /// along with its chunks, until the caller cleans it up.
    pub async fn finalize_upload(&self, upload_id: &str) -> UploadResult<MergedUpload> {
        let slot = self.slot(upload_id).await?;
        let mut guard = slot.lock().await;
        let session = live(&mut guard, upload_id)?;

        if !session.is_complete() {
            return Err(UploadError::NotComplete {
                upload_id: upload_id.to_string(),
                uploaded: session.uploaded_chunks.len() as u32,
                total: session.total_chunks,
            });
        }

        let mut merged = BytesMut::with_capacity(session.total_size as usize);
        for index in 0..session.total_chunks {
            let chunk = self.chunks.read_chunk(upload_id, index).await?;
            merged.extend_from_slice(&chunk);
        }

        if merged.len() as u64 != session.total_size {
            error!(
                "Upload {} failed size verification: expected {}, got {}",
                upload_id,
                session.total_size,
                merged.len()
            );
            return Err(UploadError::SizeMismatch {
                upload_id: upload_id.to_string(),
                expected: session.total_size,
                actual: merged.len() as u64,
            });
        }

        if !session.is_finalized() {
            let mut updated = session.clone();
            updated.finalized_at = Some(Utc::now());
            self.registry.persist(&updated).await?;
            *session = updated;
        }

        info!(
            "Upload {} finalized: {}",
            upload_id,
            format_bytes(merged.len() as u64)
        );

        Ok(MergedUpload {
            upload_id: upload_id.to_string(),
            owner_id: session.owner_id.clone(),
            data: merged.freeze(),
        })
    }

    /// Finalize, hand the bytes to permanent storage, then clean up.
    ///
    /// Only one hand-off per upload runs at a time; a concurrent caller gets
    /// `AlreadyFinalized`. A failed hand-off leaves the session and its chunks
    /// in place so the caller can retry. A failed cleanup after a successful
    /// hand-off is only logged; the sweeper reclaims what is left.
    pub async fn finalize_and_store(&self, upload_id: &str) -> UploadResult<FinalizedUpload> {
        let _claim = self
            .handoffs
            .begin(upload_id)
            .ok_or_else(|| UploadError::AlreadyFinalized(upload_id.to_string()))?;
        let merged = self.finalize_upload(upload_id).await?;
        let size_bytes = merged.data.len() as u64;

        let reference = match self
            .permanent
            .store_object(&merged.owner_id, merged.data)
            .await
        {
            Ok(reference) => reference,
            Err(err) => {
                warn!(
                    "Hand-off of upload {} failed, keeping staged chunks: {}",
                    upload_id, err
                );
                return Err(err);
            }
        };

        if let Err(err) = self.cleanup_upload(upload_id).await {
            warn!(
                "Upload {} stored but cleanup failed, leaving it to the sweeper: {}",
                upload_id, err
            );
        }

        Ok(FinalizedUpload {
            upload_id: merged.upload_id,
            owner_id: merged.owner_id,
            size_bytes,
            reference,
        })
    }

    /// Destroy a session and its chunks. Returns the bytes reclaimed.
    ///
    /// Idempotent. The durable record goes first so a failure can never leave
    /// a complete session pointing at deleted chunks; chunk deletion after that
    /// is best-effort.
    pub async fn cleanup_upload(&self, upload_id: &str) -> UploadResult<u64> {
        Ok(self.destroy(upload_id, None).await?.unwrap_or(0))
    }

    /// Destroy a session only if it is still idle since before `cutoff`.
    ///
    /// Activity is re-checked under the session lock, so a chunk that lands
    /// after the sweeper picked the session keeps it alive. Sessions in the
    /// middle of a hand-off are skipped as well. Returns `None` when the
    /// session was spared, `Some(bytes)` when it was removed or already gone.
    pub async fn expire_upload(
        &self,
        upload_id: &str,
        cutoff: DateTime<Utc>,
    ) -> UploadResult<Option<u64>> {
        self.destroy(upload_id, Some(cutoff)).await
    }

    async fn destroy(
        &self,
        upload_id: &str,
        idle_before: Option<DateTime<Utc>>,
    ) -> UploadResult<Option<u64>> {
        if !is_well_formed_upload_id(upload_id) {
            return Ok(Some(0));
        }

        let total_chunks = match self.registry.slot(upload_id).await? {
            Some(slot) => {
                let mut guard = slot.lock().await;
                if let (Some(cutoff), Some(session)) = (idle_before, guard.as_ref()) {
                    if session.last_activity_at >= cutoff || self.handoffs.contains(upload_id) {
                        debug!("Upload {} became active again, not expiring it", upload_id);
                        return Ok(None);
                    }
                }
                match guard.take() {
                    Some(session) => {
                        if let Err(err) = self.registry.forget(&session).await {
                            *guard = Some(session);
                            return Err(err);
                        }
                        session.total_chunks
                    }
                    None => 0,
                }
            }
            None => 0,
        };

        let mut reclaimed = 0;
        let mut deletions = stream::iter(0..total_chunks)
            .map(|index| async move { (index, self.chunks.delete_chunk(upload_id, index).await) })
            .buffer_unordered(CLEANUP_CONCURRENCY);
        while let Some((index, result)) = deletions.next().await {
            match result {
                Ok(bytes) => reclaimed += bytes,
                Err(err) => warn!(
                    "Failed to delete chunk {} of upload {}: {}",
                    index, upload_id, err
                ),
            }
        }

        match self.chunks.remove_upload(upload_id).await {
            Ok(bytes) => reclaimed += bytes,
            Err(err) => warn!(
                "Failed to remove staging directory of upload {}: {}",
                upload_id, err
            ),
        }

        info!(
            "Cleaned up upload session {} ({} reclaimed)",
            upload_id,
            format_bytes(reclaimed)
        );
        Ok(Some(reclaimed))
    }

    pub async fn get_progress(&self, upload_id: &str) -> UploadResult<UploadProgress> {
        let slot = self.slot(upload_id).await?;
        let mut guard = slot.lock().await;
        let session = live(&mut guard, upload_id)?;
        Ok(UploadProgress::from_session(session, Utc::now()))
    }

    pub async fn get_missing_chunks(&self, upload_id: &str) -> UploadResult<Vec<u32>> {
        let slot = self.slot(upload_id).await?;
        let mut guard = slot.lock().await;
        Ok(live(&mut guard, upload_id)?.missing_chunks())
    }

    /// Reattach to an upload by its resume token.
    ///
    /// A pure lookup: polling with the token does not count as activity and
    /// does not postpone expiry.
    pub async fn resume_upload(&self, resume_token: &str) -> UploadResult<UploadProgress> {
        if resume_token.trim().is_empty() {
            return Err(UploadError::Validation("resume token is required".into()));
        }

        let slot = self
            .registry
            .slot_by_token(resume_token)
            .await?
            .ok_or(UploadError::ResumeTokenNotFound)?;
        let guard = slot.lock().await;
        let session = guard.as_ref().ok_or(UploadError::ResumeTokenNotFound)?;

        info!("Upload {} resumed", session.upload_id);
        Ok(UploadProgress::from_session(session, Utc::now()))
    }

    /// Progress of every session in the durable store, oldest first.
    pub async fn list_active_sessions(&self) -> UploadResult<Vec<UploadProgress>> {
        let now = Utc::now();
        Ok(self
            .registry
            .repository()
            .list()
            .await?
            .iter()
            .map(|session| UploadProgress::from_session(session, now))
            .collect())
    }

    /// Ids of every known session.
    pub async fn upload_ids(&self) -> UploadResult<Vec<String>> {
        Ok(self
            .registry
            .repository()
            .list()
            .await?
            .into_iter()
            .map(|session| session.upload_id)
            .collect())
    }

    /// Ids of sessions with no chunk written since `cutoff`.
    pub async fn inactive_since(&self, cutoff: DateTime<Utc>) -> UploadResult<Vec<String>> {
        self.registry.repository().inactive_since(cutoff).await
    }

    /// Readiness: session store reachable and staging area writable.
    pub async fn check_ready(&self) -> (UploadResult<()>, UploadResult<()>) {
        let sessions = self.registry.repository().ping().await;
        let staging = self.chunks.self_check().await;
        (sessions, staging)
    }
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}
