//! Client-facing views derived from an upload session.

use super::upload_session::UploadSession;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Returned once when an upload is initialized.
#[derive(Serialize, Clone, Debug)]
pub struct InitializedUpload {
    pub upload_id: String,
    pub resume_token: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
}

/// Snapshot of how far an upload has got.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct UploadProgress {
    pub upload_id: String,
    pub owner_id: String,
    pub uploaded_chunks: u32,
    pub total_chunks: u32,
    pub uploaded_size: u64,
    pub total_size: u64,
    pub percent_complete: f64,
    pub missing_chunks: Vec<u32>,
    pub is_complete: bool,
    pub is_finalized: bool,
    pub resume_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_seconds_remaining: Option<u64>,
}

impl UploadProgress {
    /// Derive progress from session state as of `now`.
    ///
    /// The remaining-time estimate assumes the average time per chunk so far
    /// holds for the missing ones, and is only given while the upload is
    /// partially done.
    pub fn from_session(session: &UploadSession, now: DateTime<Utc>) -> Self {
        let uploaded = session.uploaded_chunks.len() as u32;
        let missing_chunks = session.missing_chunks();
        let is_complete = session.is_complete();

        let percent_complete = if uploaded == 0 {
            0.0
        } else {
            100.0 * f64::from(uploaded) / f64::from(session.total_chunks)
        };

        let estimated_seconds_remaining = if uploaded > 0 && !is_complete {
            let elapsed_ms = (now - session.started_at).num_milliseconds().max(0) as f64;
            let per_chunk_ms = elapsed_ms / f64::from(uploaded);
            Some((per_chunk_ms * missing_chunks.len() as f64 / 1000.0).round() as u64)
        } else {
            None
        };

        Self {
            upload_id: session.upload_id.clone(),
            owner_id: session.owner_id.clone(),
            uploaded_chunks: uploaded,
            total_chunks: session.total_chunks,
            uploaded_size: session.uploaded_size(),
            total_size: session.total_size,
            percent_complete,
            missing_chunks,
            is_complete,
            is_finalized: session.is_finalized(),
            resume_token: session.resume_token.clone(),
            estimated_seconds_remaining,
        }
    }
}

/// Outcome of a single accepted chunk.
#[derive(Serialize, Clone, Debug)]
pub struct ChunkReceipt {
    pub chunk_index: u32,
    pub is_complete: bool,
    pub progress: UploadProgress,
}

/// A finished upload after its bytes were handed to permanent storage.
#[derive(Serialize, Clone, Debug)]
pub struct FinalizedUpload {
    pub upload_id: String,
    pub owner_id: String,
    pub size_bytes: u64,
    pub reference: String,
}
