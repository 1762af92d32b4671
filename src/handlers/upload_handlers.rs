//! HTTP handlers for the progressive upload lifecycle.
//! Chunk bodies are small enough to buffer; everything else is JSON and is
//! delegated to `UploadService`.

use crate::{
    errors::AppError,
    models::progress::{ChunkReceipt, FinalizedUpload, InitializedUpload, UploadProgress},
    state::AppState,
};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Hex MD5 of the chunk body.
const CHUNK_MD5_HEADER: &str = "x-chunk-md5";
/// Standard base64 MD5 of the body.
const CONTENT_MD5_HEADER: &str = "content-md5";

#[derive(Debug, Deserialize)]
pub struct InitUploadReq {
    pub total_size: u64,
    pub chunk_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    pub finalize: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ResumeReq {
    pub resume_token: String,
}

#[derive(Debug, Serialize)]
pub struct ChunkUploadResponse {
    #[serde(flatten)]
    pub receipt: ChunkReceipt,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized: Option<FinalizedUpload>,
}

#[derive(Debug, Serialize)]
pub struct MissingChunksResponse {
    pub upload_id: String,
    pub missing_chunks: Vec<u32>,
}

#[derive(Debug, Serialize)]
pub struct ActiveSessionsResponse {
    pub sessions: Vec<UploadProgress>,
}

/// `POST /uploads/init/{owner_id}`
pub async fn init_upload(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
    Json(req): Json<InitUploadReq>,
) -> Result<(StatusCode, Json<InitializedUpload>), AppError> {
    let initialized = state
        .uploads
        .initialize_upload(&owner_id, req.total_size, req.chunk_size)
        .await?;
    Ok((StatusCode::CREATED, Json(initialized)))
}

/// `PUT /uploads/{upload_id}/chunks/{chunk_index}`
///
/// With `?finalize=true` the upload is finalized and handed off as soon as
/// this chunk completes it.
pub async fn upload_chunk(
    State(state): State<AppState>,
    Path((upload_id, chunk_index)): Path<(String, u32)>,
    Query(query): Query<ChunkQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ChunkUploadResponse>, AppError> {
    let digest = chunk_digest(&headers)?;
    debug!(
        "chunk {} for upload {} ({} bytes, digest: {})",
        chunk_index,
        upload_id,
        body.len(),
        digest.is_some()
    );

    let receipt = state
        .uploads
        .upload_chunk(&upload_id, chunk_index, body, digest.as_deref())
        .await?;

    let finalized = if receipt.is_complete && query.finalize.unwrap_or(false) {
        Some(state.uploads.finalize_and_store(&upload_id).await?)
    } else {
        None
    };

    Ok(Json(ChunkUploadResponse { receipt, finalized }))
}

/// `GET /uploads/{upload_id}/progress`
pub async fn get_progress(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<UploadProgress>, AppError> {
    Ok(Json(state.uploads.get_progress(&upload_id).await?))
}

/// `GET /uploads/{upload_id}/missing`
pub async fn get_missing_chunks(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<MissingChunksResponse>, AppError> {
    let missing_chunks = state.uploads.get_missing_chunks(&upload_id).await?;
    Ok(Json(MissingChunksResponse {
        upload_id,
        missing_chunks,
    }))
}

/// `POST /uploads/{upload_id}/finalize`
pub async fn finalize_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<FinalizedUpload>, AppError> {
    Ok(Json(state.uploads.finalize_and_store(&upload_id).await?))
}

/// `DELETE /uploads/{upload_id}`: abandon an upload. Unknown ids succeed too.
pub async fn cancel_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.uploads.cleanup_upload(&upload_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /uploads/resume`
pub async fn resume_upload(
    State(state): State<AppState>,
    Json(req): Json<ResumeReq>,
) -> Result<Json<UploadProgress>, AppError> {
    Ok(Json(state.uploads.resume_upload(&req.resume_token).await?))
}

/// `GET /uploads/active`
pub async fn list_active_uploads(
    State(state): State<AppState>,
) -> Result<Json<ActiveSessionsResponse>, AppError> {
    let sessions = state.uploads.list_active_sessions().await?;
    Ok(Json(ActiveSessionsResponse { sessions }))
}

/// Expected MD5 of a chunk body as lowercase hex, if the client sent one.
/// `x-chunk-md5` wins over `Content-MD5`. A well-encoded header carrying the
/// wrong digest is passed on and fails the integrity check (409); only an
/// undecodable header is a bad request.
fn chunk_digest(headers: &HeaderMap) -> Result<Option<String>, AppError> {
    if let Some(value) = headers.get(CHUNK_MD5_HEADER) {
        let digest = value
            .to_str()
            .map_err(|_| AppError::bad_request("x-chunk-md5 must be ASCII"))?
            .trim()
            .to_ascii_lowercase();
        return Ok(Some(digest));
    }

    if let Some(value) = headers.get(CONTENT_MD5_HEADER) {
        let raw = value
            .to_str()
            .ok()
            .and_then(|v| general_purpose::STANDARD.decode(v.trim()).ok())
            .ok_or_else(|| AppError::bad_request("Content-MD5 must be base64"))?;
        return Ok(Some(hex::encode(raw)));
    }

    Ok(None)
}
