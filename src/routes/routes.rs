//! Defines routes for the progressive upload API.
//!
//! ## Structure
//! - **Upload lifecycle**
//!   - `POST   /uploads/init/{owner_id}`: start an upload
//!   - `PUT    /uploads/{upload_id}/chunks/{chunk_index}`: send one chunk
//!   - `GET    /uploads/{upload_id}/progress`: progress snapshot
//!   - `GET    /uploads/{upload_id}/missing`: indices still to send
//!   - `POST   /uploads/{upload_id}/finalize`: merge and hand off
//!   - `DELETE /uploads/{upload_id}`: abandon and clean up
//!   - `POST   /uploads/resume`: look up an upload by resume token
//!   - `GET    /uploads/active`: every open upload
//!
//! - **Operations**
//!   - `POST   /admin/cleanup`: run the sweeper now
//!   - `GET    /admin/cleanup/stats`: staging area footprint
//!   - `GET    /healthz`, `GET /readyz`

use crate::{
    handlers::{
        cleanup_handlers::{cleanup_stats, run_cleanup},
        health_handlers::{healthz, readyz},
        upload_handlers::{
            cancel_upload, finalize_upload, get_missing_chunks, get_progress, init_upload,
            list_active_uploads, resume_upload, upload_chunk,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{delete, get, post, put},
};

/// Build the router for every endpoint. Handlers share `AppState`.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Upload lifecycle
        .route("/uploads/init/{owner_id}", post(init_upload))
        .route("/uploads/resume", post(resume_upload))
        .route("/uploads/active", get(list_active_uploads))
        .route(
            "/uploads/{upload_id}/chunks/{chunk_index}",
            put(upload_chunk),
        )
        .route("/uploads/{upload_id}/progress", get(get_progress))
        .route("/uploads/{upload_id}/missing", get(get_missing_chunks))
        .route("/uploads/{upload_id}/finalize", post(finalize_upload))
        .route("/uploads/{upload_id}", delete(cancel_upload))
        // Operations
        .route("/admin/cleanup", post(run_cleanup))
        .route("/admin/cleanup/stats", get(cleanup_stats))
}
