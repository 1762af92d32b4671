//! Operator endpoints for the staging area sweeper.

use crate::{
    errors::AppError,
    models::cleanup::{CleanupReport, CleanupStats},
    state::AppState,
};
use axum::{Json, extract::State};

/// `POST /admin/cleanup`: run both sweeps now.
pub async fn run_cleanup(State(state): State<AppState>) -> Result<Json<CleanupReport>, AppError> {
    Ok(Json(state.sweeper.run_cleanup().await?))
}

/// `GET /admin/cleanup/stats`
pub async fn cleanup_stats(State(state): State<AppState>) -> Result<Json<CleanupStats>, AppError> {
    Ok(Json(state.sweeper.stats().await?))
}
