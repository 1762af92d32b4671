//! Core data models for the progressive upload service.
//!
//! Sessions map to the `upload_sessions` table via `sqlx::FromRow`; the
//! progress and cleanup views serialize as JSON via `serde`.

pub mod cleanup;
pub mod progress;
pub mod upload_session;
