//! Shared state handed to every request handler.

use crate::services::{cleanup_service::CleanupSweeper, upload_service::UploadService};

#[derive(Clone)]
pub struct AppState {
    pub uploads: UploadService,
    pub sweeper: CleanupSweeper,
}
