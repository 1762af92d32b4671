//! Hand-off target for finished uploads.
//!
//! The upload core only produces the merged bytes; where they live afterwards
//! is up to a [`PermanentStore`]. The local implementation keeps them on disk
//! below `base_path/{owner_id}/`.

use crate::services::upload_service::{UploadError, UploadResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::info;
use uuid::Uuid;

#[async_trait]
pub trait PermanentStore: Send + Sync {
    /// Store a finished object for `owner_id` and return a reference to it.
    async fn store_object(&self, owner_id: &str, data: Bytes) -> UploadResult<String>;
}

/// Writes finished objects to the local filesystem and returns `file://` URLs.
#[derive(Clone, Debug)]
pub struct LocalPermanentStore {
    base_path: PathBuf,
}

impl LocalPermanentStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

#[async_trait]
impl PermanentStore for LocalPermanentStore {
    async fn store_object(&self, owner_id: &str, data: Bytes) -> UploadResult<String> {
        let dir = self.base_path.join(owner_id);
        fs::create_dir_all(&dir).await.map_err(hand_off_error)?;

        let object_id = Uuid::new_v4();
        let final_path = dir.join(format!("{}.bin", object_id));
        let tmp_path = dir.join(format!(".tmp-{}", object_id));

        let write = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(&data).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &final_path).await
        };
        if let Err(err) = write.await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(hand_off_error(err));
        }

        let absolute = fs::canonicalize(&final_path)
            .await
            .unwrap_or_else(|_| final_path.clone());
        info!(
            "stored {} bytes for owner {} at {}",
            data.len(),
            owner_id,
            absolute.display()
        );
        Ok(format!("file://{}", absolute.display()))
    }
}

fn hand_off_error(err: std::io::Error) -> UploadError {
    UploadError::HandOff(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn stores_object_under_owner_directory() {
        let tmp = TempDir::new().unwrap();
        let store = LocalPermanentStore::new(tmp.path());

        let reference = store
            .store_object("sess1", Bytes::from_static(b"recording"))
            .await
            .unwrap();

        let path = reference.strip_prefix("file://").unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"recording");
        assert!(path.contains("sess1"));
    }
}
