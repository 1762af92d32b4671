//! Chunk payload storage.
//!
//! Payloads are addressed by `(upload_id, chunk_index)`. The disk
//! implementation lays them out as `base_path/{upload_id}/chunk_{index:06}`,
//! so every upload owns one directory and no cross-upload locking is needed.

use crate::services::upload_service::{UploadError, UploadResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::SystemTime,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

/// One top-level entry of the staging area, as seen by stats and the orphan
/// sweep.
#[derive(Clone, Debug)]
pub struct StagedEntry {
    /// Directory or file name directly below the staging root.
    pub name: String,
    pub is_dir: bool,
    /// Regular files in the entry (1 for a plain file).
    pub files: u64,
    pub bytes: u64,
    /// Most recent modification of the entry or anything inside it.
    pub modified: DateTime<Utc>,
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Store `payload` for `(upload_id, index)`, replacing any previous bytes.
    /// The write is complete and durable when this returns.
    async fn put_chunk(&self, upload_id: &str, index: u32, payload: &[u8]) -> UploadResult<()>;

    /// Read back the bytes of one chunk. Fails with `ChunkMissing` when absent.
    async fn read_chunk(&self, upload_id: &str, index: u32) -> UploadResult<Bytes>;

    /// Delete one chunk, returning the bytes freed (0 if it did not exist).
    async fn delete_chunk(&self, upload_id: &str, index: u32) -> UploadResult<u64>;

    /// Remove whatever is left of an upload, returning the bytes freed.
    async fn remove_upload(&self, upload_id: &str) -> UploadResult<u64>;

    /// List the top-level entries of the staging area.
    async fn scan(&self) -> UploadResult<Vec<StagedEntry>>;

    /// Delete a staging entry returned by [`ChunkStore::scan`].
    async fn remove_entry(&self, entry: &StagedEntry) -> UploadResult<u64>;

    /// Write/read/delete round trip used by readiness checks.
    async fn self_check(&self) -> UploadResult<()>;
}

/// Chunk store backed by the local filesystem.
#[derive(Clone, Debug)]
pub struct DiskChunkStore {
    base_path: PathBuf,
}

impl DiskChunkStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Directory holding every chunk of one upload.
    fn upload_dir(&self, upload_id: &str) -> io::Result<PathBuf> {
        ensure_component_safe(upload_id)?;
        Ok(self.base_path.join(upload_id))
    }

    fn chunk_path(&self, upload_id: &str, index: u32) -> io::Result<PathBuf> {
        Ok(self
            .upload_dir(upload_id)?
            .join(format!("chunk_{:06}", index)))
    }
}

#[async_trait]
impl ChunkStore for DiskChunkStore {
    /// Writes to a temporary file, fsyncs, then renames over the final path so
    /// a reader never sees a partially written chunk.
    async fn put_chunk(&self, upload_id: &str, index: u32, payload: &[u8]) -> UploadResult<()> {
        let dir = self.upload_dir(upload_id)?;
        fs::create_dir_all(&dir).await?;

        let chunk_path = self.chunk_path(upload_id, index)?;
        let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));

        let write = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(payload).await?;
            file.flush().await?;
            file.sync_all().await
        };
        if let Err(err) = write.await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &chunk_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&chunk_path).await?;
                fs::rename(&tmp_path, &chunk_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(UploadError::Io(err));
            }
        }

        debug!(
            "stored chunk {} of {} ({} bytes)",
            index,
            upload_id,
            payload.len()
        );
        Ok(())
    }

    async fn read_chunk(&self, upload_id: &str, index: u32) -> UploadResult<Bytes> {
        let path = self.chunk_path(upload_id, index)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(UploadError::ChunkMissing {
                upload_id: upload_id.to_string(),
                index,
            }),
            Err(err) => Err(UploadError::Io(err)),
        }
    }

    async fn delete_chunk(&self, upload_id: &str, index: u32) -> UploadResult<u64> {
        let path = self.chunk_path(upload_id, index)?;
        let size = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(UploadError::Io(err)),
        };
        match fs::remove_file(&path).await {
            Ok(()) => Ok(size),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(UploadError::Io(err)),
        }
    }

    async fn remove_upload(&self, upload_id: &str) -> UploadResult<u64> {
        let dir = self.upload_dir(upload_id)?;
        let (_, bytes, _) = match dir_usage(&dir).await {
            Ok(usage) => usage,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(UploadError::Io(err)),
        };
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!("removed upload directory {}", dir.display());
                Ok(bytes)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(UploadError::Io(err)),
        }
    }

    async fn scan(&self) -> UploadResult<Vec<StagedEntry>> {
        let mut entries = Vec::new();
        let mut dir = match fs::read_dir(&self.base_path).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(UploadError::Io(err)),
        };

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(UploadError::Io(err)),
            };

            let staged = if meta.is_dir() {
                let (files, bytes, newest) = match dir_usage(&entry.path()).await {
                    Ok(usage) => usage,
                    Err(err) if err.kind() == ErrorKind::NotFound => continue,
                    Err(err) => return Err(UploadError::Io(err)),
                };
                let modified = newest.max(modified_at(&meta));
                StagedEntry {
                    name,
                    is_dir: true,
                    files,
                    bytes,
                    modified,
                }
            } else {
                StagedEntry {
                    name,
                    is_dir: false,
                    files: 1,
                    bytes: meta.len(),
                    modified: modified_at(&meta),
                }
            };
            entries.push(staged);
        }

        Ok(entries)
    }

    async fn remove_entry(&self, entry: &StagedEntry) -> UploadResult<u64> {
        ensure_component_safe(&entry.name)?;
        let path = self.base_path.join(&entry.name);
        let result = if entry.is_dir {
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_file(&path).await
        };
        match result {
            Ok(()) => Ok(entry.bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(UploadError::Io(err)),
        }
    }

    async fn self_check(&self) -> UploadResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read? != b"readyz" {
            return Err(UploadError::Io(io::Error::new(
                ErrorKind::Other,
                "staging self-check content mismatch",
            )));
        }
        Ok(())
    }
}

/// Rejects names that could escape the staging root.
fn ensure_component_safe(name: &str) -> io::Result<()> {
    let safe = !name.is_empty()
        && name != "."
        && name != ".."
        && !name
            .bytes()
            .any(|b| b == b'/' || b == b'\\' || b == b'\0' || b.is_ascii_control());
    if safe {
        Ok(())
    } else {
        Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("invalid staging entry name `{}`", name),
        ))
    }
}

/// File count, total bytes and newest mtime of the regular files directly in
/// `dir`. Upload directories are flat.
async fn dir_usage(dir: &Path) -> io::Result<(u64, u64, DateTime<Utc>)> {
    let mut files = 0;
    let mut bytes = 0;
    let mut newest = DateTime::<Utc>::MIN_UTC;

    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        if meta.is_file() {
            files += 1;
            bytes += meta.len();
            newest = newest.max(modified_at(&meta));
        }
    }

    Ok((files, bytes, newest))
}

fn modified_at(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::from(SystemTime::now()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ID: &str = "0123456789abcdef0123456789abcdef";

    #[tokio::test]
    async fn put_overwrites_previous_payload() {
        let tmp = TempDir::new().unwrap();
        let store = DiskChunkStore::new(tmp.path());

        store.put_chunk(ID, 0, b"first").await.unwrap();
        store.put_chunk(ID, 0, b"second").await.unwrap();

        assert_eq!(store.read_chunk(ID, 0).await.unwrap(), Bytes::from("second"));
        assert!(tmp.path().join(ID).join("chunk_000000").is_file());
    }

    #[tokio::test]
    async fn reading_absent_chunk_is_chunk_missing() {
        let tmp = TempDir::new().unwrap();
        let store = DiskChunkStore::new(tmp.path());

        let err = store.read_chunk(ID, 7).await.unwrap_err();
        assert!(matches!(err, UploadError::ChunkMissing { index: 7, .. }));
    }

    #[tokio::test]
    async fn deletes_are_best_effort() {
        let tmp = TempDir::new().unwrap();
        let store = DiskChunkStore::new(tmp.path());

        store.put_chunk(ID, 1, b"abcd").await.unwrap();
        assert_eq!(store.delete_chunk(ID, 1).await.unwrap(), 4);
        assert_eq!(store.delete_chunk(ID, 1).await.unwrap(), 0);
        assert_eq!(store.remove_upload(ID).await.unwrap(), 0);
        assert!(!tmp.path().join(ID).exists());
        assert_eq!(store.remove_upload(ID).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn scan_reports_directories_and_stray_files() {
        let tmp = TempDir::new().unwrap();
        let store = DiskChunkStore::new(tmp.path());

        store.put_chunk(ID, 0, b"12345").await.unwrap();
        store.put_chunk(ID, 1, b"678").await.unwrap();
        std::fs::write(tmp.path().join("stray.json"), b"{}").unwrap();

        let mut entries = store.scan().await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 2);

        assert_eq!(entries[0].name, ID);
        assert!(entries[0].is_dir);
        assert_eq!(entries[0].files, 2);
        assert_eq!(entries[0].bytes, 8);

        assert_eq!(entries[1].name, "stray.json");
        assert_eq!(store.remove_entry(&entries[1]).await.unwrap(), 2);
        assert_eq!(store.remove_entry(&entries[0]).await.unwrap(), 8);
        assert!(store.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_traversal_ids() {
        let tmp = TempDir::new().unwrap();
        let store = DiskChunkStore::new(tmp.path());

        let err = store.put_chunk("../escape", 0, b"x").await.unwrap_err();
        assert!(matches!(err, UploadError::Io(_)));
        assert!(store.self_check().await.is_ok());
    }
}
