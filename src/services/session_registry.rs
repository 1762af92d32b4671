//! In-memory index of upload sessions over a durable repository.
//!
//! Every session lives in its own [`SessionSlot`], a mutex that serializes
//! bookkeeping for that upload only. The index maps both `upload_id` and
//! `resume_token` to the slot. It starts empty and is filled lazily: a lookup
//! miss loads the record from the repository, which is how sessions survive a
//! restart.
//!
//! A slot holding `None` belongs to a session that was cleaned up while
//! someone still held a handle to it.
//!
//! Rehydration loads the record while holding the index write lock. Cleanup
//! deletes the record before evicting the slot, so a load can never race a
//! delete and cache a session that no longer exists.

use crate::models::upload_session::UploadSession;
use crate::services::session_repository::SessionRepository;
use crate::services::upload_service::{UploadError, UploadResult};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

pub type SessionSlot = Mutex<Option<UploadSession>>;

#[derive(Default)]
struct SessionIndex {
    by_id: HashMap<String, Arc<SessionSlot>>,
    by_token: HashMap<String, String>,
}

impl SessionIndex {
    fn slot_by_token(&self, resume_token: &str) -> Option<Arc<SessionSlot>> {
        self.by_token
            .get(resume_token)
            .and_then(|upload_id| self.by_id.get(upload_id))
            .cloned()
    }

    /// Insert a session unless it is already indexed; returns the slot that
    /// ends up in the index.
    fn insert(&mut self, session: UploadSession) -> Arc<SessionSlot> {
        if let Some(existing) = self.by_id.get(&session.upload_id) {
            return existing.clone();
        }

        let upload_id = session.upload_id.clone();
        self.by_token
            .insert(session.resume_token.clone(), upload_id.clone());
        let slot = Arc::new(Mutex::new(Some(session)));
        self.by_id.insert(upload_id, slot.clone());
        slot
    }
}

pub struct SessionRegistry {
    repository: Arc<dyn SessionRepository>,
    index: RwLock<SessionIndex>,
}

impl SessionRegistry {
    pub fn new(repository: Arc<dyn SessionRepository>) -> Self {
        Self {
            repository,
            index: RwLock::new(SessionIndex::default()),
        }
    }

    pub fn repository(&self) -> &Arc<dyn SessionRepository> {
        &self.repository
    }

    /// Persist a new session, then make it reachable by id and token.
    pub async fn register(&self, session: UploadSession) -> UploadResult<()> {
        self.repository.insert(&session).await?;
        self.index.write().await.insert(session);
        Ok(())
    }

    /// Handle to the session with `upload_id`, loading it from the repository
    /// on a cache miss.
    pub async fn slot(&self, upload_id: &str) -> UploadResult<Option<Arc<SessionSlot>>> {
        if let Some(slot) = self.index.read().await.by_id.get(upload_id) {
            return Ok(Some(slot.clone()));
        }

        let mut index = self.index.write().await;
        if let Some(slot) = index.by_id.get(upload_id) {
            return Ok(Some(slot.clone()));
        }
        match self.repository.load(upload_id).await? {
            Some(session) => {
                debug!("rehydrated upload {} from durable store", upload_id);
                Ok(Some(index.insert(session)))
            }
            None => Ok(None),
        }
    }

    /// Handle to the session owning `resume_token`, loading it on a miss.
    pub async fn slot_by_token(&self, resume_token: &str) -> UploadResult<Option<Arc<SessionSlot>>> {
        if let Some(slot) = self.index.read().await.slot_by_token(resume_token) {
            return Ok(Some(slot));
        }

        let mut index = self.index.write().await;
        if let Some(slot) = index.slot_by_token(resume_token) {
            return Ok(Some(slot));
        }
        match self.repository.load_by_token(resume_token).await? {
            Some(session) => {
                debug!(
                    "rehydrated upload {} from durable store by resume token",
                    session.upload_id
                );
                Ok(Some(index.insert(session)))
            }
            None => Ok(None),
        }
    }

    /// Write a mutated session through to the repository.
    ///
    /// Callers hold the session's slot lock and only replace the in-memory
    /// value after this succeeds, so both copies agree.
    pub async fn persist(&self, session: &UploadSession) -> UploadResult<()> {
        self.repository.update(session).await
    }

    /// Delete the durable record and drop the session from the index.
    pub async fn forget(&self, session: &UploadSession) -> UploadResult<()> {
        self.repository.delete(&session.upload_id).await?;
        self.evict(&session.upload_id).await;
        Ok(())
    }

    /// Drop a session from the index without touching the repository.
    pub async fn evict(&self, upload_id: &str) {
        let mut index = self.index.write().await;
        index.by_id.remove(upload_id);
        index.by_token.retain(|_, id| id != upload_id);
    }

    /// Number of sessions currently held in memory.
    #[cfg(test)]
    pub async fn cached(&self) -> usize {
        self.index.read().await.by_id.len()
    }
}

/// The session behind a locked slot, or `NotFound` if it was cleaned up in
/// the meantime.
pub fn live<'a>(
    guard: &'a mut Option<UploadSession>,
    upload_id: &str,
) -> UploadResult<&'a mut UploadSession> {
    guard
        .as_mut()
        .ok_or_else(|| UploadError::NotFound(upload_id.to_string()))
}
