//! Reclaims abandoned uploads and stray staging files.
//!
//! Two sweeps with separate retention windows:
//! - the session sweep cleans up sessions whose last chunk write is older
//!   than the session retention;
//! - the orphan sweep deletes staging entries that no session owns (chunk
//!   directories whose record is gone, temp files, leftovers) once they are
//!   older than the orphan retention.
//!
//! A failure on one candidate is logged and counted, never propagated.

use crate::models::cleanup::{CleanupReport, CleanupStats, SweepOutcome, format_bytes};
use crate::services::upload_service::{UploadResult, UploadService};
use chrono::{DateTime, TimeDelta, Utc};
use std::{collections::HashSet, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Retention windows for both sweeps.
#[derive(Clone, Copy, Debug)]
pub struct RetentionPolicy {
    pub session_retention: TimeDelta,
    pub orphan_retention: TimeDelta,
}

impl RetentionPolicy {
    pub fn from_secs(session_secs: u64, orphan_secs: u64) -> Self {
        Self {
            session_retention: delta_from_secs(session_secs),
            orphan_retention: delta_from_secs(orphan_secs),
        }
    }
}

fn delta_from_secs(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

fn retention_cutoff(now: DateTime<Utc>, retention: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(retention)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Clone)]
pub struct CleanupSweeper {
    uploads: UploadService,
    policy: RetentionPolicy,
}

impl CleanupSweeper {
    pub fn new(uploads: UploadService, policy: RetentionPolicy) -> Self {
        Self { uploads, policy }
    }

    pub async fn sweep_sessions(&self) -> UploadResult<SweepOutcome> {
        self.sweep_sessions_at(Utc::now()).await
    }

    /// Clean up every session idle since before `now - session_retention`.
    /// A session that sees a chunk between selection and removal is kept.
    pub async fn sweep_sessions_at(&self, now: DateTime<Utc>) -> UploadResult<SweepOutcome> {
        let cutoff = retention_cutoff(now, self.policy.session_retention);
        let expired = self.uploads.inactive_since(cutoff).await?;

        let mut outcome = SweepOutcome::default();
        for upload_id in expired {
            match self.uploads.expire_upload(&upload_id, cutoff).await {
                Ok(Some(bytes)) => {
                    outcome.removed += 1;
                    outcome.bytes_reclaimed += bytes;
                }
                Ok(None) => {}
                Err(err) => {
                    outcome.failed += 1;
                    error!("Failed to expire upload {}: {}", upload_id, err);
                }
            }
        }

        if outcome.removed > 0 || outcome.failed > 0 {
            info!(
                "Session sweep expired {} uploads ({} failed, {} reclaimed)",
                outcome.removed,
                outcome.failed,
                format_bytes(outcome.bytes_reclaimed)
            );
        }
        Ok(outcome)
    }

    pub async fn sweep_orphans(&self) -> UploadResult<SweepOutcome> {
        self.sweep_orphans_at(Utc::now()).await
    }

    /// Delete staging entries not owned by a live session and untouched since
    /// before `now - orphan_retention`.
    pub async fn sweep_orphans_at(&self, now: DateTime<Utc>) -> UploadResult<SweepOutcome> {
        let cutoff = retention_cutoff(now, self.policy.orphan_retention);
        let live: HashSet<String> = self.uploads.upload_ids().await?.into_iter().collect();
        let store = self.uploads.chunk_store();

        let mut outcome = SweepOutcome::default();
        for entry in store.scan().await? {
            if live.contains(&entry.name) || entry.modified >= cutoff {
                continue;
            }
            match store.remove_entry(&entry).await {
                Ok(bytes) => {
                    outcome.removed += 1;
                    outcome.bytes_reclaimed += bytes;
                }
                Err(err) => {
                    outcome.failed += 1;
                    warn!("Failed to remove orphaned staging entry {}: {}", entry.name, err);
                }
            }
        }

        if outcome.removed > 0 || outcome.failed > 0 {
            info!(
                "Cleaned up {} orphaned staging entries ({} failed, {} reclaimed)",
                outcome.removed,
                outcome.failed,
                format_bytes(outcome.bytes_reclaimed)
            );
        }
        Ok(outcome)
    }

    /// Manual trigger: run both sweeps now and report what was removed.
    pub async fn run_cleanup(&self) -> UploadResult<CleanupReport> {
        self.run_cleanup_at(Utc::now()).await
    }

    pub async fn run_cleanup_at(&self, now: DateTime<Utc>) -> UploadResult<CleanupReport> {
        info!("Starting cleanup process");
        let sessions = self.sweep_sessions_at(now).await?;
        let orphans = self.sweep_orphans_at(now).await?;
        let report = CleanupReport::new(sessions, orphans);
        info!(
            "Cleanup process completed ({} reclaimed)",
            report.bytes_reclaimed_human
        );
        Ok(report)
    }

    /// Current footprint of the staging area.
    pub async fn stats(&self) -> UploadResult<CleanupStats> {
        let active_sessions = self.uploads.upload_ids().await?.len();
        let entries = self.uploads.chunk_store().scan().await?;

        let staged_uploads = entries.iter().filter(|entry| entry.is_dir).count();
        let chunk_files = entries.iter().map(|entry| entry.files).sum();
        let staged_bytes = entries.iter().map(|entry| entry.bytes).sum();

        Ok(CleanupStats {
            active_sessions,
            staged_uploads,
            chunk_files,
            staged_bytes,
            disk_usage: format_bytes(staged_bytes),
        })
    }
}

/// Which sweep a background task runs.
#[derive(Clone, Copy, Debug)]
enum Sweep {
    Sessions,
    Orphans,
}

/// Background timers driving a [`CleanupSweeper`]. Dropping the scheduler
/// does not stop the tasks; call [`CleanupScheduler::shutdown`].
pub struct CleanupScheduler {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl CleanupScheduler {
    /// Spawn both sweeps. The orphan sweep runs once right away, the session
    /// sweep first fires after one interval.
    pub fn start(
        sweeper: CleanupSweeper,
        session_interval: Duration,
        orphan_interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handles = vec![
            tokio::spawn(run_sweep_loop(
                sweeper.clone(),
                Sweep::Sessions,
                Instant::now() + session_interval,
                session_interval,
                cancel.clone(),
            )),
            tokio::spawn(run_sweep_loop(
                sweeper,
                Sweep::Orphans,
                Instant::now(),
                orphan_interval,
                cancel.clone(),
            )),
        ];

        info!(
            "Cleanup scheduler started (sessions every {}s, orphans every {}s)",
            session_interval.as_secs(),
            orphan_interval.as_secs()
        );
        Self { cancel, handles }
    }

    /// Stop both timers and wait for a sweep in progress to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!("Cleanup task ended abnormally: {}", err);
            }
        }
        info!("Cleanup scheduler stopped");
    }
}

async fn run_sweep_loop(
    sweeper: CleanupSweeper,
    sweep: Sweep,
    start: Instant,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let result = match sweep {
                    Sweep::Sessions => sweeper.sweep_sessions().await,
                    Sweep::Orphans => sweeper.sweep_orphans().await,
                };
                if let Err(err) = result {
                    error!("{:?} sweep failed: {}", sweep, err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::upload_service::{
        UploadError,
        tests::{service, service_with},
    };
    use crate::services::session_repository::tests::memory_pool;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn policy() -> RetentionPolicy {
        RetentionPolicy::from_secs(24 * 3600, 48 * 3600)
    }

    #[tokio::test]
    async fn expired_session_is_swept_and_token_stops_resolving() {
        let tmp = TempDir::new().unwrap();
        let uploads = service(&tmp).await;
        let init = uploads.initialize_upload("sess1", 20, Some(10)).await.unwrap();
        uploads
            .upload_chunk(&init.upload_id, 0, Bytes::from_static(b"0123456789"), None)
            .await
            .unwrap();

        let sweeper = CleanupSweeper::new(uploads.clone(), policy());

        let outcome = sweeper.sweep_sessions().await.unwrap();
        assert_eq!(outcome, SweepOutcome::default());

        let later = Utc::now() + TimeDelta::hours(25);
        let outcome = sweeper.sweep_sessions_at(later).await.unwrap();
        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.bytes_reclaimed, 10);

        assert!(matches!(
            uploads.resume_upload(&init.resume_token).await.unwrap_err(),
            UploadError::ResumeTokenNotFound
        ));
    }

    #[tokio::test]
    async fn orphan_sweep_spares_live_uploads() {
        let tmp = TempDir::new().unwrap();
        let uploads = service(&tmp).await;
        let live = uploads.initialize_upload("sess1", 20, Some(10)).await.unwrap();
        uploads
            .upload_chunk(&live.upload_id, 0, Bytes::from_static(b"0123456789"), None)
            .await
            .unwrap();

        let staging = tmp.path().join("staging");
        let orphan_dir = staging.join("ffffffffffffffffffffffffffffffff");
        std::fs::create_dir_all(&orphan_dir).unwrap();
        std::fs::write(orphan_dir.join("chunk_000000"), b"abcd").unwrap();
        std::fs::write(staging.join(".tmp-leftover"), b"xy").unwrap();

        let sweeper = CleanupSweeper::new(uploads.clone(), policy());

        let outcome = sweeper.sweep_orphans().await.unwrap();
        assert_eq!(outcome.removed, 0);

        let later = Utc::now() + TimeDelta::hours(49);
        let outcome = sweeper.sweep_orphans_at(later).await.unwrap();
        assert_eq!(outcome.removed, 2);
        assert_eq!(outcome.bytes_reclaimed, 6);
        assert!(!orphan_dir.exists());
        assert!(staging.join(&live.upload_id).exists());
        assert_eq!(uploads.get_progress(&live.upload_id).await.unwrap().uploaded_chunks, 1);
    }

    #[tokio::test]
    async fn run_cleanup_reports_both_sweeps_and_stats() {
        let tmp = TempDir::new().unwrap();
        let uploads = service_with(memory_pool().await, &tmp);
        for owner in ["a", "b"] {
            let id = uploads
                .initialize_upload(owner, 8, Some(4))
                .await
                .unwrap()
                .upload_id;
            uploads
                .upload_chunk(&id, 1, Bytes::from_static(b"wxyz"), None)
                .await
                .unwrap();
        }

        let sweeper = CleanupSweeper::new(uploads.clone(), policy());
        let stats = sweeper.stats().await.unwrap();
        assert_eq!(stats.active_sessions, 2);
        assert_eq!(stats.staged_uploads, 2);
        assert_eq!(stats.chunk_files, 2);
        assert_eq!(stats.staged_bytes, 8);
        assert_eq!(stats.disk_usage, "8 B");

        let report = sweeper
            .run_cleanup_at(Utc::now() + TimeDelta::days(3))
            .await
            .unwrap();
        assert_eq!(report.expired_sessions.removed, 2);
        assert_eq!(report.orphaned_entries.removed, 0);
        assert_eq!(report.bytes_reclaimed, 8);

        let stats = sweeper.stats().await.unwrap();
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.staged_bytes, 0);
    }

    #[tokio::test]
    async fn scheduler_stops_on_shutdown() {
        let tmp = TempDir::new().unwrap();
        let uploads = service(&tmp).await;
        let sweeper = CleanupSweeper::new(uploads, policy());

        let scheduler =
            CleanupScheduler::start(sweeper, Duration::from_secs(3600), Duration::from_secs(6 * 3600));
        scheduler.shutdown().await;
    }

    #[test]
    fn huge_retention_saturates() {
        let policy = RetentionPolicy::from_secs(u64::MAX, 60);
        assert_eq!(policy.session_retention, TimeDelta::MAX);
        assert_eq!(policy.orphan_retention, TimeDelta::minutes(1));
        assert_eq!(retention_cutoff(Utc::now(), policy.session_retention), DateTime::<Utc>::MIN_UTC);
    }
}
