//! Reports produced by the cleanup sweeper.

use serde::Serialize;

/// What one sweep removed.
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Sessions or staging entries deleted.
    pub removed: usize,
    /// Candidates that could not be deleted and were skipped.
    pub failed: usize,
    pub bytes_reclaimed: u64,
}

/// Result of a manual cleanup run (both sweeps).
#[derive(Serialize, Clone, Debug, Default)]
pub struct CleanupReport {
    pub expired_sessions: SweepOutcome,
    pub orphaned_entries: SweepOutcome,
    pub bytes_reclaimed: u64,
    pub bytes_reclaimed_human: String,
}

impl CleanupReport {
    pub fn new(expired_sessions: SweepOutcome, orphaned_entries: SweepOutcome) -> Self {
        let bytes_reclaimed = expired_sessions.bytes_reclaimed + orphaned_entries.bytes_reclaimed;
        Self {
            expired_sessions,
            orphaned_entries,
            bytes_reclaimed,
            bytes_reclaimed_human: format_bytes(bytes_reclaimed),
        }
    }
}

/// Current footprint of the staging area.
#[derive(Serialize, Clone, Debug, Default)]
pub struct CleanupStats {
    pub active_sessions: usize,
    pub staged_uploads: usize,
    pub chunk_files: u64,
    pub staged_bytes: u64,
    pub disk_usage: String,
}

/// Human readable byte count with two decimals, e.g. `1.5 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".into();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = (value * 100.0).round() / 100.0;
    format!("{} {}", rounded, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(2_500_000), "2.38 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1 GB");
    }

    #[test]
    fn report_sums_both_sweeps() {
        let sessions = SweepOutcome {
            removed: 2,
            failed: 1,
            bytes_reclaimed: 1024,
        };
        let orphans = SweepOutcome {
            removed: 1,
            failed: 0,
            bytes_reclaimed: 512,
        };
        let report = CleanupReport::new(sessions, orphans);
        assert_eq!(report.bytes_reclaimed, 1536);
        assert_eq!(report.bytes_reclaimed_human, "1.5 KB");
    }
}
