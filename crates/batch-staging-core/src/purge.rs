use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How often a long sweep reports progress.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(60);

/// Accounting threaded through one reclamation sweep.
///
/// Created when a sweep starts and discarded after it; nothing here outlives
/// the sweep except the [`PurgeStats`] snapshot.
#[derive(Debug, Clone)]
pub struct PurgeContext {
    started_at: DateTime<Utc>,
    start: Instant,
    last_progress: Instant,
    progress_interval: Duration,
    purged_file_count: u64,
    purged_file_size: u64,
    purged_memory_count: u64,
    purged_memory_size: u64,
}

/// Serializable summary of a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeStats {
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub purged_file_count: u64,
    pub purged_file_size: u64,
    pub purged_memory_count: u64,
    pub purged_memory_size: u64,
}

impl PurgeStats {
    pub fn total_bytes(&self) -> u64 {
        self.purged_file_size + self.purged_memory_size
    }
}

impl PurgeContext {
    pub fn new() -> Self {
        Self::with_progress_interval(DEFAULT_PROGRESS_INTERVAL)
    }

    pub fn with_progress_interval(progress_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            started_at: Utc::now(),
            start: now,
            last_progress: now,
            progress_interval,
            purged_file_count: 0,
            purged_file_size: 0,
            purged_memory_count: 0,
            purged_memory_size: 0,
        }
    }

    pub fn record_file_purge(&mut self, bytes: u64) {
        self.purged_file_count += 1;
        self.purged_file_size += bytes;
    }

    pub fn record_memory_purge(&mut self, bytes: u64) {
        self.purged_memory_count += 1;
        self.purged_memory_size += bytes;
    }

    pub fn purged_file_count(&self) -> u64 {
        self.purged_file_count
    }

    pub fn purged_file_size(&self) -> u64 {
        self.purged_file_size
    }

    pub fn purged_memory_count(&self) -> u64 {
        self.purged_memory_count
    }

    pub fn purged_memory_size(&self) -> u64 {
        self.purged_memory_size
    }

    /// Bytes reclaimed so far, file and memory.
    pub fn total_bytes(&self) -> u64 {
        self.purged_file_size + self.purged_memory_size
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Returns true at most once per progress interval.
    pub fn progress_due(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_progress) >= self.progress_interval {
            self.last_progress = now;
            true
        } else {
            false
        }
    }

    pub fn stats(&self) -> PurgeStats {
        PurgeStats {
            started_at: self.started_at,
            elapsed_ms: u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX),
            purged_file_count: self.purged_file_count,
            purged_file_size: self.purged_file_size,
            purged_memory_count: self.purged_memory_count,
            purged_memory_size: self.purged_memory_size,
        }
    }
}

impl Default for PurgeContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let mut ctx = PurgeContext::new();
        ctx.record_file_purge(100);
        ctx.record_file_purge(50);
        ctx.record_memory_purge(7);

        assert_eq!(ctx.purged_file_count(), 2);
        assert_eq!(ctx.purged_file_size(), 150);
        assert_eq!(ctx.purged_memory_count(), 1);
        assert_eq!(ctx.purged_memory_size(), 7);
        assert_eq!(ctx.total_bytes(), 157);

        let stats = ctx.stats();
        assert_eq!(stats.total_bytes(), 157);
        assert_eq!(stats.purged_file_count, 2);
    }

    #[test]
    fn test_progress_due_once_per_interval() {
        let mut ctx = PurgeContext::with_progress_interval(Duration::from_millis(20));
        assert!(!ctx.progress_due());
        std::thread::sleep(Duration::from_millis(30));
        assert!(ctx.progress_due());
        assert!(!ctx.progress_due());
    }

    #[test]
    fn test_zero_interval_always_due() {
        let mut ctx = PurgeContext::with_progress_interval(Duration::ZERO);
        assert!(ctx.progress_due());
        assert!(ctx.progress_due());
    }

    #[test]
    fn test_stats_serialize() {
        let mut ctx = PurgeContext::new();
        ctx.record_memory_purge(11);
        let json = serde_json::to_value(ctx.stats()).unwrap();
        assert_eq!(json["purged_memory_size"], 11);
        assert_eq!(json["purged_file_count"], 0);
    }
}
