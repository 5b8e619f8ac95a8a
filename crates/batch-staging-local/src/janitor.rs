use std::sync::Arc;
use std::time::Duration;

use batch_staging_core::{resource_path, PurgeContext, PurgeStats};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::lock::StagingFileLock;
use crate::stage::StagingManager;

/// Key of the lock that elects one sweeping node per shared staging root.
pub const PURGE_LOCK: &str = "purge";

/// How the janitor sweeps. The purge ttl comes from the staging config.
#[derive(Debug, Clone)]
pub struct JanitorSettings {
    /// Pause between sweeps
    pub purge_interval: Duration,
    /// Age beyond which another node's purge lock is considered abandoned
    pub lock_timeout: Duration,
    /// Identifies this process in lock markers
    pub instance_id: String,
}

impl JanitorSettings {
    pub fn new(purge_interval: Duration, lock_timeout: Duration) -> Self {
        Self {
            purge_interval,
            lock_timeout,
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    fn owner_info(&self) -> String {
        format!(
            "instance={} pid={} acquired_at={}",
            self.instance_id,
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        )
    }
}

/// Periodically reclaims expired resources from a staging area.
///
/// In cluster mode only the node holding the purge lock sweeps.
#[derive(Debug)]
pub struct Janitor {
    manager: StagingManager,
    settings: JanitorSettings,
}

impl Janitor {
    pub fn new(manager: StagingManager, settings: JanitorSettings) -> Self {
        Self { manager, settings }
    }

    pub fn manager(&self) -> &StagingManager {
        &self.manager
    }

    pub fn settings(&self) -> &JanitorSettings {
        &self.settings
    }

    /// Run one sweep. Returns `None` if another node holds the purge lock.
    pub fn sweep_once(&self) -> Option<PurgeStats> {
        let mut lock = if self.manager.is_cluster_enabled() {
            let owner_info = self.settings.owner_info();
            let key = resource_path![PURGE_LOCK];
            let mut lock = self.manager.acquire_file_lock(&owner_info, &key);
            if !lock.is_acquired() {
                let age = lock.age();
                if age <= self.settings.lock_timeout {
                    info!(
                        "Skipping purge: {}",
                        lock.failure_message().unwrap_or("purge lock is held")
                    );
                    return None;
                }
                warn!(
                    "Purge lock {} is {:?} old, breaking it",
                    lock.lock_file().display(),
                    age
                );
                lock.break_lock();
                lock = self.manager.acquire_file_lock(&owner_info, &key);
                if !lock.is_acquired() {
                    info!(
                        "Skipping purge: {}",
                        lock.failure_message().unwrap_or("purge lock is held")
                    );
                    return None;
                }
            }
            Some(lock)
        } else {
            None
        };

        let mut context = PurgeContext::new();
        self.manager.clean_expired(&mut context);

        if let Some(lock) = lock.as_mut() {
            self.release_purge_lock(lock);
        }
        Some(context.stats())
    }

    fn release_purge_lock(&self, lock: &mut StagingFileLock) -> bool {
        let released = lock.release();
        if !released {
            info!(
                "Purge lock {} was not released; other nodes wait {:?} before breaking it",
                lock.lock_file().display(),
                self.settings.lock_timeout
            );
        }
        released
    }

    /// Sweep every `purge_interval` until `shutdown` turns true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.purge_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Janitor started: ttl {:?}, interval {:?}",
            self.manager.config().ttl,
            self.settings.purge_interval
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let janitor = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || janitor.sweep_once()).await {
                        Ok(Some(stats)) => debug!(
                            "Sweep reclaimed {} bytes in {} ms",
                            stats.total_bytes(),
                            stats.elapsed_ms
                        ),
                        Ok(None) => {}
                        Err(e) => warn!("Purge task failed: {}", e),
                    }
                }
                _ = async {
                    let _ = shutdown.wait_for(|&stop| stop).await;
                } => {
                    break;
                }
            }
        }

        info!("Janitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batch_staging_core::{ContextId, ResourceState, StagingConfig};
    use std::io::Write;
    use tempfile::TempDir;

    fn setup(cluster: bool, ttl: Duration, lock_timeout: Duration) -> (Janitor, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = StagingConfig::new(temp_dir.path())
            .with_cluster_enabled(cluster)
            .with_ttl(ttl);
        let manager = StagingManager::new(config).unwrap();
        let settings = JanitorSettings::new(Duration::from_millis(10), lock_timeout);
        (Janitor::new(manager, settings), temp_dir)
    }

    fn stage_committed(manager: &StagingManager, id: u64, content: &[u8]) {
        let resource = manager.create(&resource_path!["outgoing", id]).unwrap();
        let mut writer = resource.writer(Some(0)).unwrap();
        writer.write_all(content).unwrap();
        writer.close().unwrap();
        let ctx = ContextId::new();
        resource.set_state(ctx, ResourceState::Done).unwrap();
        resource.close(ctx);
    }

    #[test]
    fn test_sweep_once_local() {
        let (janitor, _temp) = setup(false, Duration::ZERO, Duration::from_secs(60));
        stage_committed(janitor.manager(), 1, b"abcdef");
        std::thread::sleep(Duration::from_millis(10));

        let stats = janitor.sweep_once().expect("local sweeps always run");
        assert_eq!(stats.purged_file_count, 1);
        assert_eq!(stats.purged_file_size, 6);
    }

    #[test]
    fn test_sweep_skipped_while_lock_held() {
        let (janitor, _temp) = setup(true, Duration::ZERO, Duration::from_secs(600));
        let mut other = janitor
            .manager()
            .acquire_file_lock("other-node", &resource_path![PURGE_LOCK]);
        assert!(other.is_acquired());

        assert!(janitor.sweep_once().is_none());

        other.release();
        let stats = janitor.sweep_once().expect("lock is free");
        assert_eq!(stats.total_bytes(), 0);
        assert!(!other.lock_file().exists());
    }

    #[test]
    fn test_sweep_breaks_abandoned_lock() {
        let (janitor, _temp) = setup(true, Duration::ZERO, Duration::ZERO);
        let abandoned = janitor
            .manager()
            .acquire_file_lock("crashed-node", &resource_path![PURGE_LOCK]);
        assert!(abandoned.is_acquired());
        std::thread::sleep(Duration::from_millis(10));

        stage_committed(janitor.manager(), 2, b"xyz");
        std::thread::sleep(Duration::from_millis(10));

        let stats = janitor.sweep_once().expect("abandoned lock should be broken");
        assert_eq!(stats.purged_file_size, 3);
        assert!(!abandoned.lock_file().exists());
    }

    #[test]
    fn test_sweep_uses_configured_ttl() {
        let (janitor, _temp) = setup(false, Duration::from_secs(3600), Duration::from_secs(60));
        stage_committed(janitor.manager(), 4, b"recent");
        std::thread::sleep(Duration::from_millis(10));

        let stats = janitor.sweep_once().expect("local sweeps always run");
        assert_eq!(stats.total_bytes(), 0);
        assert!(janitor.manager().find(&resource_path!["outgoing", 4]).is_some());
    }

    #[test]
    fn test_unreleasable_purge_lock() {
        let (janitor, _temp) = setup(true, Duration::ZERO, Duration::from_secs(60));
        let mut lock = janitor
            .manager()
            .acquire_file_lock("this-node", &resource_path![PURGE_LOCK]);
        assert!(lock.is_acquired());

        // A non-empty directory in place of the marker cannot be removed.
        std::fs::remove_file(lock.lock_file()).unwrap();
        std::fs::create_dir_all(lock.lock_file().join("inner")).unwrap();

        assert!(!janitor.release_purge_lock(&mut lock));
        assert!(lock.is_acquired());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (janitor, _temp) = setup(false, Duration::ZERO, Duration::from_secs(60));
        stage_committed(janitor.manager(), 3, b"payload");
        let manager = janitor.manager().clone();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::new(janitor).run(rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("janitor should stop")
            .expect("janitor task panicked");

        assert!(manager.find(&resource_path!["outgoing", 3]).is_none());
    }
}
