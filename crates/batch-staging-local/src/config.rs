use std::path::PathBuf;
use std::time::Duration;

use batch_staging_core::{StagingConfig, DEFAULT_MEMORY_THRESHOLD};
use batch_staging_local::JanitorSettings;
use clap::Parser;

/// Configuration for the batch-staging-local janitor.
#[derive(Parser, Debug, Clone)]
#[command(name = "batch-staging-local")]
#[command(about = "Purges expired resources from a batch staging area")]
pub struct Config {
    /// Root directory of the staging area
    #[arg(long, env = "STAGING_DIR")]
    pub staging_dir: Option<PathBuf>,

    /// Seconds an unused committed resource is kept before it is purged
    #[arg(long, default_value = "3600", env = "STAGING_TTL_SECS")]
    pub ttl_secs: u64,

    /// Seconds between purge sweeps
    #[arg(long, default_value = "60", env = "STAGING_PURGE_INTERVAL_SECS")]
    pub purge_interval_secs: u64,

    /// Bytes a resource may buffer in memory before spilling to disk
    #[arg(long, default_value_t = DEFAULT_MEMORY_THRESHOLD, env = "STAGING_MEMORY_THRESHOLD")]
    pub memory_threshold: u64,

    /// The staging root is shared with other nodes.
    /// Sweeps then run only while holding the purge lock.
    #[arg(long, env = "STAGING_CLUSTER")]
    pub cluster: bool,

    /// Seconds after which another node's purge lock is treated as abandoned
    #[arg(long, default_value = "600", env = "STAGING_LOCK_TIMEOUT_SECS")]
    pub lock_timeout_secs: u64,

    /// Run a single sweep, print its statistics as JSON and exit
    #[arg(long)]
    pub once: bool,
}

impl Config {
    /// Get the effective staging directory.
    pub fn effective_staging_dir(&self) -> PathBuf {
        self.staging_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("batch-staging")
                .join("staging")
        })
    }

    pub fn to_staging_config(&self) -> StagingConfig {
        StagingConfig::new(self.effective_staging_dir())
            .with_cluster_enabled(self.cluster)
            .with_memory_threshold(self.memory_threshold)
            .with_ttl(Duration::from_secs(self.ttl_secs))
    }

    pub fn to_janitor_settings(&self) -> JanitorSettings {
        JanitorSettings::new(
            Duration::from_secs(self.purge_interval_secs.max(1)),
            Duration::from_secs(self.lock_timeout_secs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse_from(["batch-staging-local", "--staging-dir", "/tmp/staging"]);
        assert_eq!(config.effective_staging_dir(), PathBuf::from("/tmp/staging"));
        assert!(!config.cluster);
        assert!(!config.once);

        let staging = config.to_staging_config();
        assert_eq!(staging.ttl, Duration::from_secs(3600));
        assert_eq!(staging.memory_threshold, DEFAULT_MEMORY_THRESHOLD);

        let settings = config.to_janitor_settings();
        assert_eq!(settings.purge_interval, Duration::from_secs(60));
        assert_eq!(settings.lock_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_overrides() {
        let config = Config::parse_from([
            "batch-staging-local",
            "--staging-dir",
            "/srv/staging",
            "--ttl-secs",
            "5",
            "--purge-interval-secs",
            "0",
            "--memory-threshold",
            "0",
            "--cluster",
            "--once",
        ]);
        assert!(config.once);

        let staging = config.to_staging_config();
        assert!(staging.cluster_enabled);
        assert_eq!(staging.memory_threshold, 0);
        assert_eq!(staging.ttl, Duration::from_secs(5));

        // A zero interval would make the ticker panic.
        assert_eq!(
            config.to_janitor_settings().purge_interval,
            Duration::from_secs(1)
        );
    }
}
