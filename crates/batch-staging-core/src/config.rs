use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of bytes a resource may buffer in memory before spilling to disk.
pub const DEFAULT_MEMORY_THRESHOLD: u64 = 32 * 1024;

/// Default age beyond which unused terminal resources are purged.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Configuration of one staging area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Root directory of the staging area. Created if absent.
    pub directory: PathBuf,
    /// Discover resources written by other processes sharing `directory`.
    #[serde(default)]
    pub cluster_enabled: bool,
    /// Bytes a writer keeps in memory before spilling to a file.
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: u64,
    /// Age beyond which unused terminal resources are purged.
    #[serde(default = "default_ttl", with = "duration_secs")]
    pub ttl: Duration,
}

fn default_memory_threshold() -> u64 {
    DEFAULT_MEMORY_THRESHOLD
}

fn default_ttl() -> Duration {
    DEFAULT_TTL
}

impl StagingConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            cluster_enabled: false,
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_cluster_enabled(mut self, cluster_enabled: bool) -> Self {
        self.cluster_enabled = cluster_enabled;
        self
    }

    pub fn with_memory_threshold(mut self, memory_threshold: u64) -> Self {
        self.memory_threshold = memory_threshold;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied_when_missing() {
        let config: StagingConfig = serde_json::from_str(r#"{"directory": "/tmp/staging"}"#).unwrap();
        assert_eq!(config.directory, PathBuf::from("/tmp/staging"));
        assert!(!config.cluster_enabled);
        assert_eq!(config.memory_threshold, DEFAULT_MEMORY_THRESHOLD);
        assert_eq!(config.ttl, DEFAULT_TTL);
    }

    #[test]
    fn test_ttl_serialized_as_seconds() {
        let config = StagingConfig::new("/data")
            .with_cluster_enabled(true)
            .with_ttl(Duration::from_secs(90));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["ttl"], 90);
        assert_eq!(json["cluster_enabled"], true);

        let back: StagingConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
