//! Filesystem staging area for synchronization batches.
//!
//! - `stage`: the resource registry and staged resource handles
//! - `lock`: marker-file locks shared by processes on one staging root
//! - `janitor`: periodic reclamation of expired resources

pub mod janitor;
pub mod lock;
pub mod stage;

pub use janitor::{Janitor, JanitorSettings, PURGE_LOCK};
pub use lock::StagingFileLock;
pub use stage::{
    staged_file, MemoryBuffer, StagedReader, StagedResource, StagedWriter, StagingManager,
    StreamKind, ThresholdWriter,
};

pub use batch_staging_core::{
    category, resource_path, ContextId, PurgeContext, PurgeStats, ResourcePath, ResourceState,
    StagingConfig, StagingError,
};
