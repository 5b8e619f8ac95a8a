use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use batch_staging_core::{
    PurgeContext, ResourcePath, ResourceState, StagingConfig, StagingError, LOCK_SUFFIX,
    PATH_SEPARATOR,
};
use dashmap::{DashMap, DashSet};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use super::resource::{state_file, StagedResource};
use crate::lock::StagingFileLock;

/// Stages a sweep considers. `Ready` is never produced, so it is not scanned.
const SWEPT_STATES: [ResourceState; 2] = [ResourceState::Creating, ResourceState::Done];

/// Path caches shared between a manager and its handles.
#[derive(Debug, Default)]
pub(crate) struct ResourceCaches {
    /// Handles known to be open in this process: path -> handle
    in_use: DashMap<String, Arc<StagedResource>>,
    /// Paths known to exist on disk or in memory
    resource_paths: DashSet<String>,
}

impl ResourceCaches {
    /// Track `resource` as in use again, unless another handle owns the path.
    pub(crate) fn register(&self, resource: &Arc<StagedResource>) {
        self.in_use
            .entry(resource.path().to_string())
            .or_insert_with(|| Arc::clone(resource));
    }

    /// Drop `resource` from the in-use map if it is the registered handle and
    /// still idle. Idleness is checked under the map entry so a stream opened
    /// concurrently keeps the handle registered.
    pub(crate) fn release(&self, resource: &StagedResource) {
        self.in_use.remove_if(resource.path(), |_, v| {
            std::ptr::eq(Arc::as_ptr(v), resource) && !v.is_in_use()
        });
    }

    /// Forget a deleted resource entirely.
    pub(crate) fn forget(&self, resource: &StagedResource) {
        self.in_use
            .remove_if(resource.path(), |_, v| std::ptr::eq(Arc::as_ptr(v), resource));
        self.resource_paths.remove(resource.path());
    }
}

/// Registry of staged resources under one root directory.
///
/// Layout:
/// ```text
/// {directory}/
///   outgoing/
///     {node}/
///       0000000042.creating   (being written)
///       0000000041.done       (committed)
///   purge.lock                (cross-process lock marker)
/// ```
///
/// Cloning is cheap; clones share the same caches.
#[derive(Debug, Clone)]
pub struct StagingManager {
    config: Arc<StagingConfig>,
    caches: Arc<ResourceCaches>,
}

impl StagingManager {
    /// Open the staging area, creating its root directory if needed.
    pub fn new(config: StagingConfig) -> Result<Self, StagingError> {
        fs::create_dir_all(&config.directory).map_err(|e| {
            StagingError::Io(format!(
                "Failed to create staging dir {}: {}",
                config.directory.display(),
                e
            ))
        })?;
        info!(
            "Staging area at {} (cluster: {}, memory threshold: {} bytes)",
            config.directory.display(),
            config.cluster_enabled,
            config.memory_threshold
        );
        Ok(Self {
            config: Arc::new(config),
            caches: Arc::new(ResourceCaches::default()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    pub fn config(&self) -> &StagingConfig {
        &self.config
    }

    pub fn is_cluster_enabled(&self) -> bool {
        self.config.cluster_enabled
    }

    /// Join path segments, zero-padding numbers.
    pub fn build_path(&self, path: &ResourcePath) -> String {
        path.join()
    }

    fn checked_path(&self, path: &ResourcePath) -> Result<String, StagingError> {
        let joined = path.join();
        if joined.is_empty() {
            return Err(StagingError::InvalidPath(
                "resource path has no segments".to_string(),
            ));
        }
        Ok(joined)
    }

    fn open_resource(&self, path: &str) -> StagedResource {
        StagedResource::from_disk(
            &self.config.directory,
            path,
            self.config.memory_threshold,
            Arc::downgrade(&self.caches),
        )
    }

    /// Register a fresh resource at `path` in the `Creating` stage.
    ///
    /// Whatever was staged at `path` before is deleted. Two callers creating
    /// the same path at once race; the last one wins.
    #[instrument(skip(self, path), level = "debug", fields(path = %path))]
    pub fn create(&self, path: &ResourcePath) -> Result<Arc<StagedResource>, StagingError> {
        let path = self.checked_path(path)?;

        let previous = self.caches.in_use.get(&path).map(|r| Arc::clone(r.value()));
        if let Some(previous) = previous {
            debug!("Replacing in-use staged resource {}", path);
            previous.delete();
        }

        for state in ResourceState::ALL {
            let stale = state_file(&self.config.directory, &path, state);
            match fs::remove_file(&stale) {
                Ok(()) => debug!("Deleted stale {}", stale.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to delete stale {}: {}", stale.display(), e),
            }
        }

        let resource = Arc::new(self.open_resource(&path));
        self.caches
            .in_use
            .insert(path.clone(), Arc::clone(&resource));
        self.caches.resource_paths.insert(path);
        Ok(resource)
    }

    /// Look up a staged resource.
    ///
    /// Checks the in-use map, then the existence cache, and in cluster mode
    /// finally probes the filesystem for a committed artifact written by
    /// another process.
    #[instrument(skip(self, path), level = "debug", fields(path = %path))]
    pub fn find(&self, path: &ResourcePath) -> Option<Arc<StagedResource>> {
        let path = self.checked_path(path).ok()?;

        if let Some(resource) = self.caches.in_use.get(&path) {
            return Some(Arc::clone(resource.value()));
        }

        if self.caches.resource_paths.contains(&path) {
            let resource = self.open_resource(&path);
            if resource.exists() {
                return Some(self.adopt(path, resource));
            }
            debug!("Cached staged resource {} no longer exists", path);
            self.caches.resource_paths.remove(&path);
        }

        if self.config.cluster_enabled {
            let resource = self.open_resource(&path);
            if resource.state() == ResourceState::Done {
                debug!("Discovered staged resource {} on disk", path);
                self.caches.resource_paths.insert(path.clone());
                return Some(self.adopt(path, resource));
            }
        }

        None
    }

    fn adopt(&self, path: String, resource: StagedResource) -> Arc<StagedResource> {
        let entry = self
            .caches
            .in_use
            .entry(path)
            .or_insert_with(|| Arc::new(resource));
        Arc::clone(entry.value())
    }

    /// Forget `path` in both caches, e.g. after it was deleted externally.
    pub fn remove_resource_path(&self, path: &str) {
        self.caches.in_use.remove(path);
        self.caches.resource_paths.remove(path);
    }

    pub fn in_use_count(&self) -> usize {
        self.caches.in_use.len()
    }

    /// Paths currently cached as existing, sorted.
    pub fn cached_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .caches
            .resource_paths
            .iter()
            .map(|p| p.key().clone())
            .collect();
        paths.sort();
        paths
    }

    /// Try to take the cross-process lock for `path`.
    pub fn acquire_file_lock(&self, owner_info: &str, path: &ResourcePath) -> StagingFileLock {
        let lock_file = self
            .config
            .directory
            .join(format!("{}.{}", path.join(), LOCK_SUFFIX));
        StagingFileLock::acquire(owner_info, lock_file)
    }

    /// Purge committed, unused resources older than `ttl`.
    ///
    /// Returns the number of bytes reclaimed.
    pub fn clean(&self, ttl: Duration) -> u64 {
        let mut context = PurgeContext::new();
        self.clean_with_context(ttl, &mut context)
    }

    /// [`clean`](Self::clean) with the ttl configured for this staging area.
    pub fn clean_expired(&self, context: &mut PurgeContext) -> u64 {
        self.clean_with_context(self.config.ttl, context)
    }

    /// [`clean`](Self::clean) with caller-provided accounting.
    #[instrument(skip(self, context), level = "debug")]
    pub fn clean_with_context(&self, ttl: Duration, context: &mut PurgeContext) -> u64 {
        let before = context.total_bytes();
        info!("Cleaning staging area {}", self.config.directory.display());

        let entries = WalkDir::new(&self.config.directory)
            .min_depth(1)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping unreadable staging entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file());

        for entry in entries {
            match resource_path_of(&self.config.directory, entry.path()) {
                Ok((path, state)) if SWEPT_STATES.contains(&state) => {
                    self.purge_candidate(path, ttl, context);
                }
                Ok(_) => {}
                Err(e) => debug!("Ignoring {}: {}", entry.path().display(), e),
            }

            if context.progress_due() {
                info!(
                    "Purged {} staged files so far, freeing {} bytes in {:?}",
                    context.purged_file_count(),
                    context.purged_file_size(),
                    context.elapsed()
                );
            }
        }

        self.purge_memory(ttl, context);

        info!(
            "Finished purging staging area in {:?}: {} files ({} bytes) and {} memory buffers ({} bytes)",
            context.elapsed(),
            context.purged_file_count(),
            context.purged_file_size(),
            context.purged_memory_count(),
            context.purged_memory_size()
        );
        context.total_bytes() - before
    }

    fn purge_candidate(&self, path: String, ttl: Duration, context: &mut PurgeContext) {
        let registered = self.caches.in_use.get(&path).map(|r| Arc::clone(r.value()));
        let resource = match registered {
            Some(resource) if resource.is_in_use() => {
                self.caches.resource_paths.insert(path);
                return;
            }
            Some(resource) => resource,
            None => Arc::new(self.open_resource(&path)),
        };

        if !is_purgeable(&resource, ttl) {
            self.caches.resource_paths.insert(path);
            return;
        }

        let size = resource.size();
        if resource.delete() {
            debug!("Purged staged file {} ({} bytes)", path, size);
            context.record_file_purge(size);
        } else {
            warn!("Failed to purge staged resource {}", path);
        }
    }

    fn purge_memory(&self, ttl: Duration, context: &mut PurgeContext) {
        let candidates: Vec<Arc<StagedResource>> = self
            .caches
            .in_use
            .iter()
            .filter(|entry| !entry.value().is_file_resource())
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for resource in candidates {
            if !is_purgeable(&resource, ttl) {
                continue;
            }
            let size = resource.size();
            if resource.delete() {
                debug!("Purged memory buffer {} ({} bytes)", resource.path(), size);
                context.record_memory_purge(size);
            }
        }
    }
}

fn is_purgeable(resource: &StagedResource, ttl: Duration) -> bool {
    resource.state().is_terminal() && !resource.is_in_use() && resource.age() > ttl
}

/// Recover the logical path and stage of a staged file under `directory`.
pub(crate) fn resource_path_of(
    directory: &Path,
    file: &Path,
) -> Result<(String, ResourceState), StagingError> {
    let relative = file.strip_prefix(directory).map_err(|_| {
        StagingError::InvalidPath(format!(
            "{} is outside {}",
            file.display(),
            directory.display()
        ))
    })?;

    let separator = PATH_SEPARATOR.to_string();
    let joined = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join(separator.as_str());

    let (path, suffix) = joined.rsplit_once('.').ok_or_else(|| {
        StagingError::InvalidPath(format!("{} has no stage suffix", file.display()))
    })?;
    let state = ResourceState::from_suffix(suffix).ok_or_else(|| {
        StagingError::InvalidPath(format!(
            "{} has unknown suffix '{}'",
            file.display(),
            suffix
        ))
    })?;
    if path.is_empty() {
        return Err(StagingError::InvalidPath(format!(
            "{} has an empty name",
            file.display()
        )));
    }
    Ok((path.to_string(), state))
}

/// Staged file for `path` in `state`, for callers that inspect the tree.
pub fn staged_file(directory: &Path, path: &ResourcePath, state: ResourceState) -> PathBuf {
    state_file(directory, &path.join(), state)
}
