use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, SystemTime};

use batch_staging_core::{ContextId, ResourceState, StagingError};
use chrono::{DateTime, Local};
use tracing::{debug, info, instrument, warn};

use super::lock_unpoisoned;
use super::manager::ResourceCaches;
use super::stream::{closed_stream_error, ReaderSource, StagedReader, StagedWriter, StreamKind};
use super::threshold::{MemoryBuffer, ThresholdWriter};

const RENAME_SETTLE_ATTEMPTS: u32 = 5;
const RENAME_SETTLE_BACKOFF: Duration = Duration::from_secs(1);
const DELETE_ATTEMPTS: u32 = 3;
const DELETE_BACKOFF: Duration = Duration::from_millis(100);

/// One staged artifact: a lifecycle state plus memory or file backing.
///
/// File-backed content lives at `{directory}/{path}.{state suffix}`, so the
/// stage a resource reached survives a crash. Handles are shared as
/// `Arc<StagedResource>`; every mutation is serialized on the handle.
#[derive(Debug)]
pub struct StagedResource {
    directory: PathBuf,
    path: String,
    memory_threshold: u64,
    references: AtomicUsize,
    inner: Mutex<ResourceInner>,
    caches: Weak<ResourceCaches>,
}

#[derive(Debug)]
struct ResourceInner {
    state: ResourceState,
    file: PathBuf,
    memory: Option<MemoryBuffer>,
    writer: Option<OpenWriter>,
    streams: HashMap<u64, OpenStream>,
    next_stream_id: u64,
    last_update_time: SystemTime,
}

#[derive(Debug)]
struct OpenWriter {
    id: u64,
    sink: ThresholdWriter,
}

#[derive(Debug)]
struct OpenStream {
    context: ContextId,
    kind: StreamKind,
    closed: Arc<AtomicBool>,
}

impl ResourceInner {
    fn next_id(&mut self) -> u64 {
        self.next_stream_id += 1;
        self.next_stream_id
    }

    fn file_exists(&self) -> bool {
        self.file.is_file()
    }

    fn file_len(&self) -> Option<u64> {
        fs::metadata(&self.file)
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.len())
    }

    fn close_streams_where(&mut self, mut matches: impl FnMut(&OpenStream) -> bool) {
        self.streams.retain(|_, stream| {
            if matches(stream) {
                stream.closed.store(true, Ordering::Release);
                false
            } else {
                true
            }
        });
    }

    fn close_writer(&mut self, path: &str) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.sink.finish() {
                warn!("Failed to flush writer for staged resource {}: {}", path, e);
            }
            self.last_update_time = SystemTime::now();
        }
    }
}

impl StagedResource {
    /// Build a handle for `path`, adopting whatever stage is on disk.
    pub(crate) fn from_disk(
        directory: &Path,
        path: &str,
        memory_threshold: u64,
        caches: Weak<ResourceCaches>,
    ) -> Self {
        let done_file = state_file(directory, path, ResourceState::Done);
        let (state, file) = if done_file.is_file() {
            (ResourceState::Done, done_file)
        } else {
            let ready_file = state_file(directory, path, ResourceState::Ready);
            if ready_file.is_file() {
                (ResourceState::Ready, ready_file)
            } else {
                (
                    ResourceState::Creating,
                    state_file(directory, path, ResourceState::Creating),
                )
            }
        };

        let last_update_time = fs::metadata(&file)
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| SystemTime::now());

        Self {
            directory: directory.to_path_buf(),
            path: path.to_string(),
            memory_threshold,
            references: AtomicUsize::new(0),
            inner: Mutex::new(ResourceInner {
                state,
                file,
                memory: None,
                writer: None,
                streams: HashMap::new(),
                next_stream_id: 0,
                last_update_time,
            }),
            caches,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ResourceInner> {
        lock_unpoisoned(&self.inner)
    }

    /// Logical path, relative to the staging root and without a suffix.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> ResourceState {
        self.lock().state
    }

    /// Backing file, if the content lives on disk.
    pub fn file(&self) -> Option<PathBuf> {
        let inner = self.lock();
        inner.file_exists().then(|| inner.file.clone())
    }

    pub fn is_file_resource(&self) -> bool {
        self.lock().file_exists()
    }

    /// File length, or memory-buffer length when memory-backed.
    pub fn size(&self) -> u64 {
        let inner = self.lock();
        inner
            .file_len()
            .or_else(|| inner.memory.as_ref().map(|m| m.len() as u64))
            .unwrap_or(0)
    }

    /// Whether there is any content, on disk or in memory.
    pub fn exists(&self) -> bool {
        let inner = self.lock();
        inner.file_len().is_some_and(|len| len > 0)
            || inner.memory.as_ref().is_some_and(|m| !m.is_empty())
    }

    pub fn last_update_time(&self) -> SystemTime {
        self.lock().last_update_time
    }

    pub fn refresh_last_update_time(&self) {
        self.lock().last_update_time = SystemTime::now();
    }

    /// Time since the last update.
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.last_update_time())
            .unwrap_or_default()
    }

    /// Exempt the resource from purging until a matching [`unpin`](Self::unpin).
    pub fn pin(self: &Arc<Self>) {
        let count = self.references.fetch_add(1, Ordering::AcqRel) + 1;
        self.register();
        debug!("Increased references to {} for {}", count, self.path);
    }

    pub fn unpin(&self) {
        let previous = self
            .references
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(n) => debug!("Decreased references to {} for {}", n - 1, self.path),
            Err(_) => warn!("Unpinned staged resource {} that was not pinned", self.path),
        }
    }

    pub fn pin_count(&self) -> usize {
        self.references.load(Ordering::Acquire)
    }

    /// Pinned, or any stream still open.
    pub fn is_in_use(&self) -> bool {
        if self.pin_count() > 0 {
            return true;
        }
        let inner = self.lock();
        inner.writer.is_some() || !inner.streams.is_empty()
    }

    /// Number of read streams currently open for `context`.
    pub fn open_stream_count(&self, context: ContextId) -> usize {
        self.lock()
            .streams
            .values()
            .filter(|s| s.context == context)
            .count()
    }

    /// Open the single writer for this resource.
    ///
    /// `threshold` overrides the staging area's memory threshold. Any content
    /// already at the current stage is discarded.
    #[instrument(skip(self), level = "debug", fields(path = %self.path))]
    pub fn writer(self: &Arc<Self>, threshold: Option<u64>) -> Result<StagedWriter, StagingError> {
        self.register();
        let mut inner = self.lock();
        if inner.writer.is_some() {
            return Err(StagingError::IllegalState(format!(
                "Staged resource {} already has an open writer",
                self.path
            )));
        }

        if inner.file_exists() {
            warn!(
                "Opening a writer had to delete {} because it already existed",
                inner.file.display()
            );
            if let Err(e) = fs::remove_file(&inner.file) {
                warn!("Failed to delete {}: {}", inner.file.display(), e);
            }
        } else if inner.memory.is_some() {
            warn!(
                "Discarding the memory buffer of {} because it already existed",
                self.path
            );
        }

        let threshold = threshold.unwrap_or(self.memory_threshold);
        let buffer = MemoryBuffer::new();
        inner.memory = (threshold > 0).then(|| buffer.clone());

        let id = inner.next_id();
        let sink = ThresholdWriter::new(threshold, buffer, inner.file.clone());
        inner.writer = Some(OpenWriter { id, sink });
        inner.last_update_time = SystemTime::now();
        drop(inner);

        // A concurrent close may have dropped the handle from the map.
        self.register();
        Ok(StagedWriter::new(Arc::clone(self), id))
    }

    /// Buffered reader owned by `context`.
    pub fn reader(self: &Arc<Self>, context: ContextId) -> Result<StagedReader, StagingError> {
        self.open_stream(context, StreamKind::Reader)
    }

    /// Raw byte stream owned by `context`.
    pub fn input_stream(self: &Arc<Self>, context: ContextId) -> Result<StagedReader, StagingError> {
        self.open_stream(context, StreamKind::InputStream)
    }

    /// Read the whole content as UTF-8.
    pub fn read_to_string(self: &Arc<Self>, context: ContextId) -> Result<String, StagingError> {
        let mut reader = self.reader(context)?;
        let mut content = String::new();
        reader.read_to_string(&mut content).map_err(|e| {
            StagingError::Io(format!("Failed to read staged resource {}: {}", self.path, e))
        })?;
        Ok(content)
    }

    /// Read the whole content as bytes.
    pub fn read_to_end(self: &Arc<Self>, context: ContextId) -> Result<Vec<u8>, StagingError> {
        let mut stream = self.input_stream(context)?;
        let mut content = Vec::new();
        stream.read_to_end(&mut content).map_err(|e| {
            StagingError::Io(format!("Failed to read staged resource {}: {}", self.path, e))
        })?;
        Ok(content)
    }

    fn open_stream(
        self: &Arc<Self>,
        context: ContextId,
        kind: StreamKind,
    ) -> Result<StagedReader, StagingError> {
        self.register();
        let mut inner = self.lock();
        let source = if inner.file_exists() {
            let file = File::open(&inner.file).map_err(|e| {
                StagingError::Io(format!("Failed to open {}: {}", inner.file.display(), e))
            })?;
            ReaderSource::File(BufReader::new(file))
        } else if let Some(memory) = inner.memory.as_ref().filter(|m| !m.is_empty()) {
            ReaderSource::Memory(Cursor::new(memory.snapshot()))
        } else {
            return Err(StagingError::IllegalState(format!(
                "There is no content to read. Memory buffer was empty and {} was not found",
                inner.file.display()
            )));
        };

        let id = inner.next_id();
        let closed = Arc::new(AtomicBool::new(false));
        inner.streams.insert(
            id,
            OpenStream {
                context,
                kind,
                closed: Arc::clone(&closed),
            },
        );
        debug!("Opened {:?} {} on {} for {}", kind, id, self.path, context);
        drop(inner);

        self.register();
        Ok(StagedReader::new(
            Arc::clone(self),
            id,
            context,
            kind,
            closed,
            source,
        ))
    }

    /// Move the resource to `state`.
    ///
    /// Closes `context`'s streams and the open writer first. For file-backed
    /// content the transition is a rename; a failed rename is fatal unless the
    /// destination turns up with the same length.
    #[instrument(skip(self), level = "debug", fields(path = %self.path))]
    pub fn set_state(&self, context: ContextId, state: ResourceState) -> Result<(), StagingError> {
        let mut inner = self.lock();
        inner.close_streams_where(|s| s.context == context);
        inner.close_writer(&self.path);

        let target = self.build_file(state);
        if inner.file_exists() && target != inner.file {
            if target.exists() && !delete_quietly(&target) {
                warn!(
                    "Failed to delete '{}' in preparation for renaming '{}'",
                    target.display(),
                    inner.file.display()
                );
                for stream in inner.streams.values() {
                    warn!(
                        "Closing unwanted {:?} for '{}' that had been opened by {}",
                        stream.kind,
                        target.display(),
                        stream.context
                    );
                }
                inner.close_streams_where(|_| true);
                if !delete_quietly(&target) {
                    warn!("Failed to delete '{}' for a second time", target.display());
                }
            }

            if let Err(e) = fs::rename(&inner.file, &target) {
                warn!(
                    "Rename of {} to {} failed: {}",
                    inner.file.display(),
                    target.display(),
                    e
                );
                reconcile_failed_rename(
                    &inner.file,
                    &target,
                    RENAME_SETTLE_ATTEMPTS,
                    RENAME_SETTLE_BACKOFF,
                )?;
            }
        }

        debug!("{} moved from {} to {}", self.path, inner.state, state);
        inner.state = state;
        inner.file = target;
        inner.last_update_time = SystemTime::now();
        Ok(())
    }

    /// Release `context`'s streams and the open writer, keeping the content.
    pub fn close(&self, context: ContextId) {
        let release = {
            let mut inner = self.lock();
            inner.close_streams_where(|s| s.context == context);
            inner.close_writer(&self.path);
            inner.file_exists()
                && inner.writer.is_none()
                && inner.streams.is_empty()
                && self.pin_count() == 0
        };

        if release {
            if let Some(caches) = self.caches.upgrade() {
                caches.release(self);
            }
        }
    }

    /// Destroy the content on disk and in memory and forget the path.
    ///
    /// Returns whether anything was deleted. Calling it again is a no-op that
    /// returns `false`.
    #[instrument(skip(self), level = "debug", fields(path = %self.path))]
    pub fn delete(&self) -> bool {
        let deleted = {
            let mut inner = self.lock();
            inner.close_streams_where(|_| true);
            inner.close_writer(&self.path);

            let mut deleted = false;
            if inner.file_exists() {
                deleted = delete_with_retry(&inner.file);
            }
            if inner.memory.take().is_some() {
                deleted = true;
            }
            deleted
        };

        if let Some(caches) = self.caches.upgrade() {
            caches.forget(self);
        }
        if deleted {
            debug!("Deleted staging resource {}", self.path);
        }
        deleted
    }

    pub(crate) fn write_through(&self, id: u64, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.lock();
        match inner.writer.as_mut() {
            Some(writer) if writer.id == id => writer.sink.write(buf),
            _ => Err(closed_stream_error(&self.path)),
        }
    }

    pub(crate) fn flush_writer(&self, id: u64) -> io::Result<()> {
        let mut inner = self.lock();
        match inner.writer.as_mut() {
            Some(writer) if writer.id == id => writer.sink.flush(),
            _ => Err(closed_stream_error(&self.path)),
        }
    }

    pub(crate) fn finish_writer(&self, id: u64) -> io::Result<()> {
        let mut inner = self.lock();
        if inner.writer.as_ref().is_some_and(|w| w.id == id) {
            if let Some(writer) = inner.writer.take() {
                inner.last_update_time = SystemTime::now();
                return writer.sink.finish();
            }
        }
        Ok(())
    }

    pub(crate) fn release_stream(&self, id: u64) {
        self.lock().streams.remove(&id);
    }

    /// Put the handle back in the manager's in-use map so sweeps see its
    /// streams and pins. Must not be called with the handle locked.
    fn register(self: &Arc<Self>) {
        if let Some(caches) = self.caches.upgrade() {
            caches.register(self);
        }
    }

    fn build_file(&self, state: ResourceState) -> PathBuf {
        state_file(&self.directory, &self.path, state)
    }
}

impl std::fmt::Display for StagedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        if inner.file_exists() {
            let absolute = fs::canonicalize(&inner.file).unwrap_or_else(|_| inner.file.clone());
            write!(f, "{}", absolute.display())
        } else {
            let len = inner.memory.as_ref().map(|m| m.len()).unwrap_or(0);
            write!(f, "{} bytes in memory", len)
        }
    }
}

/// `{directory}/{path}.{suffix}` for a state.
pub(crate) fn state_file(directory: &Path, path: &str, state: ResourceState) -> PathBuf {
    directory.join(format!("{}.{}", path, state.suffix()))
}

fn delete_quietly(file: &Path) -> bool {
    match fs::remove_file(file) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            debug!("Failed to delete {}: {}", file.display(), e);
            false
        }
    }
}

fn delete_with_retry(file: &Path) -> bool {
    for attempt in 1..=DELETE_ATTEMPTS {
        if delete_quietly(file) {
            return true;
        }
        if attempt < DELETE_ATTEMPTS {
            std::thread::sleep(DELETE_BACKOFF);
        }
    }
    warn!(
        "Failed to delete {} after {} attempts",
        file.display(),
        DELETE_ATTEMPTS
    );
    false
}

fn describe(file: &Path) -> String {
    match fs::metadata(file) {
        Ok(metadata) => {
            let modified = metadata
                .modified()
                .map(|t| {
                    DateTime::<Local>::from(t)
                        .format("%Y-%m-%d %H:%M:%S%.3f")
                        .to_string()
                })
                .unwrap_or_else(|_| "unknown".to_string());
            format!(
                "{} size: {} lastModified: {}",
                file.display(),
                metadata.len(),
                modified
            )
        }
        Err(_) => format!("{} (missing)", file.display()),
    }
}

/// Decide whether a failed rename still committed.
///
/// Some shared filesystems report a failure for a rename that lands late.
/// Waits for the destination to appear; a destination with the source's
/// length is accepted and the source removed.
pub(crate) fn reconcile_failed_rename(
    source: &Path,
    target: &Path,
    attempts: u32,
    backoff: Duration,
) -> Result<(), StagingError> {
    let mut remaining = attempts;
    while !target.exists() && remaining > 0 {
        std::thread::sleep(backoff);
        remaining -= 1;
    }

    if !target.exists() {
        return Err(StagingError::Rename(format!(
            "Had trouble renaming file. The destination file does not appear to exist. Source file: ({}) Target file: ({})",
            describe(source),
            target.display()
        )));
    }

    let source_len = fs::metadata(source).map(|m| m.len()).ok();
    let target_len = fs::metadata(target)
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len());
    if source_len.is_some() && source_len == target_len {
        info!(
            "Had trouble renaming file. The destination file already exists, and is the same size - will proceed. Source file: ({}) Target file: ({})",
            describe(source),
            describe(target)
        );
        delete_quietly(source);
        return Ok(());
    }

    Err(StagingError::Rename(format!(
        "Had trouble renaming file. The destination file already exists, but is not the same size. Source file: ({}) Target file: ({})",
        describe(source),
        describe(target)
    )))
}
