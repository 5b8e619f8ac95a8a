use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

const RELEASE_ATTEMPTS: u32 = 5;
const RELEASE_BACKOFF: Duration = Duration::from_secs(1);

/// Advisory lock shared by processes that use the same staging root.
///
/// The lock is a marker file created only if absent, holding the owner's
/// description. Nothing stops an uncooperative process from ignoring it.
/// Lock files are stored next to the resources they guard:
/// `{staging_dir}/{path}.lock`
#[derive(Debug)]
pub struct StagingFileLock {
    lock_file: PathBuf,
    acquired: bool,
    owner_info: String,
    failure_message: Option<String>,
}

impl StagingFileLock {
    /// Try to create the marker at `lock_file`.
    ///
    /// Losing the race is not an error: check [`is_acquired`](Self::is_acquired)
    /// and [`failure_message`](Self::failure_message).
    pub fn acquire(owner_info: &str, lock_file: impl AsRef<Path>) -> Self {
        let lock_file = lock_file.as_ref().to_path_buf();
        let mut lock = Self {
            lock_file,
            acquired: false,
            owner_info: owner_info.to_string(),
            failure_message: None,
        };

        match lock.create_marker() {
            Ok(()) => {
                lock.acquired = true;
                debug!(
                    "Acquired lock {} for {}",
                    lock.lock_file.display(),
                    lock.owner_info
                );
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let message = lock.describe_existing();
                debug!("{}", message);
                lock.failure_message = Some(message);
            }
            Err(e) => {
                let message = format!(
                    "Failed to create lock file ({}): {}",
                    lock.lock_file.display(),
                    e
                );
                warn!("{}", message);
                lock.failure_message = Some(message);
            }
        }
        lock
    }

    fn create_marker(&self) -> io::Result<()> {
        if let Some(parent) = self.lock_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_file)?;
        let written = file
            .write_all(self.owner_info.as_bytes())
            .and_then(|()| file.sync_all());
        if written.is_err() {
            let _ = fs::remove_file(&self.lock_file);
        }
        written
    }

    fn describe_existing(&self) -> String {
        match fs::read_to_string(&self.lock_file) {
            Ok(contents) => format!(
                "Lock file exists: {} Lock file contents: {}",
                self.lock_file.display(),
                contents
            ),
            Err(e) => format!(
                "Lock file exists: {} (contents unavailable: {})",
                self.lock_file.display(),
                e
            ),
        }
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    pub fn owner_info(&self) -> &str {
        &self.owner_info
    }

    /// Why acquisition failed, including the current holder's description.
    pub fn failure_message(&self) -> Option<&str> {
        self.failure_message.as_deref()
    }

    /// Delete the marker this lock created.
    ///
    /// Retries a few times with a one second backoff. Returns `false` without
    /// touching the file if this lock was never acquired.
    pub fn release(&mut self) -> bool {
        if !self.acquired {
            debug!(
                "Not releasing {}: it was never acquired by {}",
                self.lock_file.display(),
                self.owner_info
            );
            return false;
        }

        for attempt in 1..=RELEASE_ATTEMPTS {
            match fs::remove_file(&self.lock_file) {
                Ok(()) => {
                    self.acquired = false;
                    debug!("Released lock {}", self.lock_file.display());
                    return true;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    self.acquired = false;
                    return true;
                }
                Err(e) => {
                    debug!(
                        "Attempt {} to delete lock file {} failed: {}",
                        attempt,
                        self.lock_file.display(),
                        e
                    );
                    if attempt < RELEASE_ATTEMPTS {
                        std::thread::sleep(RELEASE_BACKOFF);
                    }
                }
            }
        }

        warn!("Failed to delete lock file {}", self.lock_file.display());
        false
    }

    /// Delete the marker regardless of who created it.
    ///
    /// For recovering from a holder that died without releasing.
    pub fn break_lock(&mut self) -> bool {
        match fs::remove_file(&self.lock_file) {
            Ok(()) => {
                warn!(
                    "Broke lock {} on behalf of {}",
                    self.lock_file.display(),
                    self.owner_info
                );
                self.acquired = false;
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.acquired = false;
                true
            }
            Err(e) => {
                warn!("Failed to break lock {}: {}", self.lock_file.display(), e);
                false
            }
        }
    }

    /// Time since the marker was last modified, zero if it cannot be read.
    pub fn age(&self) -> Duration {
        fs::metadata(&self.lock_file)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (PathBuf, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let lock_file = temp_dir.path().join("outgoing").join("purge.lock");
        (lock_file, temp_dir)
    }

    #[test]
    fn test_acquire_release() {
        let (path, _temp) = setup();

        let mut first = StagingFileLock::acquire("holder-1", &path);
        assert!(first.is_acquired());
        assert!(first.failure_message().is_none());
        assert_eq!(fs::read_to_string(&path).unwrap(), "holder-1");

        let second = StagingFileLock::acquire("holder-2", &path);
        assert!(!second.is_acquired());
        let message = second.failure_message().unwrap();
        assert!(message.contains("Lock file exists"));
        assert!(message.contains("holder-1"));

        assert!(first.release());
        assert!(!first.is_acquired());
        assert!(!path.exists());

        let third = StagingFileLock::acquire("holder-2", &path);
        assert!(third.is_acquired());
    }

    #[test]
    fn test_release_not_owner() {
        let (path, _temp) = setup();
        let _holder = StagingFileLock::acquire("holder-1", &path);

        let mut loser = StagingFileLock::acquire("holder-2", &path);
        assert!(!loser.release());
        assert!(path.exists());
    }

    #[test]
    fn test_release_twice() {
        let (path, _temp) = setup();
        let mut lock = StagingFileLock::acquire("holder-1", &path);
        assert!(lock.release());
        assert!(!lock.release());
    }

    #[test]
    fn test_break_lock() {
        let (path, _temp) = setup();
        let _crashed = StagingFileLock::acquire("crashed-node", &path);

        let mut rescuer = StagingFileLock::acquire("operator", &path);
        assert!(!rescuer.is_acquired());
        assert!(rescuer.break_lock());
        assert!(!path.exists());

        let mut retry = StagingFileLock::acquire("operator", &path);
        assert!(retry.is_acquired());

        // Breaking an already missing marker still succeeds.
        assert!(retry.break_lock());
        assert!(retry.break_lock());
    }

    #[test]
    fn test_age() {
        let (path, _temp) = setup();
        let lock = StagingFileLock::acquire("holder-1", &path);
        std::thread::sleep(Duration::from_millis(20));
        assert!(lock.age() >= Duration::from_millis(20));

        let handle = OpenOptions::new().write(true).open(&path).unwrap();
        handle
            .set_modified(SystemTime::now() - Duration::from_secs(120))
            .unwrap();
        assert!(lock.age() >= Duration::from_secs(120));

        let missing = StagingFileLock {
            lock_file: path.with_file_name("never-created.lock"),
            acquired: false,
            owner_info: String::new(),
            failure_message: None,
        };
        assert_eq!(missing.age(), Duration::ZERO);
    }

    #[test]
    fn test_concurrent_acquire() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::{Arc, Barrier};

        let (path, _temp) = setup();
        const NUM_THREADS: usize = 10;
        let barrier = Arc::new(Barrier::new(NUM_THREADS));
        let winners = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for i in 0..NUM_THREADS {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            let winners = Arc::clone(&winners);
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                let lock = StagingFileLock::acquire(&format!("holder-{}", i), &path);
                if lock.is_acquired() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        for handle in handles {
            handle.join().expect("thread panicked");
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
