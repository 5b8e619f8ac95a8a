mod manager;
mod resource;
mod stream;
mod threshold;

pub use manager::{staged_file, StagingManager};
pub use resource::StagedResource;
pub use stream::{StagedReader, StagedWriter, StreamKind};
pub use threshold::{MemoryBuffer, ThresholdWriter};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
