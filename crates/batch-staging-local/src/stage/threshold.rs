use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::lock_unpoisoned;

/// Byte buffer shared between a [`ThresholdWriter`] and whoever reads the
/// content before it spills.
#[derive(Debug, Clone, Default)]
pub struct MemoryBuffer(Arc<Mutex<Vec<u8>>>);

impl MemoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current content.
    pub fn snapshot(&self) -> Vec<u8> {
        lock_unpoisoned(&self.0).clone()
    }

    fn append(&self, bytes: &[u8]) {
        lock_unpoisoned(&self.0).extend_from_slice(bytes);
    }

    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *lock_unpoisoned(&self.0))
    }
}

/// Write sink that keeps content in memory until it grows past `threshold`
/// bytes, then moves everything to `file` and writes there from then on.
///
/// A threshold of zero spills on the first write.
#[derive(Debug)]
pub struct ThresholdWriter {
    threshold: u64,
    buffer: MemoryBuffer,
    file: PathBuf,
    sink: Option<BufWriter<File>>,
}

impl ThresholdWriter {
    pub fn new(threshold: u64, buffer: MemoryBuffer, file: impl Into<PathBuf>) -> Self {
        Self {
            threshold,
            buffer,
            file: file.into(),
            sink: None,
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn buffer(&self) -> &MemoryBuffer {
        &self.buffer
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether writes now go to the file.
    pub fn is_spilled(&self) -> bool {
        self.sink.is_some()
    }

    /// Flush and close the file, if one was opened.
    pub fn finish(mut self) -> io::Result<()> {
        match self.sink.take() {
            Some(mut sink) => sink.flush(),
            None => Ok(()),
        }
    }

    fn spill(&mut self) -> io::Result<&mut BufWriter<File>> {
        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut sink = BufWriter::new(File::create(&self.file)?);
        let pending = self.buffer.take();
        sink.write_all(&pending)?;
        sink.flush()?;
        debug!(
            "Spilled {} buffered bytes to {}",
            pending.len(),
            self.file.display()
        );
        Ok(self.sink.insert(sink))
    }
}

impl Write for ThresholdWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(sink) = self.sink.as_mut() {
            return sink.write(buf);
        }

        let buffered = self.buffer.len() as u64;
        if self.threshold == 0 || buffered + buf.len() as u64 > self.threshold {
            return self.spill()?.write(buf);
        }

        self.buffer.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.flush(),
            None => Ok(()),
        }
    }
}
