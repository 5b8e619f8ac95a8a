use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use batch_staging_core::ContextId;
use tracing::warn;

use super::resource::StagedResource;

/// Which accessor opened a read stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Buffered, line-oriented reader.
    Reader,
    /// Raw byte stream.
    InputStream,
}

pub(crate) fn closed_stream_error(path: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("stream for staged resource {} is closed", path),
    )
}

/// Write side of a staged resource.
///
/// Bytes go through the resource's [`ThresholdWriter`](super::ThresholdWriter).
/// Dropping the writer closes it; use [`StagedWriter::close`] to observe the
/// final flush error.
#[derive(Debug)]
pub struct StagedWriter {
    resource: Arc<StagedResource>,
    id: u64,
    closed: bool,
}

impl StagedWriter {
    pub(crate) fn new(resource: Arc<StagedResource>, id: u64) -> Self {
        Self {
            resource,
            id,
            closed: false,
        }
    }

    pub fn resource(&self) -> &Arc<StagedResource> {
        &self.resource
    }

    /// Flush and release the writer.
    pub fn close(mut self) -> io::Result<()> {
        self.closed = true;
        self.resource.finish_writer(self.id)
    }
}

impl Write for StagedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.resource.write_through(self.id, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.resource.flush_writer(self.id)
    }
}

impl Drop for StagedWriter {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.resource.finish_writer(self.id) {
            warn!(
                "Failed to flush writer for staged resource {}: {}",
                self.resource.path(),
                e
            );
        }
    }
}

#[derive(Debug)]
pub(crate) enum ReaderSource {
    File(BufReader<File>),
    Memory(Cursor<Vec<u8>>),
}

/// Read side of a staged resource, owned by one [`ContextId`].
///
/// The resource can close the stream underneath the holder (on a state
/// change or delete); later reads then fail with `BrokenPipe`.
#[derive(Debug)]
pub struct StagedReader {
    resource: Arc<StagedResource>,
    id: u64,
    context: ContextId,
    kind: StreamKind,
    closed: Arc<AtomicBool>,
    source: ReaderSource,
}

impl StagedReader {
    pub(crate) fn new(
        resource: Arc<StagedResource>,
        id: u64,
        context: ContextId,
        kind: StreamKind,
        closed: Arc<AtomicBool>,
        source: ReaderSource,
    ) -> Self {
        Self {
            resource,
            id,
            context,
            kind,
            closed,
            source,
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Whether content comes from the memory buffer rather than a file.
    pub fn is_memory(&self) -> bool {
        matches!(self.source, ReaderSource::Memory(_))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_stream_error(self.resource.path()));
        }
        Ok(())
    }
}

impl Read for StagedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        match &mut self.source {
            ReaderSource::File(reader) => reader.read(buf),
            ReaderSource::Memory(cursor) => cursor.read(buf),
        }
    }
}

impl BufRead for StagedReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.check_open()?;
        match &mut self.source {
            ReaderSource::File(reader) => reader.fill_buf(),
            ReaderSource::Memory(cursor) => cursor.fill_buf(),
        }
    }

    fn consume(&mut self, amt: usize) {
        match &mut self.source {
            ReaderSource::File(reader) => reader.consume(amt),
            ReaderSource::Memory(cursor) => cursor.consume(amt),
        }
    }
}

impl Drop for StagedReader {
    fn drop(&mut self) {
        self.resource.release_stream(self.id);
    }
}
