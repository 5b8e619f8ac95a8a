mod file;

pub use file::StagingFileLock;
