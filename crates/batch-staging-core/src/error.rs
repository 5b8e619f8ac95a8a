use thiserror::Error;

/// Errors that can occur in the staging layer.
#[derive(Error, Debug)]
pub enum StagingError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Rename failed: {0}")]
    Rename(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl From<StagingError> for std::io::Error {
    fn from(err: StagingError) -> Self {
        match err {
            StagingError::Io(msg) => std::io::Error::other(msg),
            StagingError::IllegalState(msg) => std::io::Error::other(msg),
            StagingError::Rename(msg) => std::io::Error::other(msg),
            StagingError::InvalidPath(msg) => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, msg)
            }
        }
    }
}
