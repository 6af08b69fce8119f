//! Error types for the mixing engine

use thiserror::Error;

/// Broad failure category, mirrors the result codes callers switch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    OutOfMemory,
    InvalidArgument,
    InvalidState,
    InvalidOperation,
    InvalidData,
    Timeout,
}

/// Errors returned by session and voice operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AudioError {
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("timed out: {0}")]
    Timeout(String),
}

impl AudioError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AudioError::OutOfMemory(_) => ErrorKind::OutOfMemory,
            AudioError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            AudioError::InvalidState(_) => ErrorKind::InvalidState,
            AudioError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            AudioError::InvalidData(_) => ErrorKind::InvalidData,
            AudioError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        AudioError::InvalidArgument(msg.into())
    }

    pub(crate) fn invalid_operation(msg: impl Into<String>) -> Self {
        AudioError::InvalidOperation(msg.into())
    }
}

/// Errors raised by a [`Source`](crate::Source) implementation
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Seek to frame {frame} is past the end ({len} frames)")]
    SeekOutOfRange { frame: u64, len: u64 },
    #[error("Unsupported source: {0}")]
    Unsupported(String),
}

impl From<SourceError> for AudioError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::SeekOutOfRange { .. } | SourceError::Unsupported(_) => {
                AudioError::InvalidArgument(err.to_string())
            }
            SourceError::Io(_) | SourceError::Decode(_) => {
                AudioError::InvalidOperation(err.to_string())
            }
        }
    }
}

/// Map a failed `try_reserve` into the out-of-memory category
pub(crate) fn reserve_failed(what: &str, err: std::collections::TryReserveError) -> AudioError {
    AudioError::OutOfMemory(format!("{what}: {err}"))
}

/// Allocate a zero-filled buffer, reporting allocation failure instead of aborting
pub(crate) fn zeroed<T: Clone + Default>(len: usize, what: &str) -> Result<Vec<T>, AudioError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|e| reserve_failed(what, e))?;
    buf.resize(len, T::default());
    Ok(buf)
}

pub type Result<T, E = AudioError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_mapping() {
        let err: AudioError = SourceError::SeekOutOfRange { frame: 10, len: 5 }.into();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err: AudioError = SourceError::Decode("bad packet".into()).into();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
        assert!(err.to_string().contains("bad packet"));
    }
}
