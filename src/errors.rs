//! Error types shared by every format reader in this crate.

use std::io;
use std::path::PathBuf;

/// The error type returned by every fallible operation in this crate.
///
/// Each variant corresponds to one distinguishable failure class, so callers
/// can react differently to, say, a wrong-format file (`InvalidSignature`)
/// and a right-format file that references a parent disk we cannot find
/// (`MissingDependency`).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Magic bytes or another identifier did not match the expected format.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// A header was structurally short or arithmetically impossible
    /// (cluster size out of range, table counts that do not fit the file, ...).
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// A known on-disk construct that this crate does not implement
    /// (encryption, exotic block locations, unknown compression methods, ...).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Metadata contradicted itself or failed verification (checksum, MD5,
    /// impossible bitmap states).
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(String),

    /// A sibling file required to serve reads (parent disk, data file,
    /// descriptor-listed extent) could not be located or opened.
    #[error("missing dependency{}: {message}", path.as_ref().map(|p| format!(" '{}'", p.display())).unwrap_or_default())]
    MissingDependency {
        message: String,
        path: Option<PathBuf>,
    },

    /// An index exceeded a declared count (BAT entry, vector index,
    /// directory entry, ...).
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// An I/O error from the underlying byte source.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: io::Error,
        path: Option<PathBuf>,
    },
}

/// A specialized `Result` for operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn signature(message: impl Into<String>) -> Self {
        Self::InvalidSignature(message.into())
    }

    pub fn header(message: impl Into<String>) -> Self {
        Self::InvalidHeader(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptMetadata(message.into())
    }

    pub fn missing(message: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::MissingDependency {
            message: message.into(),
            path: Some(path.into()),
        }
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::OutOfRange(message.into())
    }

    /// An I/O error with path context.
    pub fn io(source: io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Self::Io { source, path: None }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io { source, path: None } => source,
            Error::Io {
                source,
                path: Some(path),
            } => io::Error::new(
                source.kind(),
                format!("{} (at '{}')", source, path.display()),
            ),
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_dependency_message() {
        let err = Error::missing("parent disk not found", "/vm/parent.vhdx");
        let msg = err.to_string();
        assert!(msg.contains("missing dependency"));
        assert!(msg.contains("/vm/parent.vhdx"));
    }

    #[test]
    fn test_io_error_round_trip() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err: Error = io_err.into();
        let back: io::Error = err.into();
        assert_eq!(back.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_library_error_becomes_invalid_data() {
        let err = Error::signature("not a qcow2 file");
        let back: io::Error = err.into();
        assert_eq!(back.kind(), io::ErrorKind::InvalidData);
        assert!(back.to_string().contains("invalid signature"));
    }
}
