#![forbid(unsafe_code)]
//! Error types for the APFS reader.
//!
//! Defines `ApfsError` and a `Result<T>` alias used throughout the
//! workspace, plus errno mappings for FUSE response codes.

use thiserror::Error;

/// Unified error type for all reader operations.
#[derive(Debug, Error)]
pub enum ApfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,
}

impl ApfsError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Invalid(_) => libc::EINVAL,
            Self::Corruption { .. } => libc::EIO,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
        }
    }

    /// True for the corruption class that must be logged at alert severity.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

/// Result alias using `ApfsError`.
pub type Result<T> = std::result::Result<T, ApfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(
            ApfsError::Invalid("bad option".into()).to_errno(),
            libc::EINVAL
        );
        assert_eq!(
            ApfsError::Corruption {
                block: 7,
                detail: "checksum mismatch".into()
            }
            .to_errno(),
            libc::EIO
        );
        assert_eq!(
            ApfsError::NotFound("no record".into()).to_errno(),
            libc::ENOENT
        );
        assert_eq!(ApfsError::NotDirectory.to_errno(), libc::ENOTDIR);
    }

    #[test]
    fn io_errno_passthrough() {
        let err = ApfsError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.to_errno(), libc::ENOSPC);
    }
}
