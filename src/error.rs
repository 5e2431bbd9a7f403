//! Error taxonomy for the filesystem core.
//!
//! The I/O layers (raw, block, cipher, MAC) report [`IoError`], which maps
//! onto a negative POSIX errno at the host boundary. Subsystem errors
//! (crypto, name codecs, configuration) have their own typed enums and are
//! converted here so a single `to_errno` call covers every failure the host
//! can observe.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::name::NameError;

/// A POSIX errno value, always positive. Hosts negate it on the wire.
pub type Errno = i32;

/// Errors surfaced by the file I/O stack and the directory layer.
#[derive(Debug, Error)]
pub enum IoError {
    /// Data failed an integrity check: MAC mismatch, header decode failure,
    /// or a cipher primitive rejecting its input.
    #[error("integrity failure: {0}")]
    Integrity(&'static str),

    /// The operation is forbidden in the current mode, e.g. writing through
    /// a reverse mount with per-file IVs.
    #[error("operation not permitted: {0}")]
    NotPermitted(&'static str),

    /// The mount is busy (unmounting, or a file is still open).
    #[error("resource busy: {0}")]
    Busy(&'static str),

    /// Path translation failed before any backing I/O was attempted.
    #[error("name translation failed: {0}")]
    Name(#[from] NameError),

    /// An OS error from the raw file layer, passed through verbatim.
    #[error(transparent)]
    Os(#[from] io::Error),
}

impl IoError {
    /// The positive errno equivalent of this error.
    pub fn to_errno(&self) -> Errno {
        match self {
            IoError::Integrity(_) => libc::EBADMSG,
            IoError::NotPermitted(_) => libc::EPERM,
            IoError::Busy(_) => libc::EBUSY,
            IoError::Name(_) => libc::EIO,
            IoError::Os(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Wrap a raw errno value, preserving it across the stack.
    pub fn from_errno(errno: Errno) -> Self {
        IoError::Os(io::Error::from_raw_os_error(errno))
    }

    /// True if the underlying OS error is the given errno.
    pub fn is_errno(&self, errno: Errno) -> bool {
        self.to_errno() == errno
    }
}

impl From<CryptoError> for IoError {
    fn from(e: CryptoError) -> Self {
        tracing::debug!("cipher primitive failure: {e}");
        IoError::Integrity("cipher primitive failure")
    }
}

impl From<ConfigError> for IoError {
    fn from(e: ConfigError) -> Self {
        tracing::warn!("configuration error at I/O boundary: {e}");
        IoError::Os(io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}

/// Result alias used throughout the I/O stack.
pub type IoResult<T> = Result<T, IoError>;
