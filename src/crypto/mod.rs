//! Cryptographic capability layer.
//!
//! The rest of the crate never touches a primitive directly: it goes through
//! a [`Cipher`] (algorithm + key geometry chosen at mount time) and a
//! [`CipherKey`] (the derived material, zeroed on drop). Interface
//! descriptors tie persisted configurations to compatible implementations.

pub mod cipher;
pub mod interface;
pub(crate) mod kdf;
pub mod key;

pub use cipher::Cipher;
pub use interface::Interface;
pub use key::{CipherKey, KEY_CHECKSUM_BYTES, MAX_IV_LENGTH, MAX_KEY_LENGTH};

use thiserror::Error;

/// Failures of the cipher capability.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unknown cipher algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("cipher interface {0} is outside the supported compatibility window")]
    IncompatibleInterface(String),

    #[error("invalid key length: {0} bytes")]
    InvalidKeyLength(usize),

    #[error("buffer length {0} is not a multiple of the cipher block size")]
    Misaligned(usize),

    #[error("empty password")]
    EmptyPassword,

    #[error("stored key checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    KeyChecksum { stored: u32, computed: u32 },

    #[error("wrapped key blob has unexpected length {0}")]
    BadKeyBlob(usize),

    #[error("system RNG failure: {0}")]
    Rng(String),
}
