//! Cipher key material.
//!
//! A [`CipherKey`] owns the derived key bytes plus the IV seed bytes that
//! feed the per-operation IV schedule. The material is zeroed on drop and
//! never appears in `Debug` output; everything else about a key (contexts,
//! MACs) is derived per operation from these bytes.

use std::fmt;

use zeroize::Zeroizing;

/// Upper bound on key bytes across all supported ciphers.
pub const MAX_KEY_LENGTH: usize = 32;
/// Upper bound on IV seed bytes across all supported ciphers.
pub const MAX_IV_LENGTH: usize = 16;
/// Checksum prefix length of a wrapped key blob.
pub const KEY_CHECKSUM_BYTES: usize = 4;

/// Secret key material for one mount: key bytes followed by IV seed bytes.
///
/// Shared by every I/O object of the mount for its whole lifetime; clone it
/// behind an `Arc`. Dropping the last owner zeroes the buffer.
#[derive(Clone)]
pub struct CipherKey {
    material: Zeroizing<Vec<u8>>,
    key_len: usize,
    iv_len: usize,
}

impl CipherKey {
    /// An all-zero key of the given geometry, ready to be filled by a KDF.
    pub(crate) fn zeroed(key_len: usize, iv_len: usize) -> Self {
        debug_assert!(key_len <= MAX_KEY_LENGTH && iv_len <= MAX_IV_LENGTH);
        CipherKey {
            material: Zeroizing::new(vec![0u8; key_len + iv_len]),
            key_len,
            iv_len,
        }
    }

    /// Adopt raw material (key bytes then IV bytes).
    pub(crate) fn from_material(material: &[u8], key_len: usize, iv_len: usize) -> Self {
        debug_assert_eq!(material.len(), key_len + iv_len);
        CipherKey {
            material: Zeroizing::new(material.to_vec()),
            key_len,
            iv_len,
        }
    }

    pub fn key_len(&self) -> usize {
        self.key_len
    }

    pub fn iv_len(&self) -> usize {
        self.iv_len
    }

    /// Total material length (key + IV seed).
    pub fn len(&self) -> usize {
        self.material.len()
    }

    pub fn is_empty(&self) -> bool {
        self.material.is_empty()
    }

    pub(crate) fn key_data(&self) -> &[u8] {
        &self.material[..self.key_len]
    }

    pub(crate) fn iv_data(&self) -> &[u8] {
        &self.material[self.key_len..]
    }

    pub(crate) fn material(&self) -> &[u8] {
        &self.material
    }

    pub(crate) fn material_mut(&mut self) -> &mut [u8] {
        &mut self.material
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never print key bytes
        f.debug_struct("CipherKey")
            .field("key_len", &self.key_len)
            .field("iv_len", &self.iv_len)
            .finish_non_exhaustive()
    }
}

impl PartialEq for CipherKey {
    fn eq(&self, other: &Self) -> bool {
        // test convenience; not constant time, keys never cross a trust
        // boundary through this
        self.key_len == other.key_len
            && self.iv_len == other.iv_len
            && self.material[..] == other.material[..]
    }
}

impl Eq for CipherKey {}
