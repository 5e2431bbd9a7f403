//! Filename encoding.
//!
//! A [`NameCodec`] transforms a single UTF-8 name; a [`PathCodec`] applies
//! the codec along a `/`-separated path, optionally threading an IV between
//! components so a name's ciphertext depends on where it lives. In reverse
//! mode the directions swap: "encoding" a mount-visible path decodes it back
//! to the backing tree's names, which keeps the directory layer agnostic of
//! the mount direction.

pub mod base;
pub mod block;
pub mod null;
pub mod stream;

use std::sync::Arc;

use thiserror::Error;

use crate::crypto::{Cipher, CipherKey, Interface};

pub use block::BlockCodec;
pub use null::NullCodec;
pub use stream::StreamCodec;

/// Failures of name encoding and decoding.
///
/// Decoding failures are expected in normal operation: backing directories
/// can contain entries that were never encoded (dropped temp files, foreign
/// tools). Directory iteration surfaces such names separately instead of
/// failing the listing.
#[derive(Debug, Error)]
pub enum NameError {
    #[error("name too short to decode")]
    TooShort,

    #[error("invalid base encoding: {0}")]
    BadEncoding(String),

    #[error("name checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u16, got: u16 },

    #[error("invalid name padding {padding} for block size {block_size}")]
    BadPadding { padding: u8, block_size: usize },

    #[error("decoded name is not UTF-8: {0}")]
    NotUtf8(String),

    #[error("unknown name codec: {0}")]
    UnknownCodec(String),

    #[error("name codec interface {0} is outside the supported compatibility window")]
    IncompatibleInterface(String),

    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),
}

/// A transform over single filename components.
///
/// `iv` is both input and output when IV chaining is active: the incoming
/// value seasons this component's ciphertext, and the component's own MAC
/// replaces it for the next component.
pub trait NameCodec: Send + Sync {
    fn interface(&self) -> Interface;

    /// Upper bound on the encoded length of an `plaintext_len`-byte name.
    fn max_encoded_len(&self, plaintext_len: usize) -> usize;

    /// Upper bound on the decoded length of an `encoded_len`-byte name.
    fn max_decoded_len(&self, encoded_len: usize) -> usize;

    fn encode_name(&self, plaintext: &str, iv: Option<&mut u64>) -> Result<String, NameError>;

    fn decode_name(&self, encoded: &str, iv: Option<&mut u64>) -> Result<String, NameError>;
}

/// Construct the codec a persisted interface descriptor names.
pub fn new_name_codec(
    iface: &Interface,
    cipher: Arc<Cipher>,
    key: Arc<CipherKey>,
) -> Result<Box<dyn NameCodec>, NameError> {
    let check = |current: Interface| -> Result<(), NameError> {
        if current.supports(iface) {
            Ok(())
        } else {
            Err(NameError::IncompatibleInterface(iface.to_string()))
        }
    };
    match iface.name.as_str() {
        "nameio/null" => {
            check(NullCodec::current_interface())?;
            Ok(Box::new(NullCodec))
        }
        "nameio/stream" => {
            check(StreamCodec::current_interface())?;
            Ok(Box::new(StreamCodec::new(iface, cipher, key)))
        }
        "nameio/block" => {
            check(BlockCodec::current_interface(false))?;
            Ok(Box::new(BlockCodec::new(iface, cipher, key, false)))
        }
        "nameio/block32" => {
            check(BlockCodec::current_interface(true))?;
            Ok(Box::new(BlockCodec::new(iface, cipher, key, true)))
        }
        other => Err(NameError::UnknownCodec(other.to_owned())),
    }
}

/// Path-level application of a name codec.
pub struct PathCodec {
    codec: Box<dyn NameCodec>,
    chained_name_iv: bool,
    reverse: bool,
}

impl PathCodec {
    pub fn new(codec: Box<dyn NameCodec>, chained_name_iv: bool, reverse: bool) -> PathCodec {
        PathCodec {
            codec,
            chained_name_iv,
            reverse,
        }
    }

    pub fn chained_name_iv(&self) -> bool {
        self.chained_name_iv
    }

    pub fn interface(&self) -> Interface {
        self.codec.interface()
    }

    /// Encode one component toward the backing store. In reverse mode this
    /// is a decode of the mount-visible ciphertext name.
    pub fn encode_name(&self, name: &str, iv: Option<&mut u64>) -> Result<String, NameError> {
        if self.reverse {
            self.codec.decode_name(name, iv)
        } else {
            self.codec.encode_name(name, iv)
        }
    }

    /// Decode one component toward the mount view. In reverse mode this is
    /// an encode of a backing plaintext name.
    pub fn decode_name(&self, name: &str, iv: Option<&mut u64>) -> Result<String, NameError> {
        if self.reverse {
            self.codec.encode_name(name, iv)
        } else {
            self.codec.decode_name(name, iv)
        }
    }

    /// Encode a whole `/`-separated path toward the backing store.
    ///
    /// With IV chaining enabled, each component's chain value feeds the
    /// next; the caller's `iv` receives the chain value of the final
    /// component. `.` and `..` pass through and do not advance the chain.
    pub fn encode_path(&self, path: &str, iv: Option<&mut u64>) -> Result<String, NameError> {
        self.recode_path(path, iv, |name, iv| self.encode_name(name, iv))
    }

    /// Decode a whole path toward the mount view.
    pub fn decode_path(&self, path: &str, iv: Option<&mut u64>) -> Result<String, NameError> {
        self.recode_path(path, iv, |name, iv| self.decode_name(name, iv))
    }

    fn recode_path<F>(
        &self,
        path: &str,
        iv: Option<&mut u64>,
        code: F,
    ) -> Result<String, NameError>
    where
        F: Fn(&str, Option<&mut u64>) -> Result<String, NameError>,
    {
        let mut local_iv = 0u64;
        let mut chain: Option<&mut u64> = match (self.chained_name_iv, iv) {
            (true, Some(v)) => Some(v),
            (true, None) => Some(&mut local_iv),
            (false, _) => None,
        };

        let mut out = String::new();
        for part in path.split('/') {
            if part.is_empty() {
                continue;
            }
            let coded = if part == "." || part == ".." {
                part.to_owned()
            } else {
                code(part, chain.as_deref_mut())?
            };
            if !out.is_empty() {
                out.push('/');
            }
            out.push_str(&coded);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path_codec(chained: bool) -> PathCodec {
        let cipher = Arc::new(Cipher::new("AES", 192).unwrap());
        let mut key = crate::crypto::CipherKey::zeroed(24, 16);
        for (i, b) in key.material_mut().iter_mut().enumerate() {
            *b = (i + 100) as u8;
        }
        let key = Arc::new(key);
        let codec = new_name_codec(
            &BlockCodec::current_interface(false),
            cipher,
            key,
        )
        .unwrap();
        PathCodec::new(codec, chained, false)
    }

    #[test]
    fn path_round_trip_unchained() {
        let pc = path_codec(false);
        let enc = pc.encode_path("/docs/work/report.txt", None).unwrap();
        assert_eq!(enc.split('/').count(), 3);
        let dec = pc.decode_path(&enc, None).unwrap();
        assert_eq!(dec, "docs/work/report.txt");
    }

    #[test]
    fn path_round_trip_chained() {
        let pc = path_codec(true);
        let enc = pc.encode_path("/a/b/c", None).unwrap();
        let dec = pc.decode_path(&enc, None).unwrap();
        assert_eq!(dec, "a/b/c");
    }

    #[test]
    fn chaining_makes_names_position_dependent() {
        let pc = path_codec(true);
        let in_root = pc.encode_path("/name", None).unwrap();
        let nested = pc.encode_path("/dir/name", None).unwrap();
        let nested_leaf = nested.rsplit('/').next().unwrap();
        assert_ne!(in_root, nested_leaf);

        // without chaining, the same component encodes identically anywhere
        let pc = path_codec(false);
        let in_root = pc.encode_path("/name", None).unwrap();
        let nested = pc.encode_path("/dir/name", None).unwrap();
        let nested_leaf = nested.rsplit('/').next().unwrap();
        assert_eq!(in_root, nested_leaf);
    }

    #[test]
    fn dot_components_pass_through() {
        let pc = path_codec(true);
        assert_eq!(pc.encode_path(".", None).unwrap(), ".");
        assert_eq!(pc.encode_path("..", None).unwrap(), "..");
        assert_eq!(pc.encode_path("/", None).unwrap(), "");
        assert_eq!(pc.encode_path("", None).unwrap(), "");
    }

    #[test]
    fn caller_iv_receives_final_chain_value() {
        let pc = path_codec(true);
        let mut iv = 0u64;
        pc.encode_path("/a/b", Some(&mut iv)).unwrap();
        assert_ne!(iv, 0);

        let mut iv2 = 0u64;
        pc.encode_path("/a", Some(&mut iv2)).unwrap();
        assert_ne!(iv, iv2);
    }

    #[test]
    fn unknown_codec_rejected() {
        let cipher = Arc::new(Cipher::new("AES", 192).unwrap());
        let key = Arc::new(crate::crypto::CipherKey::zeroed(24, 16));
        let bogus = Interface::new("nameio/bogus", 1, 0, 0);
        assert!(matches!(
            new_name_codec(&bogus, cipher, key),
            Err(NameError::UnknownCodec(_))
        ));
    }
}
