//! Block name codec.
//!
//! Pads the plaintext to a whole number of cipher blocks, prepends a 16-bit
//! MAC and encrypts with the cipher's block primitive, so encoded names leak
//! only a coarse length bucket. Output is base64 by default or base32 for
//! case-insensitive filesystems.
//!
//! Padding bytes all hold the padding length, which is always in
//! `[1, block size]`; a name that is already block-aligned gains one full
//! block of padding. Decoding validates the padding before trusting it.

use std::sync::Arc;

use super::base::{b32_len, b32_raw_len, b64_len, b64_raw_len, NAME_B32, NAME_B64};
use super::{NameCodec, NameError};
use crate::crypto::{Cipher, CipherKey, Interface};

pub struct BlockCodec {
    version: u32,
    block_size: usize,
    case_insensitive: bool,
    cipher: Arc<Cipher>,
    key: Arc<CipherKey>,
}

impl BlockCodec {
    pub fn current_interface(case_insensitive: bool) -> Interface {
        if case_insensitive {
            Interface::new("nameio/block32", 4, 0, 2)
        } else {
            Interface::new("nameio/block", 4, 0, 2)
        }
    }

    pub fn new(
        iface: &Interface,
        cipher: Arc<Cipher>,
        key: Arc<CipherKey>,
        case_insensitive: bool,
    ) -> BlockCodec {
        let block_size = cipher.cipher_block_size();
        debug_assert!(block_size < 128);
        BlockCodec {
            version: iface.current,
            block_size,
            case_insensitive,
            cipher,
            key,
        }
    }

    fn base_encode(&self, raw: &[u8]) -> String {
        if self.case_insensitive {
            NAME_B32.encode(raw)
        } else {
            NAME_B64.encode(raw)
        }
    }

    fn base_decode(&self, encoded: &str) -> Result<Vec<u8>, NameError> {
        let enc = if self.case_insensitive {
            &NAME_B32
        } else {
            &NAME_B64
        };
        enc.decode(encoded.as_bytes())
            .map_err(|e| NameError::BadEncoding(e.to_string()))
    }
}

impl NameCodec for BlockCodec {
    fn interface(&self) -> Interface {
        Self::current_interface(self.case_insensitive)
    }

    fn max_encoded_len(&self, plaintext_len: usize) -> usize {
        let blocks = (plaintext_len + self.block_size) / self.block_size;
        let raw_len = blocks * self.block_size + 2;
        if self.case_insensitive {
            b32_len(raw_len)
        } else {
            b64_len(raw_len)
        }
    }

    fn max_decoded_len(&self, encoded_len: usize) -> usize {
        let raw_len = if self.case_insensitive {
            b32_raw_len(encoded_len)
        } else {
            b64_raw_len(encoded_len)
        };
        raw_len.saturating_sub(2)
    }

    fn encode_name(&self, plaintext: &str, iv: Option<&mut u64>) -> Result<String, NameError> {
        let data = plaintext.as_bytes();
        let padding = self.block_size - data.len() % self.block_size;

        let mut buf = vec![0u8; data.len() + 2 + padding];
        buf[2..2 + data.len()].copy_from_slice(data);
        buf[2 + data.len()..].fill(padding as u8);

        let chain_in = if self.version >= 3 {
            iv.as_deref().copied().unwrap_or(0)
        } else {
            0
        };
        let mac = self.cipher.mac_16(&buf[2..], &self.key, iv);
        buf[0] = (mac >> 8) as u8;
        buf[1] = mac as u8;

        self.cipher
            .block_encode(&mut buf[2..], u64::from(mac) ^ chain_in, &self.key)?;

        Ok(self.base_encode(&buf))
    }

    fn decode_name(&self, encoded: &str, iv: Option<&mut u64>) -> Result<String, NameError> {
        let mut raw = self.base_decode(encoded)?;
        if raw.len() < 2 + self.block_size {
            tracing::debug!("rejecting filename {encoded}: too short to decode");
            return Err(NameError::TooShort);
        }
        let stream_len = raw.len() - 2;
        if stream_len % self.block_size != 0 {
            return Err(NameError::BadEncoding(format!(
                "{stream_len} bytes is not a whole number of cipher blocks"
            )));
        }

        let mac = u16::from(raw[0]) << 8 | u16::from(raw[1]);
        let chain_in = if self.version >= 3 {
            iv.as_deref().copied().unwrap_or(0)
        } else {
            0
        };

        self.cipher
            .block_decode(&mut raw[2..], u64::from(mac) ^ chain_in, &self.key)?;

        let padding = raw[raw.len() - 1] as usize;
        if padding == 0 || padding > self.block_size || padding > stream_len {
            tracing::debug!(
                "invalid padding {padding} (block size {}, stream {stream_len})",
                self.block_size
            );
            return Err(NameError::BadPadding {
                padding: padding as u8,
                block_size: self.block_size,
            });
        }
        let final_len = stream_len - padding;

        let verify = self.cipher.mac_16(&raw[2..], &self.key, iv);
        if verify != mac {
            tracing::debug!(
                "block name checksum mismatch: expected {mac}, got {verify} on {final_len} bytes"
            );
            return Err(NameError::ChecksumMismatch {
                expected: mac,
                got: verify,
            });
        }

        String::from_utf8(raw[2..2 + final_len].to_vec())
            .map_err(|e| NameError::NotUtf8(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key::CipherKey;

    fn codec(case_insensitive: bool) -> BlockCodec {
        let cipher = Arc::new(Cipher::new("AES", 256).unwrap());
        let mut key = CipherKey::zeroed(cipher.key_size(), cipher.cipher_block_size());
        for (i, b) in key.material_mut().iter_mut().enumerate() {
            *b = (i * 3 + 1) as u8;
        }
        BlockCodec::new(
            &BlockCodec::current_interface(case_insensitive),
            cipher,
            Arc::new(key),
            case_insensitive,
        )
    }

    #[test]
    fn round_trip_various_lengths() {
        let c = codec(false);
        for name in [
            "a",
            "exactly-16-chars",
            "one-more-than-16!",
            "short.txt",
            "a much longer file name that spans several cipher blocks.tar.gz",
        ] {
            let enc = c.encode_name(name, None).unwrap();
            assert!(enc.len() <= c.max_encoded_len(name.len()));
            assert_eq!(c.decode_name(&enc, None).unwrap(), name);
        }
    }

    #[test]
    fn base32_round_trip() {
        let c = codec(true);
        let enc = c.encode_name("CaseFold.me", None).unwrap();
        assert!(enc
            .chars()
            .all(|ch| ch.is_ascii_uppercase() || ('2'..='7').contains(&ch)));
        assert_eq!(c.decode_name(&enc, None).unwrap(), "CaseFold.me");
    }

    #[test]
    fn equal_length_names_encode_to_equal_length() {
        let c = codec(false);
        let a = c.encode_name("aaaaaaaa", None).unwrap();
        let b = c.encode_name("bbbbbbbb", None).unwrap();
        assert_eq!(a.len(), b.len());
        assert_ne!(a, b);
    }

    #[test]
    fn chained_iv_round_trip() {
        let c = codec(false);
        let mut enc_iv = 99u64;
        let enc = c.encode_name("chained", Some(&mut enc_iv)).unwrap();
        let mut dec_iv = 99u64;
        assert_eq!(c.decode_name(&enc, Some(&mut dec_iv)).unwrap(), "chained");
        assert_eq!(enc_iv, dec_iv);

        let mut wrong = 100u64;
        assert!(c.decode_name(&enc, Some(&mut wrong)).is_err());
    }

    #[test]
    fn corruption_detected() {
        let c = codec(false);
        let enc = c.encode_name("important", None).unwrap();
        let mut chars: Vec<char> = enc.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == ',' { '-' } else { ',' };
        let tampered: String = chars.into_iter().collect();
        assert!(c.decode_name(&tampered, None).is_err());
    }

    #[test]
    fn undersized_names_rejected() {
        let c = codec(false);
        assert!(matches!(
            c.decode_name("abc", None),
            Err(NameError::TooShort) | Err(NameError::BadEncoding(_))
        ));
    }
}
