//! Stream name codec.
//!
//! Keeps encoded names as short as possible: a 16-bit MAC of the plaintext
//! followed by the stream-encoded plaintext, base64'd. The MAC doubles as
//! the encryption IV seed (mixed with the chained path IV), so equal names
//! in different directories encode differently when chaining is on.
//!
//! Interface history: version 0 stored the MAC after the name; version 1
//! moved it in front; version 2 added the chained IV contribution. Old
//! suffix-MAC names are still decoded, but encoding always emits the modern
//! layout.

use std::sync::Arc;

use super::base::{b64_len, b64_raw_len, NAME_B64};
use super::{NameCodec, NameError};
use crate::crypto::{Cipher, CipherKey, Interface};

pub struct StreamCodec {
    version: u32,
    cipher: Arc<Cipher>,
    key: Arc<CipherKey>,
}

impl StreamCodec {
    pub fn current_interface() -> Interface {
        Interface::new("nameio/stream", 2, 1, 2)
    }

    pub fn new(iface: &Interface, cipher: Arc<Cipher>, key: Arc<CipherKey>) -> StreamCodec {
        StreamCodec {
            version: iface.current,
            cipher,
            key,
        }
    }
}

impl NameCodec for StreamCodec {
    fn interface(&self) -> Interface {
        Self::current_interface()
    }

    fn max_encoded_len(&self, plaintext_len: usize) -> usize {
        b64_len(plaintext_len + 2)
    }

    fn max_decoded_len(&self, encoded_len: usize) -> usize {
        b64_raw_len(encoded_len).saturating_sub(2)
    }

    fn encode_name(&self, plaintext: &str, iv: Option<&mut u64>) -> Result<String, NameError> {
        let data = plaintext.as_bytes();
        let chain_in = if self.version >= 2 {
            iv.as_deref().copied().unwrap_or(0)
        } else {
            0
        };
        let mac = self.cipher.mac_16(data, &self.key, iv);

        let mut buf = vec![0u8; data.len() + 2];
        buf[0] = (mac >> 8) as u8;
        buf[1] = mac as u8;
        buf[2..].copy_from_slice(data);
        self.cipher
            .stream_encode(&mut buf[2..], u64::from(mac) ^ chain_in, &self.key)?;

        Ok(NAME_B64.encode(&buf))
    }

    fn decode_name(&self, encoded: &str, iv: Option<&mut u64>) -> Result<String, NameError> {
        if encoded.len() <= 2 {
            return Err(NameError::TooShort);
        }
        let raw = NAME_B64
            .decode(encoded.as_bytes())
            .map_err(|e| NameError::BadEncoding(e.to_string()))?;
        if raw.len() <= 2 {
            return Err(NameError::TooShort);
        }
        let stream_len = raw.len() - 2;

        let (mac, mut name) = if self.version >= 1 {
            let mac = u16::from(raw[0]) << 8 | u16::from(raw[1]);
            (mac, raw[2..].to_vec())
        } else {
            // legacy layout: MAC trails the name
            let mac = u16::from(raw[stream_len]) << 8 | u16::from(raw[stream_len + 1]);
            (mac, raw[..stream_len].to_vec())
        };

        let chain_in = if self.version >= 2 {
            iv.as_deref().copied().unwrap_or(0)
        } else {
            0
        };
        self.cipher
            .stream_decode(&mut name, u64::from(mac) ^ chain_in, &self.key)?;

        let verify = self.cipher.mac_16(&name, &self.key, iv);
        if verify != mac {
            tracing::debug!(
                "stream name checksum mismatch: expected {mac}, got {verify} on {stream_len} bytes"
            );
            return Err(NameError::ChecksumMismatch {
                expected: mac,
                got: verify,
            });
        }

        String::from_utf8(name).map_err(|e| NameError::NotUtf8(e.to_string()))
    }
}
