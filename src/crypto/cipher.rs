//! Cipher capability.
//!
//! One [`Cipher`] value describes the algorithm a mount was created with and
//! exposes every primitive the stack needs: block encode/decode on
//! block-aligned buffers, a length-preserving stream transform for partial
//! blocks and filenames, keyed MACs with optional IV chaining, randomness,
//! and key derivation/wrapping. Algorithms are dispatched through a variant
//! type fixed at mount time; the [`Interface`] descriptor is retained for
//! configuration compatibility.
//!
//! The stream transform is deliberately not a plain CFB pass: the buffer is
//! xor-chained, encrypted, flipped in 64-byte chunks, chained again and
//! encrypted under the incremented IV, so every output byte depends on every
//! input byte in both directions. Block encoding is CBC without padding.
//!
//! Per-operation IVs are derived from the key's IV seed and a 64-bit
//! caller-supplied value via HMAC-SHA1, so related block numbers do not
//! produce related IVs.

use std::time::Duration;

use cipher::block_padding::NoPadding;
use cipher::{
    BlockCipher, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit,
};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use zeroize::Zeroizing;

use super::interface::Interface;
use super::kdf;
use super::key::{CipherKey, KEY_CHECKSUM_BYTES, MAX_IV_LENGTH};
use super::CryptoError;

type HmacSha1 = Hmac<Sha1>;

/// Salt length used when generating a fresh random volume key.
const RANDOM_KEY_SALT_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    Aes128,
    Aes192,
    Aes256,
    Blowfish,
    Camellia128,
    Camellia192,
    Camellia256,
}

/// A concrete cipher algorithm bound to a key geometry.
#[derive(Debug, Clone)]
pub struct Cipher {
    iface: Interface,
    real_iface: Interface,
    variant: Variant,
    key_len: usize,
    iv_len: usize,
}

fn aes_interface() -> Interface {
    Interface::new("cipher/aes", 3, 0, 2)
}

fn blowfish_interface() -> Interface {
    Interface::new("cipher/blowfish", 3, 0, 2)
}

fn camellia_interface() -> Interface {
    Interface::new("cipher/camellia", 3, 0, 2)
}

/// Closest permitted key size to `bits` within `[min, max]` stepping by `step`.
fn closest_key_bits(bits: u32, min: u32, max: u32, step: u32) -> u32 {
    let bits = bits.clamp(min, max);
    let down = (bits - min) / step * step + min;
    let up = down + step;
    if up > max || bits - down <= up - bits {
        down
    } else {
        up
    }
}

/// Propagate the previous byte into the next, front to back.
fn shuffle_bytes(buf: &mut [u8]) {
    for i in 1..buf.len() {
        buf[i] ^= buf[i - 1];
    }
}

/// Inverse of [`shuffle_bytes`].
fn unshuffle_bytes(buf: &mut [u8]) {
    for i in (1..buf.len()).rev() {
        buf[i] ^= buf[i - 1];
    }
}

/// Reverse byte order within each 64-byte chunk. Involutive.
fn flip_bytes(buf: &mut [u8]) {
    for chunk in buf.chunks_mut(64) {
        chunk.reverse();
    }
}

fn cfb_encrypt<C>(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), CryptoError>
where
    C: BlockCipher + BlockEncrypt + KeyInit,
{
    let mut enc = cfb_mode::BufEncryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    enc.encrypt(buf);
    Ok(())
}

fn cfb_decrypt<C>(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), CryptoError>
where
    C: BlockCipher + BlockEncrypt + KeyInit,
{
    let mut dec = cfb_mode::BufDecryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    dec.decrypt(buf);
    Ok(())
}

fn cbc_encrypt<C>(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), CryptoError>
where
    C: BlockCipher + BlockEncrypt + KeyInit,
{
    let len = buf.len();
    let enc = cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    enc.encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(|_| CryptoError::Misaligned(len))?;
    Ok(())
}

fn cbc_decrypt<C>(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), CryptoError>
where
    C: BlockCipher + BlockEncrypt + BlockDecrypt + KeyInit,
{
    let len = buf.len();
    let dec = cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    dec.decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| CryptoError::Misaligned(len))?;
    Ok(())
}

macro_rules! dispatch {
    ($variant:expr, $func:ident, $($arg:expr),*) => {
        match $variant {
            Variant::Aes128 => $func::<aes::Aes128>($($arg),*),
            Variant::Aes192 => $func::<aes::Aes192>($($arg),*),
            Variant::Aes256 => $func::<aes::Aes256>($($arg),*),
            Variant::Blowfish => $func::<blowfish::Blowfish>($($arg),*),
            Variant::Camellia128 => $func::<camellia::Camellia128>($($arg),*),
            Variant::Camellia192 => $func::<camellia::Camellia192>($($arg),*),
            Variant::Camellia256 => $func::<camellia::Camellia256>($($arg),*),
        }
    };
}

impl Cipher {
    /// Construct an algorithm by display name (`"AES"`, `"Blowfish"`,
    /// `"CAMELLIA"`) with the requested key size in bits. A size of zero
    /// selects the algorithm default; other sizes snap to the closest
    /// supported value.
    pub fn new(name: &str, key_bits: u32) -> Result<Cipher, CryptoError> {
        let iface = match name {
            "AES" => aes_interface(),
            "Blowfish" => blowfish_interface(),
            "CAMELLIA" => camellia_interface(),
            other => return Err(CryptoError::UnknownAlgorithm(other.to_owned())),
        };
        Cipher::from_interface(&iface, key_bits)
    }

    /// Construct from a persisted interface descriptor, applying the
    /// compatibility window.
    pub fn from_interface(iface: &Interface, key_bits: u32) -> Result<Cipher, CryptoError> {
        let (real_iface, is_blowfish) = match iface.name.as_str() {
            "cipher/aes" => (aes_interface(), false),
            "cipher/camellia" => (camellia_interface(), false),
            "cipher/blowfish" => (blowfish_interface(), true),
            other => return Err(CryptoError::UnknownAlgorithm(other.to_owned())),
        };
        if !real_iface.supports(iface) {
            return Err(CryptoError::IncompatibleInterface(iface.to_string()));
        }

        let cipher = if is_blowfish {
            let bits = if key_bits == 0 {
                160
            } else {
                closest_key_bits(key_bits, 128, 256, 32)
            };
            Cipher {
                iface: iface.clone(),
                real_iface,
                variant: Variant::Blowfish,
                key_len: bits as usize / 8,
                iv_len: 8,
            }
        } else {
            let bits = if key_bits == 0 {
                192
            } else {
                closest_key_bits(key_bits, 128, 256, 64)
            };
            let aes = iface.name == "cipher/aes";
            let variant = match (aes, bits) {
                (true, 128) => Variant::Aes128,
                (true, 192) => Variant::Aes192,
                (true, _) => Variant::Aes256,
                (false, 128) => Variant::Camellia128,
                (false, 192) => Variant::Camellia192,
                (false, _) => Variant::Camellia256,
            };
            Cipher {
                iface: iface.clone(),
                real_iface,
                variant,
                key_len: bits as usize / 8,
                iv_len: 16,
            }
        };

        tracing::debug!(
            "allocated cipher {}, keySize {}, ivLength {}",
            cipher.real_iface,
            cipher.key_len,
            cipher.iv_len
        );
        Ok(cipher)
    }

    pub fn interface(&self) -> &Interface {
        &self.real_iface
    }

    /// Key length in bytes.
    pub fn key_size(&self) -> usize {
        self.key_len
    }

    /// Native block size of the primitive; also the IV length.
    pub fn cipher_block_size(&self) -> usize {
        self.iv_len
    }

    /// Length of a wrapped key blob produced by [`Cipher::write_key`].
    pub fn encoded_key_size(&self) -> usize {
        self.key_len + self.iv_len + KEY_CHECKSUM_BYTES
    }

    /// Derive a key from a password with PBKDF2-HMAC-SHA1.
    ///
    /// When `iterations` is zero the count is auto-tuned toward
    /// `desired_duration` and the chosen count is returned for persistence;
    /// otherwise the given count is used verbatim.
    pub fn new_key(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        desired_duration: Duration,
    ) -> Result<(CipherKey, u32), CryptoError> {
        if password.is_empty() {
            return Err(CryptoError::EmptyPassword);
        }
        let mut key = CipherKey::zeroed(self.key_len, self.iv_len);
        let used = if iterations == 0 {
            kdf::derive_timed(password, salt, desired_duration, key.material_mut())
        } else {
            kdf::derive(password, salt, iterations, key.material_mut());
            iterations
        };
        Ok((key, used))
    }

    /// Derive a key from a password alone via the legacy iterated-digest
    /// scheme. Interface version 1 volumes used the primitive's native key
    /// length; later versions derive the configured length explicitly.
    pub fn new_legacy_key(&self, password: &[u8]) -> Result<CipherKey, CryptoError> {
        if password.is_empty() {
            return Err(CryptoError::EmptyPassword);
        }
        let mut key = CipherKey::zeroed(self.key_len, self.iv_len);
        let derive_len = if self.iface.current > 1 {
            self.key_len
        } else {
            let native = match self.variant {
                Variant::Blowfish => 16,
                _ => self.key_len,
            };
            if native != self.key_len {
                tracing::warn!(
                    "running in version-1 compatibility mode: key is really {} bits, not {}",
                    native * 8,
                    self.key_len * 8
                );
            }
            native
        };
        let key_len = self.key_len;
        let material = key.material_mut();
        let (key_part, iv_part) = material.split_at_mut(key_len);
        kdf::bytes_to_key(
            password,
            kdf::LEGACY_KDF_ROUNDS,
            &mut key_part[..derive_len],
            iv_part,
        );
        Ok(key)
    }

    /// Generate a fresh random volume key.
    pub fn new_random_key(&self) -> Result<CipherKey, CryptoError> {
        let mut seed = Zeroizing::new([0u8; 32]);
        let mut salt = [0u8; RANDOM_KEY_SALT_LEN];
        self.randomize(seed.as_mut())?;
        self.randomize(&mut salt)?;

        let mut key = CipherKey::zeroed(self.key_len, self.iv_len);
        kdf::derive(seed.as_ref(), &salt, 1000, key.material_mut());
        Ok(key)
    }

    /// Fill `buf` with cryptographically secure random bytes.
    pub fn randomize(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        buf.fill(0);
        OsRng
            .try_fill_bytes(buf)
            .map_err(|e| CryptoError::Rng(e.to_string()))
    }

    /// 64-bit keyed MAC of `data`.
    ///
    /// When `chained` is supplied, the previous chain value contributes to
    /// the digest and is replaced with the new MAC, threading a dependency
    /// along a sequence of calls (path components, rename lists).
    pub fn mac_64(&self, data: &[u8], key: &CipherKey, chained: Option<&mut u64>) -> u64 {
        match chained {
            Some(iv) => {
                let value = self.fold_mac(data, key, Some(*iv));
                *iv = value;
                value
            }
            None => self.fold_mac(data, key, None),
        }
    }

    /// 16-bit MAC: the xor-fold of the four 16-bit words of [`Cipher::mac_64`].
    pub fn mac_16(&self, data: &[u8], key: &CipherKey, chained: Option<&mut u64>) -> u16 {
        let mac = self.mac_64(data, key, chained);
        (((mac >> 48) ^ (mac >> 32) ^ (mac >> 16) ^ mac) & 0xffff) as u16
    }

    /// 32-bit MAC: the low half of [`Cipher::mac_64`]. Used as the wrapped-key
    /// checksum.
    pub fn mac_32(&self, data: &[u8], key: &CipherKey) -> u32 {
        (self.mac_64(data, key, None) & 0xffff_ffff) as u32
    }

    fn fold_mac(&self, data: &[u8], key: &CipherKey, chained: Option<u64>) -> u64 {
        let mut mac =
            <HmacSha1 as KeyInit>::new_from_slice(key.key_data()).expect("HMAC accepts any key length");
        mac.update(data);
        if let Some(iv) = chained {
            mac.update(&iv.to_le_bytes());
        }
        let digest = mac.finalize().into_bytes();

        // fold the digest to 8 bytes; the final digest byte is excluded
        let mut folded = [0u8; 8];
        for (i, b) in digest.iter().take(digest.len() - 1).enumerate() {
            folded[i % 8] ^= *b;
        }
        u64::from_be_bytes(folded)
    }

    /// Derive the per-operation IV for a 64-bit seed value.
    fn set_ivec(&self, seed: u64, key: &CipherKey) -> [u8; MAX_IV_LENGTH] {
        let mut mac =
            <HmacSha1 as KeyInit>::new_from_slice(key.key_data()).expect("HMAC accepts any key length");
        mac.update(key.iv_data());
        mac.update(&seed.to_le_bytes());
        let digest = mac.finalize().into_bytes();

        let mut ivec = [0u8; MAX_IV_LENGTH];
        ivec[..self.iv_len].copy_from_slice(&digest[..self.iv_len]);
        ivec
    }

    /// Length-preserving encryption of an arbitrary-length buffer.
    pub fn stream_encode(
        &self,
        buf: &mut [u8],
        iv64: u64,
        key: &CipherKey,
    ) -> Result<(), CryptoError> {
        if buf.is_empty() {
            return Ok(());
        }
        shuffle_bytes(buf);
        let ivec = self.set_ivec(iv64, key);
        dispatch!(
            self.variant,
            cfb_encrypt,
            key.key_data(),
            &ivec[..self.iv_len],
            buf
        )?;
        flip_bytes(buf);
        shuffle_bytes(buf);
        let ivec = self.set_ivec(iv64.wrapping_add(1), key);
        dispatch!(
            self.variant,
            cfb_encrypt,
            key.key_data(),
            &ivec[..self.iv_len],
            buf
        )
    }

    /// Inverse of [`Cipher::stream_encode`].
    pub fn stream_decode(
        &self,
        buf: &mut [u8],
        iv64: u64,
        key: &CipherKey,
    ) -> Result<(), CryptoError> {
        if buf.is_empty() {
            return Ok(());
        }
        let ivec = self.set_ivec(iv64.wrapping_add(1), key);
        dispatch!(
            self.variant,
            cfb_decrypt,
            key.key_data(),
            &ivec[..self.iv_len],
            buf
        )?;
        unshuffle_bytes(buf);
        flip_bytes(buf);
        let ivec = self.set_ivec(iv64, key);
        dispatch!(
            self.variant,
            cfb_decrypt,
            key.key_data(),
            &ivec[..self.iv_len],
            buf
        )?;
        unshuffle_bytes(buf);
        Ok(())
    }

    /// Encrypt a buffer whose length is a multiple of the cipher block size.
    pub fn block_encode(
        &self,
        buf: &mut [u8],
        iv64: u64,
        key: &CipherKey,
    ) -> Result<(), CryptoError> {
        if buf.len() % self.iv_len != 0 {
            return Err(CryptoError::Misaligned(buf.len()));
        }
        if buf.is_empty() {
            return Ok(());
        }
        let ivec = self.set_ivec(iv64, key);
        dispatch!(
            self.variant,
            cbc_encrypt,
            key.key_data(),
            &ivec[..self.iv_len],
            buf
        )
    }

    /// Inverse of [`Cipher::block_encode`].
    pub fn block_decode(
        &self,
        buf: &mut [u8],
        iv64: u64,
        key: &CipherKey,
    ) -> Result<(), CryptoError> {
        if buf.len() % self.iv_len != 0 {
            return Err(CryptoError::Misaligned(buf.len()));
        }
        if buf.is_empty() {
            return Ok(());
        }
        let ivec = self.set_ivec(iv64, key);
        dispatch!(
            self.variant,
            cbc_decrypt,
            key.key_data(),
            &ivec[..self.iv_len],
            buf
        )
    }

    /// Wrap `key` under `master` for persistence.
    ///
    /// Layout: 4-byte big-endian checksum (the 32-bit MAC of the plaintext
    /// material under the master key, which doubles as the stream IV seed)
    /// followed by the stream-encoded key and IV material.
    pub fn write_key(&self, key: &CipherKey, master: &CipherKey) -> Result<Vec<u8>, CryptoError> {
        let mut material = Zeroizing::new(key.material().to_vec());
        let checksum = self.mac_32(&material, master);
        self.stream_encode(&mut material, u64::from(checksum), master)?;

        let mut blob = Vec::with_capacity(self.encoded_key_size());
        blob.extend_from_slice(&checksum.to_be_bytes());
        blob.extend_from_slice(&material);
        Ok(blob)
    }

    /// Unwrap a key blob produced by [`Cipher::write_key`].
    pub fn read_key(
        &self,
        blob: &[u8],
        master: &CipherKey,
        check: bool,
    ) -> Result<CipherKey, CryptoError> {
        if blob.len() != self.encoded_key_size() {
            return Err(CryptoError::BadKeyBlob(blob.len()));
        }
        let stored = u32::from_be_bytes([blob[0], blob[1], blob[2], blob[3]]);
        let mut material = Zeroizing::new(blob[KEY_CHECKSUM_BYTES..].to_vec());
        self.stream_decode(&mut material, u64::from(stored), master)?;

        if check {
            let computed = self.mac_32(&material, master);
            if computed != stored {
                tracing::warn!(
                    "stored key checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
                );
                return Err(CryptoError::KeyChecksum { stored, computed });
            }
        }
        Ok(CipherKey::from_material(&material, self.key_len, self.iv_len))
    }
}
