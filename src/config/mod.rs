//! Per-mount persisted configuration.
//!
//! The configuration file lives at the root of the ciphertext tree and binds
//! everything a mount needs to interpret it: cipher and name-codec
//! interfaces, block geometry, feature flags, and the volume key wrapped
//! under a password-derived key. Serialization is XML with integers as
//! decimal, booleans as `0`/`1` and binary as standard base64; the record
//! must round-trip losslessly.
//!
//! The older binary container format lives in [`var`].

pub mod var;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{Cipher, CipherKey, CryptoError, Interface};

pub use var::{ConfigMap, ConfigVar};

/// Name of the configuration file at the ciphertext root.
pub const CONFIG_FILE_NAME: &str = ".veilfs.xml";

/// Format version written by this implementation.
pub const CONFIG_VERSION: u32 = 6;
/// Oldest format version this implementation still reads.
pub const MIN_CONFIG_VERSION: u32 = 6;

/// Salt length for freshly created volumes.
const SALT_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration parse error: {0}")]
    Xml(#[from] quick_xml::DeError),

    #[error("configuration serialize error: {0}")]
    XmlWrite(#[from] quick_xml::SeError),

    #[error("unsupported configuration version {0}")]
    UnsupportedVersion(u32),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("truncated configuration data")]
    Truncated,

    #[error("invalid password")]
    WrongPassword,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

mod xml_bool {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
        let raw = String::deserialize(de)?;
        match raw.trim() {
            "0" | "false" => Ok(false),
            "1" | "true" => Ok(true),
            other => Err(serde::de::Error::custom(format!(
                "expected 0/1 boolean, got {other:?}"
            ))),
        }
    }
}

mod xml_base64 {
    use data_encoding::BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&BASE64.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(de)?;
        BASE64
            .decode(raw.trim().as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// The persisted per-mount record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsConfig {
    /// Format version, gated on load.
    pub version: u32,

    /// Content cipher identity.
    #[serde(rename = "cipherAlg")]
    pub cipher_iface: Interface,

    /// Filename codec identity.
    #[serde(rename = "nameAlg")]
    pub name_iface: Interface,

    /// Cipher key size in bits.
    #[serde(rename = "keySize")]
    pub key_size_bits: u32,

    /// Filesystem block size in bytes; a multiple of the cipher block size.
    #[serde(rename = "blockSize")]
    pub block_size: u32,

    /// Store a random 64-bit IV in each file's header.
    #[serde(rename = "uniqueIV", with = "xml_bool")]
    pub unique_iv: bool,

    /// Thread the name-encoding IV along path components.
    #[serde(rename = "chainedNameIV", with = "xml_bool")]
    pub chained_name_iv: bool,

    /// Mix the path-derived IV into each file's header encryption.
    #[serde(rename = "externalIVChaining", with = "xml_bool")]
    pub external_iv_chaining: bool,

    /// Per-block MAC length in bytes, 0..=8.
    #[serde(rename = "blockMACBytes")]
    pub block_mac_bytes: u32,

    /// Per-block random prefix length in bytes.
    #[serde(rename = "blockMACRandBytes")]
    pub block_mac_rand_bytes: u32,

    /// Keep never-written regions sparse and readable as zeros.
    #[serde(rename = "allowHoles", with = "xml_bool")]
    pub allow_holes: bool,

    /// Length of the wrapped volume key blob.
    #[serde(rename = "encodedKeySize")]
    pub encoded_key_size: u32,

    /// Volume key wrapped under the password-derived key.
    #[serde(rename = "encodedKeyData", with = "xml_base64")]
    pub encoded_key_data: Vec<u8>,

    /// KDF salt length in bytes.
    #[serde(rename = "saltLen")]
    pub salt_len: u32,

    /// KDF salt.
    #[serde(rename = "saltData", with = "xml_base64")]
    pub salt_data: Vec<u8>,

    /// PBKDF2 iteration count; zero selects the legacy password KDF.
    #[serde(rename = "kdfIterations")]
    pub kdf_iterations: u32,

    /// Auto-tune target for the KDF, in milliseconds.
    #[serde(rename = "desiredKDFDuration")]
    pub desired_kdf_duration_ms: u64,
}

impl FsConfig {
    /// Bytes of plaintext presented per block once MAC and random prefixes
    /// are carved out.
    pub fn data_block_size(&self) -> u32 {
        self.block_size - self.block_mac_bytes - self.block_mac_rand_bytes
    }

    /// Check the structural invariants against the cipher's geometry.
    pub fn validate(&self, cipher_block_size: usize) -> Result<(), ConfigError> {
        if self.block_size == 0 || self.block_size as usize % cipher_block_size != 0 {
            return Err(ConfigError::Invalid(format!(
                "block size {} must be a positive multiple of the cipher block size {}",
                self.block_size, cipher_block_size
            )));
        }
        if self.block_mac_bytes > 8 {
            return Err(ConfigError::Invalid(format!(
                "per-block MAC length {} exceeds 8 bytes",
                self.block_mac_bytes
            )));
        }
        if self.block_mac_bytes + self.block_mac_rand_bytes >= self.block_size {
            return Err(ConfigError::Invalid(
                "block headers leave no room for data".into(),
            ));
        }
        if self.encoded_key_data.len() != self.encoded_key_size as usize {
            return Err(ConfigError::Invalid(
                "encoded key length disagrees with encodedKeySize".into(),
            ));
        }
        if self.salt_data.len() != self.salt_len as usize {
            return Err(ConfigError::Invalid(
                "salt length disagrees with saltLen".into(),
            ));
        }
        Ok(())
    }

    /// Parse from XML, applying the version gate.
    pub fn from_xml(text: &str) -> Result<FsConfig, ConfigError> {
        let config: FsConfig = quick_xml::de::from_str(text)?;
        if config.version < MIN_CONFIG_VERSION || config.version > CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(config.version));
        }
        Ok(config)
    }

    /// Serialize to XML.
    pub fn to_xml(&self) -> Result<String, ConfigError> {
        let body = quick_xml::se::to_string_with_root("veilfs", self)?;
        Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{body}\n"))
    }

    /// Load the configuration from a ciphertext root directory.
    pub fn load(root_dir: &Path) -> Result<FsConfig, ConfigError> {
        let text = std::fs::read_to_string(root_dir.join(CONFIG_FILE_NAME))?;
        FsConfig::from_xml(&text)
    }

    /// Persist the configuration into a ciphertext root directory.
    pub fn save(&self, root_dir: &Path) -> Result<(), ConfigError> {
        std::fs::write(root_dir.join(CONFIG_FILE_NAME), self.to_xml()?)?;
        Ok(())
    }
}

/// Parameters for creating a new volume.
#[derive(Debug, Clone)]
pub struct VolumeParams {
    /// Cipher display name: `"AES"`, `"Blowfish"` or `"CAMELLIA"`.
    pub cipher: String,
    pub key_size_bits: u32,
    pub block_size: u32,
    pub name_codec: Interface,
    pub unique_iv: bool,
    pub chained_name_iv: bool,
    pub external_iv_chaining: bool,
    pub block_mac_bytes: u32,
    pub block_mac_rand_bytes: u32,
    pub allow_holes: bool,
    /// Zero auto-tunes toward `desired_kdf_duration`.
    pub kdf_iterations: u32,
    pub desired_kdf_duration: Duration,
}

impl Default for VolumeParams {
    fn default() -> Self {
        VolumeParams {
            cipher: "AES".into(),
            key_size_bits: 192,
            block_size: 1024,
            name_codec: crate::name::BlockCodec::current_interface(false),
            unique_iv: true,
            chained_name_iv: true,
            external_iv_chaining: false,
            block_mac_bytes: 0,
            block_mac_rand_bytes: 0,
            allow_holes: true,
            kdf_iterations: 0,
            desired_kdf_duration: Duration::from_millis(500),
        }
    }
}

/// Create a fresh volume: generate the volume key, wrap it under the
/// password, and produce the record to persist.
pub fn create_volume(
    params: &VolumeParams,
    password: &[u8],
) -> Result<(FsConfig, Cipher, CipherKey), ConfigError> {
    let cipher = Cipher::new(&params.cipher, params.key_size_bits)?;
    let volume_key = cipher.new_random_key()?;

    let mut salt = vec![0u8; SALT_LEN];
    cipher.randomize(&mut salt)?;
    let (user_key, iterations) = cipher.new_key(
        password,
        &salt,
        params.kdf_iterations,
        params.desired_kdf_duration,
    )?;
    let encoded = cipher.write_key(&volume_key, &user_key)?;

    let config = FsConfig {
        version: CONFIG_VERSION,
        cipher_iface: cipher.interface().clone(),
        name_iface: params.name_codec.clone(),
        key_size_bits: (cipher.key_size() * 8) as u32,
        block_size: params.block_size,
        unique_iv: params.unique_iv,
        chained_name_iv: params.chained_name_iv,
        external_iv_chaining: params.external_iv_chaining,
        block_mac_bytes: params.block_mac_bytes,
        block_mac_rand_bytes: params.block_mac_rand_bytes,
        allow_holes: params.allow_holes,
        encoded_key_size: encoded.len() as u32,
        encoded_key_data: encoded,
        salt_len: salt.len() as u32,
        salt_data: salt,
        kdf_iterations: iterations,
        desired_kdf_duration_ms: params.desired_kdf_duration.as_millis() as u64,
    };
    config.validate(cipher.cipher_block_size())?;
    Ok((config, cipher, volume_key))
}

/// Unwrap the volume key of an existing configuration.
pub fn unlock_volume(
    config: &FsConfig,
    password: &[u8],
) -> Result<(Cipher, CipherKey), ConfigError> {
    let cipher = Cipher::from_interface(&config.cipher_iface, config.key_size_bits)?;
    config.validate(cipher.cipher_block_size())?;

    let user_key = if config.kdf_iterations == 0 || config.salt_data.is_empty() {
        cipher.new_legacy_key(password)?
    } else {
        let (key, _) = cipher.new_key(
            password,
            &config.salt_data,
            config.kdf_iterations,
            Duration::from_millis(config.desired_kdf_duration_ms),
        )?;
        key
    };

    match cipher.read_key(&config.encoded_key_data, &user_key, true) {
        Ok(volume_key) => Ok((cipher, volume_key)),
        Err(CryptoError::KeyChecksum { .. }) => Err(ConfigError::WrongPassword),
        Err(e) => Err(ConfigError::Crypto(e)),
    }
}
