//! Namespace and mount management.
//!
//! [`FsRuntime`] bundles everything a mount shares: configuration, cipher,
//! volume key, name codec and options. A [`DirNode`](dir_node::DirNode)
//! translates the plaintext namespace onto the backing tree and hands out
//! [`FileNode`](file_node::FileNode)s, while the
//! [`Context`](context::Context) deduplicates open files, allocates FUSE
//! handles and drives idle unmounting.

pub mod context;
pub mod dir_node;
pub mod file_node;

use std::sync::Arc;

use crate::config::{ConfigError, FsConfig};
use crate::crypto::{Cipher, CipherKey};
use crate::name::{new_name_codec, PathCodec};
use crate::opts::MountOpts;

pub use context::Context;
pub use dir_node::{DirNode, DirTraverse};
pub use file_node::FileNode;

/// Shared, immutable state of one mount.
#[derive(Clone)]
pub struct FsRuntime {
    pub config: Arc<FsConfig>,
    pub opts: Arc<MountOpts>,
    pub cipher: Arc<Cipher>,
    pub key: Arc<CipherKey>,
    pub naming: Arc<PathCodec>,
}

impl FsRuntime {
    /// Assemble the runtime from an unlocked volume.
    pub fn new(
        config: FsConfig,
        opts: MountOpts,
        cipher: Cipher,
        key: CipherKey,
    ) -> Result<FsRuntime, ConfigError> {
        config.validate(cipher.cipher_block_size())?;
        let cipher = Arc::new(cipher);
        let key = Arc::new(key);
        let codec = new_name_codec(&config.name_iface, Arc::clone(&cipher), Arc::clone(&key))
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let naming = Arc::new(PathCodec::new(
            codec,
            config.chained_name_iv,
            opts.reverse_encryption,
        ));
        Ok(FsRuntime {
            config: Arc::new(config),
            opts: Arc::new(opts),
            cipher,
            key,
            naming,
        })
    }

    pub fn reverse(&self) -> bool {
        self.opts.reverse_encryption
    }
}

/// Temporarily adopt the caller's filesystem identity for a create
/// operation. Only meaningful on Linux; other platforms ignore the request.
#[cfg(target_os = "linux")]
pub(crate) fn with_fs_ids<T>(
    uid: u32,
    gid: u32,
    f: impl FnOnce() -> T,
) -> Result<T, crate::error::IoError> {
    let mut old_gid: Option<u32> = None;
    let mut old_uid: Option<u32> = None;

    if gid != 0 {
        // setfsgid always succeeds and returns the previous value; probe to
        // detect whether the switch actually took
        let prev = unsafe { libc::setfsgid(gid) };
        if unsafe { libc::setfsgid(gid) } != gid as i32 {
            unsafe { libc::setfsgid(prev as libc::gid_t) };
            tracing::debug!("setfsgid to {gid} failed");
            return Err(crate::error::IoError::NotPermitted("setfsgid failed"));
        }
        old_gid = Some(prev as u32);
    }
    if uid != 0 {
        let prev = unsafe { libc::setfsuid(uid) };
        if unsafe { libc::setfsuid(uid) } != uid as i32 {
            unsafe { libc::setfsuid(prev as libc::uid_t) };
            if let Some(g) = old_gid {
                unsafe { libc::setfsgid(g as libc::gid_t) };
            }
            tracing::debug!("setfsuid to {uid} failed");
            return Err(crate::error::IoError::NotPermitted("setfsuid failed"));
        }
        old_uid = Some(prev as u32);
    }

    let result = f();

    if let Some(u) = old_uid {
        unsafe { libc::setfsuid(u as libc::uid_t) };
    }
    if let Some(g) = old_gid {
        unsafe { libc::setfsgid(g as libc::gid_t) };
    }
    Ok(result)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn with_fs_ids<T>(
    _uid: u32,
    _gid: u32,
    f: impl FnOnce() -> T,
) -> Result<T, crate::error::IoError> {
    Ok(f())
}
