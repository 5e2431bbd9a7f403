//! Mount options consumed by the core.
//!
//! The host (FUSE adapter, CLI) fills this in; the core treats it as
//! read-only state shared across a mount.

use std::path::PathBuf;

/// Options for a single mount, fixed for its lifetime.
#[derive(Debug, Clone, Default)]
pub struct MountOpts {
    /// Where the plaintext view is presented.
    pub mount_point: PathBuf,
    /// Backing directory holding ciphertext (plaintext in reverse mode).
    pub root_dir: PathBuf,
    /// Expose an encrypted view of a plaintext tree instead of the usual
    /// direction. Nothing is persisted to the backing tree in this mode.
    pub reverse_encryption: bool,
    /// Disable the single-block cache. Implied by reverse mode, where the
    /// backing tree may change underneath the mount.
    pub no_cache: bool,
    /// Downgrade block MAC mismatches from hard errors to warnings.
    pub force_decode: bool,
    /// Defer mounting until first access and allow idle-driven unmount to
    /// leave the mount point armed for remount.
    pub mount_on_demand: bool,
    /// Idle cycles before a lazy unmount is attempted; zero disables.
    pub idle_timeout_cycles: u32,
    /// Allow unlinking files that are still open. When unset, such unlinks
    /// fail with `EBUSY`.
    pub hard_remove: bool,
}

impl MountOpts {
    /// Whether the block cache must be bypassed for this mount.
    pub fn cache_disabled(&self) -> bool {
        self.no_cache || self.reverse_encryption
    }
}
