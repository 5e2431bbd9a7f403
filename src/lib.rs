//! # veilfs
//!
//! Core of a transparent encrypting overlay filesystem. Plaintext
//! operations against a mount point translate, block by block and name by
//! name, into ciphertext operations against a backing directory; a reverse
//! mode exposes an encrypted view of a plaintext tree without persisting
//! anything.
//!
//! The crate is host-agnostic: a FUSE (or other) adapter dispatches
//! filesystem calls into [`fs::Context`] / [`fs::DirNode`] /
//! [`fs::FileNode`] and maps the returned errors to negative errno values
//! via [`error::IoError::to_errno`]. What lives here is the machinery:
//!
//! - the layered block-oriented encrypted file I/O pipeline
//!   ([`io::raw`] -> [`io::cipher`] -> [`io::mac`], driven by the generic
//!   block engine in [`io::block`]);
//! - the filename codecs with IV chaining along path components
//!   ([`name`]);
//! - the directory node manager, including recursive rename under IV
//!   chaining ([`fs::dir_node`]);
//! - the per-mount configuration record that binds cipher parameters, key
//!   material and codec identities ([`config`]);
//! - the cipher capability itself ([`crypto`]).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use veilfs::config::{create_volume, VolumeParams};
//! use veilfs::fs::{Context, DirNode, FsRuntime};
//! use veilfs::opts::MountOpts;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let params = VolumeParams::default();
//! let (config, cipher, volume_key) = create_volume(&params, b"password")?;
//! config.save("/tmp/backing".as_ref())?;
//!
//! let opts = MountOpts {
//!     root_dir: "/tmp/backing".into(),
//!     ..MountOpts::default()
//! };
//! let runtime = FsRuntime::new(config, opts.clone(), cipher, volume_key)?;
//!
//! let ctx = Context::new(Arc::new(opts));
//! let root = DirNode::new(&ctx, runtime.opts.root_dir.clone(), runtime);
//! ctx.set_root(root);
//!
//! let root = ctx.get_root()?;
//! root.lookup_node("/hello.txt")?.mknod(0o100644, 0, 0, 0)?;
//! let node = root.open_node("/hello.txt", true)?;
//! node.write(0, b"hello world")?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod io;
pub mod name;
pub mod opts;

pub use config::FsConfig;
pub use crypto::{Cipher, CipherKey, Interface};
pub use error::{Errno, IoError, IoResult};
pub use fs::{Context, DirNode, FileNode, FsRuntime};
pub use opts::MountOpts;
