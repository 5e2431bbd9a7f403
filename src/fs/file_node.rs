//! Per-file node.
//!
//! One [`FileNode`] exists per open ciphertext path; every concurrent open
//! of that path shares it. The node owns the layered I/O stack
//! (raw -> cipher -> optional MAC) and serializes all operations on it with
//! a single mutex, which also keeps the single-block cache coherent. A
//! canary tag tracks the node's lifecycle so a handle used after release is
//! caught instead of silently corrupting another file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{IoError, IoResult};
use crate::io::cipher::{CipherFileIo, CipherLayerConfig};
use crate::io::mac::{new_mac_file_io, MacLayerConfig};
use crate::io::raw::RawFileIo;
use crate::io::{FileAttr, FileIo};

use super::FsRuntime;

/// Lifecycle tag values.
const CANARY_OK: u32 = 0x4640_9775;
const CANARY_RELEASED: u32 = 0x2866_4440;
const CANARY_DESTROYED: u32 = 0x174b_e585;

struct NodeState {
    plaintext_name: String,
    cipher_name: PathBuf,
    io: Box<dyn FileIo>,
}

pub struct FileNode {
    state: Mutex<NodeState>,
    canary: AtomicU32,
    runtime: FsRuntime,
    /// Handle the host hands to the kernel for this node.
    pub fuse_fh: u64,
}

/// Build the layered I/O stack for one ciphertext file.
fn build_io_stack(runtime: &FsRuntime, cipher_name: &Path) -> Box<dyn FileIo> {
    let config = &runtime.config;
    let raw = RawFileIo::new(cipher_name.to_path_buf());
    let cipher_layer = CipherFileIo::new(
        Box::new(raw),
        &CipherLayerConfig {
            cipher: Arc::clone(&runtime.cipher),
            key: Arc::clone(&runtime.key),
            block_size: config.block_size as usize,
            unique_iv: config.unique_iv,
            allow_holes: config.allow_holes,
            reverse: runtime.reverse(),
            no_cache: runtime.opts.cache_disabled(),
        },
    );

    if config.block_mac_bytes != 0 || config.block_mac_rand_bytes != 0 {
        Box::new(new_mac_file_io(
            Box::new(cipher_layer),
            &MacLayerConfig {
                cipher: Arc::clone(&runtime.cipher),
                key: Arc::clone(&runtime.key),
                block_size: config.block_size as usize,
                mac_bytes: config.block_mac_bytes as usize,
                rand_bytes: config.block_mac_rand_bytes as usize,
                allow_holes: config.allow_holes,
                warn_only: runtime.opts.force_decode,
                no_cache: runtime.opts.cache_disabled(),
            },
        ))
    } else {
        Box::new(cipher_layer)
    }
}

impl FileNode {
    pub(crate) fn new(
        runtime: FsRuntime,
        plaintext_name: &str,
        cipher_name: PathBuf,
        fuse_fh: u64,
    ) -> Arc<FileNode> {
        let io = build_io_stack(&runtime, &cipher_name);
        Arc::new(FileNode {
            state: Mutex::new(NodeState {
                plaintext_name: plaintext_name.to_owned(),
                cipher_name,
                io,
            }),
            canary: AtomicU32::new(CANARY_OK),
            runtime,
            fuse_fh,
        })
    }

    fn check_canary(&self) {
        let canary = self.canary.load(Ordering::Acquire);
        assert_ne!(canary, CANARY_DESTROYED, "file node used after destruction");
        if canary == CANARY_RELEASED {
            tracing::warn!("file node used after release: {:?}", self.fuse_fh);
        }
    }

    pub(crate) fn mark_released(&self) {
        self.canary.store(CANARY_RELEASED, Ordering::Release);
    }

    pub fn plaintext_name(&self) -> String {
        self.state.lock().plaintext_name.clone()
    }

    pub fn cipher_name(&self) -> PathBuf {
        self.state.lock().cipher_name.clone()
    }

    /// Directory part of the plaintext path.
    pub fn plaintext_parent(&self) -> String {
        parent_directory(&self.plaintext_name())
    }

    /// Rename the node in place, rebinding the external IV when chaining is
    /// active. With `set_iv_first` the IV moves before the names; otherwise
    /// the names move first and are rolled back if the IV rebind fails.
    pub(crate) fn set_name(
        &self,
        plaintext_name: Option<&str>,
        cipher_name: Option<&Path>,
        iv: u64,
        set_iv_first: bool,
    ) -> IoResult<()> {
        self.check_canary();
        if let Some(cname) = cipher_name {
            tracing::debug!("rebinding IV for {:?}", cname);
        }
        let mut state = self.state.lock();

        if set_iv_first {
            if self.runtime.config.external_iv_chaining {
                set_iv_for_files_only(&mut state, iv)?;
            }
            if let Some(pname) = plaintext_name {
                state.plaintext_name = pname.to_owned();
            }
            if let Some(cname) = cipher_name {
                state.cipher_name = cname.to_path_buf();
                state.io.set_file_name(cname);
            }
        } else {
            let old_pname = state.plaintext_name.clone();
            let old_cname = state.cipher_name.clone();

            if let Some(pname) = plaintext_name {
                state.plaintext_name = pname.to_owned();
            }
            if let Some(cname) = cipher_name {
                state.cipher_name = cname.to_path_buf();
                state.io.set_file_name(cname);
            }
            if self.runtime.config.external_iv_chaining {
                if let Err(e) = set_iv_for_files_only(&mut state, iv) {
                    state.plaintext_name = old_pname;
                    state.cipher_name = old_cname.clone();
                    state.io.set_file_name(&old_cname);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub fn open(&self, write_mode: bool) -> IoResult<()> {
        self.check_canary();
        self.state.lock().io.open(write_mode)
    }

    pub fn get_attr(&self) -> IoResult<FileAttr> {
        self.check_canary();
        self.state.lock().io.get_attr()
    }

    pub fn get_size(&self) -> IoResult<u64> {
        self.check_canary();
        self.state.lock().io.get_size()
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> IoResult<usize> {
        self.check_canary();
        self.state.lock().io.read(offset, buf)
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> IoResult<usize> {
        tracing::debug!("node write at offset {offset}, {} bytes", data.len());
        self.check_canary();
        let mut state = self.state.lock();
        state.io.write(offset, data)?;
        Ok(data.len())
    }

    pub fn truncate(&self, size: u64) -> IoResult<()> {
        self.check_canary();
        self.state.lock().io.truncate(size)
    }

    pub fn sync(&self, datasync: bool) -> IoResult<()> {
        self.check_canary();
        self.state.lock().io.sync(datasync)
    }

    /// Create the backing inode for this node.
    pub fn mknod(&self, mode: u32, rdev: u64, uid: u32, gid: u32) -> IoResult<()> {
        self.check_canary();
        let state = self.state.lock();
        let cname = state.cipher_name.clone();
        drop(state);

        super::with_fs_ids(uid, gid, move || create_node(&cname, mode, rdev))?
    }
}

pub(crate) fn parent_directory(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(i) => path[..i].to_owned(),
    }
}

/// The external IV binds to the file header; directories have none, so the
/// call is skipped for them (and for paths that do not exist yet).
fn set_iv_for_files_only(state: &mut NodeState, iv: u64) -> IoResult<()> {
    match state.io.get_attr() {
        Err(_) => state.io.set_iv(iv),
        Ok(attr) if attr.is_regular_file => state.io.set_iv(iv),
        Ok(_) => Ok(()),
    }
}

fn create_node(cname: &Path, mode: u32, rdev: u64) -> IoResult<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(cname.as_os_str().as_bytes())
        .map_err(|_| IoError::from_errno(libc::EINVAL))?;

    let permissions = (mode & 0o7777) as libc::mode_t;
    let res = if mode & libc::S_IFMT as u32 == libc::S_IFREG as u32 {
        let fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY,
                libc::c_uint::from(permissions),
            )
        };
        if fd >= 0 {
            unsafe { libc::close(fd) }
        } else {
            fd
        }
    } else if mode & libc::S_IFMT as u32 == libc::S_IFIFO as u32 {
        unsafe { libc::mkfifo(c_path.as_ptr(), permissions) }
    } else {
        unsafe { libc::mknod(c_path.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) }
    };

    if res < 0 {
        let e = std::io::Error::last_os_error();
        tracing::debug!("mknod error on {:?}: {e}", cname);
        return Err(IoError::Os(e));
    }
    Ok(())
}

impl Drop for FileNode {
    fn drop(&mut self) {
        self.canary.store(CANARY_DESTROYED, Ordering::Release);
        let mut state = self.state.lock();
        // blank the names; the key material zeroes itself
        state.plaintext_name.clear();
        state.cipher_name.clear();
    }
}
