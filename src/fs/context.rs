//! Mount context.
//!
//! Process-wide state of one mount: the open-file registry that
//! deduplicates [`FileNode`]s by plaintext path, the FUSE handle map, and
//! the usage/idle counters that drive lazy unmounting. Registry state sits
//! behind one mutex so the unmount decision sees a coherent snapshot; the
//! handle map is a concurrent map keyed by the monotonically assigned
//! handle, which is the hot lookup on every kernel callback.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{IoError, IoResult};
use crate::opts::MountOpts;

use super::dir_node::DirNode;
use super::file_node::FileNode;
use super::FsRuntime;

/// Everything needed to rebuild the root after an on-demand detach.
#[derive(Clone)]
struct RemountSource {
    root_dir: PathBuf,
    runtime: FsRuntime,
}

struct MountState {
    root: Option<Arc<DirNode>>,
    remount_source: Option<RemountSource>,
    open_files: HashMap<String, Vec<Arc<FileNode>>>,
    usage_count: u64,
    idle_count: i64,
    is_unmounting: bool,
}

pub struct Context {
    state: Mutex<MountState>,
    fh_map: DashMap<u64, Arc<FileNode>>,
    next_fh: AtomicU64,
    opts: Arc<MountOpts>,
    /// Back-reference to hand to lazily remounted roots.
    self_ref: Weak<Context>,
}

impl Context {
    pub fn new(opts: Arc<MountOpts>) -> Arc<Context> {
        Arc::new_cyclic(|self_ref| Context {
            state: Mutex::new(MountState {
                root: None,
                remount_source: None,
                open_files: HashMap::new(),
                usage_count: 0,
                idle_count: -1,
                is_unmounting: false,
            }),
            fh_map: DashMap::new(),
            next_fh: AtomicU64::new(1),
            opts,
            self_ref: self_ref.clone(),
        })
    }

    pub fn opts(&self) -> &MountOpts {
        &self.opts
    }

    /// Attach a root, retaining its mount parameters so a detached
    /// on-demand mount can be re-established lazily.
    pub fn set_root(&self, root: Arc<DirNode>) {
        let mut state = self.state.lock();
        state.remount_source = Some(RemountSource {
            root_dir: root.root_directory().to_path_buf(),
            runtime: root.runtime().clone(),
        });
        state.root = Some(root);
        state.is_unmounting = false;
    }

    /// Drop the active root while keeping the parameters needed to rebuild
    /// it, so the next [`Context::get_root`] remounts lazily. Hosts call
    /// this after detaching an idle on-demand mount.
    pub fn detach_root(&self) {
        let mut state = self.state.lock();
        state.root = None;
    }

    /// Fetch the root, counting the access as mount activity.
    ///
    /// Fails with `EBUSY` while an unmount is in progress. When the root
    /// was detached (on-demand mount gone idle) it is remounted lazily
    /// from the retained parameters; `ENXIO` is reported only for a
    /// context that was never mounted.
    pub fn get_root(&self) -> IoResult<Arc<DirNode>> {
        let mut state = self.state.lock();
        if state.is_unmounting {
            return Err(IoError::Busy("filesystem is unmounting"));
        }
        if let Some(root) = &state.root {
            let root = Arc::clone(root);
            state.usage_count += 1;
            return Ok(root);
        }

        let Some(source) = state.remount_source.clone() else {
            return Err(IoError::from_errno(libc::ENXIO));
        };
        let Some(ctx) = self.self_ref.upgrade() else {
            return Err(IoError::from_errno(libc::ENXIO));
        };
        tracing::debug!("lazy remount of {:?}", source.root_dir);
        let root = DirNode::new(&ctx, source.root_dir, source.runtime);
        state.root = Some(Arc::clone(&root));
        state.usage_count += 1;
        Ok(root)
    }

    pub fn is_unmounting(&self) -> bool {
        self.state.lock().is_unmounting
    }

    /// Periodic idle bookkeeping.
    ///
    /// Returns `true` when the mount has been idle for `timeout_cycles`
    /// cycles with no files open: the context is then marked as unmounting
    /// (unless mounted on demand) and the caller should detach the mount.
    pub fn usage_and_unmount(&self, timeout_cycles: i64) -> bool {
        let mut state = self.state.lock();
        if state.root.is_none() {
            return false;
        }

        if state.usage_count == 0 {
            state.idle_count += 1;
        } else {
            state.idle_count = 0;
        }
        tracing::debug!(
            "idle cycle count: {}, timeout at {timeout_cycles}",
            state.idle_count
        );
        state.usage_count = 0;

        if state.idle_count < timeout_cycles {
            return false;
        }

        if !state.open_files.is_empty() {
            if state.idle_count % timeout_cycles == 0 {
                tracing::warn!(
                    "filesystem inactive, but {} files opened: {:?}",
                    state.open_files.len(),
                    self.opts.mount_point
                );
            }
            return false;
        }

        if !self.opts.mount_on_demand {
            state.is_unmounting = true;
        }
        // the caller performs the actual unmount outside the lock
        true
    }

    /// Allocate a fresh FUSE handle. Handles start at 1 and are never
    /// reused within a mount.
    pub fn next_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    /// The node currently registered for a plaintext path, if any.
    pub fn lookup_node(&self, path: &str) -> Option<Arc<FileNode>> {
        let state = self.state.lock();
        state
            .open_files
            .get(path)
            .and_then(|nodes| nodes.first().cloned())
    }

    pub fn lookup_fh(&self, fh: u64) -> Option<Arc<FileNode>> {
        self.fh_map.get(&fh).map(|entry| Arc::clone(&entry))
    }

    /// Register an open of `node` under `path`.
    pub fn put_node(&self, path: &str, node: Arc<FileNode>) {
        let mut state = self.state.lock();
        self.fh_map.insert(node.fuse_fh, Arc::clone(&node));
        state
            .open_files
            .entry(path.to_owned())
            .or_default()
            .insert(0, node);
    }

    /// Drop one registration of `node` under `path`. The handle mapping and
    /// the node's live tag go away with the last registration.
    pub fn erase_node(&self, path: &str, node: &Arc<FileNode>) {
        let mut state = self.state.lock();
        let Some(nodes) = state.open_files.get_mut(path) else {
            tracing::warn!("no registered node to erase at {path:?}");
            return;
        };

        let Some(pos) = nodes.iter().position(|n| Arc::ptr_eq(n, node)) else {
            tracing::warn!("node to erase not registered at {path:?}");
            return;
        };
        nodes.remove(pos);
        let last_registration = !nodes.iter().any(|n| Arc::ptr_eq(n, node));
        let path_empty = nodes.is_empty();

        if last_registration {
            self.fh_map.remove(&node.fuse_fh);
            node.mark_released();
        }
        if path_empty {
            state.open_files.remove(path);
        }
    }

    /// Move all registrations from one plaintext path to another.
    pub fn rename_node(&self, from: &str, to: &str) {
        let mut state = self.state.lock();
        if let Some(nodes) = state.open_files.remove(from) {
            state.open_files.insert(to.to_owned(), nodes);
        }
    }

    pub fn open_file_count(&self) -> usize {
        self.state.lock().open_files.len()
    }
}
