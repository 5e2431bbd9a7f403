//! Directory node: plaintext-to-ciphertext namespace translation.
//!
//! One [`DirNode`] manages a rooted ciphertext tree: it encodes and decodes
//! paths, iterates directories, creates and removes entries, and hands out
//! [`FileNode`]s deduplicated through the mount [`Context`].
//!
//! Rename is the delicate operation. With chained name IVs, the ciphertext
//! name of every entry beneath a renamed directory depends on the
//! directory's path, so the rename must re-encode the whole subtree. That
//! runs as a list of individual renames applied in child-before-parent
//! order; on any failure, applied entries are walked back in reverse so the
//! ciphertext tree returns to its pre-rename state.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::Mutex;
use zeroize::Zeroize;

use crate::config::CONFIG_FILE_NAME;
use crate::error::{IoError, IoResult};
use crate::name::PathCodec;

use super::context::Context;
use super::file_node::FileNode;
use super::FsRuntime;

/// Lazy directory iterator yielding mount-view names.
pub struct DirTraverse {
    entries: std::fs::ReadDir,
    iv: u64,
    naming: Arc<PathCodec>,
    root: bool,
}

impl DirTraverse {
    fn next_raw_name(&mut self) -> Option<String> {
        loop {
            let entry = self.entries.next()?.ok()?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                tracing::debug!("skipping non-UTF-8 entry {:?}", name);
                continue;
            };
            if self.root && name == CONFIG_FILE_NAME {
                tracing::debug!("skipping filename: {name}");
                continue;
            }
            if name == "." || name == ".." {
                continue;
            }
            return Some(name.to_owned());
        }
    }

    /// Next entry that decodes cleanly; undecodable names are skipped.
    pub fn next_plaintext_name(&mut self) -> Option<String> {
        loop {
            let raw = self.next_raw_name()?;
            let mut local_iv = self.iv;
            match self.naming.decode_path(&raw, Some(&mut local_iv)) {
                Ok(plain) => return Some(plain),
                Err(e) => {
                    tracing::debug!("skipping undecodable filename {raw:?}: {e}");
                }
            }
        }
    }

    /// Next entry that does NOT decode; raw names for cleanup tooling.
    pub fn next_invalid(&mut self) -> Option<String> {
        loop {
            let raw = self.next_raw_name()?;
            let mut local_iv = self.iv;
            if self.naming.decode_path(&raw, Some(&mut local_iv)).is_err() {
                return Some(raw);
            }
        }
    }
}

/// One entry of a recursive rename.
struct RenameEl {
    old_cname: PathBuf,
    new_cname: PathBuf,
    old_pname: String,
    new_pname: String,
    is_directory: bool,
}

impl Drop for RenameEl {
    fn drop(&mut self) {
        // plaintext names are secrets of the namespace
        self.old_pname.zeroize();
        self.new_pname.zeroize();
    }
}

/// Applies a rename list and can walk it back on failure.
struct RenameOp<'a> {
    dn: &'a DirNode,
    list: Vec<RenameEl>,
    applied: usize,
}

impl<'a> RenameOp<'a> {
    fn new(dn: &'a DirNode, list: Vec<RenameEl>) -> RenameOp<'a> {
        RenameOp {
            dn,
            list,
            applied: 0,
        }
    }

    fn apply(&mut self) -> bool {
        while self.applied < self.list.len() {
            let el = &self.list[self.applied];
            tracing::debug!("renaming {:?} -> {:?}", el.old_cname, el.new_cname);

            let times = file_times(&el.old_cname);
            if self.dn.rename_node_impl(&el.old_pname, &el.new_pname, true).is_err() {
                return false;
            }
            if let Err(e) = std::fs::rename(&el.old_cname, &el.new_cname) {
                tracing::warn!("error renaming {:?}: {e}", el.old_cname);
                let _ = self
                    .dn
                    .rename_node_impl(&el.new_pname, &el.old_pname, false);
                return false;
            }
            if let Some((atime, mtime)) = times {
                restore_file_times(&el.new_cname, atime, mtime);
            }
            self.applied += 1;
        }
        true
    }

    fn undo(&mut self) {
        tracing::debug!("undoing {} applied renames", self.applied);
        let mut undo_count = 0;
        while self.applied > 0 {
            self.applied -= 1;
            let el = &self.list[self.applied];
            tracing::debug!("undo: renaming {:?} -> {:?}", el.new_cname, el.old_cname);
            if let Err(e) = std::fs::rename(&el.new_cname, &el.old_cname) {
                tracing::warn!("undo rename failed for {:?}: {e}", el.new_cname);
            }
            if let Err(e) = self
                .dn
                .rename_node_impl(&el.new_pname, &el.old_pname, false)
            {
                tracing::warn!("undo node rename failed: {e}");
            }
            undo_count += 1;
        }
        if undo_count > 0 {
            tracing::warn!("undo rename count: {undo_count}");
        }
    }
}

pub struct DirNode {
    ctx: Weak<Context>,
    runtime: FsRuntime,
    root_dir: PathBuf,
    naming: Arc<PathCodec>,
    /// Serializes namespace mutations (rename, link, unlink, mkdir, lookup).
    op_lock: Mutex<()>,
}

impl std::fmt::Debug for DirNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirNode")
            .field("root_dir", &self.root_dir)
            .finish_non_exhaustive()
    }
}

impl DirNode {
    pub fn new(ctx: &Arc<Context>, root_dir: PathBuf, runtime: FsRuntime) -> Arc<DirNode> {
        let naming = Arc::clone(&runtime.naming);
        Arc::new(DirNode {
            ctx: Arc::downgrade(ctx),
            runtime,
            root_dir,
            naming,
            op_lock: Mutex::new(()),
        })
    }

    pub fn root_directory(&self) -> &Path {
        &self.root_dir
    }

    pub(crate) fn runtime(&self) -> &FsRuntime {
        &self.runtime
    }

    /// Renaming a directory invalidates descendant names when the encoding
    /// chains IVs along the path.
    pub fn has_directory_name_dependency(&self) -> bool {
        self.naming.chained_name_iv()
    }

    /// Absolute backing path for a mount-view path.
    pub fn cipher_path(&self, plaintext_path: &str) -> IoResult<PathBuf> {
        let encoded = self
            .naming
            .encode_path(plaintext_path, None)
            .map_err(IoError::Name)?;
        Ok(self.root_dir.join(encoded))
    }

    /// Backing path without the root prefix.
    pub fn cipher_path_without_root(&self, plaintext_path: &str) -> IoResult<String> {
        self.naming
            .encode_path(plaintext_path, None)
            .map_err(IoError::Name)
    }

    /// Mount-view rendition of a backing path, chiefly for symlink targets.
    ///
    /// Absolute targets cannot be encoded per component, so they travel as
    /// one opaque encoded name behind an escape prefix: `+` marks them on
    /// the ciphertext side in forward mode, `/` in reverse mode. Returns an
    /// empty string on decode failure (logged), never an error.
    pub fn plain_path(&self, cipher_path: &str) -> String {
        let (mark, prefix) = if self.runtime.reverse() {
            ('/', "+")
        } else {
            ('+', "/")
        };
        let result = if let Some(rest) = cipher_path.strip_prefix(mark) {
            self.naming
                .decode_name(rest, None)
                .map(|name| format!("{prefix}{name}"))
        } else {
            self.naming.decode_path(cipher_path, None)
        };
        match result {
            Ok(path) => path,
            Err(e) => {
                tracing::error!("decode err: {e}");
                String::new()
            }
        }
    }

    /// Inverse of [`DirNode::plain_path`], with the escape prefix swapped
    /// for the encoding direction.
    pub fn relative_cipher_path(&self, plaintext_path: &str) -> String {
        let (mark, prefix) = if self.runtime.reverse() {
            ('+', "/")
        } else {
            ('/', "+")
        };
        let result = if let Some(rest) = plaintext_path.strip_prefix(mark) {
            self.naming
                .encode_name(rest, None)
                .map(|name| format!("{prefix}{name}"))
        } else {
            self.naming.encode_path(plaintext_path, None)
        };
        match result {
            Ok(path) => path,
            Err(e) => {
                tracing::error!("encode err: {e}");
                String::new()
            }
        }
    }

    /// Open a directory for iteration, deriving its chained IV from the
    /// path.
    pub fn open_dir(&self, plaintext_path: &str) -> IoResult<DirTraverse> {
        let cy_name = self.cipher_path(plaintext_path)?;
        let entries = std::fs::read_dir(&cy_name).map_err(|e| {
            tracing::debug!("opendir error: {e}");
            IoError::Os(e)
        })?;

        let mut iv = 0u64;
        if self.naming.chained_name_iv() {
            if let Err(e) = self.naming.encode_path(plaintext_path, Some(&mut iv)) {
                tracing::error!("encode err: {e}");
            }
        }
        Ok(DirTraverse {
            entries,
            iv,
            naming: Arc::clone(&self.naming),
            root: plaintext_path == "/",
        })
    }

    /// Collect the re-encoding renames for every entry under `from_p`,
    /// recursing into subdirectories. Children precede their parent in the
    /// resulting list, so each entry's paths stay valid while it applies.
    fn gen_rename_list(
        &self,
        list: &mut Vec<RenameEl>,
        from_p: &str,
        to_p: &str,
    ) -> IoResult<()> {
        let mut from_iv = 0u64;
        let mut to_iv = 0u64;
        let from_c_part = self
            .naming
            .encode_path(from_p, Some(&mut from_iv))
            .map_err(IoError::Name)?;
        self.naming
            .encode_path(to_p, Some(&mut to_iv))
            .map_err(IoError::Name)?;

        // equal chain values mean the subtree names are unaffected
        if from_iv == to_iv {
            return Ok(());
        }

        let source_path = self.root_dir.join(&from_c_part);
        tracing::debug!("opendir {:?}", source_path);

        for entry in std::fs::read_dir(&source_path).map_err(IoError::Os)? {
            let entry = entry.map_err(IoError::Os)?;
            let raw = entry.file_name();
            let Some(raw) = raw.to_str() else { continue };

            let mut local_iv = from_iv;
            let plain = match self.naming.decode_path(raw, Some(&mut local_iv)) {
                Ok(p) => p,
                Err(_) => continue,
            };

            let mut local_iv = to_iv;
            let new_name = self
                .naming
                .encode_path(&plain, Some(&mut local_iv))
                .map_err(|e| {
                    tracing::warn!("aborting rename: error on file {from_c_part}/{raw}: {e}");
                    IoError::Name(e)
                })?;

            let el = RenameEl {
                old_cname: source_path.join(raw),
                new_cname: source_path.join(&new_name),
                old_pname: format!("{from_p}/{plain}"),
                new_pname: format!("{to_p}/{plain}"),
                is_directory: entry.file_type().map(|t| t.is_dir()).unwrap_or(false),
            };

            if el.is_directory {
                self.gen_rename_list(list, &el.old_pname, &el.new_pname)?;
            }

            tracing::debug!("adding file {:?} to rename list", el.old_cname);
            list.push(el);
        }
        Ok(())
    }

    /// Rename a mount-view path, re-encoding descendants when the name
    /// encoding requires it. The backing tree is restored on failure.
    pub fn rename(&self, from_plaintext: &str, to_plaintext: &str) -> IoResult<()> {
        let _guard = self.op_lock.lock();

        let from_c_name = self.cipher_path(from_plaintext)?;
        let to_c_name = self.cipher_path(to_plaintext)?;
        tracing::debug!("rename {:?} -> {:?}", from_c_name, to_c_name);

        let _to_node = self.find_or_create(to_plaintext)?;

        let mut rename_op: Option<RenameOp> = None;
        if self.has_directory_name_dependency() && from_c_name.is_dir() {
            tracing::debug!("recursive rename begin");
            let mut list = Vec::new();
            if self
                .gen_rename_list(&mut list, from_plaintext, to_plaintext)
                .is_err()
            {
                tracing::warn!("error during generation of recursive rename list");
                return Err(IoError::from_errno(libc::EACCES));
            }

            let mut op = RenameOp::new(self, list);
            if !op.apply() {
                op.undo();
                tracing::warn!("rename aborted");
                return Err(IoError::from_errno(libc::EACCES));
            }
            rename_op = Some(op);
            tracing::debug!("recursive rename end");
        }

        let times = file_times(&from_c_name);

        if let Err(e) = self.rename_node_impl(from_plaintext, to_plaintext, true) {
            if let Some(op) = rename_op.as_mut() {
                op.undo();
            }
            tracing::warn!("rename failed: {e}");
            return Err(e);
        }

        if let Err(e) = std::fs::rename(&from_c_name, &to_c_name) {
            let _ = self.rename_node_impl(to_plaintext, from_plaintext, false);
            if let Some(op) = rename_op.as_mut() {
                op.undo();
            }
            tracing::debug!("rename failed: {e}");
            return Err(IoError::Os(e));
        }

        if let Some((atime, mtime)) = times {
            restore_file_times(&to_c_name, atime, mtime);
        }
        Ok(())
    }

    /// Hard link. Refused under external IV chaining, where a file's
    /// content encryption is bound to its one path.
    pub fn link(&self, existing: &str, new_link: &str) -> IoResult<()> {
        let _guard = self.op_lock.lock();

        let to_c_name = self.cipher_path(existing)?;
        let from_c_name = self.cipher_path(new_link)?;
        tracing::debug!("link {:?} -> {:?}", from_c_name, to_c_name);

        if self.runtime.config.external_iv_chaining {
            tracing::debug!("hard links not supported with external IV chaining");
            return Err(IoError::NotPermitted(
                "hard links with external IV chaining",
            ));
        }
        std::fs::hard_link(&to_c_name, &from_c_name).map_err(IoError::Os)
    }

    /// Create a directory, adopting the caller's identity for the create.
    pub fn mkdir(&self, plaintext_path: &str, mode: u32, uid: u32, gid: u32) -> IoResult<()> {
        let cy_name = self.cipher_path(plaintext_path)?;
        tracing::debug!("mkdir on {:?}", cy_name);

        super::with_fs_ids(uid, gid, || {
            let mut builder = std::fs::DirBuilder::new();
            #[cfg(unix)]
            std::os::unix::fs::DirBuilderExt::mode(&mut builder, mode);
            builder.create(&cy_name).map_err(|e| {
                tracing::warn!("mkdir error on {:?} mode {mode:o}: {e}", cy_name);
                IoError::Os(e)
            })
        })?
    }

    /// Remove a file. Open files are protected unless the host opted into
    /// hard removal.
    pub fn unlink(&self, plaintext_path: &str) -> IoResult<()> {
        let cy_name = self.cipher_path_without_root(plaintext_path)?;
        tracing::debug!("unlink {cy_name:?}");

        let _guard = self.op_lock.lock();

        if !self.runtime.opts.hard_remove {
            if let Some(ctx) = self.ctx.upgrade() {
                if ctx.lookup_node(plaintext_path).is_some() {
                    tracing::warn!("refusing to unlink open file {cy_name:?}");
                    return Err(IoError::Busy("file is still open"));
                }
            }
        }

        std::fs::remove_file(self.root_dir.join(&cy_name)).map_err(|e| {
            tracing::debug!("unlink error: {e}");
            IoError::Os(e)
        })
    }

    /// Fetch or create the node for a path without opening it.
    pub fn lookup_node(&self, plaintext_name: &str) -> IoResult<Arc<FileNode>> {
        let _guard = self.op_lock.lock();
        self.find_or_create(plaintext_name)
    }

    /// Open a node and register the open with the mount context, so
    /// concurrent opens of one path share a node.
    pub fn open_node(&self, plaintext_name: &str, write_mode: bool) -> IoResult<Arc<FileNode>> {
        let _guard = self.op_lock.lock();
        let node = self.find_or_create(plaintext_name)?;
        node.open(write_mode)?;
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.put_node(plaintext_name, Arc::clone(&node));
        }
        Ok(node)
    }

    fn find_or_create(&self, plaintext_name: &str) -> IoResult<Arc<FileNode>> {
        let ctx = self.ctx.upgrade();
        if let Some(ctx) = &ctx {
            if let Some(node) = ctx.lookup_node(plaintext_name) {
                return Ok(node);
            }
        }

        let mut iv = 0u64;
        let cipher_name = self
            .naming
            .encode_path(plaintext_name, Some(&mut iv))
            .map_err(IoError::Name)?;
        let fuse_fh = ctx.as_ref().map_or(0, |c| c.next_fh());
        let node = FileNode::new(
            self.runtime.clone(),
            plaintext_name,
            self.root_dir.join(cipher_name),
            fuse_fh,
        );
        if self.runtime.config.external_iv_chaining {
            node.set_name(None, None, iv, true)?;
        }
        tracing::debug!("created file node for {:?}", node.cipher_name());
        Ok(node)
    }

    /// Rename the in-memory node and the registry entry for `from`.
    fn rename_node_impl(&self, from: &str, to: &str, forward: bool) -> IoResult<Arc<FileNode>> {
        let node = self.find_or_create(from)?;

        let mut iv = 0u64;
        let encoded = self
            .naming
            .encode_path(to, Some(&mut iv))
            .map_err(IoError::Name)?;
        let cname = self.root_dir.join(encoded);
        tracing::debug!(
            "renaming internal node {:?} -> {:?}",
            node.cipher_name(),
            cname
        );

        node.set_name(Some(to), Some(&cname), iv, forward).map_err(|e| {
            tracing::error!("internal node name change failed");
            e
        })?;
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.rename_node(from, to);
        }
        Ok(node)
    }
}

fn file_times(path: &Path) -> Option<(SystemTime, SystemTime)> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.accessed().ok()?, meta.modified().ok()?))
}

fn restore_file_times(path: &Path, atime: SystemTime, mtime: SystemTime) {
    if let Ok(file) = std::fs::File::open(path) {
        let times = std::fs::FileTimes::new()
            .set_accessed(atime)
            .set_modified(mtime);
        let _ = file.set_times(times);
    }
}
