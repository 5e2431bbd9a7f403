//! Shared mount harness for the integration suites.

use std::sync::Arc;

use tempfile::TempDir;
use veilfs::config::{create_volume, unlock_volume, FsConfig, VolumeParams};
use veilfs::fs::{Context, DirNode, FsRuntime};
use veilfs::opts::MountOpts;

pub const TEST_PASSWORD: &[u8] = b"correct horse battery staple";

/// A live in-process mount over a temporary backing directory.
pub struct TestMount {
    pub backing: TempDir,
    pub ctx: Arc<Context>,
    pub root: Arc<DirNode>,
}

/// Volume parameters with a fast KDF for tests.
pub fn fast_params() -> VolumeParams {
    VolumeParams {
        kdf_iterations: 1000,
        ..VolumeParams::default()
    }
}

pub fn mount(params: VolumeParams) -> TestMount {
    mount_with(params, |_| {})
}

pub fn mount_with(params: VolumeParams, tweak: impl FnOnce(&mut MountOpts)) -> TestMount {
    let backing = tempfile::tempdir().expect("create backing dir");
    let (config, cipher, volume_key) =
        create_volume(&params, TEST_PASSWORD).expect("create volume");
    config.save(backing.path()).expect("persist config");

    let mut opts = MountOpts {
        root_dir: backing.path().to_path_buf(),
        mount_point: backing.path().join("mnt"),
        ..MountOpts::default()
    };
    tweak(&mut opts);

    attach(backing, config, opts, cipher, volume_key)
}

/// Re-open an existing backing directory the way a new process would:
/// load the persisted config and unlock it with the password.
pub fn remount(previous: TestMount, tweak: impl FnOnce(&mut MountOpts)) -> TestMount {
    let backing = previous.backing;
    drop(previous.ctx);
    drop(previous.root);

    let config = FsConfig::load(backing.path()).expect("load config");
    let (cipher, volume_key) = unlock_volume(&config, TEST_PASSWORD).expect("unlock volume");

    let mut opts = MountOpts {
        root_dir: backing.path().to_path_buf(),
        mount_point: backing.path().join("mnt"),
        ..MountOpts::default()
    };
    tweak(&mut opts);

    attach(backing, config, opts, cipher, volume_key)
}

fn attach(
    backing: TempDir,
    config: FsConfig,
    opts: MountOpts,
    cipher: veilfs::Cipher,
    volume_key: veilfs::CipherKey,
) -> TestMount {
    let runtime =
        FsRuntime::new(config, opts.clone(), cipher, volume_key).expect("build runtime");
    let ctx = Context::new(Arc::new(opts));
    let root = DirNode::new(&ctx, backing.path().to_path_buf(), runtime);
    ctx.set_root(Arc::clone(&root));
    TestMount { backing, ctx, root }
}

impl TestMount {
    /// Create the backing inode for `path` (if needed) and open it for
    /// writing, the way a host create call would.
    pub fn create(&self, path: &str) -> Arc<veilfs::FileNode> {
        let node = self.root.lookup_node(path).expect("lookup node");
        match node.mknod(libc::S_IFREG | 0o644, 0, 0, 0) {
            Ok(()) => {}
            Err(e) if e.to_errno() == libc::EEXIST => {}
            Err(e) => panic!("mknod failed: {e}"),
        }
        drop(node);
        self.root.open_node(path, true).expect("open for write")
    }

    /// Create a file and write its full contents through a node.
    pub fn write_file(&self, path: &str, contents: &[u8]) {
        let node = self.create(path);
        node.write(0, contents).expect("write contents");
        self.ctx.erase_node(path, &node);
    }

    /// Read a file's full contents through a node.
    pub fn read_file(&self, path: &str) -> Vec<u8> {
        let node = self.root.open_node(path, false).expect("open for read");
        let size = node.get_size().expect("file size");
        let mut buf = vec![0u8; size as usize];
        let n = node.read(0, &mut buf).expect("read contents");
        buf.truncate(n);
        self.ctx.erase_node(path, &node);
        buf
    }

    /// Absolute backing path of a mount-view path.
    pub fn backing_path(&self, path: &str) -> std::path::PathBuf {
        self.root.cipher_path(path).expect("encode path")
    }
}
