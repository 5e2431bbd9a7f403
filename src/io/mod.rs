//! Layered file I/O.
//!
//! Every layer implements [`FileIo`] and owns the layer beneath it:
//! the MAC layer wraps the cipher layer wraps the raw byte file. The block
//! engine in [`block`] turns arbitrary-offset requests into block-aligned
//! single-block operations for the layer backends.

pub mod block;
pub mod cipher;
pub mod mac;
pub mod pool;
pub mod raw;

use std::path::Path;
use std::time::SystemTime;

use crate::error::IoResult;

/// A positioned I/O request referencing a caller-owned buffer.
///
/// The buffer length is the requested transfer size; short reads indicate
/// end of file.
#[derive(Debug)]
pub struct IoRequest<'a> {
    pub offset: u64,
    pub data: &'a mut [u8],
}

impl<'a> IoRequest<'a> {
    pub fn new(offset: u64, data: &'a mut [u8]) -> Self {
        IoRequest { offset, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Stat subset the stack cares about. Sizes are translated by each layer;
/// everything else passes through.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileAttr {
    pub size: u64,
    pub inode: u64,
    pub is_regular_file: bool,
    pub is_directory: bool,
    pub modified: Option<SystemTime>,
}

impl FileAttr {
    pub fn from_metadata(meta: &std::fs::Metadata) -> FileAttr {
        #[cfg(unix)]
        let inode = std::os::unix::fs::MetadataExt::ino(meta);
        #[cfg(not(unix))]
        let inode = 0;
        FileAttr {
            size: meta.len(),
            inode,
            is_regular_file: meta.is_file(),
            is_directory: meta.is_dir(),
            modified: meta.modified().ok(),
        }
    }
}

/// Capability shared by every layer of the file I/O stack.
pub trait FileIo: Send {
    /// Prepare for I/O; `write_mode` requests a writable descriptor.
    fn open(&mut self, write_mode: bool) -> IoResult<()>;

    /// Point this stack at a different backing path (rename support).
    fn set_file_name(&mut self, name: &Path);

    fn file_name(&self) -> &Path;

    /// Bind the externally derived IV (path-chained) to this file.
    fn set_iv(&mut self, iv: u64) -> IoResult<()>;

    fn get_attr(&self) -> IoResult<FileAttr>;

    /// Logical size at this layer.
    fn get_size(&self) -> IoResult<u64>;

    /// Read up to `buf.len()` bytes at `offset`; returns bytes read.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> IoResult<usize>;

    /// Write `data` at `offset`; returns bytes accepted.
    fn write(&mut self, offset: u64, data: &[u8]) -> IoResult<usize>;

    fn truncate(&mut self, size: u64) -> IoResult<()>;

    fn is_writable(&self) -> bool;

    /// Flush file contents (and metadata unless `datasync`).
    fn sync(&mut self, datasync: bool) -> IoResult<()>;

    /// Transfer granularity of this layer; 1 for byte-oriented layers.
    fn block_size(&self) -> usize {
        1
    }
}
