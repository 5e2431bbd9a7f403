//! MAC file layer.
//!
//! Adds per-block authentication over the cipher layer. Each stored block
//! carries `[mac bytes | random bytes | data]`; the MAC covers the random
//! prefix and the data, so even identical plaintext blocks get fresh MACs
//! when random bytes are enabled. The layer presents
//! `blockSize - macBytes - randBytes` bytes per block upward and translates
//! sizes in both directions accordingly.
//!
//! A mismatch normally fails the read with an integrity error; mounts
//! recovering damaged volumes can downgrade that to a warning.

use std::path::Path;
use std::sync::Arc;

use crate::crypto::{Cipher, CipherKey};
use crate::error::{IoError, IoResult};

use super::block::{BlockBackend, BlockFileIo};
use super::pool;
use super::{FileAttr, FileIo, IoRequest};

/// Shared pieces of the mount the MAC layer needs.
#[derive(Clone)]
pub struct MacLayerConfig {
    pub cipher: Arc<Cipher>,
    pub key: Arc<CipherKey>,
    /// Full block size of the layer below.
    pub block_size: usize,
    pub mac_bytes: usize,
    pub rand_bytes: usize,
    pub allow_holes: bool,
    /// Log MAC mismatches instead of failing the read.
    pub warn_only: bool,
    pub no_cache: bool,
}

impl MacLayerConfig {
    fn data_block_size(&self) -> usize {
        self.block_size - self.mac_bytes - self.rand_bytes
    }
}

pub(crate) struct MacBackend {
    base: Box<dyn FileIo>,
    cipher: Arc<Cipher>,
    key: Arc<CipherKey>,
    data_block_size: usize,
    mac_bytes: usize,
    rand_bytes: usize,
    allow_holes: bool,
    warn_only: bool,
}

impl MacBackend {
    fn header_size(&self) -> usize {
        self.mac_bytes + self.rand_bytes
    }

    fn stored_block_size(&self) -> usize {
        self.data_block_size + self.header_size()
    }

    /// Map a logical offset or size to the stored one.
    fn with_header(&self, offset: u64) -> u64 {
        let blocks = offset.div_ceil(self.data_block_size as u64);
        offset + blocks * self.header_size() as u64
    }

    /// Map a stored offset or size back to the logical one.
    fn without_header(&self, offset: u64) -> u64 {
        let blocks = offset.div_ceil(self.stored_block_size() as u64);
        offset.saturating_sub(blocks * self.header_size() as u64)
    }
}

impl BlockBackend for MacBackend {
    fn read_one_block(&mut self, req: &mut IoRequest<'_>) -> IoResult<usize> {
        let block_num = req.offset / self.data_block_size as u64;
        let physical = block_num * self.stored_block_size() as u64;

        // the engine requests full blocks except when re-reading the old
        // tail during padding; there the request length pins the stored
        // read (and the MAC check) to the bytes that were actually written
        let want = self.header_size() + req.len().min(self.data_block_size);
        let mut stored = pool::allocate(want);
        let read_size = self.base.read(physical, &mut stored)?;
        if read_size <= self.header_size() {
            if read_size > 0 {
                tracing::debug!(
                    "read {read_size} bytes, expecting more than {}",
                    self.header_size()
                );
            }
            return Ok(0);
        }

        let is_hole = self.allow_holes && stored[..read_size].iter().all(|&b| b == 0);
        if self.mac_bytes > 0 && !is_hole {
            let mac = self
                .cipher
                .mac_64(&stored[self.mac_bytes..read_size], &self.key, None);
            let mut fail = false;
            for i in 0..self.mac_bytes {
                let expected = ((mac >> (8 * i)) & 0xff) as u8;
                if stored[self.mac_bytes - 1 - i] != expected {
                    fail = true;
                }
            }
            if fail {
                tracing::warn!(
                    "MAC comparison failure in block {block_num} of {:?}",
                    self.base.file_name()
                );
                if !self.warn_only {
                    return Err(IoError::Integrity("block MAC mismatch"));
                }
            }
        }

        let data_len = read_size - self.header_size();
        req.data[..data_len].copy_from_slice(&stored[self.header_size()..read_size]);
        Ok(data_len)
    }

    fn write_one_block(&mut self, offset: u64, data: &[u8]) -> IoResult<usize> {
        debug_assert!(data.len() <= self.data_block_size);
        let block_num = offset / self.data_block_size as u64;
        let physical = block_num * self.stored_block_size() as u64;

        let mut stored = pool::allocate(self.header_size() + data.len());
        stored[self.header_size()..].copy_from_slice(data);

        if self.rand_bytes > 0 {
            let range = self.mac_bytes..self.header_size();
            self.cipher
                .randomize(&mut stored[range])
                .map_err(|_| IoError::Integrity("random prefix generation failed"))?;
        }

        if self.mac_bytes > 0 {
            let mac = self.cipher.mac_64(&stored[self.mac_bytes..], &self.key, None);
            for i in 0..self.mac_bytes {
                stored[self.mac_bytes - 1 - i] = ((mac >> (8 * i)) & 0xff) as u8;
            }
        }

        self.base.write(physical, &stored)?;
        Ok(data.len())
    }

    fn open(&mut self, write_mode: bool) -> IoResult<()> {
        self.base.open(write_mode)
    }

    fn set_file_name(&mut self, name: &Path) {
        self.base.set_file_name(name);
    }

    fn file_name(&self) -> &Path {
        self.base.file_name()
    }

    fn set_iv(&mut self, iv: u64) -> IoResult<()> {
        self.base.set_iv(iv)
    }

    fn get_attr(&self) -> IoResult<FileAttr> {
        let mut attr = self.base.get_attr()?;
        if attr.is_regular_file {
            attr.size = self.without_header(attr.size);
        }
        Ok(attr)
    }

    fn get_size(&self) -> IoResult<u64> {
        let size = self.base.get_size()?;
        Ok(self.without_header(size))
    }

    fn truncate_backing(&mut self, size: u64) -> IoResult<()> {
        self.base.truncate(self.with_header(size))
    }

    fn is_writable(&self) -> bool {
        self.base.is_writable()
    }

    fn sync(&mut self, datasync: bool) -> IoResult<()> {
        self.base.sync(datasync)
    }
}

/// MAC layer as a [`FileIo`]: block engine over [`MacBackend`].
pub(crate) type MacFileIo = BlockFileIo<MacBackend>;

pub(crate) fn new_mac_file_io(base: Box<dyn FileIo>, config: &MacLayerConfig) -> MacFileIo {
    debug_assert!(config.mac_bytes <= 8);
    debug_assert!(config.data_block_size() > 0);
    tracing::debug!(
        "fs block size = {}, macBytes = {}, randBytes = {}",
        config.block_size,
        config.mac_bytes,
        config.rand_bytes
    );
    let backend = MacBackend {
        base,
        cipher: Arc::clone(&config.cipher),
        key: Arc::clone(&config.key),
        data_block_size: config.data_block_size(),
        mac_bytes: config.mac_bytes,
        rand_bytes: config.rand_bytes,
        allow_holes: config.allow_holes,
        warn_only: config.warn_only,
    };
    BlockFileIo::new(
        backend,
        config.data_block_size(),
        config.allow_holes,
        config.no_cache,
    )
}
