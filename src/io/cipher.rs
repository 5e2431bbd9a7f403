//! Cipher file layer.
//!
//! Encrypts file contents block by block over a raw byte file. When unique
//! per-file IVs are enabled, an eight-byte header at the start of the
//! ciphertext file holds the file IV, itself stream-encrypted under the
//! externally derived (path-chained) IV; every block then uses
//! `block number XOR file IV` as its IV seed, so identical plaintext blocks
//! differ between files and between positions.
//!
//! In reverse mode the directions swap (reads encrypt, the synthesized
//! header derives deterministically from the backing inode) and nothing is
//! ever written through.

use std::path::Path;
use std::sync::Arc;

use sha1::{Digest, Sha1};

use crate::crypto::{Cipher, CipherKey};
use crate::error::{IoError, IoResult};

use super::block::{BlockBackend, BlockFileIo};
use super::pool;
use super::{FileAttr, FileIo, IoRequest};

/// Bytes of the per-file IV header.
pub const HEADER_SIZE: u64 = 8;

/// Shared pieces of the mount every cipher layer instance needs.
#[derive(Clone)]
pub struct CipherLayerConfig {
    pub cipher: Arc<Cipher>,
    pub key: Arc<CipherKey>,
    pub block_size: usize,
    pub unique_iv: bool,
    pub allow_holes: bool,
    pub reverse: bool,
    pub no_cache: bool,
}

pub(crate) struct CipherBackend {
    base: Box<dyn FileIo>,
    cipher: Arc<Cipher>,
    key: Arc<CipherKey>,
    block_size: usize,
    have_header: bool,
    allow_holes: bool,
    reverse: bool,
    external_iv: u64,
    file_iv: u64,
}

impl CipherBackend {
    fn header_offset(&self) -> u64 {
        if self.have_header && !self.reverse {
            HEADER_SIZE
        } else {
            0
        }
    }

    /// Establish `file_iv`: read and decode an existing header, or create,
    /// remember and (when writable) persist a fresh one.
    fn init_header(&mut self) -> IoResult<()> {
        if self.reverse {
            self.generate_reverse_header(&mut [0u8; HEADER_SIZE as usize])?;
            return Ok(());
        }

        let raw_size = self.base.get_size()?;
        if raw_size >= HEADER_SIZE {
            tracing::debug!("reading existing header, raw size {raw_size}");
            let mut buf = [0u8; HEADER_SIZE as usize];
            let n = self.base.read(0, &mut buf)?;
            if n < buf.len() {
                return Err(IoError::Integrity("short file IV header"));
            }
            self.cipher
                .stream_decode(&mut buf, self.external_iv, &self.key)
                .map_err(|_| IoError::Integrity("file IV header decode failed"))?;
            self.file_iv = u64::from_be_bytes(buf);
            if self.file_iv == 0 {
                tracing::warn!("degraded file IV of zero in {:?}", self.base.file_name());
            }
        } else {
            tracing::debug!("creating new file IV header");
            let mut buf = [0u8; HEADER_SIZE as usize];
            loop {
                self.cipher
                    .randomize(&mut buf)
                    .map_err(|e| {
                        tracing::error!("unable to generate a random file IV: {e}");
                        IoError::Integrity("file IV generation failed")
                    })?;
                self.file_iv = u64::from_be_bytes(buf);
                if self.file_iv != 0 {
                    break;
                }
                tracing::warn!("unexpected result: randomize returned 8 null bytes");
            }

            if self.base.is_writable() {
                self.cipher
                    .stream_encode(&mut buf, self.external_iv, &self.key)
                    .map_err(|_| IoError::Integrity("file IV header encode failed"))?;
                self.base.write(0, &buf)?;
            } else {
                tracing::debug!("base not writable, file IV not persisted yet");
            }
        }
        tracing::debug!("init_header finished, fileIV = {:#x}", self.file_iv);
        Ok(())
    }

    /// Re-encode the current `file_iv` under the current external IV.
    fn write_header(&mut self) -> IoResult<()> {
        if self.file_iv == 0 {
            tracing::error!("internal error: fileIV == 0 while writing header");
            return Err(IoError::Integrity("zero file IV"));
        }
        tracing::debug!("writing fileIV {:#x}", self.file_iv);

        let mut buf = self.file_iv.to_be_bytes();
        self.cipher
            .stream_encode(&mut buf, self.external_iv, &self.key)
            .map_err(|_| IoError::Integrity("file IV header encode failed"))?;
        self.base.write(0, &buf)?;
        Ok(())
    }

    /// Reverse-mode header: SHA-1 of the backing inode number, truncated to
    /// eight bytes and surfaced stream-encrypted under the external IV.
    fn generate_reverse_header(&mut self, out: &mut [u8; HEADER_SIZE as usize]) -> IoResult<()> {
        let attr = self.base.get_attr()?;
        if attr.inode == 0 {
            return Err(IoError::Integrity("backing inode unavailable"));
        }
        tracing::debug!("generating reverse file IV header from inode {}", attr.inode);

        let digest = Sha1::digest(attr.inode.to_le_bytes());
        out.copy_from_slice(&digest[..HEADER_SIZE as usize]);
        self.file_iv = u64::from_be_bytes(*out);

        self.cipher
            .stream_encode(out, self.external_iv, &self.key)
            .map_err(|_| IoError::Integrity("file IV header encode failed"))?;
        Ok(())
    }

    fn decode_block(&self, buf: &mut [u8], block_iv: u64) -> IoResult<()> {
        let result = if buf.len() != self.block_size {
            self.cipher.stream_decode(buf, block_iv, &self.key)
        } else {
            self.cipher.block_decode(buf, block_iv, &self.key)
        };
        result.map_err(|_| IoError::Integrity("block decode failed"))
    }

    fn encode_block(&self, buf: &mut [u8], block_iv: u64) -> IoResult<()> {
        let result = if buf.len() != self.block_size {
            self.cipher.stream_encode(buf, block_iv, &self.key)
        } else {
            self.cipher.block_encode(buf, block_iv, &self.key)
        };
        result.map_err(|_| IoError::Integrity("block encode failed"))
    }
}

impl BlockBackend for CipherBackend {
    fn read_one_block(&mut self, req: &mut IoRequest<'_>) -> IoResult<usize> {
        let block_num = req.offset / self.block_size as u64;
        let physical = req.offset + self.header_offset();

        let read_size = self.base.read(physical, req.data)?;
        if read_size == 0 {
            tracing::debug!("read size zero for offset {}", req.offset);
            return Ok(0);
        }

        if self.have_header && self.file_iv == 0 {
            self.init_header()?;
        }
        let block_iv = block_num ^ self.file_iv;
        let data = &mut req.data[..read_size];

        if self.reverse {
            // the backing holds plaintext; reading produces ciphertext
            self.encode_block(data, block_iv)?;
            return Ok(read_size);
        }

        // hole preservation: an all-zero stored block reads as zeros
        if self.allow_holes && read_size == self.block_size && data.iter().all(|&b| b == 0) {
            return Ok(read_size);
        }

        self.decode_block(data, block_iv).map_err(|e| {
            tracing::debug!("decode failed for block {block_num}, size {read_size}");
            e
        })?;
        Ok(read_size)
    }

    fn write_one_block(&mut self, offset: u64, data: &[u8]) -> IoResult<usize> {
        if self.have_header && self.reverse {
            tracing::debug!("writing to a reverse mount with per-file IVs is not supported");
            return Err(IoError::NotPermitted("reverse write with unique IV"));
        }

        let block_num = offset / self.block_size as u64;
        if self.have_header && self.file_iv == 0 {
            self.base.open(true)?;
            self.init_header()?;
        }

        let mut buf = pool::allocate(data.len());
        buf.copy_from_slice(data);
        self.encode_block(&mut buf, block_num ^ self.file_iv)
            .map_err(|e| {
                tracing::debug!("encode failed for block {block_num}, size {}", data.len());
                e
            })?;

        self.base.write(offset + self.header_offset(), &buf)
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

    /// Bind or rebind the external IV.
    ///
    /// The first call simply records the value. Later calls (rename under
    /// external IV chaining) must re-encrypt the header under the new IV;
    /// directories have no header, so only the in-memory value moves.
    fn set_iv(&mut self, iv: u64) -> IoResult<()> {
        tracing::debug!(
            "set_iv: current {:#x}, new {iv:#x}, fileIV {:#x}",
            self.external_iv,
            self.file_iv
        );
        if self.external_iv == 0 {
            self.external_iv = iv;
            if self.file_iv != 0 {
                tracing::warn!("fileIV initialized before external IV");
            }
        } else if self.have_header {
            match self.base.open(true) {
                Err(e) if e.is_errno(libc::EISDIR) => {
                    self.external_iv = iv;
                    return self.base.set_iv(iv);
                }
                Err(e) => {
                    tracing::debug!("set_iv failed to reopen for write: {e}");
                    return Err(e);
                }
                Ok(()) => {}
            }
            if self.file_iv == 0 {
                self.init_header()?;
            }
            let old_iv = self.external_iv;
            self.external_iv = iv;
            if let Err(e) = self.write_header() {
                self.external_iv = old_iv;
                return Err(e);
            }
        } else {
            self.external_iv = iv;
        }
        self.base.set_iv(iv)
    }

    fn get_attr(&self) -> IoResult<FileAttr> {
        let mut attr = self.base.get_attr()?;
        if self.have_header && attr.is_regular_file && attr.size > 0 {
            if self.reverse {
                attr.size += HEADER_SIZE;
            } else {
                attr.size = attr.size.saturating_sub(HEADER_SIZE);
            }
        }
        Ok(attr)
    }

    fn get_size(&self) -> IoResult<u64> {
        let size = self.base.get_size()?;
        if self.have_header && size > 0 {
            if self.reverse {
                Ok(size + HEADER_SIZE)
            } else {
                debug_assert!(size >= HEADER_SIZE);
                Ok(size.saturating_sub(HEADER_SIZE))
            }
        } else {
            Ok(size)
        }
    }

    fn truncate_backing(&mut self, size: u64) -> IoResult<()> {
        if self.reverse {
            return Err(IoError::NotPermitted("truncate through a reverse mount"));
        }
        if self.have_header {
            if self.file_iv == 0 {
                self.base.open(true)?;
                self.init_header()?;
            }
            self.base.truncate(size + HEADER_SIZE)
        } else {
            self.base.truncate(size)
        }
    }

    fn is_writable(&self) -> bool {
        !self.reverse && self.base.is_writable()
    }

    fn sync(&mut self, datasync: bool) -> IoResult<()> {
        self.base.sync(datasync)
    }
}

/// The full cipher layer: block engine over [`CipherBackend`], plus the
/// reverse-mode header synthesis on the read path.
pub struct CipherFileIo {
    inner: BlockFileIo<CipherBackend>,
}

impl CipherFileIo {
    pub fn new(base: Box<dyn FileIo>, config: &CipherLayerConfig) -> CipherFileIo {
        debug_assert_eq!(
            config.block_size % config.cipher.cipher_block_size(),
            0,
            "fs block size must be a multiple of the cipher block size"
        );
        let backend = CipherBackend {
            base,
            cipher: Arc::clone(&config.cipher),
            key: Arc::clone(&config.key),
            block_size: config.block_size,
            have_header: config.unique_iv,
            allow_holes: config.allow_holes,
            reverse: config.reverse,
            external_iv: 0,
            file_iv: 0,
        };
        CipherFileIo {
            inner: BlockFileIo::new(backend, config.block_size, config.allow_holes, config.no_cache),
        }
    }

    fn reverse_with_header(&self) -> bool {
        let b = self.inner.backend();
        b.reverse && b.have_header
    }
}

impl FileIo for CipherFileIo {
    fn open(&mut self, write_mode: bool) -> IoResult<()> {
        self.inner.open(write_mode)
    }

    fn set_file_name(&mut self, name: &Path) {
        self.inner.set_file_name(name);
    }

    fn file_name(&self) -> &Path {
        self.inner.file_name()
    }

    fn set_iv(&mut self, iv: u64) -> IoResult<()> {
        self.inner.set_iv(iv)
    }

    fn get_attr(&self) -> IoResult<FileAttr> {
        self.inner.get_attr()
    }

    fn get_size(&self) -> IoResult<u64> {
        self.inner.get_size()
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> IoResult<usize> {
        if !self.reverse_with_header() || buf.is_empty() {
            return self.inner.read(offset, buf);
        }

        // reverse mode surfaces a synthesized header before the content
        let mut served = 0usize;
        let mut offset = offset;
        if offset < HEADER_SIZE {
            let mut header = [0u8; HEADER_SIZE as usize];
            self.inner.backend_mut().generate_reverse_header(&mut header)?;
            let skip = offset as usize;
            served = (HEADER_SIZE as usize - skip).min(buf.len());
            buf[..served].copy_from_slice(&header[skip..skip + served]);
            offset = HEADER_SIZE;
            if served == buf.len() {
                return Ok(served);
            }
        } else if self.inner.backend().file_iv == 0 {
            self.inner.backend_mut().init_header()?;
        }

        let n = self.inner.read(offset - HEADER_SIZE, &mut buf[served..])?;
        Ok(served + n)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> IoResult<usize> {
        self.inner.write(offset, data)
    }

    fn truncate(&mut self, size: u64) -> IoResult<()> {
        self.inner.truncate(size)
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    fn sync(&mut self, datasync: bool) -> IoResult<()> {
        self.inner.sync(datasync)
    }

    fn block_size(&self) -> usize {
        self.inner.block_size()
    }
}
