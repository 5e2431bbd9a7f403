//! Generic block engine.
//!
//! Translates arbitrary-offset reads and writes into block-aligned,
//! block-sized operations against a [`BlockBackend`], stitching partial
//! blocks through scratch buffers. A single-slot write-through cache holds
//! the most recently touched block, which turns the common
//! read-modify-write sequence into one backing read.
//!
//! Cache invariant: a non-empty slot holds exactly the plaintext of the
//! block at `slot.offset`. The slot is cleared on any write-through error
//! and is disabled entirely when the backing may change underneath us
//! (reverse mode).

use std::path::Path;

use crate::error::IoResult;

use super::pool::{self, MemBlock};
use super::{FileAttr, FileIo, IoRequest};

/// The block-sized operations a layer provides to the engine.
///
/// `read_one_block`/`write_one_block` receive block-aligned offsets and at
/// most one block of data; everything else passes through to the wrapped
/// layer with whatever size translation the implementation applies.
pub(crate) trait BlockBackend: Send {
    fn read_one_block(&mut self, req: &mut IoRequest<'_>) -> IoResult<usize>;

    fn write_one_block(&mut self, offset: u64, data: &[u8]) -> IoResult<usize>;

    fn open(&mut self, write_mode: bool) -> IoResult<()>;

    fn set_file_name(&mut self, name: &Path);

    fn file_name(&self) -> &Path;

    fn set_iv(&mut self, iv: u64) -> IoResult<()>;

    fn get_attr(&self) -> IoResult<FileAttr>;

    /// Logical size at this layer.
    fn get_size(&self) -> IoResult<u64>;

    /// Truncate the wrapped layer to hold exactly `size` logical bytes.
    fn truncate_backing(&mut self, size: u64) -> IoResult<()>;

    fn is_writable(&self) -> bool;

    fn sync(&mut self, datasync: bool) -> IoResult<()>;
}

struct CacheSlot {
    offset: u64,
    len: usize,
    data: Vec<u8>,
}

impl CacheSlot {
    fn clear(&mut self) {
        self.data.fill(0);
        self.len = 0;
    }
}

/// A [`FileIo`] layer built from a [`BlockBackend`] plus the engine state.
pub(crate) struct BlockFileIo<B: BlockBackend> {
    backend: B,
    block_size: usize,
    allow_holes: bool,
    no_cache: bool,
    cache: CacheSlot,
}

impl<B: BlockBackend> BlockFileIo<B> {
    pub(crate) fn new(
        backend: B,
        block_size: usize,
        allow_holes: bool,
        no_cache: bool,
    ) -> BlockFileIo<B> {
        assert!(block_size > 1, "block size must exceed one byte");
        BlockFileIo {
            backend,
            block_size,
            allow_holes,
            no_cache,
            cache: CacheSlot {
                offset: 0,
                len: 0,
                data: vec![0u8; block_size],
            },
        }
    }

    pub(crate) fn backend(&self) -> &B {
        &self.backend
    }

    pub(crate) fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Serve a read of at most one block at a block-aligned offset.
    ///
    /// Full blocks are always requested from the backend; the result is
    /// clamped to the request length. Short backend results mark the last
    /// block of the file and are still cacheable.
    fn cache_read_one_block(&mut self, req: &mut IoRequest<'_>) -> IoResult<usize> {
        debug_assert!(req.len() <= self.block_size);
        debug_assert_eq!(req.offset % self.block_size as u64, 0);

        if !self.no_cache && req.offset == self.cache.offset && self.cache.len != 0 {
            let len = req.len().min(self.cache.len);
            req.data[..len].copy_from_slice(&self.cache.data[..len]);
            return Ok(len);
        }
        if self.cache.len > 0 {
            self.cache.clear();
        }

        let block_size = self.block_size;
        let Self { backend, cache, .. } = self;
        let result = {
            let mut full = IoRequest::new(req.offset, &mut cache.data[..block_size]);
            backend.read_one_block(&mut full)
        };

        match result {
            Ok(n) if n > 0 => {
                self.cache.offset = req.offset;
                self.cache.len = n;
                let serve = n.min(req.len());
                req.data[..serve].copy_from_slice(&self.cache.data[..serve]);
                Ok(serve)
            }
            Ok(_) => {
                tracing::debug!("read size zero for offset {}", req.offset);
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    /// Write at most one block at a block-aligned offset, keeping the cache
    /// slot coherent. Any backend failure empties the slot.
    fn cache_write_one_block(&mut self, offset: u64, data: &[u8]) -> IoResult<usize> {
        debug_assert!(data.len() <= self.block_size);
        debug_assert_eq!(offset % self.block_size as u64, 0);

        match self.backend.write_one_block(offset, data) {
            Ok(n) => {
                self.cache.data[..data.len()].copy_from_slice(data);
                self.cache.offset = offset;
                self.cache.len = data.len();
                Ok(n)
            }
            Err(e) => {
                self.cache.clear();
                Err(e)
            }
        }
    }

    /// Read the old tail block at its exact pre-extension length.
    ///
    /// Padding runs after the backing truncate, so the backing may already
    /// be zero-extended past the tail; a full-block read would then span
    /// bytes the tail was never encoded with. The request length pins the
    /// read to the bytes that were actually written.
    fn read_tail_block(&mut self, offset: u64, buf: &mut [u8]) -> IoResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.no_cache && offset == self.cache.offset && self.cache.len != 0 {
            let len = buf.len().min(self.cache.len);
            buf[..len].copy_from_slice(&self.cache.data[..len]);
            return Ok(len);
        }
        let mut req = IoRequest::new(offset, buf);
        self.backend.read_one_block(&mut req)
    }

    /// Zero-extend the file from `old_size` to `new_size`.
    ///
    /// Rounds the current tail block up to a full block, emits whole zero
    /// blocks for the span in between unless holes are allowed, and when
    /// `force_write` is set materializes the final partial block as well.
    fn pad_file(&mut self, old_size: u64, new_size: u64, force_write: bool) -> IoResult<()> {
        let bs = self.block_size as u64;
        let old_last_block = old_size / bs;
        let new_last_block = new_size / bs;

        let mut mb = pool::allocate(self.block_size);

        if old_last_block == new_last_block {
            if !force_write {
                tracing::debug!("optimization: not padding last block");
                return Ok(());
            }
            let out_size = (new_size % bs) as usize;
            if out_size != 0 {
                mb[..out_size].fill(0);
                let offset = old_last_block * bs;
                let old_partial = (old_size % bs) as usize;
                self.read_tail_block(offset, &mut mb[..old_partial])?;
                self.cache_write_one_block(offset, &mb[..out_size])?;
            }
            return Ok(());
        }

        // extend the current tail block to a full block
        let mut next_block = old_last_block;
        let old_partial = (old_size % bs) as usize;
        if old_partial != 0 {
            tracing::debug!("padding block {next_block}");
            mb.fill(0);
            let offset = next_block * bs;
            self.read_tail_block(offset, &mut mb[..old_partial])?;
            let block_size = self.block_size;
            self.cache_write_one_block(offset, &mb[..block_size])?;
            next_block += 1;
        }

        // whole blocks in between stay sparse when holes are allowed
        if !self.allow_holes {
            while next_block != new_last_block {
                tracing::debug!("padding block {next_block}");
                mb.fill(0);
                let block_size = self.block_size;
                self.cache_write_one_block(next_block * bs, &mb[..block_size])?;
                next_block += 1;
            }
        }

        let new_partial = (new_size % bs) as usize;
        if force_write && new_partial != 0 {
            mb[..new_partial].fill(0);
            self.cache_write_one_block(new_last_block * bs, &mb[..new_partial])?;
        }
        Ok(())
    }
}

impl<B: BlockBackend> FileIo for BlockFileIo<B> {
    fn open(&mut self, write_mode: bool) -> IoResult<()> {
        self.backend.open(write_mode)
    }

    fn set_file_name(&mut self, name: &Path) {
        self.backend.set_file_name(name);
    }

    fn file_name(&self) -> &Path {
        self.backend.file_name()
    }

    fn set_iv(&mut self, iv: u64) -> IoResult<()> {
        self.backend.set_iv(iv)
    }

    fn get_attr(&self) -> IoResult<FileAttr> {
        self.backend.get_attr()
    }

    fn get_size(&self) -> IoResult<u64> {
        self.backend.get_size()
    }

    /// Stitch together whole blocks to serve an arbitrary request, dropping
    /// unwanted bytes from the front of the first block. Stops at the first
    /// short block (end of file); the first error aborts the read.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> IoResult<usize> {
        let bs = self.block_size as u64;
        let mut partial = (offset % bs) as usize;
        let mut block_num = offset / bs;

        if partial == 0 && buf.len() <= self.block_size {
            let mut req = IoRequest::new(offset, buf);
            return self.cache_read_one_block(&mut req);
        }

        let mut scratch: Option<MemBlock> = None;
        let mut out_pos = 0usize;
        let mut remaining = buf.len();
        let mut total = 0usize;

        while remaining > 0 {
            let block_offset = block_num * bs;
            let direct = partial == 0 && remaining >= self.block_size;

            let read_size = if direct {
                let slice = &mut buf[out_pos..out_pos + self.block_size];
                let mut req = IoRequest::new(block_offset, slice);
                self.cache_read_one_block(&mut req)?
            } else {
                let mb = scratch.get_or_insert_with(|| pool::allocate(self.block_size));
                let mut req = IoRequest::new(block_offset, &mut mb[..]);
                self.cache_read_one_block(&mut req)?
            };

            if read_size <= partial {
                break;
            }
            let copy = (read_size - partial).min(remaining);
            if !direct {
                let mb = scratch.as_ref().expect("scratch allocated above");
                buf[out_pos..out_pos + copy].copy_from_slice(&mb[partial..partial + copy]);
            }

            total += copy;
            remaining -= copy;
            out_pos += copy;
            block_num += 1;
            partial = 0;

            if read_size < self.block_size {
                break;
            }
        }
        Ok(total)
    }

    /// Write with zero-fill of any gap past end of file, fast paths for
    /// aligned and tail-growing requests, and read-modify-write otherwise.
    fn write(&mut self, offset: u64, data: &[u8]) -> IoResult<usize> {
        let bs = self.block_size as u64;
        let file_size = self.backend.get_size()?;

        let mut block_num = offset / bs;
        let mut partial = (offset % bs) as usize;

        let last_file_block = file_size / bs;
        let last_block_size = (file_size % bs) as usize;
        let last_nonempty_block = if last_block_size == 0 {
            last_file_block as i64 - 1
        } else {
            last_file_block as i64
        };

        if offset > file_size {
            self.pad_file(file_size, offset, false)?;
        }

        if partial == 0 && data.len() <= self.block_size {
            let whole_block = data.len() == self.block_size;
            let growing_tail = block_num == last_file_block && data.len() >= last_block_size;
            if whole_block || growing_tail {
                self.cache_write_one_block(offset, data)?;
                return Ok(data.len());
            }
        }

        // merge with existing blocks
        let mut scratch: Option<MemBlock> = None;
        let mut in_pos = 0usize;
        let mut remaining = data.len();

        while remaining > 0 {
            let block_offset = block_num * bs;
            let to_copy = (self.block_size - partial).min(remaining);

            let replaces_whole = to_copy == self.block_size;
            let extends_past_eof = partial == 0 && block_offset + to_copy as u64 >= file_size;

            if replaces_whole || extends_past_eof {
                self.cache_write_one_block(block_offset, &data[in_pos..in_pos + to_copy])?;
            } else {
                let mb = scratch.get_or_insert_with(|| pool::allocate(self.block_size));
                mb.fill(0);

                let mut merged_len;
                if block_num as i64 > last_nonempty_block {
                    // brand new block: the zero fill is the base content
                    merged_len = partial + to_copy;
                } else {
                    let mut req = IoRequest::new(block_offset, &mut mb[..]);
                    merged_len = self.cache_read_one_block(&mut req)?;
                    if partial + to_copy > merged_len {
                        merged_len = partial + to_copy;
                    }
                }

                mb[partial..partial + to_copy].copy_from_slice(&data[in_pos..in_pos + to_copy]);
                self.cache_write_one_block(block_offset, &mb[..merged_len])?;
            }

            remaining -= to_copy;
            in_pos += to_copy;
            block_num += 1;
            partial = 0;
        }

        Ok(data.len())
    }

    fn truncate(&mut self, size: u64) -> IoResult<()> {
        let bs = self.block_size as u64;
        let partial = (size % bs) as usize;
        let old_size = self.backend.get_size()?;

        if size > old_size {
            // backing first: the physical file reaches the target length
            // even if a padding write fails partway
            self.backend.truncate_backing(size)?;
            self.pad_file(old_size, size, true)
        } else if size == old_size {
            Ok(())
        } else if partial != 0 {
            // shrink into the middle of a block: rewrite the new tail
            let block_num = size / bs;
            let mut mb = pool::allocate(self.block_size);
            {
                let mut req = IoRequest::new(block_num * bs, &mut mb[..]);
                self.cache_read_one_block(&mut req)?;
            }
            self.backend.truncate_backing(size)?;
            self.cache_write_one_block(block_num * bs, &mb[..partial])?;
            Ok(())
        } else {
            self.backend.truncate_backing(size)
        }
    }

    fn is_writable(&self) -> bool {
        self.backend.is_writable()
    }

    fn sync(&mut self, datasync: bool) -> IoResult<()> {
        self.backend.sync(datasync)
    }

    fn block_size(&self) -> usize {
        self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IoError;
    use std::collections::BTreeMap;

    /// In-memory backend storing whole blocks; short tail block allowed.
    struct MemBackend {
        blocks: BTreeMap<u64, Vec<u8>>,
        block_size: usize,
        size: u64,
        name: std::path::PathBuf,
        fail_writes: bool,
    }

    impl MemBackend {
        fn new(block_size: usize) -> MemBackend {
            MemBackend {
                blocks: BTreeMap::new(),
                block_size,
                size: 0,
                name: "mem".into(),
                fail_writes: false,
            }
        }
    }

    impl BlockBackend for MemBackend {
        fn read_one_block(&mut self, req: &mut IoRequest<'_>) -> IoResult<usize> {
            if req.offset >= self.size {
                return Ok(0);
            }
            let stored = self.blocks.get(&req.offset);
            let in_file = ((self.size - req.offset) as usize).min(self.block_size);
            let serve = in_file.min(req.len());
            req.data[..serve].fill(0);
            if let Some(block) = stored {
                let n = serve.min(block.len());
                req.data[..n].copy_from_slice(&block[..n]);
            }
            Ok(serve)
        }

        fn write_one_block(&mut self, offset: u64, data: &[u8]) -> IoResult<usize> {
            if self.fail_writes {
                return Err(IoError::from_errno(libc::EIO));
            }
            let mut block = self.blocks.remove(&offset).unwrap_or_default();
            if block.len() < data.len() {
                block.resize(data.len(), 0);
            }
            block[..data.len()].copy_from_slice(data);
            self.blocks.insert(offset, block);
            self.size = self.size.max(offset + data.len() as u64);
            Ok(data.len())
        }

        fn open(&mut self, _write_mode: bool) -> IoResult<()> {
            Ok(())
        }

        fn set_file_name(&mut self, name: &Path) {
            self.name = name.to_path_buf();
        }

        fn file_name(&self) -> &Path {
            &self.name
        }

        fn set_iv(&mut self, _iv: u64) -> IoResult<()> {
            Ok(())
        }

        fn get_attr(&self) -> IoResult<FileAttr> {
            Ok(FileAttr {
                size: self.size,
                is_regular_file: true,
                ..FileAttr::default()
            })
        }

        fn get_size(&self) -> IoResult<u64> {
            Ok(self.size)
        }

        fn truncate_backing(&mut self, size: u64) -> IoResult<()> {
            self.size = size;
            self.blocks.retain(|&off, _| off < size);
            Ok(())
        }

        fn is_writable(&self) -> bool {
            true
        }

        fn sync(&mut self, _datasync: bool) -> IoResult<()> {
            Ok(())
        }
    }

    fn engine(block_size: usize) -> BlockFileIo<MemBackend> {
        BlockFileIo::new(MemBackend::new(block_size), block_size, false, false)
    }

    #[test]
    fn aligned_full_block_round_trip() {
        let mut io = engine(64);
        let data: Vec<u8> = (0..64u8).collect();
        assert_eq!(io.write(0, &data).unwrap(), 64);

        let mut buf = vec![0u8; 64];
        assert_eq!(io.read(0, &mut buf).unwrap(), 64);
        assert_eq!(buf, data);
    }

    #[test]
    fn unaligned_write_and_read_span_blocks() {
        let mut io = engine(64);
        let data: Vec<u8> = (0..200).map(|i| i as u8).collect();
        assert_eq!(io.write(10, &data).unwrap(), 200);
        assert_eq!(io.get_size().unwrap(), 210);

        let mut buf = vec![0u8; 200];
        assert_eq!(io.read(10, &mut buf).unwrap(), 200);
        assert_eq!(buf, data);

        // bytes before the write are zero fill
        let mut head = vec![0xAAu8; 10];
        assert_eq!(io.read(0, &mut head).unwrap(), 10);
        assert_eq!(head, vec![0u8; 10]);
    }

    #[test]
    fn read_past_eof_is_short() {
        let mut io = engine(64);
        io.write(0, &[1u8; 100]).unwrap();

        let mut buf = vec![0u8; 64];
        assert_eq!(io.read(96, &mut buf).unwrap(), 4);
        assert_eq!(io.read(100, &mut buf).unwrap(), 0);
        assert_eq!(io.read(5000, &mut buf).unwrap(), 0);
    }

    #[test]
    fn sparse_write_pads_with_zeros() {
        let mut io = engine(64);
        io.write(0, &[9u8; 10]).unwrap();
        io.write(300, &[7u8; 4]).unwrap();
        assert_eq!(io.get_size().unwrap(), 304);

        let mut buf = vec![0xFFu8; 290];
        assert_eq!(io.read(10, &mut buf).unwrap(), 290);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn overwrite_merges_with_existing_block() {
        let mut io = engine(64);
        io.write(0, &[1u8; 128]).unwrap();
        io.write(30, &[2u8; 10]).unwrap();

        let mut buf = vec![0u8; 128];
        io.read(0, &mut buf).unwrap();
        assert!(buf[..30].iter().all(|&b| b == 1));
        assert!(buf[30..40].iter().all(|&b| b == 2));
        assert!(buf[40..].iter().all(|&b| b == 1));
    }

    #[test]
    fn cache_serves_repeated_single_block_reads() {
        let mut io = engine(64);
        io.write(0, &[5u8; 64]).unwrap();

        let mut buf = [0u8; 32];
        io.read(0, &mut buf).unwrap();
        // poke the backend directly; the cached block must still serve
        io.backend_mut().blocks.get_mut(&0).unwrap()[0] = 99;
        io.read(0, &mut buf).unwrap();
        assert_eq!(buf[0], 5, "cache hit expected");
    }

    #[test]
    fn no_cache_mode_reads_through() {
        let mut io = BlockFileIo::new(MemBackend::new(64), 64, false, true);
        io.write(0, &[5u8; 64]).unwrap();

        let mut buf = [0u8; 32];
        io.read(0, &mut buf).unwrap();
        io.backend_mut().blocks.get_mut(&0).unwrap()[0] = 99;
        io.read(0, &mut buf).unwrap();
        assert_eq!(buf[0], 99, "cache must be bypassed");
    }

    #[test]
    fn write_error_clears_cache() {
        let mut io = engine(64);
        io.write(0, &[5u8; 64]).unwrap();
        io.backend_mut().fail_writes = true;
        assert!(io.write(0, &[6u8; 64]).is_err());
        io.backend_mut().fail_writes = false;

        // cache may not serve the failed write's data
        let mut buf = [0u8; 8];
        io.read(0, &mut buf).unwrap();
        assert_eq!(buf, [5u8; 8]);
    }

    #[test]
    fn truncate_shrink_to_unaligned_size() {
        let mut io = engine(64);
        let data: Vec<u8> = (0..160).map(|i| i as u8).collect();
        io.write(0, &data).unwrap();

        io.truncate(100).unwrap();
        assert_eq!(io.get_size().unwrap(), 100);

        let mut buf = vec![0u8; 128];
        let n = io.read(0, &mut buf).unwrap();
        assert_eq!(n, 100);
        assert_eq!(&buf[..100], &data[..100]);
    }

    #[test]
    fn truncate_grow_materializes_zeros() {
        let mut io = engine(64);
        io.write(0, &[3u8; 10]).unwrap();
        io.truncate(150).unwrap();
        assert_eq!(io.get_size().unwrap(), 150);

        let mut buf = vec![0xFFu8; 140];
        assert_eq!(io.read(10, &mut buf).unwrap(), 140);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn holes_skip_interior_blocks() {
        let mut io = BlockFileIo::new(MemBackend::new(64), 64, true, false);
        io.write(10 * 64, &[1u8; 4]).unwrap();

        // interior blocks were never written
        assert!(io.backend().blocks.keys().all(|&off| off >= 10 * 64));

        let mut buf = vec![0xFFu8; 64];
        assert_eq!(io.read(64, &mut buf).unwrap(), 64);
        assert!(buf.iter().all(|&b| b == 0));
    }
}
