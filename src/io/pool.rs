//! Scratch-block pool.
//!
//! Block-sized scratch buffers are allocated constantly on the I/O path and
//! routinely hold plaintext, so they are recycled through a process-wide
//! free list and zeroed before they re-enter it. A [`MemBlock`] returns
//! itself to the pool on drop; the pool never hands out a buffer that is
//! still referenced.

use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;
use zeroize::Zeroize;

/// Blocks kept on the free list before excess ones are simply freed.
const MAX_POOLED_BLOCKS: usize = 64;

static POOL: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

/// An owned scratch buffer, zeroed on acquisition and on release.
pub struct MemBlock {
    data: Vec<u8>,
}

/// Take a zeroed buffer of exactly `size` bytes from the pool.
pub fn allocate(size: usize) -> MemBlock {
    let mut pool = POOL.lock();
    let reusable = pool.iter().position(|b| b.capacity() >= size);
    let mut data = match reusable {
        Some(i) => pool.swap_remove(i),
        None => Vec::with_capacity(size),
    };
    drop(pool);

    data.clear();
    data.resize(size, 0);
    MemBlock { data }
}

impl Drop for MemBlock {
    fn drop(&mut self) {
        self.data.zeroize();
        let mut pool = POOL.lock();
        if pool.len() < MAX_POOLED_BLOCKS {
            pool.push(std::mem::take(&mut self.data));
        }
    }
}

impl Deref for MemBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for MemBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
