//! Self-trailing append-only bucket: one arena, at most two live blocks at
//! steady state, with a no-access guard page riding the trailing edge of
//! the block behind the writer. Grounded on `VortexS.cpp`/`.h` — this
//! targets the Linux branch specifically (the original also has a Windows
//! branch that maps a smaller first block; Linux "requires blockSize
//! aligned memory mappings" per the original's own comment, so block 0
//! always covers a full `pagesPerBlock` here).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::Result;
use crate::stream_manager::{self, manager};
use crate::stream_pool::{BlockState, BufferConfig, StreamPool};

use super::{FaultKind, Stream};

pub struct VortexS {
    pool: Arc<StreamPool>,
    bc: BufferConfig,
    id: u64,
    buf_user: usize,
    /// Block-index offset introduced by the cache-line stagger + page
    /// coloring: `bufUser` sits `diff` blocks into the reservation.
    diff: i64,
    blocks: Mutex<HashMap<i64, BlockState>>,
    write_flag: Mutex<bool>,
    last_read_fault_addr: Mutex<Option<usize>>,
}

impl VortexS {
    pub fn new(pool: Arc<StreamPool>, memory_required: usize, chunk_size: usize, id: u64) -> Result<Arc<Self>> {
        let bc = pool.buffer_alloc(memory_required, chunk_size, id)?;
        let base = bc.base;
        let reserve_size = bc.reserve_size;
        // cache-line stagger: always less than one page, so the guard page
        // mechanics downstream are unaffected.
        let buf_user = bc.user_base + 64 * (id as usize & 63);
        let diff = ((buf_user - base) / pool.block_size) as i64;

        info!(id, memory_required, chunk_size, "VortexS created");

        let stream = Arc::new(Self {
            pool,
            bc,
            id,
            buf_user,
            diff,
            blocks: Mutex::new(HashMap::new()),
            write_flag: Mutex::new(false),
            last_read_fault_addr: Mutex::new(None),
        });

        manager().register(base, reserve_size, stream.clone())?;
        Ok(stream)
    }

    pub fn get_read_buf(&self) -> *mut u8 {
        self.buf_user as *mut u8
    }

    pub fn get_write_buf(&self) -> *mut u8 {
        self.buf_user as *mut u8
    }

    pub fn get_first_block_size(&self) -> u64 {
        self.pool.pages_per_block
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn block_index(&self, aligned_addr: usize) -> i64 {
        ((aligned_addr - self.bc.base) >> self.pool.block_size_power) as i64 - self.diff
    }

    fn handle_write_fault(&self, aligned_addr: usize) {
        let index = self.block_index(aligned_addr);
        debug!(id = self.id, index, "VortexS write fault");

        if let Some(lrf) = *self.last_read_fault_addr.lock() {
            let last_read_block = self.block_index((lrf >> self.pool.block_size_power) << self.pool.block_size_power);
            if index == last_read_block + 2 {
                *self.write_flag.lock() = true;
            }
        }

        let mut blocks = self.blocks.lock();

        if let Some(prev) = blocks.get(&(index - 1)) {
            if let Err(e) = self.pool.install_guard(prev.vaddr) {
                tracing::error!(error = %e, "failed to reinstall trailing guard");
                stream_manager::fatal_in_fault_handler("install_guard failed");
            }
        }

        if let Some(cur) = blocks.get(&index) {
            if let Err(e) = self.pool.remove_guard(cur.vaddr) {
                tracing::error!(error = %e, "failed to remove guard on current block");
                stream_manager::fatal_in_fault_handler("remove_guard failed");
            }
        } else {
            let pages_needed = self.pool.pages_per_block;
            let frames = match self.pool.get_new_block(pages_needed) {
                Ok(f) => f,
                Err(e) => {
                    tracing::error!(error = %e, "failed to allocate frames for write fault");
                    stream_manager::fatal_in_fault_handler("pool exhausted servicing write fault");
                }
            };
            if let Err(e) = self.pool.map_block(&self.bc, aligned_addr, &frames) {
                tracing::error!(error = %e, "failed to map block");
                stream_manager::fatal_in_fault_handler("map_block failed");
            }
            blocks.insert(
                index,
                BlockState {
                    vaddr: aligned_addr,
                    frames,
                },
            );
        }
    }

    fn handle_read_fault(&self, raw_addr: usize, aligned_addr: usize) {
        let index = self.block_index(aligned_addr);
        debug!(id = self.id, index, "VortexS read fault");

        let aligned = raw_addr == aligned_addr;
        let mut last_read = self.last_read_fault_addr.lock();
        let block_gap = *last_read == Some(raw_addr.wrapping_sub(self.pool.block_size));
        let second_block = *last_read == Some(self.buf_user) && raw_addr < self.buf_user + self.pool.block_size;
        let write_flag = *self.write_flag.lock();

        if !write_flag && (second_block || block_gap) && aligned {
            if let Some(block) = self.blocks.lock().remove(&(index - 1)) {
                if let Err(e) = self.pool.unmap_block(&self.bc, block.vaddr, &block.frames) {
                    tracing::error!(error = %e, "failed to unmap trailing block");
                    stream_manager::fatal_in_fault_handler("unmap_block failed");
                }
                self.pool.return_free_block(block.frames);
            }
        }

        let blocks = self.blocks.lock();
        let block = blocks
            .get(&index)
            .unwrap_or_else(|| stream_manager::fatal_in_fault_handler("trying to use an empty block"));
        if let Err(e) = self.pool.remove_guard(block.vaddr) {
            tracing::error!(error = %e, "failed to remove guard on current block");
            stream_manager::fatal_in_fault_handler("remove_guard failed");
        }
        drop(blocks);

        *last_read = Some(raw_addr);
        drop(last_read);
        *self.write_flag.lock() = false;
    }

    fn do_reset(&self) {
        let entries: Vec<(i64, BlockState)> = self.blocks.lock().drain().collect();
        for (_, block) in entries {
            // Linux doesn't implicitly clear a guard page when the
            // underlying mapping is torn down, unlike Windows; do it
            // explicitly before unmapping.
            let _ = self.pool.remove_guard(block.vaddr);
            if let Err(e) = self.pool.unmap_block(&self.bc, block.vaddr, &block.frames) {
                tracing::error!(error = %e, "failed to unmap block during reset");
            }
            self.pool.return_free_block(block.frames);
        }
        *self.write_flag.lock() = false;
        *self.last_read_fault_addr.lock() = None;
    }
}

impl Stream for VortexS {
    fn process_fault(&self, kind: FaultKind, fault_addr: usize) -> bool {
        let offset = fault_addr.wrapping_sub(self.bc.base);
        if offset >= self.bc.reserve_size {
            stream_manager::fatal_in_fault_handler("fault outside VortexS arena bounds");
        }
        let aligned = self.bc.base + (offset & !(self.pool.block_size - 1));
        self.bc.last_fault.store(aligned, std::sync::atomic::Ordering::SeqCst);

        match kind {
            FaultKind::Write => self.handle_write_fault(aligned),
            FaultKind::Read => self.handle_read_fault(fault_addr, aligned),
        }
        true
    }

    fn reset(&self) {
        self.do_reset();
    }
}

impl Drop for VortexS {
    fn drop(&mut self) {
        self.do_reset();
        manager().unregister(self.bc.base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_one_block() {
        let pool = StreamPool::new(12, 16).unwrap(); // 64 KiB blocks
        pool.adjust_pool_physical_memory(pool.pages_per_block * 4).unwrap();
        let vs = VortexS::new(pool, 1 << 20, 1 << 20, 0).unwrap();

        let buf = vs.get_write_buf();
        unsafe {
            *buf = 0xAB;
        }
        unsafe {
            assert_eq!(*vs.get_read_buf(), 0xAB);
        }
        assert_eq!(vs.get_first_block_size(), vs.pool.pages_per_block);
    }

    #[test]
    fn write_across_several_blocks_then_reset_frees_everything() {
        let pool = StreamPool::new(12, 16).unwrap();
        pool.adjust_pool_physical_memory(pool.pages_per_block * 8).unwrap();
        let vs = VortexS::new(pool.clone(), 1 << 22, 1 << 22, 1).unwrap();

        let block_size = pool.block_size;
        let buf = vs.get_write_buf();
        unsafe {
            for block in 0..4u64 {
                let p = buf.add(block as usize * block_size);
                std::ptr::write_volatile(p, block as u8);
            }
        }
        assert_eq!(vs.blocks.lock().len(), 4);

        vs.reset();
        assert_eq!(vs.blocks.lock().len(), 0);
        // all frames returned to the pool
        assert_eq!(pool.free_count(), pool.page_count());
    }
}
