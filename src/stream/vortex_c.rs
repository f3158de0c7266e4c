//! Producer→consumer handoff channel over two cursor-linked arenas.
//! Grounded on `VortexC.cpp`/`.h`.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::stream_manager::{self, manager};
use crate::stream_pool::{BlockState, BufferConfig, StreamPool};
use crate::sync::Semaphore;

use super::{FaultKind, Stream};

#[derive(Debug, Clone)]
pub struct VortexCConfig {
    pub size: u64,
    pub block_size_power: u32,
    /// M: how many blocks the consumer may step back from its head.
    pub come_back_consumer: u64,
    /// L: how many blocks the producer may step back from its head.
    pub come_back_producer: u64,
    /// N: maximum producer lead over the consumer, in blocks.
    pub write_ahead: u64,
}

pub struct VortexC {
    pool: Arc<StreamPool>,
    reader: BufferConfig,
    writer: BufferConfig,
    reader_base: usize,
    writer_base: usize,
    size: u64,
    m: u64,
    l: u64,
    blocks: Mutex<HashMap<i64, BlockState>>,
    cur_read_off: Mutex<i64>,
    last_writer_position: Mutex<Option<usize>>,
    sem_empty: Semaphore,
    sem_full: Semaphore,
}

impl VortexC {
    pub fn new(cfg: VortexCConfig) -> Result<Arc<Self>> {
        let fwd = cfg.write_ahead + cfg.come_back_producer;
        let pool = StreamPool::new(12, cfg.block_size_power)?;
        pool.adjust_pool_physical_memory(
            (cfg.come_back_consumer + cfg.come_back_producer + cfg.write_ahead + 1) * pool.pages_per_block,
        )?;

        let reader = pool.buffer_alloc(cfg.size as usize, cfg.size as usize, 0)?;
        let writer = pool.buffer_alloc(cfg.size as usize, cfg.size as usize, 0)?;
        let reader_base = reader.base;
        let writer_base = writer.base;

        info!(
            size = cfg.size,
            block_size = pool.block_size,
            m = cfg.come_back_consumer,
            l = cfg.come_back_producer,
            n = cfg.write_ahead,
            "VortexC created"
        );

        let stream = Arc::new(Self {
            pool,
            reader,
            writer,
            reader_base,
            writer_base,
            size: cfg.size,
            m: cfg.come_back_consumer,
            l: cfg.come_back_producer,
            blocks: Mutex::new(HashMap::new()),
            cur_read_off: Mutex::new(-1),
            last_writer_position: Mutex::new(None),
            sem_empty: Semaphore::new(fwd),
            sem_full: Semaphore::new(0),
        });

        manager().register(reader_base, stream.reader.reserve_size, stream.clone())?;
        if let Err(e) = manager().register(writer_base, stream.writer.reserve_size, stream.clone()) {
            manager().unregister(reader_base);
            return Err(e);
        }

        Ok(stream)
    }

    fn is_reader_address(&self, addr: usize) -> bool {
        addr >= self.reader_base && addr < self.reader_base + self.reader.reserve_size
    }

    fn pages_for_block(&self, idx: i64, raw_addr: usize, base: usize) -> u64 {
        if idx != 0 {
            self.pool.pages_per_block
        } else {
            let page_spacing = ((raw_addr - base) >> self.pool.page_size_power) as u64;
            self.pool.pages_per_block - (page_spacing & (self.pool.pages_per_block - 1))
        }
    }

    fn handle_write_fault(&self, raw_addr: usize, aligned_addr: usize) {
        let idx = ((aligned_addr - self.writer_base) >> self.pool.block_size_power) as i64;
        debug!(idx, addr = format_args!("{aligned_addr:#x}"), "write fault");

        {
            let mut last = self.last_writer_position.lock();
            if let Some(prev) = *last {
                let comeback_bytes = (self.l as usize) << self.pool.block_size_power;
                if raw_addr < prev.saturating_sub(comeback_bytes) {
                    stream_manager::fatal_in_fault_handler("producer violated come-back window L");
                }
            }
            *last = Some(raw_addr);
        }

        let pages_needed = self.pages_for_block(idx, raw_addr, self.writer_base);

        if idx - (self.l as i64 + 1) >= 0 {
            self.sem_full.post(1);
        }

        self.sem_empty.wait();

        let frames = match self.pool.get_new_block(pages_needed) {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, "failed to allocate frames for write fault");
                stream_manager::fatal_in_fault_handler("pool exhausted servicing write fault");
            }
        };
        if let Err(e) = self.pool.map_block(&self.writer, aligned_addr, &frames) {
            error!(error = %e, "failed to map block");
            stream_manager::fatal_in_fault_handler("map_block failed");
        }

        self.blocks.lock().insert(
            idx,
            BlockState {
                vaddr: aligned_addr,
                frames,
            },
        );
    }

    fn handle_read_fault(&self, aligned_addr: usize) {
        let idx = ((aligned_addr - self.reader_base) >> self.pool.block_size_power) as i64;
        debug!(idx, addr = format_args!("{aligned_addr:#x}"), "read fault");

        loop {
            let mut cur_guard = self.cur_read_off.lock();
            if *cur_guard >= idx {
                break;
            }
            *cur_guard += 1;
            let cur = *cur_guard;
            drop(cur_guard);

            if cur - (self.m as i64 + 1) >= 0 {
                let empty_idx = cur - (self.m as i64 + 1);
                let block = self.blocks.lock().remove(&empty_idx);
                let block = match block {
                    Some(b) => b,
                    None => stream_manager::fatal_in_fault_handler("unmapping an empty block"),
                };
                let bc: &BufferConfig = if self.is_reader_address(block.vaddr) {
                    &self.reader
                } else {
                    &self.writer
                };
                if let Err(e) = self.pool.unmap_block(bc, block.vaddr, &block.frames) {
                    error!(error = %e, "failed to unmap block");
                    stream_manager::fatal_in_fault_handler("unmap_block failed");
                }
                self.pool.return_free_block(block.frames);
            }

            self.sem_empty.post(1);
            self.sem_full.wait();

            if cur + self.m as i64 >= idx {
                let (old_vaddr, num_pages) = {
                    let blocks = self.blocks.lock();
                    let block = blocks
                        .get(&cur)
                        .unwrap_or_else(|| stream_manager::fatal_in_fault_handler("mapping down empty block"));
                    (block.vaddr, block.frames.len() as u64)
                };
                let new_vaddr = self.reader_base + cur as usize * self.pool.block_size;
                if let Err(e) = self.pool.remap_block(&self.writer, old_vaddr, &self.reader, new_vaddr, num_pages) {
                    error!(error = %e, "failed to remap block down to reader arena");
                    stream_manager::fatal_in_fault_handler("remap_block failed");
                }
                if let Some(b) = self.blocks.lock().get_mut(&cur) {
                    b.vaddr = new_vaddr;
                }
            }
        }
    }

    fn do_reset(&self) {
        let entries: Vec<(i64, BlockState)> = self.blocks.lock().drain().collect();
        for (_, block) in entries {
            let bc: &BufferConfig = if self.is_reader_address(block.vaddr) {
                &self.reader
            } else {
                &self.writer
            };
            if let Err(e) = self.pool.unmap_block(bc, block.vaddr, &block.frames) {
                error!(error = %e, "failed to unmap block during reset");
            }
            self.pool.return_free_block(block.frames);
        }
        *self.cur_read_off.lock() = -1;
        *self.last_writer_position.lock() = None;
    }

    pub fn get_write_buf(&self) -> *mut u8 {
        self.writer_base as *mut u8
    }

    pub fn get_read_buf(&self) -> *mut u8 {
        self.reader_base as *mut u8
    }

    pub fn get_size(&self) -> u64 {
        self.size
    }

    pub fn get_block_size(&self) -> usize {
        self.pool.block_size
    }

    pub fn get_producer_comeback(&self) -> u64 {
        self.l
    }

    pub fn get_consumer_comeback(&self) -> u64 {
        self.m
    }

    /// The backing `StreamPool` — exposed so callers (and tests) can watch
    /// `min_available()`/`page_count()` without reaching into private state.
    pub fn pool(&self) -> &Arc<StreamPool> {
        &self.pool
    }

    /// Release the producer's remaining pending blocks, draining the
    /// consumer side to completion.
    pub fn finished_write(&self) {
        self.sem_full.post(self.l + 1);
    }

    /// Touch the last byte of the stream, forcing any final read fault.
    pub fn finished_read(&self) {
        unsafe {
            let last = (self.reader_base as *const u8).add(self.size as usize - 1);
            std::ptr::read_volatile(last);
        }
    }
}

impl Stream for VortexC {
    fn process_fault(&self, kind: FaultKind, fault_addr: usize) -> bool {
        match kind {
            FaultKind::Write => {
                let offset = fault_addr.wrapping_sub(self.writer_base);
                if offset >= self.writer.reserve_size {
                    stream_manager::fatal_in_fault_handler("write fault outside writer arena bounds");
                }
                let aligned = self.writer_base + (offset & !(self.pool.block_size - 1));
                self.writer.last_fault.store(aligned, Ordering::SeqCst);
                self.handle_write_fault(fault_addr, aligned);
            }
            FaultKind::Read => {
                let offset = fault_addr.wrapping_sub(self.reader_base);
                if offset >= self.reader.reserve_size {
                    stream_manager::fatal_in_fault_handler("read fault outside reader arena bounds");
                }
                let aligned = self.reader_base + (offset & !(self.pool.block_size - 1));
                self.reader.last_fault.store(aligned, Ordering::SeqCst);
                self.handle_read_fault(aligned);
            }
        }
        true
    }

    fn reset(&self) {
        self.do_reset();
    }
}

impl Drop for VortexC {
    fn drop(&mut self) {
        self.do_reset();
        manager().unregister(self.reader_base);
        manager().unregister(self.writer_base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn small_config(size: u64) -> VortexCConfig {
        VortexCConfig {
            size,
            block_size_power: 16, // 64 KiB blocks, small enough for quick tests
            come_back_consumer: 0,
            come_back_producer: 0,
            write_ahead: 2,
        }
    }

    #[test]
    fn producer_constant_consumer_sum_e1_shape() {
        // Scaled-down analogue of spec.md's E1 scenario.
        let size = 1 << 18; // 256 KiB, 4 blocks of 64 KiB
        let vc = VortexC::new(small_config(size)).unwrap();
        let words = (size / 8) as u64;

        let writer = {
            let vc = vc.clone();
            thread::spawn(move || {
                let buf = vc.get_write_buf() as *mut u64;
                unsafe {
                    for i in 0..words {
                        *buf.add(i as usize) = 32u64;
                    }
                }
                vc.finished_write();
            })
        };

        let reader = {
            let vc = vc.clone();
            thread::spawn(move || {
                let buf = vc.get_read_buf() as *const u64;
                let mut sum: u64 = 0;
                unsafe {
                    for i in 0..words {
                        sum = sum.wrapping_add(*buf.add(i as usize));
                    }
                }
                vc.finished_read();
                sum
            })
        };

        writer.join().unwrap();
        let sum = reader.join().unwrap();
        assert_eq!(sum, 32 * words);
    }

    #[test]
    fn bounded_residency_never_exceeds_m_plus_l_plus_n_plus_1() {
        let size = 1 << 20;
        let cfg = VortexCConfig {
            size,
            block_size_power: 16,
            come_back_consumer: 1,
            come_back_producer: 1,
            write_ahead: 2,
        };
        let bound = cfg.come_back_consumer + cfg.come_back_producer + cfg.write_ahead + 1;
        let vc = VortexC::new(cfg).unwrap();

        let words = (size / 8) as u64;
        let writer = {
            let vc = vc.clone();
            thread::spawn(move || {
                let buf = vc.get_write_buf() as *mut u64;
                unsafe {
                    for i in 0..words {
                        *buf.add(i as usize) = i;
                        assert!(vc.blocks.lock().len() as u64 <= bound);
                    }
                }
                vc.finished_write();
            })
        };
        let reader = {
            let vc = vc.clone();
            thread::spawn(move || {
                let buf = vc.get_read_buf() as *const u64;
                unsafe {
                    for i in 0..words {
                        assert_eq!(*buf.add(i as usize), i);
                    }
                }
                vc.finished_read();
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
    }
}
