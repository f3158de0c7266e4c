//! Owns the growable stack of physical page frames and the page/block size
//! policy; reserves `BufferConfig` virtual arenas; maps/unmaps blocks of
//! frames at a given virtual address; installs/removes guard pages.
//! Grounded on `StreamPool.cpp`/`.h`.
//!
//! Linux has no userspace physical-frame API, so a "frame" here is a page
//! inside an anonymous backing region this pool owns (see
//! `platform::linux`); mapping a block moves those pages' backing out to
//! the target address via `mremap`, unmapping moves it back to the frame's
//! fixed "home" slot. Unlike the original's single growable PFN array
//! (which has to splice new pages into the middle of its byte range when
//! growing), each growth here allocates a new backing region and appends
//! its pages as new frames — home addresses never move, so no frame ever
//! needs to be relocated once it is allocated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::Result;
use crate::platform;

const MAX_COLORS: u64 = 1024;

/// One physical frame: a page-sized slot inside a pool-owned backing
/// region, identified by its permanent home address.
#[derive(Debug, Clone, Copy)]
pub struct PageFrame {
    home: *mut u8,
}

unsafe impl Send for PageFrame {}

/// One currently-mapped block: the virtual address it's mapped at, and
/// the frames backing it. Dropping the frames (returning them to the
/// pool) is the caller's responsibility — `BlockState` itself is just
/// data, matching spec.md §3 ("a BlockState exists iff its frames are
/// mapped; destroying it returns those frames to the pool").
#[derive(Debug, Clone)]
pub struct BlockState {
    pub vaddr: usize,
    pub frames: Vec<PageFrame>,
}

impl BlockState {
    pub fn num_pages(&self) -> usize {
        self.frames.len()
    }
}

/// A reserved virtual arena. `base` is the kernel-chosen reservation
/// start; `user_base` is `base` shifted by the page-coloring offset.
pub struct BufferConfig {
    pub base: usize,
    pub user_base: usize,
    pub reserve_size: usize,
    pub chunk_size: usize,
    chunk_refcounts: Mutex<HashMap<u64, i64>>,
    pub last_fault: AtomicUsize,
}

impl Drop for BufferConfig {
    fn drop(&mut self) {
        if let Err(e) = platform::release_virtual(self.base as *mut u8, self.reserve_size) {
            tracing::error!(error = %e, base = format_args!("{:#x}", self.base), "failed to release BufferConfig reservation");
        }
    }
}

struct StreamPoolInner {
    regions: Vec<(*mut u8, usize)>,
    free: Vec<PageFrame>,
    page_count: u64,
}

unsafe impl Send for StreamPoolInner {}

pub struct StreamPool {
    inner: Mutex<StreamPoolInner>,
    color_shift: Mutex<Option<u64>>,
    min_available: AtomicI64,
    pub page_size: usize,
    pub page_size_power: u32,
    pub block_size: usize,
    pub pages_per_block: u64,
    pub block_size_power: u32,
}

fn round_up(x: usize, multiple: usize) -> usize {
    debug_assert!(multiple > 0);
    x.div_ceil(multiple) * multiple
}

impl StreamPool {
    pub fn new(page_size_power: u32, block_size_power: u32) -> Result<Arc<Self>> {
        let page_size = platform::page_size();
        debug_assert_eq!(page_size, 1usize << page_size_power);
        let block_size = round_up(1usize << block_size_power, page_size);
        let pages_per_block = (block_size / page_size) as u64;

        info!(page_size, block_size, pages_per_block, "StreamPool created");

        Ok(Arc::new(Self {
            inner: Mutex::new(StreamPoolInner {
                regions: Vec::new(),
                free: Vec::new(),
                page_count: 0,
            }),
            color_shift: Mutex::new(None),
            min_available: AtomicI64::new(i64::MAX),
            page_size,
            page_size_power,
            block_size,
            pages_per_block,
            block_size_power,
        }))
    }

    fn grow(&self, inner: &mut StreamPoolInner, extra: u64) -> Result<()> {
        if extra == 0 {
            return Ok(());
        }
        let bytes = extra as usize * self.page_size;
        let region = platform::alloc_backing(bytes)?;
        for i in 0..extra {
            inner.free.push(PageFrame {
                home: unsafe { region.add(i as usize * self.page_size) },
            });
        }
        inner.regions.push((region, bytes));
        inner.page_count += extra;
        Ok(())
    }

    /// If `total_pages` exceeds the pool's current page count, allocate
    /// the difference from the OS and push the new frames onto the stack.
    pub fn adjust_pool_physical_memory(&self, total_pages: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if total_pages > inner.page_count {
            let extra = total_pages - inner.page_count;
            self.grow(&mut inner, extra)?;
        }
        Ok(())
    }

    /// Pop `num_pages` frames off the free stack, growing the pool first
    /// if necessary.
    pub fn get_new_block(&self, num_pages: u64) -> Result<Vec<PageFrame>> {
        let mut inner = self.inner.lock();
        if (inner.free.len() as u64) < num_pages {
            let deficit = num_pages - inner.free.len() as u64;
            warn!(deficit, "StreamPool growing frame stack mid-run");
            self.grow(&mut inner, deficit)?;
        }
        let split_at = inner.free.len() - num_pages as usize;
        let frames = inner.free.split_off(split_at);
        let avail = inner.free.len() as i64;
        drop(inner);
        self.min_available.fetch_min(avail, Ordering::SeqCst);
        Ok(frames)
    }

    /// Push frames back onto the free stack.
    pub fn return_free_block(&self, mut frames: Vec<PageFrame>) {
        let mut inner = self.inner.lock();
        inner.free.append(&mut frames);
    }

    fn touch_chunk(&self, bc: &BufferConfig, vaddr: usize, delta: i64) {
        if bc.chunk_size == 0 {
            return;
        }
        let idx = ((vaddr - bc.base) / bc.chunk_size) as u64;
        let mut refcounts = bc.chunk_refcounts.lock();
        *refcounts.entry(idx).or_insert(0) += delta;
    }

    /// Bind `frames` to `[vaddr, vaddr + frames.len()*pageSize)` inside
    /// `bc`. Chunk "make physical-mappable" conversion (spec.md §4.3) is a
    /// no-op on this backend (see DESIGN.md Open Question 3); the
    /// refcount bookkeeping is still maintained.
    pub fn map_block(&self, bc: &BufferConfig, vaddr: usize, frames: &[PageFrame]) -> Result<()> {
        self.touch_chunk(bc, vaddr, 1);
        for (i, frame) in frames.iter().enumerate() {
            let dst = (vaddr + i * self.page_size) as *mut u8;
            platform::remap_fixed(frame.home, dst, self.page_size)?;
        }
        Ok(())
    }

    /// Move `frames` back to their home slots, undoing `map_block`.
    pub fn unmap_block(&self, bc: &BufferConfig, vaddr: usize, frames: &[PageFrame]) -> Result<()> {
        for (i, frame) in frames.iter().enumerate() {
            let src = (vaddr + i * self.page_size) as *mut u8;
            platform::remap_fixed(src, frame.home, self.page_size)?;
        }
        self.touch_chunk(bc, vaddr, -1);
        Ok(())
    }

    /// Move a live, still-mapped block from one arena's virtual address to
    /// another's directly (no trip through the free stack) — used by
    /// `VortexC`'s read-fault handler to hand a block from the writer
    /// arena to the reader arena.
    pub fn remap_block(
        &self,
        src_bc: &BufferConfig,
        src_vaddr: usize,
        dst_bc: &BufferConfig,
        dst_vaddr: usize,
        num_pages: u64,
    ) -> Result<()> {
        let bytes = num_pages as usize * self.page_size;
        platform::remap_fixed(src_vaddr as *mut u8, dst_vaddr as *mut u8, bytes)?;
        self.touch_chunk(src_bc, src_vaddr, -1);
        self.touch_chunk(dst_bc, dst_vaddr, 1);
        Ok(())
    }

    pub fn install_guard(&self, vaddr: usize) -> Result<()> {
        platform::install_guard(vaddr as *mut u8)
    }

    pub fn remove_guard(&self, vaddr: usize) -> Result<()> {
        platform::remove_guard(vaddr as *mut u8)
    }

    /// Reserve a `BufferConfig` sized and colored per spec.md §4.3/§9.
    pub fn buffer_alloc(&self, memory_required: usize, chunk_size: usize, color: u64) -> Result<BufferConfig> {
        let aligned = round_up(memory_required + self.page_size, self.block_size);
        let reserve_size = round_up(
            aligned + self.page_size * MAX_COLORS as usize,
            chunk_size.max(self.page_size),
        );

        let buf_main = platform::reserve_virtual(reserve_size)? as usize;
        let kernel_color = ((buf_main >> self.page_size_power) as u64) & (MAX_COLORS - 1);

        let shift = {
            let mut guard = self.color_shift.lock();
            if color == 0 {
                *guard = Some(kernel_color);
            }
            guard.unwrap_or(0)
        };
        let color_offset = color.wrapping_add(shift).wrapping_sub(kernel_color) & (MAX_COLORS - 1);
        let user_base = buf_main + color_offset as usize * self.page_size;

        Ok(BufferConfig {
            base: buf_main,
            user_base,
            reserve_size,
            chunk_size: chunk_size.max(self.page_size),
            chunk_refcounts: Mutex::new(HashMap::new()),
            last_fault: AtomicUsize::new(user_base),
        })
    }

    /// The lowest free-frame count observed since the last reset — spec.md
    /// §8's `minAvailableBlocks`.
    pub fn min_available(&self) -> i64 {
        self.min_available.load(Ordering::SeqCst)
    }

    pub fn reset_min_available(&self) {
        self.min_available.store(i64::MAX, Ordering::SeqCst);
    }

    pub fn page_count(&self) -> u64 {
        self.inner.lock().page_count
    }

    pub fn free_count(&self) -> u64 {
        self.inner.lock().free.len() as u64
    }
}

impl Drop for StreamPool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for (ptr, len) in inner.regions.drain(..) {
            if let Err(e) = platform::free_backing(ptr, len) {
                tracing::error!(error = %e, "failed to release StreamPool backing region");
            }
        }
    }
}
