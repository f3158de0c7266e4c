//! MSD radix partitioner over 64-bit keys. Grounded on `VortexSort.cpp`/`.h`:
//! a bit-width schedule carves the key space into levels; level 0 splits the
//! whole input into `2^bucketPower[0]` `VortexS` sinks via a write-combining
//! per-bucket scratch buffer (cache-line-sized, flushed with non-temporal
//! stores where the CPU supports them); every bucket below that recurses on
//! its own remaining key bits until it either fits the small-bucket leaf
//! (§ `leaf.rs`) or its residual bit budget hits zero, at which point every
//! key left in the bucket is identical and the bucket can be copied to the
//! output as-is.
//!
//! Deviation from the original: `VortexSort.cpp` reuses one flat array of
//! pointers into the level-0 `VortexS` arenas across every recursion level,
//! so no allocation happens below level 0. This port recurses over owned
//! `Vec<u64>` scratch past level 0 instead — simpler, and the spec's
//! invariants (sortedness, idempotence, no VortexS allocation under the
//! small-bucket threshold) don't depend on the memory-reuse trick, only on
//! the write-combine/non-temporal-store behavior of the level-0 split. See
//! DESIGN.md.

pub mod leaf;

use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::stream::{Stream, VortexS};
use crate::stream_pool::StreamPool;

/// Keys this small go straight to the small-bucket leaf with no VortexS
/// involvement at all (spec.md E5: "no VortexS allocations").
const SMALL_INPUT_THRESHOLD: usize = 128;
/// Per-bucket recursion threshold below which a bucket is finished by the
/// leaf instead of being split further.
const SMALL_BUCKET_THRESHOLD: usize = 32;
/// Cache line as 8-byte keys: 8 keys = 64 bytes.
const CACHE_LINE: usize = 8;
/// Widest single-level split, matching the original's `maxPower`.
const MAX_LEVEL_POWER: u32 = 8;

pub struct VortexSortConfig {
    pub block_size_power: u32,
    pub key_bits: u32,
    pub chunk_size: usize,
}

impl Default for VortexSortConfig {
    fn default() -> Self {
        Self {
            block_size_power: 21,
            key_bits: 64,
            chunk_size: 1 << 20,
        }
    }
}

/// Floor(log2(x)) for x > 0.
fn bit_scan(x: u64) -> u32 {
    debug_assert!(x > 0);
    63 - x.leading_zeros()
}

/// Bit-width schedule: one entry per recursion level, summing to at least
/// `key_bits`. Ported from `VortexSort`'s constructor.
fn compute_bucket_schedule(key_bits: u32, items_hint: u64) -> Vec<u32> {
    let items_hint = items_hint.max(1);
    let input_power_floor = bit_scan(items_hint);
    let rounded_size_down = 1u64 << input_power_floor;
    let mut input_power = input_power_floor;
    if items_hint as f64 > (4.0 / 3.0) * rounded_size_down as f64 {
        input_power += 1;
    }

    let small_keys = key_bits < input_power;
    let ideal_power_last_level: u32 = if small_keys { 0 } else { 3 };
    let split_power = if small_keys { key_bits } else { input_power };
    let remaining = split_power.saturating_sub(ideal_power_last_level).max(1);
    let depth = remaining.div_ceil(MAX_LEVEL_POWER).max(1);
    let base = remaining / depth;
    let leftover = remaining % depth;

    let mut schedule: Vec<u32> = (0..depth)
        .map(|i| if i < leftover { base + 1 } else { base })
        .collect();

    let mut bit_sum: u32 = schedule.iter().sum();
    while bit_sum <= key_bits {
        let extra = *schedule.last().unwrap();
        schedule.push(extra);
        bit_sum += extra;
    }
    schedule
}

struct Level0Split {
    /// Number of keys routed to each level-0 bucket.
    counts: Vec<usize>,
}

pub struct VortexSort {
    pool: Arc<StreamPool>,
    buckets0: Vec<Arc<VortexS>>,
    bucket_power: Vec<u32>,
    key_bits: u32,
}

impl VortexSort {
    /// `expected_items` is a sizing hint (the original constructor takes the
    /// same `size` parameter) used to choose the bit-width schedule and
    /// pre-size the backing pool; `sort` accepts any length, including ones
    /// that don't match the hint.
    pub fn new(expected_items: u64, cfg: VortexSortConfig) -> Result<Self> {
        let bucket_power = compute_bucket_schedule(cfg.key_bits, expected_items);
        let n_buckets0 = 1u64 << bucket_power[0];
        let n_buckets1 = bucket_power.get(1).map(|p| 1u64 << p).unwrap_or(32);
        let byte_size = expected_items.max(1) * 8;

        let pool = StreamPool::new(12, cfg.block_size_power)?;

        // Mirrors InitializeRAM's sizing model: enough physical pages to
        // hold one level-0 bucket's worth of data plus its own level-1
        // fanout, with slack for in-flight blocks.
        let buckets_l0 = n_buckets0.max(1) as f64;
        let buckets_l1 = n_buckets1.max(1) as f64;
        let bytes_per_bucket_l0 = byte_size as f64 / buckets_l0;
        let bytes_per_bucket_l1 = bytes_per_bucket_l0 / (buckets_l1 * 1.05);
        let pages_needed = (byte_size as f64 * (buckets_l1 / buckets_l0) + bytes_per_bucket_l1 * buckets_l0)
            / pool.page_size as f64
            + 4.0 * pool.pages_per_block as f64;
        pool.adjust_pool_physical_memory(pages_needed.ceil().max(pool.pages_per_block as f64) as u64)?;

        let bucket_reserved_memory = (bucket_power.len() as u64 * byte_size).max(pool.block_size as u64 * 2);
        let mut buckets0 = Vec::with_capacity(n_buckets0 as usize);
        for i in 0..n_buckets0 {
            buckets0.push(VortexS::new(pool.clone(), bucket_reserved_memory as usize, cfg.chunk_size, i)?);
        }

        info!(
            n_buckets0,
            key_bits = cfg.key_bits,
            schedule = ?bucket_power,
            "VortexSort created"
        );

        Ok(Self {
            pool,
            buckets0,
            bucket_power,
            key_bits: cfg.key_bits,
        })
    }

    /// Sorts `input` into `output` ascending. Panics if the slices differ in
    /// length (a caller error, not a runtime fault).
    pub fn sort(&self, input: &[u64], output: &mut [u64]) {
        assert_eq!(input.len(), output.len(), "input/output length mismatch");

        if input.len() <= SMALL_INPUT_THRESHOLD {
            let mut tmp = input.to_vec();
            leaf::finish_small_bucket(&mut tmp);
            output.copy_from_slice(&tmp);
            return;
        }

        let split = self.split_input(input);
        self.begin_recursion(&split, output);
        self.reset();
    }

    fn reset(&self) {
        for stream in &self.buckets0 {
            stream.reset();
        }
        self.pool.reset_min_available();
    }

    /// The `StreamPool` backing this sort's buckets — shared with the
    /// harness so the input buffer can itself be a `VortexS` drawing from
    /// the same pool, as in the original (`Benchmarks.cpp`'s `vs->sp`).
    pub fn pool(&self) -> &Arc<StreamPool> {
        &self.pool
    }

    /// Number of level-0 buckets (`2^bucketPower[0]`).
    pub fn bucket_count0(&self) -> u64 {
        self.buckets0.len() as u64
    }

    /// Level 0: route every key into its bucket's `VortexS` sink through a
    /// per-bucket cache-line scratch buffer, flushed with a non-temporal
    /// store once full (write-combine — spec.md §9).
    fn split_input(&self, input: &[u64]) -> Level0Split {
        let level_power = self.bucket_power[0];
        let shift = (self.key_bits - level_power) as i32;
        let n_buckets = 1usize << level_power;
        let mask = (n_buckets as u64) - 1;

        let mut scratch = vec![[0u64; CACHE_LINE]; n_buckets];
        let mut scratch_len = vec![0usize; n_buckets];
        let mut write_ptr: Vec<*mut u64> = self.buckets0.iter().map(|s| s.get_write_buf() as *mut u64).collect();
        let mut counts = vec![0usize; n_buckets];

        const PREFETCH_AHEAD: usize = 256; // ~2 KiB of 8-byte keys

        for (i, &key) in input.iter().enumerate() {
            if i + PREFETCH_AHEAD < input.len() {
                unsafe { prefetch(&input[i + PREFETCH_AHEAD] as *const u64) };
            }

            let bucket = ((key >> shift.max(0)) & mask) as usize;
            counts[bucket] += 1;

            let len = scratch_len[bucket];
            scratch[bucket][len] = key;
            scratch_len[bucket] = len + 1;

            if len + 1 == CACHE_LINE {
                unsafe {
                    stream_store_cache_line(&scratch[bucket], write_ptr[bucket]);
                    write_ptr[bucket] = write_ptr[bucket].add(CACHE_LINE);
                }
                scratch_len[bucket] = 0;
            }
        }

        // Flush whatever's left in scratch (scalar — doesn't fill a line).
        for bucket in 0..n_buckets {
            let len = scratch_len[bucket];
            if len > 0 {
                unsafe {
                    std::ptr::copy_nonoverlapping(scratch[bucket].as_ptr(), write_ptr[bucket], len);
                }
            }
        }

        Level0Split { counts }
    }

    /// Drains each level-0 bucket, recursively re-partitioning on the
    /// remaining key bits and writing finished runs into `output` in bucket
    /// order (ascending, since buckets were assigned by descending key bits
    /// at level 0).
    fn begin_recursion(&self, split: &Level0Split, output: &mut [u64]) {
        let shift = self.key_bits as i32 - self.bucket_power[0] as i32 - *self.bucket_power.get(1).unwrap_or(&0) as i32;
        let mut out_pos = 0usize;

        for (bucket, stream) in self.buckets0.iter().enumerate() {
            let total = split.counts[bucket];
            if total > 0 {
                let base = stream.get_read_buf() as *const u64;
                let items = unsafe { std::slice::from_raw_parts(base, total) }.to_vec();
                self.process_bucket(&items, shift, 1, output, &mut out_pos);
            }
        }
        debug_assert_eq!(out_pos, output.len());
    }

    /// Recursively re-partitions `items` on the key bits starting at
    /// `shift`, appending finished runs into `output[*out_pos..]`.
    fn process_bucket(&self, items: &[u64], shift: i32, level: usize, output: &mut [u64], out_pos: &mut usize) {
        if items.is_empty() {
            return;
        }

        if items.len() > SMALL_BUCKET_THRESHOLD && shift > 0 {
            let level_power = *self.bucket_power.get(level).unwrap_or(&MAX_LEVEL_POWER) as i32;
            let n = 1usize << level_power;
            let mask = (n as u64) - 1;
            let mut sub: Vec<Vec<u64>> = vec![Vec::new(); n];
            for &key in items {
                let b = ((key >> shift.max(0)) & mask) as usize;
                sub[b].push(key);
            }
            let next_level_power = *self.bucket_power.get(level + 1).unwrap_or(&MAX_LEVEL_POWER) as i32;
            let next_shift = shift - next_level_power;
            for bucket in sub {
                self.process_bucket(&bucket, next_shift, level + 1, output, out_pos);
            }
        } else {
            let mut tmp = items.to_vec();
            if shift > 0 {
                // Residual bits remain but the bucket is small enough that
                // finishing it with the leaf beats another split.
                leaf::finish_small_bucket(&mut tmp);
            }
            // shift <= 0: the schedule has already consumed every key bit
            // partitioning into this bucket, so every key left here is
            // identical — nothing to sort.
            output[*out_pos..*out_pos + tmp.len()].copy_from_slice(&tmp);
            *out_pos += tmp.len();
        }
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn prefetch(ptr: *const u64) {
    use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T2};
    _mm_prefetch(ptr as *const i8, _MM_HINT_T2);
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn prefetch(_ptr: *const u64) {}

/// Flush one cache line (8 keys) with a non-temporal store when the CPU
/// supports it, falling back to a plain copy otherwise.
#[cfg(target_arch = "x86_64")]
unsafe fn stream_store_cache_line(src: &[u64; CACHE_LINE], dst: *mut u64) {
    use std::arch::x86_64::*;

    if is_x86_feature_detected!("avx") {
        let lo = _mm256_loadu_si256(src.as_ptr() as *const __m256i);
        let hi = _mm256_loadu_si256(src.as_ptr().add(4) as *const __m256i);
        _mm256_stream_si256(dst as *mut __m256i, lo);
        _mm256_stream_si256(dst.add(4) as *mut __m256i, hi);
    } else if is_x86_feature_detected!("sse2") {
        for i in 0..2 {
            let v = _mm_loadu_si128(src.as_ptr().add(i * 2) as *const __m128i);
            _mm_stream_si128(dst.add(i * 2) as *mut __m128i, v);
        }
        for i in 2..4 {
            let v = _mm_loadu_si128(src.as_ptr().add(i * 2) as *const __m128i);
            _mm_stream_si128(dst.add(i * 2) as *mut __m128i, v);
        }
    } else {
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst, CACHE_LINE);
    }
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn stream_store_cache_line(src: &[u64; CACHE_LINE], dst: *mut u64) {
    std::ptr::copy_nonoverlapping(src.as_ptr(), dst, CACHE_LINE);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lcg_keys(n: usize, seed: u64) -> Vec<u64> {
        let mut x = seed;
        (0..n)
            .map(|_| {
                x = x
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                x
            })
            .collect()
    }

    #[test]
    fn schedule_covers_key_bits() {
        let schedule = compute_bucket_schedule(64, 1 << 20);
        let sum: u32 = schedule.iter().sum();
        assert!(sum >= 64);
        assert!(!schedule.is_empty());
    }

    #[test]
    fn tiny_input_uses_leaf_only() {
        let sort = VortexSort::new(64, VortexSortConfig::default()).unwrap();
        let input = lcg_keys(100, 7);
        let mut output = vec![0u64; 100];
        sort.sort(&input, &mut output);

        let mut expected = input.clone();
        expected.sort_unstable();
        assert_eq!(output, expected);
        assert_eq!(
            sort.pool.free_count(),
            sort.pool.page_count(),
            "no VortexS frames should have left the free stack"
        );
    }

    #[test]
    fn random_keys_sort_correctly() {
        let n = 1 << 14;
        let sort = VortexSort::new(n as u64, VortexSortConfig::default()).unwrap();
        let input = lcg_keys(n, 42);
        let mut output = vec![0u64; n];
        sort.sort(&input, &mut output);

        let mut expected = input.clone();
        expected.sort_unstable();
        assert_eq!(output, expected);
    }

    #[test]
    fn all_identical_keys_sort_correctly() {
        let n = 1 << 12;
        let sort = VortexSort::new(n as u64, VortexSortConfig::default()).unwrap();
        let input = vec![0xABCDu64; n];
        let mut output = vec![0u64; n];
        sort.sort(&input, &mut output);
        assert!(output.iter().all(|&k| k == 0xABCD));
    }

    #[test]
    fn repeated_sort_calls_reuse_the_sort_cleanly() {
        let n = 1 << 13;
        let sort = VortexSort::new(n as u64, VortexSortConfig::default()).unwrap();
        let input = lcg_keys(n, 99);
        let mut output = vec![0u64; n];

        sort.sort(&input, &mut output);
        let mut expected = input.clone();
        expected.sort_unstable();
        assert_eq!(output, expected);

        // Sorting again must produce the same result: every bucket's
        // VortexS must have been fully reset after the first pass.
        let mut output2 = vec![0u64; n];
        sort.sort(&input, &mut output2);
        assert_eq!(output2, expected);
    }
}
