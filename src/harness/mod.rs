//! Collaborators spec.md §1 explicitly keeps out of the core — the
//! producer/consumer demo threads, the four-stream LCG key generator, the
//! speed/ETA reporter, and the post-sort correctness checker — given
//! minimal, faithful realizations here so the CLI in `src/bin/vortex_bench.rs`
//! has something to drive. Grounded on `Benchmarks.cpp`.

pub mod file_io;

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::info;

use crate::error::Result;
use crate::sort::{VortexSort, VortexSortConfig};
use crate::stream::{Stream, VortexC, VortexCConfig, VortexS};

const LCG_A: u64 = 6364136223846793005;
const LCG_C: u64 = 1442695040888963407;

/// Four parallel additive-LCG streams, matching `WriterLCG` in
/// `Benchmarks.cpp`. Each generated value is truncated to its bottom
/// `key_bits` bits by right-shifting away the high `64 - key_bits` bits,
/// exactly as the original truncates to `sizeof(ItemType) * 8`.
pub struct Lcg {
    x: u64,
    y: u64,
    z: u64,
    w: u64,
    shift: u32,
}

impl Lcg {
    pub fn new(seed: (u64, u64, u64, u64), key_bits: u32) -> Self {
        Self {
            x: seed.0,
            y: seed.1,
            z: seed.2,
            w: seed.3,
            shift: 64 - key_bits,
        }
    }

    /// Fills `out` four values at a time, falling back to one at a time for
    /// the final `out.len() % 4` entries.
    pub fn fill(&mut self, out: &mut [u64]) {
        let mut i = 0;
        while i + 4 <= out.len() {
            self.x = self.x.wrapping_mul(LCG_A).wrapping_add(LCG_C);
            self.y = self.y.wrapping_mul(LCG_A).wrapping_add(LCG_C);
            self.z = self.z.wrapping_mul(LCG_A).wrapping_add(LCG_C);
            self.w = self.w.wrapping_mul(LCG_A).wrapping_add(LCG_C);
            out[i] = self.x >> self.shift;
            out[i + 1] = self.y >> self.shift;
            out[i + 2] = self.z >> self.shift;
            out[i + 3] = self.w >> self.shift;
            i += 4;
        }
        while i < out.len() {
            self.x = self.x.wrapping_mul(LCG_A).wrapping_add(LCG_C);
            out[i] = self.x >> self.shift;
            i += 1;
        }
    }
}

pub fn writer_constant(buf: &mut [u64], value: u64) {
    buf.fill(value);
}

pub fn reader_sum(buf: &[u64]) -> u64 {
    buf.iter().fold(0u64, |acc, &v| acc.wrapping_add(v))
}

pub fn reader_xor_sum(buf: &[u64]) -> u64 {
    buf.iter().fold(0u64, |acc, &v| acc ^ v)
}

/// Post-sort correctness check (`ConsumerChecker` in `Benchmarks.cpp`):
/// counts adjacent out-of-order pairs and prints the result line spec.md
/// §6 names as normative ("the sort post-check line reports `unsorted
/// keys` count").
pub fn consumer_checker(items: &[u64]) -> usize {
    let unsorted = items.windows(2).filter(|w| w[0] > w[1]).count();
    println!(
        "\tSorted Result: unsorted keys = {}, processed keys = {}",
        unsorted,
        items.len()
    );
    unsorted
}

/// Minimal realization of `SpeedReporter`'s `Start`/`Report`/`FinalReport`
/// contract (`SpeedReporter.h`): tracks a running MB/s figure from a single
/// start time.
pub struct SpeedReporter {
    started: Instant,
    total: u64,
}

impl SpeedReporter {
    pub fn start(total: u64) -> Self {
        Self {
            started: Instant::now(),
            total,
        }
    }

    pub fn report(&self, offset: u64) {
        let elapsed = self.started.elapsed().as_secs_f64().max(1e-9);
        let mb_per_sec = (offset as f64 / (1024.0 * 1024.0)) / elapsed;
        info!(offset, total = self.total, mb_per_sec, "progress");
        println!("\t{mb_per_sec:.1} MB/s ({offset}/{} bytes)", self.total);
    }

    pub fn final_report(&self) {
        self.report(self.total);
    }
}

/// `p GB`: a producer thread fills the whole stream with the constant 32
/// (as little-endian 64-bit words); a consumer thread sums it. Mirrors
/// `Benchmarks.cpp::Run`'s `type == 0` branch and spec.md's E1 scenario.
pub fn run_producer_consumer(gb: u64) -> Result<()> {
    println!("Running producer (constant) -> consumer (summation)");
    let memory = (1u64 << 30) * gb;
    let vc = VortexC::new(VortexCConfig {
        size: memory,
        block_size_power: 21,
        come_back_consumer: 0,
        come_back_producer: 0,
        write_ahead: 2,
    })?;
    let words = (memory / 8) as usize;
    let reporter = SpeedReporter::start(memory);

    let writer = {
        let vc = vc.clone();
        thread::spawn(move || {
            let buf = unsafe { std::slice::from_raw_parts_mut(vc.get_write_buf() as *mut u64, words) };
            writer_constant(buf, 32);
            vc.finished_write();
        })
    };
    let reader = {
        let vc: Arc<VortexC> = vc.clone();
        thread::spawn(move || {
            let buf = unsafe { std::slice::from_raw_parts(vc.get_read_buf() as *const u64, words) };
            let sum = reader_sum(buf);
            vc.finished_read();
            sum
        })
    };

    writer.join().expect("producer thread panicked");
    let sum = reader.join().expect("consumer thread panicked");
    reporter.final_report();
    println!("\tconsumer sum = {sum}");
    vc.reset();
    Ok(())
}

/// `s GB ITERS`: repeatedly generates `GB` worth of uniform random 64-bit
/// keys via the four-stream LCG, seeded exactly as spec.md's E3 scenario
/// (`(1e4, 1e12, 1e18, 3)`), sorts them with `VortexSort`, and prints the
/// per-iteration timing/speed line plus the post-sort correctness check.
/// Mirrors `Benchmarks.cpp::Run`'s `type == 4` branch.
pub fn run_sort_benchmark(gb: u64, iterations: u64) -> Result<()> {
    println!("Running uniform {gb} GB random sort");
    let items_per_sort = (gb * (1u64 << 30)) / 8;
    let block_size_power = 20;

    let sort = VortexSort::new(
        items_per_sort,
        VortexSortConfig {
            block_size_power,
            key_bits: 64,
            chunk_size: 1 << 20,
        },
    )?;

    // The input buffer is itself a VortexS sharing the sort's pool, as in
    // the original (`inputS = new VortexS(memory, memory, vs->sp, ...)`) —
    // this exercises the same guard-page-driven block turnover while the
    // LCG fills it, rather than allocating it as plain heap memory.
    let input_stream = VortexS::new(sort.pool().clone(), items_per_sort as usize * 8, items_per_sort as usize * 8, sort.bucket_count0())?;
    let input = unsafe { std::slice::from_raw_parts_mut(input_stream.get_write_buf() as *mut u64, items_per_sort as usize) };
    let mut output = vec![0u64; items_per_sort as usize];

    let mut lcg = Lcg::new((1_0000u64, 1_000_000_000_000u64, 1_000_000_000_000_000_000u64, 3), 64);

    for _ in 0..iterations {
        lcg.fill(input);

        let start = Instant::now();
        sort.sort(input, &mut output);
        let elapsed = start.elapsed().as_secs_f64().max(1e-9);

        let speed = items_per_sort as f64 / elapsed / 1e6;
        let mem_used = (sort.pool().page_count() * sort.pool().page_size as u64) as f64;
        let mem_ideal = (items_per_sort * 8) as f64;
        println!(
            "\ttime {elapsed:.3} sec, speed {speed:.2} M/s, overhead {:.2}%, blocks {}",
            (mem_used / mem_ideal - 1.0) * 100.0,
            sort.pool().page_count() / sort.pool().pages_per_block.max(1),
        );

        consumer_checker(&output);
        input_stream.reset();
    }

    Ok(())
}
