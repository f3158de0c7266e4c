//! Uniform interface over the handful of OS primitives Vortex needs:
//! virtual reserve/release, mapping physical frames into a virtual address,
//! no-access guard pages, and installing the process-wide fault handler.
//!
//! The original Vortex implementation abstracts this behind a `sys` class
//! with parallel Windows/Linux bodies (`SystemFunctions.h`/`.cpp`). This
//! crate targets Linux/x86_64 only, so the abstraction collapses to a
//! single `libc`-backed module; the split is kept as a module boundary
//! (`platform::linux`) rather than flattened into callers, in case a second
//! backend is ever added.

mod linux;

pub use linux::*;

/// Which kind of memory access triggered the fault, mirroring
/// `EXCEPTION_READ_FAULT`/`EXCEPTION_WRITE_FAULT` in the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
}

/// Signature the process-wide fault handler dispatches into. Returning
/// `true` means the fault was handled and execution should resume;
/// `false` means it wasn't ours and the process aborts (there is no other
/// registered handler to fall back to, unlike the original's
/// `EXCEPTION_CONTINUE_SEARCH`/chained-handler behavior on Windows).
pub type FaultCallback = fn(FaultKind, usize) -> bool;
