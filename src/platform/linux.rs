//! Linux/x86_64 backend: raw `mmap`/`mremap`/`mprotect`/`sigaction` calls.
//!
//! There is no userspace "physical frame" API on Linux, so a "physical
//! frame" here is a page inside an anonymous backing mapping owned by a
//! [`crate::stream_pool::StreamPool`]; "mapping a frame" is really
//! `mremap(MREMAP_MAYMOVE | MREMAP_FIXED)`-ing that page's backing out to a
//! target virtual address, and "unmapping" is the reverse remap back to the
//! frame's home slot. This mirrors `SystemFunctions.cpp`'s Linux branch
//! (`MapPages`/`UnmapPages`/`AllocatePages`).

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Result, VortexError};

use super::{FaultCallback, FaultKind};

pub fn page_size() -> usize {
    static CACHED: AtomicUsize = AtomicUsize::new(0);
    let cached = CACHED.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    CACHED.store(sz, Ordering::Relaxed);
    sz
}

/// Reserve `size` bytes of address space with no backing and no access
/// (`PROT_NONE`), the way `AllocateVirtual` does on Linux: touching it
/// before a block is mapped in is a bug, and should fault.
pub fn reserve_virtual(size: usize) -> Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(VortexError::VirtualReserve(last_errno_msg()));
    }
    Ok(ptr as *mut u8)
}

pub fn release_virtual(addr: *mut u8, size: usize) -> Result<()> {
    let rc = unsafe { libc::munmap(addr as *mut c_void, size) };
    if rc != 0 {
        return Err(VortexError::UnmapFailed {
            addr: addr as usize,
            reason: last_errno_msg(),
        });
    }
    Ok(())
}

/// Allocate a fresh backing region of physically-present, zero-filled
/// pages — a new slab of "physical frames" for a [`crate::stream_pool`]'s
/// free stack to draw `PageFrame` home slots from.
pub fn alloc_backing(size: usize) -> Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(VortexError::PhysicalAlloc(last_errno_msg()));
    }
    Ok(ptr as *mut u8)
}

pub fn free_backing(addr: *mut u8, size: usize) -> Result<()> {
    let rc = unsafe { libc::munmap(addr as *mut c_void, size) };
    if rc != 0 {
        return Err(VortexError::UnmapFailed {
            addr: addr as usize,
            reason: last_errno_msg(),
        });
    }
    Ok(())
}

/// Move the backing of a `size`-byte, page-aligned range from `src` to
/// `dst`, unmapping whatever was previously at `dst`. This is the single
/// primitive both "map a frame into an arena" and "return a frame to its
/// home slot" are built from, matching `sys::MapPages`/`sys::UnmapPages`
/// collapsing to the one `mremap` call on Linux.
pub fn remap_fixed(src: *mut u8, dst: *mut u8, size: usize) -> Result<()> {
    let rc = unsafe {
        libc::mremap(
            src as *mut c_void,
            size,
            size,
            libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED,
            dst as *mut c_void,
        )
    };
    if rc == libc::MAP_FAILED {
        return Err(VortexError::MapFailed {
            addr: dst as usize,
            reason: last_errno_msg(),
        });
    }
    Ok(())
}

/// Grow an existing backing mapping in place (or to a new address, if the
/// kernel must move it), returning the possibly-new base. Used when a
/// `StreamPool`'s frame stack needs more physical pages than its current
/// backing region holds.
pub fn grow_backing(addr: *mut u8, old_size: usize, new_size: usize) -> Result<*mut u8> {
    let rc = unsafe {
        libc::mremap(
            addr as *mut c_void,
            old_size,
            new_size,
            libc::MREMAP_MAYMOVE,
        )
    };
    if rc == libc::MAP_FAILED {
        return Err(VortexError::PhysicalAlloc(last_errno_msg()));
    }
    Ok(rc as *mut u8)
}

/// Install a no-access tripwire on exactly one page at `addr`.
pub fn install_guard(addr: *mut u8) -> Result<()> {
    let rc = unsafe { libc::mprotect(addr as *mut c_void, page_size(), libc::PROT_NONE) };
    if rc != 0 {
        return Err(VortexError::GuardFailed {
            addr: addr as usize,
            reason: last_errno_msg(),
        });
    }
    Ok(())
}

pub fn remove_guard(addr: *mut u8) -> Result<()> {
    let rc = unsafe {
        libc::mprotect(
            addr as *mut c_void,
            page_size(),
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    if rc != 0 {
        return Err(VortexError::GuardFailed {
            addr: addr as usize,
            reason: last_errno_msg(),
        });
    }
    Ok(())
}

fn last_errno_msg() -> String {
    std::io::Error::last_os_error().to_string()
}

// --- Fault handler installation -------------------------------------------
//
// `sigaction` with `SA_SIGINFO` so the handler receives a `siginfo_t`
// (faulting address) and a `ucontext_t` (the saved register file, whose
// `uc_mcontext.gregs[REG_ERR]` low bit tells read from write — see
// `StreamManager.cpp`'s `null_ref_handler`). The dispatch callback is a
// plain `fn` pointer: the handler body must stay async-signal-safety-aware,
// and a `fn` pointer avoids closure capture doing anything surprising.

static DISPATCH: AtomicUsize = AtomicUsize::new(0);

/// Install the process-wide SIGSEGV/SIGBUS handler. `callback` is invoked
/// with the fault kind and address; returning `true` means handled and
/// execution resumes, `false` means abort. Only one handler may be
/// installed per process (matches the single process-wide `StreamManager`).
pub fn install_fault_handler(callback: FaultCallback) -> Result<()> {
    DISPATCH.store(callback as usize, Ordering::SeqCst);

    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = trampoline as usize;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);

        if libc::sigaction(libc::SIGSEGV, &sa, ptr::null_mut()) != 0 {
            return Err(VortexError::HandlerInstall(last_errno_msg()));
        }
        if libc::sigaction(libc::SIGBUS, &sa, ptr::null_mut()) != 0 {
            return Err(VortexError::HandlerInstall(last_errno_msg()));
        }
    }
    Ok(())
}

#[cfg(target_arch = "x86_64")]
extern "C" fn trampoline(sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut c_void) {
    let dispatch = DISPATCH.load(Ordering::SeqCst);
    if dispatch == 0 {
        unsafe { libc::abort() };
    }
    // SAFETY: `dispatch` was stored from a `FaultCallback` in `install_fault_handler`.
    let callback: FaultCallback = unsafe { std::mem::transmute(dispatch) };

    let fault_addr = unsafe { (*info).si_addr() } as usize;

    let kind = unsafe {
        let ucontext = ctx as *mut libc::ucontext_t;
        let err = (*ucontext).uc_mcontext.gregs[libc::REG_ERR as usize];
        if err & 0x2 != 0 {
            FaultKind::Write
        } else {
            FaultKind::Read
        }
    };

    if callback(kind, fault_addr) {
        return;
    }

    // Not ours, or the stream refused it: there is no chained handler to
    // fall back to, so this is fatal. Restore the default disposition and
    // re-raise so the process dies with the expected signal/core dump
    // rather than looping on the same fault.
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

#[cfg(not(target_arch = "x86_64"))]
extern "C" fn trampoline(sig: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut c_void) {
    let dispatch = DISPATCH.load(Ordering::SeqCst);
    if dispatch == 0 {
        unsafe { libc::abort() };
    }
    let callback: FaultCallback = unsafe { std::mem::transmute(dispatch) };
    let fault_addr = unsafe { (*info).si_addr() } as usize;
    // No portable read/write bit outside x86_64's gregs[REG_ERR]; treat
    // every fault as a write, the conservative choice (a write fault path
    // always maps frames, so a mis-classified read costs a spurious map
    // rather than silently under-mapping).
    if callback(FaultKind::Write, fault_addr) {
        return;
    }
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

pub fn set_affinity(cpu: usize) -> Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        );
        if rc != 0 {
            return Err(VortexError::InvalidConfig(format!(
                "failed to set CPU affinity to {cpu}: errno {rc}"
            )));
        }
    }
    Ok(())
}
