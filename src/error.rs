//! Error types for construction-time and configuration failures.
//!
//! Failures that occur *inside* the fault handler are not represented here —
//! per the contract-violation policy, those are logged and the process
//! aborts, since there is no meaningful way to return an error from a memory
//! access (see `stream_manager::handle_fault`).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VortexError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to reserve virtual memory: {0}")]
    VirtualReserve(String),

    #[error("failed to allocate physical pages: {0}")]
    PhysicalAlloc(String),

    #[error("failed to map physical frames at {addr:#x}: {reason}")]
    MapFailed { addr: usize, reason: String },

    #[error("failed to unmap region at {addr:#x}: {reason}")]
    UnmapFailed { addr: usize, reason: String },

    #[error("failed to install/remove guard page at {addr:#x}: {reason}")]
    GuardFailed { addr: usize, reason: String },

    #[error("stream registration overlaps an existing range: {0}")]
    OverlappingRegistration(String),

    #[error("failed to install fault handler: {0}")]
    HandlerInstall(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VortexError>;
