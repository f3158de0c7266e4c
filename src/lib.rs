//! Vortex: a page-fault-driven user-space streaming memory abstraction.
//! See `SPEC_FULL.md` and `DESIGN.md` for the full design and grounding
//! ledger; module-level docs on each item below summarize its
//! responsibility.

pub mod error;
pub mod harness;
pub mod interval_tree;
pub mod platform;
pub mod sort;
pub mod stream;
pub mod stream_manager;
pub mod stream_pool;
pub mod sync;

pub use error::{Result, VortexError};
pub use sort::{VortexSort, VortexSortConfig};
pub use stream::{Stream, VortexC, VortexCConfig, VortexS};
pub use stream_manager::manager;
pub use stream_pool::StreamPool;
