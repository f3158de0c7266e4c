//! The `Stream` abstraction: a polymorphic fault-handling object that owns
//! one or more `BufferConfig`s and implements block mapping/unmapping
//! policy on fault. Grounded on `Stream.h`, which declares the same shape
//! as a pure-virtual base with two concrete variants.

pub mod vortex_c;
pub mod vortex_s;

pub use crate::platform::FaultKind;
pub use vortex_c::{VortexC, VortexCConfig};
pub use vortex_s::VortexS;

/// A registered fault-handling object. `StreamManager` holds `Arc<dyn
/// Stream>` trait objects in its interval tree rather than an enum, since
/// the fault path genuinely wants dynamic dispatch over two
/// independently-evolving variants (spec.md §9: "a tagged-variant Stream
/// ... satisfies this without subclassing" — a trait object is the same
/// idea without hand-rolled tagging).
pub trait Stream: Send + Sync {
    /// Handle a fault at `addr` (already resolved to be within this
    /// stream's registered range). Returns `true` if handled.
    fn process_fault(&self, kind: FaultKind, addr: usize) -> bool;

    /// Unmap every live block and reset internal cursors, without
    /// unregistering from the `StreamManager`.
    fn reset(&self);
}
