//! Process-wide fault dispatcher. Installs one SIGSEGV/SIGBUS handler
//! (`StreamManager.cpp`'s Linux `null_ref_handler`) and forwards every
//! fault that lands in a registered range to the owning `Stream`.
//!
//! Streams are not owned by the manager: they register themselves on
//! construction and unregister on `Drop`, per spec.md §9 ("model this as a
//! non-owning weak registration").

use std::sync::Arc;

use once_cell::sync::Lazy;
use tracing::{debug, error};

use crate::error::Result;
use crate::interval_tree::IntervalTree;
use crate::platform::{self, FaultKind};
use crate::stream::Stream;

pub struct StreamManager {
    tree: IntervalTree<Arc<dyn Stream>>,
}

// `install_fault_handler` is called exactly once, from `Lazy`'s
// initializer, which `once_cell` guarantees runs at most once even under
// concurrent first access — matching spec.md §9's "explicit init-on-first-use".
static MANAGER: Lazy<StreamManager> = Lazy::new(|| {
    platform::install_fault_handler(dispatch)
        .expect("failed to install process-wide fault handler");
    StreamManager {
        tree: IntervalTree::new(),
    }
});

/// The process-singleton `StreamManager`. Accessing this for the first
/// time installs the fault handler.
pub fn manager() -> &'static StreamManager {
    &MANAGER
}

impl StreamManager {
    pub fn register(&self, base: usize, len: usize, stream: Arc<dyn Stream>) -> Result<()> {
        self.tree.add(base, base + len, stream)
    }

    pub fn unregister(&self, base: usize) {
        self.tree.remove(base);
    }

    pub fn find(&self, addr: usize) -> Option<Arc<dyn Stream>> {
        self.tree.find(addr)
    }

    pub fn live_stream_count(&self) -> usize {
        self.tree.len()
    }
}

/// The actual signal-handler-invoked callback. Runs on the faulting
/// thread, inside the signal frame — the same non-async-signal-safe
/// tradeoff (mutex lock, heap lookups) the original C++ handler makes, not
/// a limitation introduced here.
fn dispatch(kind: FaultKind, addr: usize) -> bool {
    match manager().find(addr) {
        Some(stream) => {
            debug!(?kind, addr = format_args!("{addr:#x}"), "dispatching fault");
            stream.process_fault(kind, addr)
        }
        None => {
            error!(
                addr = format_args!("{addr:#x}"),
                "fault at unregistered address"
            );
            false
        }
    }
}

/// Report a contract violation encountered while servicing a fault:
/// log it and terminate the process. There is no way to return a
/// `VortexError` from inside the signal handler (spec.md §7).
pub fn fatal_in_fault_handler(context: &str) -> ! {
    error!(context, "contract violation in fault handler, aborting");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::FaultKind;

    struct Dummy;
    impl Stream for Dummy {
        fn process_fault(&self, _kind: FaultKind, _addr: usize) -> bool {
            true
        }
        fn reset(&self) {}
    }

    #[test]
    fn register_find_unregister() {
        let mgr = manager();
        let before = mgr.live_stream_count();
        mgr.register(0x7f0000000000, 0x1000, Arc::new(Dummy)).unwrap();
        assert!(mgr.find(0x7f0000000500).is_some());
        mgr.unregister(0x7f0000000000);
        assert_eq!(mgr.live_stream_count(), before);
    }

    #[test]
    fn disjointness_rejects_overlap() {
        let mgr = manager();
        mgr.register(0x7f1000000000, 0x2000, Arc::new(Dummy)).unwrap();
        let overlap = mgr.register(0x7f1000001000, 0x2000, Arc::new(Dummy));
        assert!(overlap.is_err());
        mgr.unregister(0x7f1000000000);
    }
}
