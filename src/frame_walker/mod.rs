//! Async-signal-safe traversal of the target runtime's internal frame
//! chain (§4.2).
//!
//! The runtime's frame layout changed shape across its own release
//! history; rather than hide that behind a trait object (a signal
//! handler must not go anywhere near a heap-allocated vtable), each
//! shape is its own module and exactly one is selected at build time
//! by a Cargo feature — a tagged-variant "frame view" in spirit, a
//! `#[cfg]` switch in practice.

pub mod common;
pub mod current;
pub mod legacy;
pub mod mid;

pub use common::{CodeObject, WalkResult};

#[cfg(feature = "frame-layout-legacy")]
pub use legacy::{Frame, ThreadState};
#[cfg(all(feature = "frame-layout-mid", not(feature = "frame-layout-legacy")))]
pub use mid::{Frame, ThreadState};
#[cfg(all(
    feature = "frame-layout-current",
    not(any(feature = "frame-layout-legacy", feature = "frame-layout-mid"))
))]
pub use current::{Frame, ThreadState};

/// Walks the active frame-layout variant, trusting that the runtime
/// lock is held (or the caller otherwise guarantees the chain is
/// stable).
///
/// # Safety
/// `tstate`, if non-null, must point at a live `ThreadState` for the
/// duration of this call.
pub unsafe fn walk(tstate: *const ThreadState, max_depth: usize) -> WalkResult {
    #[cfg(feature = "frame-layout-legacy")]
    {
        legacy::walk(tstate, max_depth)
    }
    #[cfg(all(feature = "frame-layout-mid", not(feature = "frame-layout-legacy")))]
    {
        mid::walk(tstate, max_depth)
    }
    #[cfg(all(
        feature = "frame-layout-current",
        not(any(feature = "frame-layout-legacy", feature = "frame-layout-mid"))
    ))]
    {
        current::walk(tstate, max_depth)
    }
}

/// Walks the active frame-layout variant without trusting the runtime
/// lock (§4.2 speculative capture). Returns `None` if any dereference
/// fails validation; the caller must drop the whole sample on `None`.
///
/// # Safety
/// `tstate`, if non-null, must point at readable memory for the
/// lifetime of this call; every dereference past that is additionally
/// gated on a plausibility and type-descriptor check.
pub unsafe fn walk_speculative(
    tstate: *const ThreadState,
    cached_type_desc: *const (),
    max_depth: usize,
) -> Option<WalkResult> {
    #[cfg(feature = "frame-layout-legacy")]
    {
        legacy::walk_speculative(tstate, cached_type_desc, max_depth)
    }
    #[cfg(all(feature = "frame-layout-mid", not(feature = "frame-layout-legacy")))]
    {
        mid::walk_speculative(tstate, cached_type_desc, max_depth)
    }
    #[cfg(all(
        feature = "frame-layout-current",
        not(any(feature = "frame-layout-legacy", feature = "frame-layout-mid"))
    ))]
    {
        current::walk_speculative(tstate, cached_type_desc, max_depth)
    }
}
