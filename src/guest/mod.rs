//! The embedded guest runtime.
//!
//! A tracing collector over generation-tagged slots, pinned handles that act
//! as roots, and the two hooks through which guest continuations leave the
//! guest: the context's [`JobQueue`] and the runtime's
//! [`DispatchToEventLoop`].

mod handle;
mod heap;
mod runtime;

pub use handle::GuestValueHandle;
pub use heap::{
    CollectOutcome, GcCallback, GcCallbackId, GcStatus, GuestHeap, GuestValue, HeapStats, ValueId,
};
pub use runtime::{
    DispatchToEventLoop, Dispatchable, GuestContext, GuestRuntime, Job, JobQueue, ShutdownState,
};
