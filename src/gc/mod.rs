//! Cross-runtime reference tracking and collection coordination.
//!
//! Host objects that hold guest values register them here. The guest
//! collector then asks, once per cycle, which of those host objects are
//! gone and unpins the guest values only they were holding.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  RefTracker                                                 │
//! │  ├── Mutex<RefTrackingTable>                                │
//! │  ├── register / register_value (additive)                   │
//! │  └── teardown: release every pin once                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  GcCycleCoordinator (GcStatus::Begin callback)              │
//! │  ├── collectible: finalized or refcount == 1                │
//! │  ├── surviving set: handles listed by kept entries          │
//! │  └── release the rest, record GcReport                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use crossgc::gc::{GcCycleCoordinator, RefTracker};
//!
//! let tracker = Arc::new(RefTracker::new(cx.heap().clone(), 0));
//! let coordinator = GcCycleCoordinator::new(tracker.clone());
//! coordinator.install(&cx);
//!
//! let handle = tracker.register_value(host.clone(), value)?;
//! ```

mod coordinator;
mod ref_table;

pub use coordinator::{GcCycleCoordinator, GcReport};
pub use ref_table::{RefTracker, RefTrackingTable};
