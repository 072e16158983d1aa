//! The host runtime as seen by the bridge.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  HostHandle                                                 │
//! │  ├── Arc<dyn HostObject> (host refcount = strong count)     │
//! │  └── read-only: refcount(), is_finalized()                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  HostLock (RAII)                                            │
//! │  ├── Global reentrant execution lock                        │
//! │  └── Held while any host task runs                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  EventLoop / EventLoopHandle                                │
//! │  ├── FIFO task queue, single-threaded execution             │
//! │  ├── Running loop resolved per thread                       │
//! │  └── Guest job accounting + save/restore                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod event_loop;
mod lock;
mod object;

pub use event_loop::{EnterGuard, EventLoop, EventLoopHandle, JobOrigin, LoopTask, SavedJobQueue};
pub use lock::HostLock;
pub use object::{HostCell, HostHandle, HostId, HostObject};
