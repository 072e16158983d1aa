//! Guest → host scheduling hooks.
//!
//! ```text
//!   guest promise machinery ──► JobDispatcher ──► current thread's host loop
//!   guest helper thread     ──► CrossThreadDispatchBridge
//!                                  └─ dispatch thread (HostLock) ──► main loop
//! ```

mod cross_thread;
mod job_queue;

pub use cross_thread::{CrossThreadDispatchBridge, DispatchStats};
pub use job_queue::JobDispatcher;
