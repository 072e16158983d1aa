pub mod config;
pub mod dispatch;
pub mod error;
pub mod gc;
pub mod guest;
pub mod host;
pub mod lifecycle;
pub mod platform;

// Core API
pub use config::BridgeConfig;
pub use error::{BridgeError, GuestError};
pub use lifecycle::Bridge;

// Re-export the types collaborators touch most
pub use dispatch::{CrossThreadDispatchBridge, DispatchStats, JobDispatcher};
pub use gc::{GcCycleCoordinator, GcReport, RefTracker, RefTrackingTable};
pub use guest::{
    CollectOutcome, GuestContext, GuestHeap, GuestRuntime, GuestValue, GuestValueHandle,
    ShutdownState, ValueId,
};
pub use host::{EventLoop, EventLoopHandle, HostCell, HostHandle, HostLock, HostObject};
