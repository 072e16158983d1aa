//! Bridge initialization and teardown.
//!
//! [`Bridge`] wires the pieces together on one guest context:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Bridge::initialize                                         │
//! │  ├── GuestRuntime (heap, helper pool)                       │
//! │  ├── GuestContext (pinned global object)                    │
//! │  ├── JobDispatcher            → context job queue           │
//! │  ├── CrossThreadDispatchBridge → runtime dispatch hook      │
//! │  └── GcCycleCoordinator       → collection callback         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Bridge::shutdown (once)                                    │
//! │  1. destroy context: hooks off, reference table torn down   │
//! │  2. shut down guest runtime                                 │
//! │  3. release the global object                               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::BridgeConfig;
use crate::dispatch::{CrossThreadDispatchBridge, DispatchStats, JobDispatcher};
use crate::error::BridgeError;
use crate::gc::{GcCycleCoordinator, GcReport, RefTracker};
use crate::guest::{CollectOutcome, GuestContext, GuestHeap, GuestRuntime, GuestValueHandle, ValueId};
use crate::host::{EventLoopHandle, HostHandle};

/// Owns one guest context and the hooks connecting it to the host.
///
/// # Example
///
/// ```ignore
/// let bridge = Bridge::initialize(BridgeConfig::default())?;
/// let event_loop = EventLoop::new()?;
/// bridge.designate_main_loop(&event_loop.handle());
///
/// let value = bridge.heap().alloc(GuestValue::object())?;
/// let handle = bridge.register_value(HostHandle::new(host.clone()), value)?;
///
/// drop(host);
/// bridge.force_collection();
/// bridge.shutdown();
/// ```
pub struct Bridge {
    runtime: Arc<GuestRuntime>,
    context: GuestContext,
    tracker: Arc<RefTracker>,
    coordinator: Arc<GcCycleCoordinator>,
    dispatcher: Arc<JobDispatcher>,
    dispatch_bridge: CrossThreadDispatchBridge,
    shutting_down: Arc<AtomicBool>,
}

impl Bridge {
    /// Create a guest runtime and context and install every hook.
    pub fn initialize(config: BridgeConfig) -> Result<Self, BridgeError> {
        let runtime = GuestRuntime::new(&config);
        Self::attach(runtime, &config)
    }

    /// Install the hooks on a fresh context of an existing runtime.
    ///
    /// A runtime takes one dispatch hook: attaching a second bridge fails
    /// with [`BridgeError::AlreadyInitialized`].
    pub fn attach(runtime: Arc<GuestRuntime>, config: &BridgeConfig) -> Result<Self, BridgeError> {
        if runtime.is_shut_down() {
            return Err(BridgeError::ShutDown);
        }

        let context = GuestContext::new(Arc::clone(&runtime))?;
        let shutting_down = Arc::new(AtomicBool::new(false));

        let tracker = Arc::new(RefTracker::new(
            runtime.heap().clone(),
            config.fan_out_warning,
        ));
        let coordinator = GcCycleCoordinator::new(Arc::clone(&tracker));
        let dispatcher = Arc::new(JobDispatcher::new(Arc::clone(&shutting_down)));
        let dispatch_bridge = CrossThreadDispatchBridge::new(
            config.dispatch_thread_name.clone(),
            Arc::clone(&shutting_down),
        );

        if let Err(err) = runtime.init_dispatch_to_event_loop(Arc::new(dispatch_bridge.clone())) {
            context.destroy();
            return Err(err);
        }

        if let Err(err) = context.set_job_queue(dispatcher.clone()) {
            runtime.clear_dispatch_hook();
            context.destroy();
            return Err(err);
        }

        coordinator.install(&context);

        tracing::info!(
            "Bridge initialized (gc_threshold: {}, dispatch thread: {})",
            config.gc_threshold,
            config.dispatch_thread_name
        );

        Ok(Self {
            runtime,
            context,
            tracker,
            coordinator,
            dispatcher,
            dispatch_bridge,
            shutting_down,
        })
    }

    pub fn runtime(&self) -> &Arc<GuestRuntime> {
        &self.runtime
    }

    pub fn context(&self) -> &GuestContext {
        &self.context
    }

    pub fn heap(&self) -> &GuestHeap {
        self.runtime.heap()
    }

    pub fn tracker(&self) -> &Arc<RefTracker> {
        &self.tracker
    }

    /// Record that `host` wraps or closes over `guest`.
    pub fn register_cross_runtime_reference(
        &self,
        host: HostHandle,
        guest: &GuestValueHandle,
    ) -> Result<(), BridgeError> {
        if self.is_shutting_down() {
            return Err(BridgeError::ShutDown);
        }

        self.tracker.register(host, guest.clone())
    }

    /// Pin `value` on behalf of `host`; see [`RefTracker::register_value`].
    pub fn register_value(
        &self,
        host: HostHandle,
        value: ValueId,
    ) -> Result<GuestValueHandle, BridgeError> {
        if self.is_shutting_down() {
            return Err(BridgeError::ShutDown);
        }

        self.tracker.register_value(host, value)
    }

    /// Run a guest collection cycle now, on the calling thread.
    pub fn force_collection(&self) -> CollectOutcome {
        self.runtime.heap().collect()
    }

    pub fn last_gc_report(&self) -> Option<GcReport> {
        self.coordinator.last_report()
    }

    /// Target of helper-thread continuations.
    pub fn designate_main_loop(&self, event_loop: &EventLoopHandle) {
        self.dispatch_bridge.designate_main_loop(event_loop);
    }

    pub fn clear_main_loop(&self) {
        self.dispatch_bridge.clear_main_loop();
    }

    /// The loop helper-thread continuations are delivered to.
    pub fn main_loop(&self) -> Result<EventLoopHandle, BridgeError> {
        self.dispatch_bridge
            .main_loop()
            .ok_or(BridgeError::NoMainLoop)
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatch_bridge.stats()
    }

    /// Guest jobs pending on the current thread's loop.
    pub fn pending_jobs(&self) -> usize {
        self.dispatcher.pending_jobs()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Tear down the context, then the runtime, then the global object.
    ///
    /// Safe to call more than once; only the first call has any effect.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::info!("Shutting down bridge");

        self.context.destroy();
        let released = self.tracker.teardown();

        self.runtime.shutdown();

        self.context.global_handle().release();
        self.dispatch_bridge.clear_main_loop();

        tracing::debug!("Bridge shut down ({} pins released)", released);
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("tracker", &self.tracker)
            .field("dispatch", &self.dispatch_bridge)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::GuestValue;
    use crate::host::HostCell;

    fn config() -> BridgeConfig {
        BridgeConfig::default().with_gc_threshold(0)
    }

    #[test]
    fn test_initialize_installs_hooks() {
        let bridge = Bridge::initialize(config()).unwrap();

        assert!(bridge.context().has_job_queue());
        assert!(!bridge.is_shutting_down());
        assert!(bridge.heap().is_alive(bridge.context().global()));
    }

    #[test]
    fn test_second_attach_fails() {
        let bridge = Bridge::initialize(config()).unwrap();
        let runtime = Arc::clone(bridge.runtime());

        let second = Bridge::attach(runtime, &config());
        assert!(matches!(second, Err(BridgeError::AlreadyInitialized)));

        // First bridge unaffected
        assert!(bridge.context().has_job_queue());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let bridge = Bridge::initialize(config()).unwrap();
        let value = bridge.heap().alloc(GuestValue::Undefined).unwrap();
        let handle = bridge
            .register_value(HostHandle::new(HostCell::new(())), value)
            .unwrap();

        bridge.shutdown();
        bridge.shutdown();

        assert!(bridge.is_shutting_down());
        assert!(handle.is_released());
        assert!(bridge.context().is_destroyed());
        assert!(bridge.runtime().is_shut_down());
        assert!(bridge.context().global_handle().is_released());
        assert!(bridge.tracker().is_empty());
    }

    #[test]
    fn test_register_after_shutdown_fails() {
        let bridge = Bridge::initialize(config()).unwrap();
        let handle = bridge.heap().alloc_pinned(GuestValue::Undefined).unwrap();

        bridge.shutdown();

        let result =
            bridge.register_cross_runtime_reference(HostHandle::new(HostCell::new(())), &handle);
        assert!(matches!(result, Err(BridgeError::ShutDown)));
        assert_eq!(bridge.force_collection(), CollectOutcome::ShutDown);
    }

    #[test]
    fn test_main_loop_designation() {
        let bridge = Bridge::initialize(config()).unwrap();
        assert!(matches!(bridge.main_loop(), Err(BridgeError::NoMainLoop)));

        let event_loop = crate::host::EventLoop::new().unwrap();
        bridge.designate_main_loop(&event_loop.handle());
        assert_eq!(bridge.main_loop().unwrap().id(), event_loop.handle().id());

        bridge.shutdown();
        assert!(matches!(bridge.main_loop(), Err(BridgeError::NoMainLoop)));
    }

    #[test]
    fn test_attach_to_shut_down_runtime_fails() {
        let runtime = GuestRuntime::new(&config());
        runtime.shutdown();

        assert!(matches!(
            Bridge::attach(runtime, &config()),
            Err(BridgeError::ShutDown)
        ));
    }
}
