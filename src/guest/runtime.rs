//! Guest runtime and execution context.
//!
//! The runtime owns the heap and the dispatch-to-event-loop hook used by
//! helper threads. The context owns the global object and the job queue
//! hook that promise machinery feeds continuations into. Both hooks are
//! traits so the embedding decides where continuations run.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use super::handle::GuestValueHandle;
use super::heap::{GcCallback, GcCallbackId, GuestHeap, GuestValue, ValueId};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, GuestError};
use crate::host::SavedJobQueue;
use crate::platform;

/// Whether a continuation runs during normal operation or during teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    NotShuttingDown,
    ShuttingDown,
}

impl ShutdownState {
    pub fn from_flag(shutting_down: bool) -> Self {
        if shutting_down {
            ShutdownState::ShuttingDown
        } else {
            ShutdownState::NotShuttingDown
        }
    }

    pub fn is_shutting_down(self) -> bool {
        self == ShutdownState::ShuttingDown
    }
}

/// A promise continuation created by guest code.
pub type Job = Box<dyn FnOnce(ShutdownState) -> Result<(), GuestError> + Send + 'static>;

/// Work finished on a helper thread that must continue on the main loop.
pub trait Dispatchable: Send + 'static {
    fn run(self: Box<Self>, state: ShutdownState);
}

impl<F> Dispatchable for F
where
    F: FnOnce(ShutdownState) + Send + 'static,
{
    fn run(self: Box<Self>, state: ShutdownState) {
        (*self)(state)
    }
}

/// Hook that moves a [`Dispatchable`] from a helper thread to the main loop.
pub trait DispatchToEventLoop: Send + Sync {
    /// Hand off `dispatchable`. Returns `false` if it cannot be delivered,
    /// in which case it is dropped without running.
    fn dispatch(&self, dispatchable: Box<dyn Dispatchable>) -> bool;
}

/// The context's promise job queue.
pub trait JobQueue: Send + Sync {
    /// Queue a continuation. Must signal failure rather than drop the job.
    fn enqueue_promise_job(
        &self,
        cx: &GuestContext,
        job: Job,
        incumbent_global: Option<&GuestValueHandle>,
    ) -> Result<(), BridgeError>;

    /// Drain queued jobs, if the queue drives them itself.
    fn run_jobs(&self, cx: &GuestContext);

    fn is_empty(&self) -> bool;

    /// Take the pending jobs aside for a nested evaluation.
    fn save_job_queue(&self, cx: &GuestContext) -> Result<SavedJobQueue, BridgeError>;
}

/// The guest runtime: heap plus helper-thread plumbing.
pub struct GuestRuntime {
    heap: GuestHeap,
    dispatch_hook: RwLock<Option<Arc<dyn DispatchToEventLoop>>>,
    shut_down: AtomicBool,
}

impl GuestRuntime {
    pub fn new(config: &BridgeConfig) -> Arc<Self> {
        platform::init_platform(config.helper_threads);

        Arc::new(Self {
            heap: GuestHeap::new(config.gc_threshold),
            dispatch_hook: RwLock::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn heap(&self) -> &GuestHeap {
        &self.heap
    }

    /// Install the dispatch hook. Only one may be installed at a time.
    pub fn init_dispatch_to_event_loop(
        &self,
        hook: Arc<dyn DispatchToEventLoop>,
    ) -> Result<(), BridgeError> {
        let mut slot = self.dispatch_hook.write();
        if slot.is_some() {
            return Err(BridgeError::AlreadyInitialized);
        }
        *slot = Some(hook);
        Ok(())
    }

    pub(crate) fn clear_dispatch_hook(&self) {
        self.dispatch_hook.write().take();
    }

    /// Deliver `dispatchable` through the installed hook.
    pub fn dispatch_to_event_loop(&self, dispatchable: Box<dyn Dispatchable>) -> bool {
        let hook = self.dispatch_hook.read().clone();

        match hook {
            Some(hook) => hook.dispatch(dispatchable),
            None => {
                tracing::warn!("No dispatch hook installed, dropping dispatchable");
                false
            }
        }
    }

    /// Run `work` on a helper thread, then `continuation` with its result on
    /// the main loop (through the dispatch hook).
    pub fn run_off_thread<T, W, C>(self: &Arc<Self>, work: W, continuation: C)
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        C: FnOnce(T, ShutdownState) + Send + 'static,
    {
        let runtime = Arc::clone(self);

        platform::spawn_helper(move || {
            let output = work();

            if runtime.is_shut_down() {
                tracing::debug!("Guest runtime shut down, dropping off-thread result");
                return;
            }

            let delivered = runtime.dispatch_to_event_loop(Box::new(move |state: ShutdownState| {
                continuation(output, state)
            }));

            if !delivered {
                tracing::warn!("Off-thread continuation could not be dispatched");
            }
        });
    }

    /// Shut the runtime down: no more dispatches, heap freed. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        self.clear_dispatch_hook();
        self.heap.shutdown();
        tracing::debug!("Guest runtime shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl fmt::Debug for GuestRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestRuntime")
            .field("heap", &self.heap)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// A guest execution context with its own global object and job queue.
pub struct GuestContext {
    runtime: Arc<GuestRuntime>,
    global: GuestValueHandle,
    job_queue: RwLock<Option<Arc<dyn JobQueue>>>,
    jobs_may_be_pending: AtomicBool,
    gc_callbacks: Mutex<Vec<GcCallbackId>>,
    destroyed: AtomicBool,
}

impl GuestContext {
    /// Create a context with a fresh, pinned global object.
    pub fn new(runtime: Arc<GuestRuntime>) -> Result<Self, BridgeError> {
        let global = runtime.heap().alloc_pinned(GuestValue::object())?;

        Ok(Self {
            runtime,
            global,
            job_queue: RwLock::new(None),
            jobs_may_be_pending: AtomicBool::new(false),
            gc_callbacks: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn runtime(&self) -> &Arc<GuestRuntime> {
        &self.runtime
    }

    pub fn heap(&self) -> &GuestHeap {
        self.runtime.heap()
    }

    pub fn global(&self) -> ValueId {
        self.global.id()
    }

    /// The pin keeping the global object alive.
    pub fn global_handle(&self) -> &GuestValueHandle {
        &self.global
    }

    /// Install the job queue. Only one may be installed.
    pub fn set_job_queue(&self, queue: Arc<dyn JobQueue>) -> Result<(), BridgeError> {
        if self.is_destroyed() {
            return Err(BridgeError::ShutDown);
        }

        let mut slot = self.job_queue.write();
        if slot.is_some() {
            return Err(BridgeError::AlreadyInitialized);
        }
        *slot = Some(queue);
        Ok(())
    }

    pub fn has_job_queue(&self) -> bool {
        self.job_queue.read().is_some()
    }

    /// Register a collection callback owned by this context. It is removed
    /// when the context is destroyed.
    pub fn add_gc_callback(&self, callback: GcCallback) -> GcCallbackId {
        let id = self.heap().add_gc_callback(callback);
        self.gc_callbacks.lock().push(id);
        id
    }

    /// Tell the scheduler a job is about to become visible, so a drain in
    /// progress does not conclude the queue is empty.
    pub fn job_queue_may_not_be_empty(&self) {
        self.jobs_may_be_pending.store(true, Ordering::Release);
    }

    pub fn jobs_may_be_pending(&self) -> bool {
        self.jobs_may_be_pending.load(Ordering::Acquire)
    }

    fn installed_queue(&self) -> Result<Arc<dyn JobQueue>, BridgeError> {
        self.job_queue
            .read()
            .clone()
            .ok_or(BridgeError::NotInitialized)
    }

    /// Queue a promise continuation through the installed job queue.
    pub fn enqueue_promise_job(
        &self,
        job: Job,
        incumbent_global: Option<&GuestValueHandle>,
    ) -> Result<(), BridgeError> {
        let queue = self.installed_queue()?;
        queue.enqueue_promise_job(self, job, incumbent_global)
    }

    /// Ask the job queue to drain, then clear the pending hint if it is empty.
    pub fn run_jobs(&self) -> Result<(), BridgeError> {
        let queue = self.installed_queue()?;
        queue.run_jobs(self);

        if queue.is_empty() {
            self.jobs_may_be_pending.store(false, Ordering::Release);
        }

        Ok(())
    }

    pub fn job_queue_is_empty(&self) -> Result<bool, BridgeError> {
        Ok(self.installed_queue()?.is_empty())
    }

    pub fn save_job_queue(&self) -> Result<SavedJobQueue, BridgeError> {
        self.installed_queue()?.save_job_queue(self)
    }

    /// Uninstall the job queue and this context's collection callbacks.
    /// Idempotent. The global object stays pinned.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.job_queue.write().take();

        let callbacks = std::mem::take(&mut *self.gc_callbacks.lock());
        for id in callbacks {
            self.heap().remove_gc_callback(id);
        }

        tracing::debug!("Guest context destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for GuestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestContext")
            .field("global", &self.global)
            .field("has_job_queue", &self.has_job_queue())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
