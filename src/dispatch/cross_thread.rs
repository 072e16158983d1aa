//! Helper-thread continuations delivered to the main host loop.
//!
//! The guest runtime finishes work (compilation, off-thread parsing, ...) on
//! helper threads and must continue on the main loop. [`dispatch`] never
//! blocks the helper: a short-lived named thread takes the host lock,
//! resolves the main loop and queues the continuation there.
//!
//! A dispatchable accepted with `true` runs exactly once. If the main loop
//! goes away before it gets to run, it runs on whichever thread drops it,
//! with [`ShutdownState::ShuttingDown`], so it can skip its work.
//!
//! [`dispatch`]: CrossThreadDispatchBridge::dispatch

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use parking_lot::RwLock;

use crate::guest::{DispatchToEventLoop, Dispatchable, ShutdownState};
use crate::host::{EventLoopHandle, HostLock, JobOrigin};

/// Dispatch counters, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Accepted by `dispatch` (returned `true`).
    pub dispatched: u64,
    /// Ran on the main loop.
    pub delivered: u64,
    /// Ran with `ShuttingDown` because the main loop was gone.
    pub orphaned: u64,
}

struct DispatchShared {
    main_loop: RwLock<Option<EventLoopHandle>>,
    has_main_loop: AtomicBool,
    shutting_down: Arc<AtomicBool>,
    thread_name: String,
    dispatched: AtomicU64,
    delivered: AtomicU64,
    orphaned: AtomicU64,
}

impl DispatchShared {
    fn state(&self) -> ShutdownState {
        ShutdownState::from_flag(self.shutting_down.load(Ordering::Acquire))
    }

    /// Runs on the dispatch thread.
    fn deliver(self: &Arc<Self>, delivery: Delivery) {
        let _host = HostLock::acquire();

        let main_loop = self.main_loop.read().clone();
        let Some(main_loop) = main_loop else {
            tracing::debug!("Main loop cleared before delivery");
            return;
        };

        let loop_id = main_loop.id();
        let shared = Arc::clone(self);

        // On failure the task is dropped, and `delivery` with it
        let result = main_loop.enqueue(
            JobOrigin::Host,
            Box::new(move || {
                let state = shared.state();
                delivery.run(state);
            }),
        );

        match result {
            Ok(()) => tracing::trace!("Dispatchable queued on main loop {}", loop_id),
            Err(err) => tracing::debug!("Main loop {} rejected dispatchable: {}", loop_id, err),
        }
    }
}

/// Owns a dispatchable until it has run exactly once.
struct Delivery {
    dispatchable: Option<Box<dyn Dispatchable>>,
    shared: Arc<DispatchShared>,
}

impl Delivery {
    fn run(mut self, state: ShutdownState) {
        if let Some(dispatchable) = self.dispatchable.take() {
            self.shared.delivered.fetch_add(1, Ordering::Relaxed);
            dispatchable.run(state);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(dispatchable) = self.dispatchable.take() {
            self.shared.orphaned.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Main loop unavailable, running dispatchable in shutdown mode");
            dispatchable.run(ShutdownState::ShuttingDown);
        }
    }
}

/// [`DispatchToEventLoop`] hook targeting a designated main host loop.
#[derive(Clone)]
pub struct CrossThreadDispatchBridge {
    shared: Arc<DispatchShared>,
}

impl CrossThreadDispatchBridge {
    pub fn new(thread_name: impl Into<String>, shutting_down: Arc<AtomicBool>) -> Self {
        Self {
            shared: Arc::new(DispatchShared {
                main_loop: RwLock::new(None),
                has_main_loop: AtomicBool::new(false),
                shutting_down,
                thread_name: thread_name.into(),
                dispatched: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                orphaned: AtomicU64::new(0),
            }),
        }
    }

    /// Make `event_loop` the target of every later dispatch.
    pub fn designate_main_loop(&self, event_loop: &EventLoopHandle) {
        *self.shared.main_loop.write() = Some(event_loop.clone());
        self.shared.has_main_loop.store(true, Ordering::Release);
        tracing::debug!("Host loop {} designated as main loop", event_loop.id());
    }

    pub fn clear_main_loop(&self) {
        self.shared.has_main_loop.store(false, Ordering::Release);
        self.shared.main_loop.write().take();
    }

    pub fn main_loop(&self) -> Option<EventLoopHandle> {
        self.shared.main_loop.read().clone()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.shared.dispatched.load(Ordering::Relaxed),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            orphaned: self.shared.orphaned.load(Ordering::Relaxed),
        }
    }
}

impl DispatchToEventLoop for CrossThreadDispatchBridge {
    fn dispatch(&self, dispatchable: Box<dyn Dispatchable>) -> bool {
        if !self.shared.has_main_loop.load(Ordering::Acquire) {
            tracing::debug!("No main loop designated, dropping dispatchable");
            return false;
        }

        let shared = Arc::clone(&self.shared);
        self.shared.dispatched.fetch_add(1, Ordering::Relaxed);

        let spawned = thread::Builder::new()
            .name(self.shared.thread_name.clone())
            .spawn(move || {
                let delivery = Delivery {
                    dispatchable: Some(dispatchable),
                    shared: Arc::clone(&shared),
                };
                shared.deliver(delivery);
            });

        match spawned {
            Ok(_) => true,
            Err(err) => {
                // The dispatchable was dropped, unrun, with the closure
                self.shared.dispatched.fetch_sub(1, Ordering::Relaxed);
                tracing::error!("Failed to spawn dispatch thread: {}", err);
                false
            }
        }
    }
}

impl std::fmt::Debug for CrossThreadDispatchBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossThreadDispatchBridge")
            .field("main_loop", &self.main_loop().map(|l| l.id()))
            .field("stats", &self.stats())
            .finish()
    }
}
