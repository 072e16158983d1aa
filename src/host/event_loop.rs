//! Single-threaded cooperative host event loop.
//!
//! A loop owns a FIFO queue of tasks that any thread may push into through
//! an [`EventLoopHandle`]. The thread that owns the [`EventLoop`] drains the
//! queue, one task at a time, holding the [`HostLock`] while each task runs.
//!
//! ```text
//! ┌──────────────────────┐   enqueue (any thread)   ┌──────────────────────┐
//! │  EventLoopHandle     │ ───────────────────────▶ │  queue (VecDeque)    │
//! │  ├── Send + Sync     │                          │  ├── pending counts  │
//! │  └── current()/main  │                          │  └── Notify          │
//! └──────────────────────┘                          └──────────┬───────────┘
//!                                                              │ owner thread
//!                                                              ▼
//!                                                   ┌──────────────────────┐
//!                                                   │  EventLoop           │
//!                                                   │  ├── block_on / run  │
//!                                                   │  └── run_until_idle  │
//!                                                   └──────────────────────┘
//! ```
//!
//! Which loop is "running" is a per-thread property: it is set while the
//! owner drives the loop (or holds an [`EnterGuard`]) and resolved again on
//! every enqueue, never cached.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::ThreadId;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::lock::HostLock;
use crate::error::{BridgeError, GuestError};

/// A unit of work queued on a host loop.
pub type LoopTask = Box<dyn FnOnce() + Send + 'static>;

/// Who queued a task.
///
/// Only guest-origin tasks count towards the guest job queue's emptiness and
/// take part in save/restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOrigin {
    Host,
    Guest,
}

struct QueuedTask {
    origin: JobOrigin,
    task: LoopTask,
}

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Loop currently running on this thread (if any).
    static CURRENT_LOOP: RefCell<Option<EventLoopHandle>> = const { RefCell::new(None) };
}

struct LoopShared {
    id: u64,
    owner: ThreadId,
    queue: Mutex<VecDeque<QueuedTask>>,

    /// Queued or running tasks, of any origin
    pending: AtomicUsize,

    /// Queued or running guest-origin tasks
    guest_pending: AtomicUsize,

    notify: Notify,
    stop_notify: Notify,
    stopped: AtomicBool,
    closed: AtomicBool,
}

impl LoopShared {
    fn push(&self, origin: JobOrigin, task: LoopTask) -> Result<(), BridgeError> {
        {
            // Counters move under the queue lock so save/restore never
            // observe a task that is queued but not yet counted. `closed` is
            // checked under it too, so nothing lands after the close drain.
            let mut queue = self.queue.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(BridgeError::LoopClosed);
            }

            self.pending.fetch_add(1, Ordering::AcqRel);

            if origin == JobOrigin::Guest {
                self.guest_pending.fetch_add(1, Ordering::AcqRel);
            }

            queue.push_back(QueuedTask { origin, task });
        }

        self.notify.notify_one();
        Ok(())
    }

    /// Run the tasks that were queued when this call started.
    ///
    /// Tasks queued by those tasks wait for the next call, so a task that
    /// keeps re-queueing itself cannot starve the loop's driver.
    fn run_ready(&self) -> usize {
        let budget = self.queue.lock().len();
        let mut ran = 0;

        while ran < budget {
            let Some(queued) = self.queue.lock().pop_front() else {
                break;
            };

            self.run_task(queued);
            ran += 1;
        }

        ran
    }

    fn run_task(&self, queued: QueuedTask) {
        let QueuedTask { origin, task } = queued;

        {
            let _host = HostLock::acquire();

            if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(task)) {
                let err = GuestError::from_panic(payload);
                tracing::error!("Task on host loop {} failed: {}", self.id, err);
            }
        }

        self.pending.fetch_sub(1, Ordering::AcqRel);

        if origin == JobOrigin::Guest {
            self.guest_pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    async fn wait_stopped(&self) {
        loop {
            let notified = self.stop_notify.notified();

            if self.stopped.load(Ordering::Acquire) {
                return;
            }

            notified.await;
        }
    }
}

/// Thread-safe reference to a host event loop.
#[derive(Clone)]
pub struct EventLoopHandle {
    shared: Arc<LoopShared>,
}

impl EventLoopHandle {
    /// The loop currently running on the calling thread.
    pub fn current() -> Option<EventLoopHandle> {
        CURRENT_LOOP.with(|c| c.borrow().clone())
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Thread that owns the loop and runs its tasks.
    pub fn owner_thread(&self) -> ThreadId {
        self.shared.owner
    }

    /// Queue a host-origin task.
    pub fn call_soon<F>(&self, f: F) -> Result<(), BridgeError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.push(JobOrigin::Host, Box::new(f))
    }

    /// Queue a task with an explicit origin.
    pub fn enqueue(&self, origin: JobOrigin, task: LoopTask) -> Result<(), BridgeError> {
        self.shared.push(origin, task)
    }

    /// Tasks of any origin that are queued or running.
    pub fn pending_jobs(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Guest-origin tasks that are queued or running.
    pub fn pending_guest_jobs(&self) -> usize {
        self.shared.guest_pending.load(Ordering::Acquire)
    }

    /// Ask the loop's `run()` to return once the current task finishes.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.stop_notify.notify_one();
        self.shared.notify.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Whether the owning [`EventLoop`] was dropped.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Take every queued guest-origin task out of the loop.
    ///
    /// Host-origin tasks stay queued. The returned snapshot puts the tasks
    /// back, ahead of anything queued in the meantime, when restored or
    /// dropped.
    pub fn save_guest_jobs(&self) -> SavedJobQueue {
        let mut saved = VecDeque::new();

        {
            let mut queue = self.shared.queue.lock();
            let mut kept = VecDeque::with_capacity(queue.len());

            for queued in queue.drain(..) {
                match queued.origin {
                    JobOrigin::Guest => saved.push_back(queued),
                    JobOrigin::Host => kept.push_back(queued),
                }
            }

            *queue = kept;

            self.shared.pending.fetch_sub(saved.len(), Ordering::AcqRel);
            self.shared
                .guest_pending
                .fetch_sub(saved.len(), Ordering::AcqRel);
        }

        let count = saved.len();

        tracing::trace!("Saved {} guest jobs from host loop {}", count, self.shared.id);

        SavedJobQueue {
            target: self.clone(),
            jobs: saved,
            restored: false,
        }
    }
}

impl fmt::Debug for EventLoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopHandle")
            .field("id", &self.shared.id)
            .field("pending", &self.pending_jobs())
            .field("guest_pending", &self.pending_guest_jobs())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Snapshot of a loop's pending guest jobs.
///
/// Taken before a nested evaluation so the inner evaluation does not
/// interleave with the outer one's continuations.
pub struct SavedJobQueue {
    target: EventLoopHandle,
    jobs: VecDeque<QueuedTask>,
    restored: bool,
}

impl SavedJobQueue {
    /// Number of jobs held by the snapshot.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Put the saved jobs back at the front of the loop, in their
    /// original order.
    pub fn restore(mut self) {
        self.restore_inner();
    }

    fn restore_inner(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;

        let count = self.jobs.len();
        if count == 0 {
            return;
        }

        let shared = &self.target.shared;

        {
            let mut queue = shared.queue.lock();
            if shared.closed.load(Ordering::Acquire) {
                drop(queue);
                tracing::warn!(
                    "Dropping {} saved guest jobs: host loop {} is closed",
                    count,
                    shared.id
                );
                self.jobs.clear();
                return;
            }

            shared.pending.fetch_add(count, Ordering::AcqRel);
            shared.guest_pending.fetch_add(count, Ordering::AcqRel);

            while let Some(queued) = self.jobs.pop_back() {
                queue.push_front(queued);
            }
        }

        shared.notify.notify_one();

        tracing::trace!("Restored {} guest jobs to host loop {}", count, shared.id);
    }
}

impl Drop for SavedJobQueue {
    fn drop(&mut self) {
        self.restore_inner();
    }
}

impl fmt::Debug for SavedJobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SavedJobQueue")
            .field("loop", &self.target.shared.id)
            .field("jobs", &self.jobs.len())
            .finish()
    }
}

/// Marks a loop as the running loop of this thread until dropped.
pub struct EnterGuard<'a> {
    previous: Option<EventLoopHandle>,
    _loop: PhantomData<&'a EventLoop>,
}

impl Drop for EnterGuard<'_> {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_LOOP.with(|c| *c.borrow_mut() = previous);
    }
}

/// A host event loop, owned by the thread that runs it.
///
/// # Example
///
/// ```ignore
/// let event_loop = EventLoop::new()?;
/// let handle = event_loop.handle();
///
/// std::thread::spawn(move || handle.call_soon(|| println!("hi")));
///
/// event_loop.block_on(async { /* host work */ });
/// ```
pub struct EventLoop {
    handle: EventLoopHandle,
    runtime: tokio::runtime::Runtime,

    // Tasks must run on the owner thread
    _not_send: PhantomData<*const ()>,
}

impl EventLoop {
    pub fn new() -> Result<Self, BridgeError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let shared = LoopShared {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            owner: std::thread::current().id(),
            queue: Mutex::new(VecDeque::with_capacity(16)),
            pending: AtomicUsize::new(0),
            guest_pending: AtomicUsize::new(0),
            notify: Notify::new(),
            stop_notify: Notify::new(),
            stopped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };

        tracing::debug!("Created host loop {}", shared.id);

        Ok(Self {
            handle: EventLoopHandle {
                shared: Arc::new(shared),
            },
            runtime,
            _not_send: PhantomData,
        })
    }

    pub fn handle(&self) -> EventLoopHandle {
        self.handle.clone()
    }

    /// Make this the running loop of the current thread without driving it.
    pub fn enter(&self) -> EnterGuard<'_> {
        let previous = CURRENT_LOOP.with(|c| c.borrow_mut().replace(self.handle.clone()));

        EnterGuard {
            previous,
            _loop: PhantomData,
        }
    }

    /// Run queued tasks until the queue is empty.
    ///
    /// Returns the number of tasks run.
    pub fn run_until_idle(&self) -> usize {
        let _enter = self.enter();
        let mut total = 0;

        loop {
            let ran = self.handle.shared.run_ready();
            if ran == 0 {
                break;
            }
            total += ran;
        }

        total
    }

    /// Drive the loop until `future` completes, running queued tasks
    /// between polls.
    ///
    /// Must not be called from inside a task of this or another loop.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let _enter = self.enter();
        let shared = Arc::clone(&self.handle.shared);

        self.runtime.block_on(async move {
            let mut future = std::pin::pin!(future);

            loop {
                shared.run_ready();

                tokio::select! {
                    biased;

                    output = &mut future => return output,

                    _ = shared.notify.notified() => {}
                }
            }
        })
    }

    /// Drive the loop until [`EventLoopHandle::stop`] is called.
    pub fn run(&self) {
        let shared = Arc::clone(&self.handle.shared);
        self.block_on(async move { shared.wait_stopped().await });
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let shared = &self.handle.shared;

        let leftover: VecDeque<QueuedTask> = {
            let mut queue = shared.queue.lock();
            shared.closed.store(true, Ordering::Release);
            shared.pending.store(0, Ordering::Release);
            shared.guest_pending.store(0, Ordering::Release);
            std::mem::take(&mut *queue)
        };

        if !leftover.is_empty() {
            tracing::warn!(
                "Host loop {} closed with {} queued tasks",
                shared.id,
                leftover.len()
            );
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("handle", &self.handle)
            .finish()
    }
}
