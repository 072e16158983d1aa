//! Guest promise jobs scheduled on the host event loop.
//!
//! The guest engine hands every promise continuation to [`JobDispatcher`],
//! which queues it on whichever host loop is running on the calling thread.
//! The host loop, not the guest, owns the drain: `run_jobs` does nothing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::BridgeError;
use crate::guest::{GuestContext, GuestValueHandle, Job, JobQueue, ShutdownState};
use crate::host::{EventLoopHandle, JobOrigin, SavedJobQueue};

pub struct JobDispatcher {
    shutting_down: Arc<AtomicBool>,
}

impl JobDispatcher {
    /// `shutting_down` is reported to every job as its [`ShutdownState`].
    pub fn new(shutting_down: Arc<AtomicBool>) -> Self {
        Self { shutting_down }
    }

    /// Guest jobs queued or running on the current thread's loop.
    pub fn pending_jobs(&self) -> usize {
        EventLoopHandle::current()
            .map(|event_loop| event_loop.pending_guest_jobs())
            .unwrap_or(0)
    }
}

impl JobQueue for JobDispatcher {
    fn enqueue_promise_job(
        &self,
        cx: &GuestContext,
        job: Job,
        incumbent_global: Option<&GuestValueHandle>,
    ) -> Result<(), BridgeError> {
        let Some(event_loop) = EventLoopHandle::current() else {
            tracing::warn!("Promise job scheduled with no running host event loop");
            return Err(BridgeError::NoRunningLoop);
        };

        // Own pin, so the incumbent outlives the job even if its other pins go
        let incumbent = match incumbent_global {
            Some(global) => Some(cx.heap().persist(global.id())?),
            None => None,
        };

        cx.job_queue_may_not_be_empty();

        let shutting_down = Arc::clone(&self.shutting_down);

        event_loop.enqueue(
            JobOrigin::Guest,
            Box::new(move || {
                let state = ShutdownState::from_flag(shutting_down.load(Ordering::Acquire));

                if let Err(err) = job(state) {
                    tracing::error!("Promise job failed: {}", err);
                    if let Some(stack) = &err.stack {
                        tracing::debug!("Promise job stack:\n{}", stack);
                    }
                }

                drop(incumbent);
            }),
        )?;

        tracing::trace!("Queued promise job on host loop {}", event_loop.id());
        Ok(())
    }

    fn run_jobs(&self, _cx: &GuestContext) {}

    fn is_empty(&self) -> bool {
        self.pending_jobs() == 0
    }

    fn save_job_queue(&self, _cx: &GuestContext) -> Result<SavedJobQueue, BridgeError> {
        let event_loop = EventLoopHandle::current().ok_or(BridgeError::NoRunningLoop)?;
        Ok(event_loop.save_guest_jobs())
    }
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("pending_jobs", &self.pending_jobs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::BridgeConfig;
    use crate::error::GuestError;
    use crate::guest::{GuestRuntime, GuestValue};
    use crate::host::EventLoop;

    fn context() -> (GuestContext, Arc<AtomicBool>) {
        let runtime = GuestRuntime::new(&BridgeConfig::default().with_gc_threshold(0));
        let cx = GuestContext::new(runtime).unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        cx.set_job_queue(Arc::new(JobDispatcher::new(flag.clone())))
            .unwrap();
        (cx, flag)
    }

    #[test]
    fn test_enqueue_without_loop_fails() {
        let (cx, _) = context();

        let result = cx.enqueue_promise_job(Box::new(|_| Ok(())), None);

        assert!(matches!(result, Err(BridgeError::NoRunningLoop)));
        assert!(!cx.jobs_may_be_pending());
        assert!(cx.job_queue_is_empty().unwrap());
    }

    #[test]
    fn test_jobs_run_in_order_on_loop() {
        let (cx, _) = context();
        let event_loop = EventLoop::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        {
            let _enter = event_loop.enter();
            for i in 0..3 {
                let order = order.clone();
                cx.enqueue_promise_job(
                    Box::new(move |_| {
                        order.lock().unwrap().push(i);
                        Ok(())
                    }),
                    None,
                )
                .unwrap();
            }

            assert!(cx.jobs_may_be_pending());
            assert!(!cx.job_queue_is_empty().unwrap());
        }

        assert_eq!(event_loop.run_until_idle(), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);

        let _enter = event_loop.enter();
        assert!(cx.job_queue_is_empty().unwrap());
        cx.run_jobs().unwrap();
        assert!(!cx.jobs_may_be_pending());
    }

    #[test]
    fn test_failed_job_does_not_stop_loop() {
        let (cx, _) = context();
        let event_loop = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        {
            let _enter = event_loop.enter();
            cx.enqueue_promise_job(Box::new(|_| Err(GuestError::new("rejected"))), None)
                .unwrap();

            let ran = ran.clone();
            cx.enqueue_promise_job(
                Box::new(move |_| {
                    ran.store(true, Ordering::SeqCst);
                    Ok(())
                }),
                None,
            )
            .unwrap();
        }

        event_loop.run_until_idle();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_job_sees_shutdown_state() {
        let (cx, flag) = context();
        let event_loop = EventLoop::new().unwrap();
        let seen = Arc::new(Mutex::new(None));

        {
            let _enter = event_loop.enter();
            let seen = seen.clone();
            cx.enqueue_promise_job(
                Box::new(move |state| {
                    *seen.lock().unwrap() = Some(state);
                    Ok(())
                }),
                None,
            )
            .unwrap();
        }

        flag.store(true, Ordering::SeqCst);
        event_loop.run_until_idle();

        assert_eq!(*seen.lock().unwrap(), Some(ShutdownState::ShuttingDown));
    }

    #[test]
    fn test_incumbent_pinned_until_job_runs() {
        let (cx, _) = context();
        let event_loop = EventLoop::new().unwrap();
        let incumbent = cx.heap().alloc_pinned(GuestValue::object()).unwrap();
        let id = incumbent.id();

        {
            let _enter = event_loop.enter();
            cx.enqueue_promise_job(Box::new(|_| Ok(())), Some(&incumbent))
                .unwrap();
        }

        incumbent.release();
        cx.heap().collect();
        assert!(cx.heap().is_alive(id));

        event_loop.run_until_idle();
        cx.heap().collect();
        assert!(!cx.heap().is_alive(id));
    }

    #[test]
    fn test_dead_incumbent_leaves_queue_untouched() {
        let (cx, _) = context();
        let event_loop = EventLoop::new().unwrap();
        let incumbent = cx.heap().alloc_pinned(GuestValue::object()).unwrap();
        incumbent.release();
        cx.heap().collect();

        let _enter = event_loop.enter();
        let result = cx.enqueue_promise_job(Box::new(|_| Ok(())), Some(&incumbent));

        assert!(matches!(result, Err(BridgeError::InvariantViolation(_))));
        assert!(!cx.jobs_may_be_pending());
        assert!(cx.job_queue_is_empty().unwrap());
        assert_eq!(event_loop.handle().pending_jobs(), 0);
    }

    #[test]
    fn test_save_and_restore_guest_jobs() {
        let (cx, _) = context();
        let event_loop = EventLoop::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let _enter = event_loop.enter();
        for name in ["outer-1", "outer-2"] {
            let order = order.clone();
            cx.enqueue_promise_job(
                Box::new(move |_| {
                    order.lock().unwrap().push(name);
                    Ok(())
                }),
                None,
            )
            .unwrap();
        }

        let saved = cx.save_job_queue().unwrap();
        assert_eq!(saved.len(), 2);
        assert!(cx.job_queue_is_empty().unwrap());

        let inner = order.clone();
        cx.enqueue_promise_job(
            Box::new(move |_| {
                inner.lock().unwrap().push("inner");
                Ok(())
            }),
            None,
        )
        .unwrap();
        event_loop.run_until_idle();

        saved.restore();
        event_loop.run_until_idle();

        assert_eq!(*order.lock().unwrap(), vec!["inner", "outer-1", "outer-2"]);
    }

    #[test]
    fn test_save_without_loop_fails() {
        let (cx, _) = context();
        assert!(matches!(
            cx.save_job_queue(),
            Err(BridgeError::NoRunningLoop)
        ));
    }
}
