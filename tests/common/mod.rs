use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use crossgc::{EventLoop, EventLoopHandle};

/// A host event loop running `run()` on its own thread.
pub struct LoopThread {
    pub handle: EventLoopHandle,
    thread: Option<JoinHandle<()>>,
}

impl LoopThread {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name("test-main-loop".into())
            .spawn(move || {
                let event_loop = EventLoop::new().unwrap();
                tx.send(event_loop.handle()).unwrap();
                event_loop.run();
            })
            .unwrap();

        let handle = rx.recv().unwrap();

        Self {
            handle,
            thread: Some(thread),
        }
    }

    pub fn thread_id(&self) -> thread::ThreadId {
        self.handle.owner_thread()
    }

    /// Stop the loop and wait for its thread.
    pub fn join(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
