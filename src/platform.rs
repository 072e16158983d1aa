//! Process-wide guest platform initialization.
//!
//! The guest helper pool (background compilation and collection work) is
//! shared by every runtime in the process and can only be sized once. This
//! module provides the single entry point for it.

use std::sync::OnceLock;

use parking_lot::Mutex;
use threadpool::ThreadPool;

struct Platform {
    helpers: Mutex<ThreadPool>,
    size: usize,
}

static PLATFORM: OnceLock<Platform> = OnceLock::new();

/// Initialize the platform with `helper_threads` helper threads.
///
/// Safe to call from multiple threads. The first caller decides the pool
/// size; later calls with a different size are logged and ignored.
pub fn init_platform(helper_threads: usize) {
    let helper_threads = helper_threads.max(1);

    let platform = PLATFORM.get_or_init(|| {
        log::info!(
            "Guest platform initialized with {} helper threads",
            helper_threads
        );

        Platform {
            helpers: Mutex::new(
                threadpool::Builder::new()
                    .num_threads(helper_threads)
                    .thread_name("guest-helper".into())
                    .build(),
            ),
            size: helper_threads,
        }
    });

    if platform.size != helper_threads {
        log::warn!(
            "Guest platform already initialized with {} helper threads, ignoring request for {}",
            platform.size,
            helper_threads
        );
    }
}

/// Run `work` on a guest helper thread.
///
/// Initializes the platform with the default size if nobody did yet.
pub(crate) fn spawn_helper<F>(work: F)
where
    F: FnOnce() + Send + 'static,
{
    if PLATFORM.get().is_none() {
        init_platform(crate::config::DEFAULT_HELPER_THREADS);
    }

    if let Some(platform) = PLATFORM.get() {
        platform.helpers.lock().execute(work);
    }
}

/// Number of helper threads in the process-wide pool, if initialized.
pub fn helper_threads() -> Option<usize> {
    PLATFORM.get().map(|p| p.size)
}
