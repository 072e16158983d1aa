//! Bridge configuration.

/// Default number of allocations between automatic collection cycles.
pub const DEFAULT_GC_THRESHOLD: usize = 10_000;

/// Default number of guest helper threads.
pub const DEFAULT_HELPER_THREADS: usize = 2;

/// Default total fan-out above which registration logs a capacity warning.
pub const DEFAULT_FAN_OUT_WARNING: usize = 100_000;

/// Configuration for a [`Bridge`](crate::Bridge).
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Allocations between automatic collection cycles (0 disables them,
    /// leaving only explicit `force_collection` calls).
    pub gc_threshold: usize,
    /// Size of the process-wide guest helper pool. Only honored by the
    /// first bridge created in the process.
    pub helper_threads: usize,
    /// Name given to the short-lived threads spawned per cross-thread dispatch.
    pub dispatch_thread_name: String,
    /// The collection scan costs O(total fan-out). Registration warns once
    /// the number of tracked guest handles crosses this value.
    pub fan_out_warning: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            gc_threshold: DEFAULT_GC_THRESHOLD,
            helper_threads: DEFAULT_HELPER_THREADS,
            dispatch_thread_name: "guest-dispatch".to_string(),
            fan_out_warning: DEFAULT_FAN_OUT_WARNING,
        }
    }
}

impl BridgeConfig {
    pub fn with_gc_threshold(mut self, gc_threshold: usize) -> Self {
        self.gc_threshold = gc_threshold;
        self
    }

    pub fn with_helper_threads(mut self, helper_threads: usize) -> Self {
        self.helper_threads = helper_threads.max(1);
        self
    }

    pub fn with_dispatch_thread_name(mut self, name: impl Into<String>) -> Self {
        self.dispatch_thread_name = name.into();
        self
    }

    pub fn with_fan_out_warning(mut self, fan_out_warning: usize) -> Self {
        self.fan_out_warning = fan_out_warning;
        self
    }
}
