//! Error types shared by the bridge.

use thiserror::Error;

/// A failure raised by guest code while a job ran on the host loop.
///
/// Carries as much of the guest diagnostic as survived the trip: the
/// message always, the stack when the guest provided one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct GuestError {
    pub message: String,
    pub stack: Option<String>,
}

impl GuestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Build an error from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "job panicked".to_string()
        };

        Self::new(format!("job panicked: {}", message))
    }
}

/// Errors surfaced by the bridge to its immediate caller.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A job was scheduled while no host event loop was running on this thread.
    #[error("no host event loop is running on this thread")]
    NoRunningLoop,

    /// No main event loop has been designated.
    #[error("no main event loop has been designated")]
    NoMainLoop,

    /// The target event loop was dropped or stopped.
    #[error("host event loop is closed")]
    LoopClosed,

    /// Internal bridge state is inconsistent. Programmer error.
    #[error("bridge invariant violated: {0}")]
    InvariantViolation(String),

    /// Guest code failed while running on the host.
    #[error("guest evaluation failed: {0}")]
    Evaluation(#[from] GuestError),

    #[error("bridge hooks are already installed on this guest context")]
    AlreadyInitialized,

    #[error("bridge hooks are not installed on this guest context")]
    NotInitialized,

    #[error("bridge has been shut down")]
    ShutDown,

    #[error("failed to build event loop runtime: {0}")]
    Io(#[from] std::io::Error),
}

/// Report an internal inconsistency.
///
/// Aborts in debug builds. In release builds the violation is logged and
/// returned so the caller can leave its state untouched.
#[track_caller]
pub(crate) fn invariant_violation(message: String) -> BridgeError {
    tracing::error!("Bridge invariant violated: {}", message);
    debug_assert!(false, "bridge invariant violated: {}", message);
    BridgeError::InvariantViolation(message)
}
