//! Host-side objects as seen by the bridge.
//!
//! Host objects are reference counted with `Arc`. The bridge keeps one clone
//! per tracked object and only ever *reads* the strong count; it never
//! adjusts it by any other means than holding or dropping that clone.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A host-runtime object that may keep guest values alive.
///
/// The bridge drops its clone on whichever thread runs the collection or
/// teardown, with neither the tracker lock nor the [`HostLock`] held.
///
/// [`HostLock`]: crate::host::HostLock
pub trait HostObject: Send + Sync + 'static {
    /// Whether the host already finalized this object.
    ///
    /// A finalized object is collectible even if stray references keep its
    /// refcount above one.
    fn is_finalized(&self) -> bool {
        false
    }
}

/// A reference-counted handle on a host object.
///
/// Equality and hashing use object identity (the `Arc` allocation), not
/// value equality.
#[derive(Clone)]
pub struct HostHandle {
    object: Arc<dyn HostObject>,
}

impl HostHandle {
    pub fn new<T: HostObject>(object: Arc<T>) -> Self {
        Self { object }
    }

    /// Current host refcount, including the reference held by this handle.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.object)
    }

    pub fn is_finalized(&self) -> bool {
        self.object.is_finalized()
    }

    /// Stable identity of the underlying object.
    pub fn id(&self) -> HostId {
        HostId(Arc::as_ptr(&self.object) as *const () as usize)
    }
}

impl<T: HostObject> From<Arc<T>> for HostHandle {
    fn from(object: Arc<T>) -> Self {
        Self::new(object)
    }
}

impl PartialEq for HostHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for HostHandle {}

impl fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostHandle")
            .field("id", &self.id())
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// Object identity of a host object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(usize);

/// A host object holding a value of type `T` and an explicit finalized flag.
///
/// This is what marshalling code produces when it wraps a guest value in a
/// host object.
pub struct HostCell<T> {
    value: T,
    finalized: AtomicBool,
}

impl<T: Send + Sync + 'static> HostCell<T> {
    pub fn new(value: T) -> Arc<Self> {
        Arc::new(Self {
            value,
            finalized: AtomicBool::new(false),
        })
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Mark the object finalized. It becomes collectible on the next cycle.
    pub fn finalize(&self) {
        self.finalized.store(true, Ordering::Release);
    }
}

impl<T: Send + Sync + 'static> HostObject for HostCell<T> {
    fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }
}

impl<T: fmt::Debug> fmt::Debug for HostCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCell")
            .field("value", &self.value)
            .field("finalized", &self.finalized.load(Ordering::Relaxed))
            .finish()
    }
}
