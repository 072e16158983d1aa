//! Pinned guest value handles.
//!
//! A [`GuestValueHandle`] keeps one pin on a guest value. Clones share the
//! same pin, so several host objects can list the very same handle; the pin
//! is dropped exactly once, by [`GuestValueHandle::release`] or, failing
//! that, when the last clone goes away.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::heap::{HeapInner, ValueId};

struct PinnedSlot {
    heap: Weak<HeapInner>,
    id: ValueId,
    released: AtomicBool,
}

impl PinnedSlot {
    fn unpin(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }

        // Heap already gone: nothing left to unpin
        if let Some(heap) = self.heap.upgrade() {
            heap.unpin(self.id);
            tracing::trace!("Released guest value {:?}", self.id);
        }

        true
    }
}

impl Drop for PinnedSlot {
    fn drop(&mut self) {
        self.unpin();
    }
}

/// A shared pin on a guest value.
#[derive(Clone)]
pub struct GuestValueHandle {
    slot: Arc<PinnedSlot>,
}

impl GuestValueHandle {
    /// Wrap a value the heap already pinned on our behalf.
    pub(super) fn from_pinned(heap: Weak<HeapInner>, id: ValueId) -> Self {
        Self {
            slot: Arc::new(PinnedSlot {
                heap,
                id,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> ValueId {
        self.slot.id
    }

    /// Drop the pin, letting the collector reclaim the value.
    ///
    /// Returns `true` only for the call that actually released it.
    pub fn release(&self) -> bool {
        self.slot.unpin()
    }

    pub fn is_released(&self) -> bool {
        self.slot.released.load(Ordering::Acquire)
    }

    /// Whether both handles share the same pin.
    pub fn ptr_eq(&self, other: &GuestValueHandle) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Identity of the shared pin, usable as a map key.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.slot) as usize
    }
}

impl fmt::Debug for GuestValueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestValueHandle")
            .field("id", &self.slot.id)
            .field("released", &self.is_released())
            .finish()
    }
}
