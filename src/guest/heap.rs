//! Guest heap: a non-moving mark/sweep collector.
//!
//! Values live in generation-tagged slots. Roots are pins: a pinned value
//! and everything reachable from it survives a collection cycle, anything
//! else is swept. Collection callbacks run on the collecting thread at the
//! start and end of every cycle, with no heap lock held.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use super::handle::GuestValueHandle;
use crate::error::{BridgeError, invariant_violation};

/// Identity of a guest value. Stale ids (pointing at a swept slot) are
/// detected through the generation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId {
    index: u32,
    generation: u32,
}

/// A guest value. Objects hold edges to other values.
#[derive(Debug, Clone, PartialEq)]
pub enum GuestValue {
    Undefined,
    Boolean(bool),
    Number(f64),
    String(Arc<str>),
    Object(Vec<ValueId>),
}

impl GuestValue {
    pub fn object() -> Self {
        GuestValue::Object(Vec::new())
    }

    fn children(&self) -> &[ValueId] {
        match self {
            GuestValue::Object(children) => children,
            _ => &[],
        }
    }
}

/// Phase of a collection cycle reported to callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcStatus {
    Begin,
    End,
}

pub type GcCallback = Arc<dyn Fn(GcStatus) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcCallbackId(u64);

/// Result of a collection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectOutcome {
    /// Cycle ran, plus one follow-up cycle per nested request.
    Completed { freed: usize },
    /// Requested from inside a cycle on the collecting thread; a follow-up
    /// cycle runs once the current one ends.
    Deferred,
    /// The heap was shut down.
    ShutDown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub live: usize,
    pub pinned: usize,
    pub collections: u64,
    pub freed_total: u64,
    pub last_freed: usize,
}

struct Slot {
    generation: u32,
    value: Option<GuestValue>,
    pins: usize,
    marked: bool,
}

#[derive(Default)]
struct Cells {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    allocations_since_gc: usize,
    shut_down: bool,
}

impl Cells {
    fn slot(&self, id: ValueId) -> Option<&Slot> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.value.is_some())
    }

    fn slot_mut(&mut self, id: ValueId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.value.is_some())
    }

    fn insert(&mut self, value: GuestValue, pins: usize) -> ValueId {
        self.live += 1;
        self.allocations_since_gc += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            slot.pins = pins;
            slot.marked = false;

            return ValueId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
            pins,
            marked: false,
        });

        ValueId {
            index,
            generation: 0,
        }
    }

    fn mark_and_sweep(&mut self) -> usize {
        let mut stack: Vec<ValueId> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.pins > 0 && slot.value.is_some())
            .map(|(index, slot)| ValueId {
                index: index as u32,
                generation: slot.generation,
            })
            .collect();

        while let Some(id) = stack.pop() {
            let Some(slot) = self.slot_mut(id) else {
                continue;
            };

            if slot.marked {
                continue;
            }
            slot.marked = true;

            if let Some(value) = &slot.value {
                stack.extend_from_slice(value.children());
            }
        }

        let mut freed = 0;

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.is_none() {
                continue;
            }

            if slot.marked {
                slot.marked = false;
                continue;
            }

            slot.value = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(index as u32);
            freed += 1;
        }

        self.live -= freed;
        self.allocations_since_gc = 0;
        freed
    }

    fn pinned(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.pins > 0 && slot.value.is_some())
            .count()
    }
}

pub(super) struct HeapInner {
    cells: Mutex<Cells>,
    callbacks: Mutex<Vec<(GcCallbackId, GcCallback)>>,
    next_callback: AtomicU64,
    collector: Mutex<Option<ThreadId>>,
    collector_idle: Condvar,
    rerun_requested: AtomicBool,
    gc_threshold: usize,
    collections: AtomicU64,
    freed_total: AtomicU64,
    last_freed: AtomicU64,
}

impl HeapInner {
    /// Drop one pin on `id`. Returns false if the heap no longer knows it.
    pub(super) fn unpin(&self, id: ValueId) -> bool {
        let mut cells = self.cells.lock();

        if cells.shut_down {
            return false;
        }

        let unpinned = match cells.slot_mut(id) {
            Some(slot) if slot.pins > 0 => {
                slot.pins -= 1;
                true
            }
            _ => false,
        };
        drop(cells);

        if !unpinned {
            let _ = invariant_violation(format!("unpin of unpinned guest value {:?}", id));
        }

        unpinned
    }
}

/// Gives up the collector slot and wakes waiting threads, even if a
/// callback panics.
struct CollectingGuard<'a>(&'a HeapInner);

impl Drop for CollectingGuard<'_> {
    fn drop(&mut self) {
        *self.0.collector.lock() = None;
        self.0.collector_idle.notify_all();
    }
}

/// Shared handle on a guest heap.
#[derive(Clone)]
pub struct GuestHeap {
    inner: Arc<HeapInner>,
}

impl GuestHeap {
    /// Create a heap that collects automatically every `gc_threshold`
    /// allocations (0 disables automatic collection).
    pub fn new(gc_threshold: usize) -> Self {
        Self {
            inner: Arc::new(HeapInner {
                cells: Mutex::new(Cells::default()),
                callbacks: Mutex::new(Vec::new()),
                next_callback: AtomicU64::new(1),
                collector: Mutex::new(None),
                collector_idle: Condvar::new(),
                rerun_requested: AtomicBool::new(false),
                gc_threshold,
                collections: AtomicU64::new(0),
                freed_total: AtomicU64::new(0),
                last_freed: AtomicU64::new(0),
            }),
        }
    }

    /// Allocate an unpinned value.
    ///
    /// The value survives only while reachable from a pin; it may be swept
    /// by the next cycle otherwise.
    pub fn alloc(&self, value: GuestValue) -> Result<ValueId, BridgeError> {
        self.alloc_with_pins(value, 0)
    }

    /// Allocate a value and pin it in one step, so no cycle can observe it
    /// unpinned.
    pub fn alloc_pinned(&self, value: GuestValue) -> Result<GuestValueHandle, BridgeError> {
        let id = self.alloc_with_pins(value, 1)?;
        Ok(GuestValueHandle::from_pinned(self.downgrade(), id))
    }

    fn alloc_with_pins(&self, value: GuestValue, pins: usize) -> Result<ValueId, BridgeError> {
        if self.should_collect() {
            self.collect();
        }

        let mut cells = self.inner.cells.lock();
        if cells.shut_down {
            return Err(BridgeError::ShutDown);
        }

        let id = cells.insert(value, pins);
        tracing::trace!("Allocated guest value {:?} (pins: {})", id, pins);
        Ok(id)
    }

    fn should_collect(&self) -> bool {
        let threshold = self.inner.gc_threshold;
        threshold > 0 && self.inner.cells.lock().allocations_since_gc >= threshold
    }

    /// Pin an existing value, keeping it (and what it reaches) alive until
    /// the returned handle is released.
    pub fn persist(&self, id: ValueId) -> Result<GuestValueHandle, BridgeError> {
        let mut cells = self.inner.cells.lock();
        if cells.shut_down {
            return Err(BridgeError::ShutDown);
        }

        let slot = cells.slot_mut(id).ok_or_else(|| {
            BridgeError::InvariantViolation(format!("persist of dead guest value {:?}", id))
        })?;
        slot.pins += 1;
        drop(cells);

        Ok(GuestValueHandle::from_pinned(self.downgrade(), id))
    }

    /// Add an edge from object `parent` to `child`.
    pub fn link(&self, parent: ValueId, child: ValueId) -> Result<(), BridgeError> {
        let mut cells = self.inner.cells.lock();

        if cells.slot(child).is_none() {
            return Err(BridgeError::InvariantViolation(format!(
                "link to dead guest value {:?}",
                child
            )));
        }

        match cells.slot_mut(parent).and_then(|slot| slot.value.as_mut()) {
            Some(GuestValue::Object(children)) => {
                children.push(child);
                Ok(())
            }
            _ => Err(BridgeError::InvariantViolation(format!(
                "link from non-object guest value {:?}",
                parent
            ))),
        }
    }

    pub fn get(&self, id: ValueId) -> Option<GuestValue> {
        self.inner
            .cells
            .lock()
            .slot(id)
            .and_then(|slot| slot.value.clone())
    }

    pub fn is_alive(&self, id: ValueId) -> bool {
        self.inner.cells.lock().slot(id).is_some()
    }

    pub fn pin_count(&self, id: ValueId) -> usize {
        self.inner
            .cells
            .lock()
            .slot(id)
            .map(|slot| slot.pins)
            .unwrap_or(0)
    }

    /// Register a callback run at the start and end of every cycle.
    pub fn add_gc_callback(&self, callback: GcCallback) -> GcCallbackId {
        let id = GcCallbackId(self.inner.next_callback.fetch_add(1, Ordering::Relaxed));
        self.inner.callbacks.lock().push((id, callback));
        id
    }

    pub fn remove_gc_callback(&self, id: GcCallbackId) -> bool {
        let mut callbacks = self.inner.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(cb_id, _)| *cb_id != id);
        callbacks.len() != before
    }

    /// Whether a cycle is running right now (on any thread).
    pub fn is_collecting(&self) -> bool {
        self.inner.collector.lock().is_some()
    }

    /// Run a collection cycle on the calling thread.
    ///
    /// Never recurses: a request made from inside a cycle on the collecting
    /// thread is deferred, and the collecting thread keeps running follow-up
    /// cycles until no request is left. A request from another thread waits
    /// for the running cycle to end and then runs its own.
    pub fn collect(&self) -> CollectOutcome {
        if self.inner.cells.lock().shut_down {
            return CollectOutcome::ShutDown;
        }

        let current = thread::current().id();
        {
            let mut collector = self.inner.collector.lock();
            loop {
                match *collector {
                    None => break,
                    Some(owner) if owner == current => {
                        self.inner.rerun_requested.store(true, Ordering::Release);
                        tracing::debug!("Collection already running, deferring request");
                        return CollectOutcome::Deferred;
                    }
                    Some(_) => self.inner.collector_idle.wait(&mut collector),
                }
            }
            *collector = Some(current);
        }

        let _guard = CollectingGuard(&self.inner);

        // Shut down while this thread waited
        if self.inner.cells.lock().shut_down {
            return CollectOutcome::ShutDown;
        }

        let mut freed = self.cycle();

        while self.inner.rerun_requested.swap(false, Ordering::AcqRel) {
            freed += self.cycle();
        }

        CollectOutcome::Completed { freed }
    }

    fn cycle(&self) -> usize {
        let callbacks: Vec<GcCallback> = self
            .inner
            .callbacks
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in &callbacks {
            callback(GcStatus::Begin);
        }

        let freed = {
            let mut cells = self.inner.cells.lock();
            if cells.shut_down {
                0
            } else {
                cells.mark_and_sweep()
            }
        };

        self.inner.collections.fetch_add(1, Ordering::Relaxed);
        self.inner
            .freed_total
            .fetch_add(freed as u64, Ordering::Relaxed);
        self.inner.last_freed.store(freed as u64, Ordering::Relaxed);

        tracing::debug!("Guest collection cycle freed {} values", freed);

        for callback in &callbacks {
            callback(GcStatus::End);
        }

        freed
    }

    pub fn stats(&self) -> HeapStats {
        let (live, pinned) = {
            let cells = self.inner.cells.lock();
            (cells.live, cells.pinned())
        };

        HeapStats {
            live,
            pinned,
            collections: self.inner.collections.load(Ordering::Relaxed),
            freed_total: self.inner.freed_total.load(Ordering::Relaxed),
            last_freed: self.inner.last_freed.load(Ordering::Relaxed) as usize,
        }
    }

    /// Free every value and refuse further allocation. Idempotent.
    pub fn shutdown(&self) {
        let mut cells = self.inner.cells.lock();
        if cells.shut_down {
            return;
        }

        let live = cells.live;
        *cells = Cells {
            shut_down: true,
            ..Cells::default()
        };
        drop(cells);

        self.inner.callbacks.lock().clear();
        tracing::debug!("Guest heap shut down ({} values freed)", live);
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cells.lock().shut_down
    }

    fn downgrade(&self) -> Weak<HeapInner> {
        Arc::downgrade(&self.inner)
    }
}

impl fmt::Debug for GuestHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestHeap")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_unpinned_values_are_swept() {
        let heap = GuestHeap::new(0);
        let id = heap.alloc(GuestValue::Number(1.0)).unwrap();
        assert!(heap.is_alive(id));

        assert_eq!(heap.collect(), CollectOutcome::Completed { freed: 1 });
        assert!(!heap.is_alive(id));
        assert!(heap.get(id).is_none());
    }

    #[test]
    fn test_pinned_values_and_children_survive() {
        let heap = GuestHeap::new(0);
        let root = heap.alloc_pinned(GuestValue::object()).unwrap();
        let child = heap.alloc(GuestValue::String("kept".into())).unwrap();
        let orphan = heap.alloc(GuestValue::Boolean(true)).unwrap();
        heap.link(root.id(), child).unwrap();

        heap.collect();

        assert!(heap.is_alive(root.id()));
        assert!(heap.is_alive(child));
        assert!(!heap.is_alive(orphan));
        assert_eq!(heap.stats().pinned, 1);
    }

    #[test]
    fn test_stale_id_after_slot_reuse() {
        let heap = GuestHeap::new(0);
        let old = heap.alloc(GuestValue::Number(1.0)).unwrap();
        heap.collect();

        let new = heap.alloc(GuestValue::Number(2.0)).unwrap();
        assert!(!heap.is_alive(old));
        assert_eq!(heap.get(new), Some(GuestValue::Number(2.0)));
    }

    #[test]
    fn test_callbacks_see_begin_then_end() {
        let heap = GuestHeap::new(0);
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();

        let id = heap.add_gc_callback(Arc::new(move |status: GcStatus| events_clone.lock().push(status)));
        heap.collect();
        assert_eq!(*events.lock(), vec![GcStatus::Begin, GcStatus::End]);

        assert!(heap.remove_gc_callback(id));
        heap.collect();
        assert_eq!(events.lock().len(), 2);
    }

    #[test]
    fn test_nested_collection_is_deferred() {
        let heap = GuestHeap::new(0);
        let begins = Arc::new(AtomicUsize::new(0));
        let nested = Arc::new(Mutex::new(None));

        let heap_clone = heap.clone();
        let begins_clone = begins.clone();
        let nested_clone = nested.clone();
        heap.add_gc_callback(Arc::new(move |status: GcStatus| {
            if status == GcStatus::Begin && begins_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                *nested_clone.lock() = Some(heap_clone.collect());
            }
        }));

        heap.collect();

        assert_eq!(*nested.lock(), Some(CollectOutcome::Deferred));
        // The deferred request ran as exactly one follow-up cycle
        assert_eq!(begins.load(Ordering::SeqCst), 2);
        assert_eq!(heap.stats().collections, 2);
        assert!(!heap.is_collecting());
    }

    #[test]
    fn test_request_during_follow_up_cycle_is_served() {
        let heap = GuestHeap::new(0);
        let begins = Arc::new(AtomicUsize::new(0));
        let nested = Arc::new(Mutex::new(Vec::new()));

        let heap_clone = heap.clone();
        let begins_clone = begins.clone();
        let nested_clone = nested.clone();
        heap.add_gc_callback(Arc::new(move |status: GcStatus| {
            // Ask again in the first cycle and in its follow-up
            if status == GcStatus::Begin && begins_clone.fetch_add(1, Ordering::SeqCst) < 2 {
                nested_clone.lock().push(heap_clone.collect());
            }
        }));

        let outcome = heap.collect();

        assert!(matches!(outcome, CollectOutcome::Completed { .. }));
        assert_eq!(*nested.lock(), vec![CollectOutcome::Deferred; 2]);
        assert_eq!(begins.load(Ordering::SeqCst), 3);
        assert_eq!(heap.stats().collections, 3);
        assert!(!heap.is_collecting());
    }

    #[test]
    fn test_collect_from_other_thread_waits_and_runs() {
        let heap = GuestHeap::new(0);
        let (entered_tx, entered_rx) = std::sync::mpsc::channel::<()>();
        let (resume_tx, resume_rx) = std::sync::mpsc::channel::<()>();
        let resume_rx = Mutex::new(resume_rx);
        let first = AtomicBool::new(true);

        heap.add_gc_callback(Arc::new(move |status: GcStatus| {
            // Hold the first cycle open until the other thread has asked
            if status == GcStatus::Begin && first.swap(false, Ordering::SeqCst) {
                let _ = entered_tx.send(());
                let _ = resume_rx.lock().recv();
            }
        }));

        std::thread::scope(|scope| {
            let collecting = scope.spawn(|| heap.collect());
            entered_rx.recv().unwrap();
            assert!(heap.is_collecting());

            let waiting = scope.spawn(|| heap.collect());

            // Give the second caller time to block on the running cycle
            std::thread::sleep(std::time::Duration::from_millis(50));
            assert!(!waiting.is_finished());
            resume_tx.send(()).unwrap();

            assert!(matches!(collecting.join().unwrap(), CollectOutcome::Completed { .. }));
            assert!(matches!(waiting.join().unwrap(), CollectOutcome::Completed { .. }));
        });

        assert_eq!(heap.stats().collections, 2);
        assert!(!heap.is_collecting());
    }

    #[test]
    fn test_threshold_triggers_collection() {
        let heap = GuestHeap::new(3);
        for i in 0..3 {
            heap.alloc(GuestValue::Number(i as f64)).unwrap();
        }
        assert_eq!(heap.stats().collections, 0);

        heap.alloc(GuestValue::Undefined).unwrap();
        assert_eq!(heap.stats().collections, 1);
        assert_eq!(heap.stats().live, 1);
    }

    #[test]
    fn test_shutdown_refuses_allocation() {
        let heap = GuestHeap::new(0);
        let handle = heap.alloc_pinned(GuestValue::Undefined).unwrap();
        heap.shutdown();
        heap.shutdown();

        assert!(heap.is_shut_down());
        assert!(matches!(
            heap.alloc(GuestValue::Undefined),
            Err(BridgeError::ShutDown)
        ));
        assert_eq!(heap.collect(), CollectOutcome::ShutDown);

        // Releasing after shutdown is harmless
        handle.release();
    }
}
