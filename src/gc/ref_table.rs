//! Cross-runtime reference tracking.
//!
//! Maps each tracked host object to the guest values it keeps alive. The
//! table holds exactly one reference on every tracked host object and one
//! clone of every guest handle it lists; it never touches host refcounts in
//! any other way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::error::BridgeError;
use crate::guest::{GuestHeap, GuestValueHandle, ValueId};
use crate::host::{HostHandle, HostId};

pub(super) struct Entry {
    pub(super) host: HostHandle,
    pub(super) guests: Vec<GuestValueHandle>,
}

/// Host object → guest values it keeps pinned.
///
/// Registration is additive: registering the same pair twice stores the
/// handle twice. Entries are only ever removed by the collection scan.
#[derive(Default)]
pub struct RefTrackingTable {
    pub(super) entries: HashMap<HostId, Entry>,
    pub(super) fan_out: usize,
}

impl RefTrackingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `host` keeps `guest` alive.
    pub fn register(&mut self, host: HostHandle, guest: GuestValueHandle) {
        let entry = self.entries.entry(host.id()).or_insert_with(|| Entry {
            host,
            guests: Vec::with_capacity(1),
        });

        entry.guests.push(guest);
        self.fan_out += 1;
    }

    /// Number of tracked host objects.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of guest handles listed across all entries.
    pub fn fan_out(&self) -> usize {
        self.fan_out
    }

    pub fn contains_host(&self, host: &HostHandle) -> bool {
        self.entries.contains_key(&host.id())
    }

    /// Guest handles counted entry by entry; always equals [`fan_out`].
    ///
    /// [`fan_out`]: RefTrackingTable::fan_out
    pub fn listed_handles(&self) -> usize {
        self.entries.values().map(|entry| entry.guests.len()).sum()
    }

    /// Guest handles listed by `host`'s entry (duplicates included).
    pub fn guest_count(&self, host: &HostHandle) -> usize {
        self.entries
            .get(&host.id())
            .map(|entry| entry.guests.len())
            .unwrap_or(0)
    }

    /// Number of entries listing `guest`.
    pub fn references(&self, guest: &GuestValueHandle) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.guests.iter().any(|g| g.ptr_eq(guest)))
            .count()
    }

    /// Empty the table, handing every entry to the caller.
    fn take(&mut self) -> HashMap<HostId, Entry> {
        self.fan_out = 0;
        std::mem::take(&mut self.entries)
    }
}

impl std::fmt::Debug for RefTrackingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefTrackingTable")
            .field("entries", &self.entries.len())
            .field("fan_out", &self.fan_out)
            .finish()
    }
}

/// Lock-guarded tracking service shared by registration and collection.
///
/// One coarse lock covers the whole table: registration and the collection
/// scan never interleave.
pub struct RefTracker {
    table: Mutex<RefTrackingTable>,
    heap: GuestHeap,
    fan_out_warning: usize,
    warned: AtomicBool,
    torn_down: AtomicBool,
}

impl RefTracker {
    pub fn new(heap: GuestHeap, fan_out_warning: usize) -> Self {
        Self {
            table: Mutex::new(RefTrackingTable::new()),
            heap,
            fan_out_warning,
            warned: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Record that `host` keeps `guest` alive until a collection cycle finds
    /// `host` collectible.
    pub fn register(&self, host: HostHandle, guest: GuestValueHandle) -> Result<(), BridgeError> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(BridgeError::ShutDown);
        }

        // A released handle would only be noticed by the collector much later
        if guest.is_released() {
            return Err(BridgeError::InvariantViolation(format!(
                "cannot track already released guest handle {:?}",
                guest
            )));
        }

        let fan_out = {
            let mut table = self.table.lock();
            table.register(host, guest);
            table.fan_out
        };

        if self.fan_out_warning > 0
            && fan_out >= self.fan_out_warning
            && !self.warned.swap(true, Ordering::AcqRel)
        {
            tracing::warn!(
                "Cross-runtime reference table tracks {} guest handles; each collection cycle scans all of them",
                fan_out
            );
        }

        Ok(())
    }

    /// Pin `value` and register the new handle for `host`.
    ///
    /// The returned handle may be registered for other host objects too; it
    /// stays pinned until none of them is alive.
    pub fn register_value(
        &self,
        host: HostHandle,
        value: ValueId,
    ) -> Result<GuestValueHandle, BridgeError> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(BridgeError::ShutDown);
        }

        let guest = self.heap.persist(value)?;
        self.register(host, guest.clone())?;
        Ok(guest)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RefTrackingTable> {
        self.table.lock()
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    pub fn fan_out(&self) -> usize {
        self.table.lock().fan_out()
    }

    pub fn contains_host(&self, host: &HostHandle) -> bool {
        self.table.lock().contains_host(host)
    }

    /// `(fan_out, listed_handles)` read under one lock.
    pub fn fan_out_and_listed(&self) -> (usize, usize) {
        let table = self.table.lock();
        (table.fan_out(), table.listed_handles())
    }

    pub fn references(&self, guest: &GuestValueHandle) -> usize {
        self.table.lock().references(guest)
    }

    /// Release every pin and refuse further registrations. Idempotent.
    ///
    /// Pins are released and host objects dropped after the table lock is
    /// released, so host destructors may query the tracker.
    pub fn teardown(&self) -> usize {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let entries = self.table.lock().take();
        let count = entries.len();

        let mut released = 0;
        for entry in entries.values() {
            for guest in &entry.guests {
                if guest.release() {
                    released += 1;
                }
            }
        }
        drop(entries);

        tracing::debug!(
            "Reference table torn down ({} entries, {} pins released)",
            count,
            released
        );

        released
    }
}

impl std::fmt::Debug for RefTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefTracker")
            .field("table", &*self.table.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::GuestValue;
    use crate::host::{HostCell, HostObject};
    use std::sync::Arc;

    /// Reads the tracker from its destructor.
    struct TrackerReader {
        tracker: Mutex<Option<Arc<RefTracker>>>,
        seen: Arc<Mutex<Option<usize>>>,
    }

    impl HostObject for TrackerReader {}

    impl Drop for TrackerReader {
        fn drop(&mut self) {
            if let Some(tracker) = self.tracker.lock().take() {
                *self.seen.lock() = Some(tracker.len());
            }
        }
    }

    #[test]
    fn test_register_creates_entry() {
        let heap = GuestHeap::new(0);
        let mut table = RefTrackingTable::new();
        let host = HostHandle::new(HostCell::new(()));
        let guest = heap.alloc_pinned(GuestValue::Number(1.0)).unwrap();

        assert!(!table.contains_host(&host));
        table.register(host.clone(), guest.clone());

        assert!(table.contains_host(&host));
        assert_eq!(table.len(), 1);
        assert_eq!(table.guest_count(&host), 1);
        assert_eq!(table.references(&guest), 1);
    }

    #[test]
    fn test_duplicate_registration_is_stored() {
        let heap = GuestHeap::new(0);
        let mut table = RefTrackingTable::new();
        let host = HostHandle::new(HostCell::new(()));
        let guest = heap.alloc_pinned(GuestValue::Number(1.0)).unwrap();

        table.register(host.clone(), guest.clone());
        table.register(host.clone(), guest.clone());

        assert_eq!(table.len(), 1);
        assert_eq!(table.guest_count(&host), 2);
        assert_eq!(table.fan_out(), 2);
        assert_eq!(table.listed_handles(), 2);
        // Still one entry listing it
        assert_eq!(table.references(&guest), 1);
    }

    #[test]
    fn test_table_holds_one_host_reference() {
        let heap = GuestHeap::new(0);
        let mut table = RefTrackingTable::new();
        let cell = HostCell::new(5u8);
        let guest = heap.alloc_pinned(GuestValue::Undefined).unwrap();

        table.register(HostHandle::new(cell.clone()), guest.clone());
        table.register(HostHandle::new(cell.clone()), guest);

        // `cell` + the table's single clone
        assert_eq!(std::sync::Arc::strong_count(&cell), 2);
    }

    #[test]
    fn test_register_value_pins() {
        let heap = GuestHeap::new(0);
        let tracker = RefTracker::new(heap.clone(), 0);
        let host = HostHandle::new(HostCell::new(()));
        let id = heap.alloc(GuestValue::String("s".into())).unwrap();

        let handle = tracker.register_value(host.clone(), id).unwrap();
        assert_eq!(heap.pin_count(id), 1);
        assert_eq!(tracker.references(&handle), 1);

        heap.collect();
        assert!(heap.is_alive(id));
    }

    #[test]
    fn test_register_value_rejects_dead_value() {
        let heap = GuestHeap::new(0);
        let tracker = RefTracker::new(heap.clone(), 0);
        let id = heap.alloc(GuestValue::Undefined).unwrap();
        heap.collect();

        let result = tracker.register_value(HostHandle::new(HostCell::new(())), id);
        assert!(matches!(result, Err(BridgeError::InvariantViolation(_))));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_teardown_releases_each_pin_once() {
        let heap = GuestHeap::new(0);
        let tracker = RefTracker::new(heap.clone(), 0);
        let shared = heap.alloc_pinned(GuestValue::object()).unwrap();

        for _ in 0..3 {
            tracker
                .register(HostHandle::new(HostCell::new(())), shared.clone())
                .unwrap();
        }

        assert_eq!(tracker.teardown(), 1);
        assert_eq!(tracker.teardown(), 0);
        assert!(tracker.is_empty());
        assert_eq!(heap.pin_count(shared.id()), 0);

        let late = tracker.register(HostHandle::new(HostCell::new(())), shared);
        assert!(matches!(late, Err(BridgeError::ShutDown)));
    }

    #[test]
    fn test_register_rejects_released_handle() {
        let heap = GuestHeap::new(0);
        let tracker = RefTracker::new(heap.clone(), 0);
        let guest = heap.alloc_pinned(GuestValue::Undefined).unwrap();
        assert!(guest.release());

        let result = tracker.register(HostHandle::new(HostCell::new(())), guest.clone());
        assert!(matches!(result, Err(BridgeError::InvariantViolation(_))));
        assert!(tracker.is_empty());
        assert_eq!(tracker.fan_out(), 0);

        // Nothing was tracked, so a teardown has nothing to release
        assert_eq!(tracker.teardown(), 0);
    }

    #[test]
    fn test_teardown_drops_hosts_outside_table_lock() {
        let heap = GuestHeap::new(0);
        let tracker = Arc::new(RefTracker::new(heap.clone(), 0));
        let seen = Arc::new(Mutex::new(None));
        let guest = heap.alloc_pinned(GuestValue::object()).unwrap();

        let host = Arc::new(TrackerReader {
            tracker: Mutex::new(Some(tracker.clone())),
            seen: seen.clone(),
        });
        tracker.register(HostHandle::new(host), guest.clone()).unwrap();

        // The only host reference left is the table's
        assert_eq!(tracker.teardown(), 1);

        assert_eq!(*seen.lock(), Some(0));
        assert!(guest.is_released());
        assert_eq!(Arc::strong_count(&tracker), 1);
    }
}
