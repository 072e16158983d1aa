//! Collection-cycle coordination.
//!
//! Hooked on the guest collector's `Begin` phase. Finds tracked host objects
//! nobody but the table still references, drops their entries and releases
//! the guest pins no surviving entry lists, so the sweep that follows can
//! reclaim those guest values in the same cycle.
//!
//! ```text
//!   guest GC ──Begin──► GcCycleCoordinator::scan
//!                          │  (tracker lock held for the whole scan)
//!                          ├─ collectible = finalized || refcount == 1
//!                          ├─ surviving   = handles listed by kept entries
//!                          └─ release(removed handles ∖ surviving)
//!   guest GC ──sweep──► unpinned values reclaimed
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::ref_table::{Entry, RefTracker};
use crate::error::invariant_violation;
use crate::guest::{GcCallbackId, GcStatus, GuestContext};
use crate::host::HostId;

/// Outcome of one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Entries inspected.
    pub scanned: usize,
    /// Entries removed because their host object was collectible.
    pub pruned: usize,
    /// Guest pins released.
    pub released: usize,
    /// Handles of removed entries kept pinned because a surviving entry
    /// still lists them.
    pub retained: usize,
}

pub struct GcCycleCoordinator {
    tracker: Arc<RefTracker>,
    scanning: AtomicBool,
    scans: AtomicU64,
    last_report: Mutex<Option<GcReport>>,
}

impl GcCycleCoordinator {
    pub fn new(tracker: Arc<RefTracker>) -> Arc<Self> {
        Arc::new(Self {
            tracker,
            scanning: AtomicBool::new(false),
            scans: AtomicU64::new(0),
            last_report: Mutex::new(None),
        })
    }

    pub fn tracker(&self) -> &Arc<RefTracker> {
        &self.tracker
    }

    /// Register the scan as a collection callback on `cx`.
    ///
    /// The callback only holds a weak reference; once the coordinator is
    /// dropped it does nothing.
    pub fn install(self: &Arc<Self>, cx: &GuestContext) -> GcCallbackId {
        let coordinator: Weak<Self> = Arc::downgrade(self);

        cx.add_gc_callback(Arc::new(move |status: GcStatus| {
            if status != GcStatus::Begin {
                return;
            }

            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.scan();
            }
        }))
    }

    /// Prune collectible entries and release the pins only they held.
    ///
    /// Returns `None` if a scan is already in progress.
    pub fn scan(&self) -> Option<GcReport> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Reference scan already in progress, skipping");
            return None;
        }

        let _guard = ScanGuard(&self.scanning);

        let (report, removed) = {
            let mut table = self.tracker.lock();

            let scanned = table.entries.len();
            let collectible: Vec<HostId> = table
                .entries
                .iter()
                .filter(|(_, entry)| entry.host.is_finalized() || entry.host.refcount() == 1)
                .map(|(id, _)| *id)
                .collect();

            let removed: Vec<Entry> = collectible
                .iter()
                .filter_map(|id| table.entries.remove(id))
                .collect();

            let surviving: HashSet<usize> = table
                .entries
                .values()
                .flat_map(|entry| entry.guests.iter().map(|guest| guest.key()))
                .collect();

            let mut seen = HashSet::new();
            let mut report = GcReport {
                scanned,
                pruned: removed.len(),
                ..GcReport::default()
            };

            for entry in &removed {
                table.fan_out -= entry.guests.len();

                for guest in &entry.guests {
                    if !seen.insert(guest.key()) {
                        continue;
                    }

                    if surviving.contains(&guest.key()) {
                        report.retained += 1;
                        continue;
                    }

                    if guest.release() {
                        report.released += 1;
                    } else {
                        // Leave the value alone: it is already unpinned
                        let _ = invariant_violation(format!(
                            "tracked guest handle {:?} was released outside the collector",
                            guest
                        ));
                    }
                }
            }

            (report, removed)
        };

        // Host destructors run outside the tracker lock. The host lock is not
        // taken either: a loop task holding it may itself be waiting on this
        // cycle.
        drop(removed);

        let scans = self.scans.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(
            "Reference scan #{}: scanned {}, pruned {}, released {}, retained {}",
            scans,
            report.scanned,
            report.pruned,
            report.released,
            report.retained
        );

        *self.last_report.lock() = Some(report);
        Some(report)
    }

    pub fn last_report(&self) -> Option<GcReport> {
        *self.last_report.lock()
    }

    /// Number of scans completed.
    pub fn scans(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for GcCycleCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcCycleCoordinator")
            .field("scans", &self.scans())
            .field("last_report", &self.last_report())
            .finish()
    }
}

struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
