use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};

use super::perf::{PerfCallback, PerfEvent, PerfEventKind, PerfEventTable};
use super::telemetry::recorder::CollectorTools;
use crate::error::TrackerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectorId(pub u64);

/// Tracing state of one monitored address space.
///
/// Lock order inside a collector: `perf_events` before `tools`. Both nest
/// inside the registry's global lock.
#[derive(Debug)]
pub struct Collector {
    id: CollectorId,
    // True exactly while listed in the registry; flipped under the global lock.
    enabled: AtomicBool,
    pub(crate) perf_events: RwLock<PerfEventTable>,
    pub(crate) tools: RwLock<CollectorTools>,
}

impl Collector {
    pub(crate) fn new(id: CollectorId, max_perf_callbacks: usize) -> Self {
        Self {
            id,
            enabled: AtomicBool::new(false),
            perf_events: RwLock::new(PerfEventTable::new(max_perf_callbacks)),
            tools: RwLock::new(CollectorTools::default()),
        }
    }

    pub fn id(&self) -> CollectorId {
        self.id
    }

    /// Whether any tracker is subscribed to anything here. A cheap,
    /// lock-free early-out for producers.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Shared access to the subscriber lists, as `record` requires.
    pub fn tools(&self) -> RwLockReadGuard<'_, CollectorTools> {
        self.tools.read()
    }

    /// Registers a callback for other driver components.
    pub fn register_perf_callback(
        &self,
        kind: PerfEventKind,
        owner: &'static str,
        callback: PerfCallback,
    ) -> Result<(), TrackerError> {
        self.perf_events.write().register(kind, owner, callback)
    }

    pub fn unregister_perf_callback(&self, kind: PerfEventKind, owner: &'static str) -> bool {
        self.perf_events.write().unregister(kind, owner)
    }

    pub fn is_perf_callback_registered(&self, kind: PerfEventKind, owner: &'static str) -> bool {
        self.perf_events.read().is_registered(kind, owner)
    }

    /// Delivers a producer event to every callback registered for its kind.
    pub fn notify(self: &Arc<Self>, event: &mut PerfEvent<'_>) {
        let table = self.perf_events.read();
        for callback in table.callbacks(event.kind()) {
            callback(self, event);
        }
    }
}
