use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::collector::Collector;
use super::perf::{PerfCallback, PerfEventKind, PerfEventTable};
use super::telemetry::counter::{CounterSet, COUNTER_COUNT};
use super::telemetry::event::{EventRecord, EventType, EVENT_TYPE_COUNT};
use super::telemetry::queue::EventQueue;
use super::telemetry::recorder::{CollectorTools, ListChange};
use crate::error::TrackerError;

/// Owner tag of the callbacks the tools core registers.
pub const TOOLS_CALLBACK_OWNER: &str = "tools";

/// A tracker's side of a subscription.
#[derive(Debug, Clone, Copy)]
pub enum Subscriber<'a> {
    Queue(&'a Arc<EventQueue>),
    Counter(&'a Arc<CounterSet>),
}

impl Subscriber<'_> {
    fn insert(self, tools: &mut CollectorTools, bits: u64) -> ListChange {
        match self {
            Subscriber::Queue(q) => tools.insert_queue(q, bits),
            Subscriber::Counter(c) => tools.insert_counters(c, bits),
        }
    }

    fn remove(self, tools: &mut CollectorTools, bits: u64) -> ListChange {
        match self {
            Subscriber::Queue(q) => tools.remove_queue(q, bits),
            Subscriber::Counter(c) => tools.remove_counters(c, bits),
        }
    }
}

/// The fault and migration callbacks installed on collectors that need them.
pub struct ToolsCallbacks {
    pub(crate) fault: PerfCallback,
    pub(crate) migration: PerfCallback,
}

impl ToolsCallbacks {
    fn sync_one(
        table: &mut PerfEventTable,
        kind: PerfEventKind,
        needed: bool,
        callback: &PerfCallback,
    ) -> Result<(), TrackerError> {
        let registered = table.is_registered(kind, TOOLS_CALLBACK_OWNER);
        if needed && !registered {
            table.register(kind, TOOLS_CALLBACK_OWNER, callback.clone())?;
        } else if !needed && registered {
            table.unregister(kind, TOOLS_CALLBACK_OWNER);
        }
        Ok(())
    }

    fn sync(&self, table: &mut PerfEventTable, tools: &CollectorTools) -> Result<(), TrackerError> {
        Self::sync_one(table, PerfEventKind::Fault, tools.fault_callback_needed(), &self.fault)?;
        Self::sync_one(
            table,
            PerfEventKind::Migration,
            tools.migration_callback_needed(),
            &self.migration,
        )
    }
}

impl std::fmt::Debug for ToolsCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolsCallbacks").finish_non_exhaustive()
    }
}

/// State behind the global active-collector lock.
#[derive(Debug)]
pub struct GlobalTools {
    collectors: Vec<Arc<Collector>>,
    enabled_events: [u32; EVENT_TYPE_COUNT],
    enabled_counters: [u32; COUNTER_COUNT],
}

impl Default for GlobalTools {
    fn default() -> Self {
        Self {
            collectors: Vec::new(),
            enabled_events: [0; EVENT_TYPE_COUNT],
            enabled_counters: [0; COUNTER_COUNT],
        }
    }
}

impl GlobalTools {
    pub fn collectors(&self) -> &[Arc<Collector>] {
        &self.collectors
    }

    pub fn enabled_events(&self) -> &[u32; EVENT_TYPE_COUNT] {
        &self.enabled_events
    }

    pub fn enabled_counters(&self) -> &[u32; COUNTER_COUNT] {
        &self.enabled_counters
    }

    fn counts_for(&mut self, subscriber: Subscriber<'_>) -> &mut [u32] {
        match subscriber {
            Subscriber::Queue(_) => &mut self.enabled_events,
            Subscriber::Counter(_) => &mut self.enabled_counters,
        }
    }

    fn count_enabled(&mut self, subscriber: Subscriber<'_>, transitions: u64) {
        let counts = self.counts_for(subscriber);
        for (i, count) in counts.iter_mut().enumerate() {
            if transitions & (1u64 << i) != 0 {
                *count += 1;
            }
        }
    }

    fn count_disabled(&mut self, subscriber: Subscriber<'_>, transitions: u64) {
        let counts = self.counts_for(subscriber);
        for (i, count) in counts.iter_mut().enumerate() {
            if transitions & (1u64 << i) != 0 {
                assert!(*count > 0, "enabled count underflow at index {i}");
                *count -= 1;
            }
        }
    }

    /// Brings callbacks and active-list membership in line with `tools`.
    fn update_status(
        &mut self,
        collector: &Arc<Collector>,
        table: &mut PerfEventTable,
        tools: &CollectorTools,
        callbacks: &ToolsCallbacks,
    ) -> Result<(), TrackerError> {
        callbacks.sync(table, tools)?;

        let should_be_enabled = tools.any_enabled();
        if should_be_enabled != collector.is_enabled() {
            if should_be_enabled {
                self.collectors.push(collector.clone());
            } else {
                self.collectors.retain(|c| !Arc::ptr_eq(c, collector));
            }
            collector.set_enabled(should_be_enabled);
            debug!(collector = collector.id().0, enabled = should_be_enabled, "collector status changed");
        }
        Ok(())
    }
}

/// Global subscription bookkeeping.
///
/// Lock order: global lock, then a collector's callback table, then its
/// subscription lock.
#[derive(Debug, Default)]
pub struct Registry {
    global: RwLock<GlobalTools>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_event_enabled_anywhere(&self, ty: EventType) -> bool {
        self.global.read().enabled_events[ty.index()] != 0
    }

    /// Records `event` into every active collector.
    pub fn broadcast(&self, event: &EventRecord) {
        let global = self.global.read();
        for collector in &global.collectors {
            collector.tools.read().record(event);
        }
    }

    pub fn with_global<R>(&self, f: impl FnOnce(&GlobalTools) -> R) -> R {
        f(&self.global.read())
    }

    /// Subscribes `subscriber` to `bits` on `collector`.
    ///
    /// Bits already subscribed are left alone. On callback registration
    /// failure every list, count and registration is restored.
    pub(crate) fn subscribe(
        &self,
        collector: &Arc<Collector>,
        subscriber: Subscriber<'_>,
        bits: u64,
        callbacks: &ToolsCallbacks,
    ) -> Result<(), TrackerError> {
        let mut global = self.global.write();
        let mut table = collector.perf_events.write();
        let mut tools = collector.tools.write();

        let change = subscriber.insert(&mut tools, bits);
        global.count_enabled(subscriber, change.transitions);

        if let Err(err) = global.update_status(collector, &mut table, &tools, callbacks) {
            let undo = subscriber.remove(&mut tools, change.changed);
            global.count_disabled(subscriber, undo.transitions);
            let restored = global.update_status(collector, &mut table, &tools, callbacks);
            assert!(restored.is_ok(), "rolling back a subscription cannot register callbacks");
            return Err(err);
        }
        Ok(())
    }

    /// Mirror of `subscribe`. Never fails.
    pub(crate) fn unsubscribe(
        &self,
        collector: &Arc<Collector>,
        subscriber: Subscriber<'_>,
        bits: u64,
        callbacks: &ToolsCallbacks,
    ) {
        let mut global = self.global.write();
        let mut table = collector.perf_events.write();
        let mut tools = collector.tools.write();

        let change = subscriber.remove(&mut tools, bits);
        global.count_disabled(subscriber, change.transitions);

        let status = global.update_status(collector, &mut table, &tools, callbacks);
        assert!(status.is_ok(), "unsubscribing cannot fail");
    }
}
