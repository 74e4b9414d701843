use std::sync::Arc;

use super::counter::{CounterName, CounterSet, COUNTER_COUNT};
use super::event::{EventRecord, EventType, EVENT_TYPE_COUNT};
use super::queue::EventQueue;
use crate::kernel::processor::ProcessorUuid;
use crate::memory::speculation_barrier;

/// Result of adding or removing one subscriber's bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListChange {
    /// Bits whose membership actually changed.
    pub changed: u64,
    /// Bits whose list went from empty to non-empty, or back.
    pub transitions: u64,
}

/// Subscriber lists of one collector, indexed by event type and counter.
///
/// Guarded by the collector's subscription lock. `record` and `increment`
/// need only the read side.
#[derive(Debug)]
pub struct CollectorTools {
    queues: Vec<Vec<Arc<EventQueue>>>,
    counters: Vec<Vec<Arc<CounterSet>>>,
}

impl Default for CollectorTools {
    fn default() -> Self {
        Self {
            queues: vec![Vec::new(); EVENT_TYPE_COUNT],
            counters: vec![Vec::new(); COUNTER_COUNT],
        }
    }
}

impl CollectorTools {
    pub fn is_event_enabled(&self, ty: EventType) -> bool {
        !self.queues[ty.index()].is_empty()
    }

    pub fn is_counter_enabled(&self, name: CounterName) -> bool {
        !self.counters[name.index()].is_empty()
    }

    pub fn any_enabled(&self) -> bool {
        self.queues.iter().any(|l| !l.is_empty()) || self.counters.iter().any(|l| !l.is_empty())
    }

    pub fn fault_callback_needed(&self) -> bool {
        self.is_event_enabled(EventType::CpuFault)
            || self.is_event_enabled(EventType::GpuFault)
            || self.is_counter_enabled(CounterName::CpuPageFaultCount)
            || self.is_counter_enabled(CounterName::GpuPageFaultCount)
    }

    pub fn migration_callback_needed(&self) -> bool {
        self.is_event_enabled(EventType::Migration)
            || self.is_event_enabled(EventType::ReadDuplicate)
            || self.is_counter_enabled(CounterName::BytesXferDtH)
            || self.is_counter_enabled(CounterName::BytesXferHtD)
    }

    /// Fans `event` out to every queue subscribed to its type.
    pub fn record(&self, event: &EventRecord) {
        for queue in &self.queues[event.event_type().index()] {
            queue.enqueue(event);
        }
    }

    /// Adds `amount` to every counter subscriber whose scope covers `processor`.
    pub fn increment(&self, name: CounterName, amount: u64, processor: &ProcessorUuid) {
        if amount == 0 {
            return;
        }
        speculation_barrier();
        for counters in &self.counters[name.index()] {
            counters.add(name, amount, processor);
        }
    }

    pub(crate) fn insert_queue(&mut self, queue: &Arc<EventQueue>, bits: u64) -> ListChange {
        let change = insert(&mut self.queues, queue, queue.subscribed(), bits);
        queue.set_subscribed(queue.subscribed() | change.changed);
        change
    }

    pub(crate) fn remove_queue(&mut self, queue: &Arc<EventQueue>, bits: u64) -> ListChange {
        let change = remove(&mut self.queues, queue, queue.subscribed(), bits);
        queue.set_subscribed(queue.subscribed() & !change.changed);
        change
    }

    pub(crate) fn insert_counters(&mut self, counters: &Arc<CounterSet>, bits: u64) -> ListChange {
        let change = insert(&mut self.counters, counters, counters.subscribed(), bits);
        counters.set_subscribed(counters.subscribed() | change.changed);
        change
    }

    pub(crate) fn remove_counters(&mut self, counters: &Arc<CounterSet>, bits: u64) -> ListChange {
        let change = remove(&mut self.counters, counters, counters.subscribed(), bits);
        counters.set_subscribed(counters.subscribed() & !change.changed);
        change
    }
}

fn set_bits(bits: u64, len: usize) -> impl Iterator<Item = usize> {
    (0..len).filter(move |i| bits & (1u64 << i) != 0)
}

fn insert<T>(lists: &mut [Vec<Arc<T>>], item: &Arc<T>, subscribed: u64, bits: u64) -> ListChange {
    let mut change = ListChange::default();
    for i in set_bits(bits & !subscribed, lists.len()) {
        let list = &mut lists[i];
        assert!(
            !list.iter().any(|s| Arc::ptr_eq(s, item)),
            "subscriber listed twice for index {i}"
        );
        if list.is_empty() {
            change.transitions |= 1u64 << i;
        }
        list.push(item.clone());
        change.changed |= 1u64 << i;
    }
    change
}

fn remove<T>(lists: &mut [Vec<Arc<T>>], item: &Arc<T>, subscribed: u64, bits: u64) -> ListChange {
    let mut change = ListChange::default();
    for i in set_bits(bits & subscribed, lists.len()) {
        let list = &mut lists[i];
        let before = list.len();
        list.retain(|s| !Arc::ptr_eq(s, item));
        assert_eq!(list.len() + 1, before, "subscriber missing from list {i}");
        if list.is_empty() {
            change.transitions |= 1u64 << i;
        }
        change.changed |= 1u64 << i;
    }
    change
}
