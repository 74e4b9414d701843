use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::collector::Collector;
use super::registry::Subscriber;
use super::service::ToolsService;
use super::telemetry::counter::{CounterMask, CounterScope, CounterSet, COUNTER_BYTES};
use super::telemetry::event::{EventMask, RECORD_BYTES};
use super::telemetry::queue::{EventQueue, CONTROL_BYTES};
use crate::error::TrackerError;
use crate::memory::{BufferDescriptor, UserAddressSpace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueAttach {
    pub events: u64,
    pub control: BufferDescriptor,
    pub records: BufferDescriptor,
    /// Slots in the record buffer; a power of two.
    pub capacity: u32,
    /// Defaults to half the capacity.
    pub notification_threshold: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterAttach {
    pub counters: u64,
    pub values: BufferDescriptor,
    pub scope: CounterScope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachRequest {
    Queue(QueueAttach),
    Counter(CounterAttach),
}

#[derive(Debug, Clone)]
pub enum Tracker {
    Queue(Arc<EventQueue>),
    Counter(Arc<CounterSet>),
}

impl Tracker {
    fn subscriber(&self) -> Subscriber<'_> {
        match self {
            Tracker::Queue(q) => Subscriber::Queue(q),
            Tracker::Counter(c) => Subscriber::Counter(c),
        }
    }

    fn subscribed(&self) -> u64 {
        match self {
            Tracker::Queue(q) => q.subscribed(),
            Tracker::Counter(c) => c.subscribed(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Tracker::Queue(_) => "queue",
            Tracker::Counter(_) => "counter",
        }
    }
}

impl BufferDescriptor {
    fn require(self, needed: u64) -> Result<Self, TrackerError> {
        if self.len < needed {
            return Err(TrackerError::BufferTooSmall {
                va: self.va,
                len: self.len,
                needed,
            });
        }
        Ok(self)
    }
}

pub(crate) fn attach(
    service: &Arc<ToolsService>,
    collector: &Arc<Collector>,
    consumer: &UserAddressSpace,
    request: AttachRequest,
) -> Result<TrackerHandle, TrackerError> {
    let max_pages = service.config.max_page_count;

    let (tracker, bits) = match request {
        AttachRequest::Queue(req) => {
            let mask = EventMask::validate(req.events, service.config.enable_builtin_tests)?;
            if req.capacity < 2 || !req.capacity.is_power_of_two() {
                return Err(TrackerError::InvalidCapacity(req.capacity));
            }
            if let Some(threshold) = req.notification_threshold {
                if threshold > req.capacity {
                    return Err(TrackerError::InvalidThreshold {
                        threshold,
                        capacity: req.capacity,
                    });
                }
            }

            let records_len = req.capacity as u64 * RECORD_BYTES as u64;
            let records = req.records.require(records_len)?;
            let records = consumer.pin(BufferDescriptor::new(records.va, records_len), max_pages)?;
            let control = req.control.require(CONTROL_BYTES)?;
            let control = consumer.pin(BufferDescriptor::new(control.va, CONTROL_BYTES), max_pages)?;

            let queue = EventQueue::new(control, records, req.capacity)?;
            if let Some(threshold) = req.notification_threshold {
                queue.set_threshold(threshold)?;
            }
            (Tracker::Queue(Arc::new(queue)), mask.bits())
        }
        AttachRequest::Counter(req) => {
            let mask = CounterMask::validate(req.counters)?;
            let values = req.values.require(COUNTER_BYTES)?;
            let values = consumer.pin(BufferDescriptor::new(values.va, COUNTER_BYTES), max_pages)?;
            (
                Tracker::Counter(Arc::new(CounterSet::new(values, req.scope)?)),
                mask.bits(),
            )
        }
    };

    service
        .registry
        .subscribe(collector, tracker.subscriber(), bits, &service.callbacks)?;

    info!(
        collector = collector.id().0,
        kind = tracker.kind(),
        mask = bits,
        "tracker attached"
    );

    Ok(TrackerHandle {
        service: service.clone(),
        collector: collector.clone(),
        tracker,
        detached: false,
    })
}

/// An attached tracker. Detaches on `close` or drop, exactly once.
#[derive(Debug)]
pub struct TrackerHandle {
    service: Arc<ToolsService>,
    collector: Arc<Collector>,
    tracker: Tracker,
    detached: bool,
}

impl TrackerHandle {
    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    pub fn queue(&self) -> Option<&Arc<EventQueue>> {
        match &self.tracker {
            Tracker::Queue(q) => Some(q),
            Tracker::Counter(_) => None,
        }
    }

    pub fn counters(&self) -> Option<&Arc<CounterSet>> {
        match &self.tracker {
            Tracker::Counter(c) => Some(c),
            Tracker::Queue(_) => None,
        }
    }

    /// Bits currently subscribed, events or counters depending on the kind.
    pub fn subscribed(&self) -> u64 {
        self.tracker.subscribed()
    }

    fn validate(&self, bits: u64) -> Result<u64, TrackerError> {
        match self.tracker {
            Tracker::Queue(_) => {
                EventMask::validate(bits, self.service.config.enable_builtin_tests).map(EventMask::bits)
            }
            Tracker::Counter(_) => CounterMask::validate(bits).map(CounterMask::bits),
        }
    }

    /// Subscribes additional bits. Already subscribed ones are left alone.
    pub fn enable(&self, bits: u64) -> Result<(), TrackerError> {
        let bits = self.validate(bits)?;
        self.service.registry.subscribe(
            &self.collector,
            self.tracker.subscriber(),
            bits,
            &self.service.callbacks,
        )
    }

    pub fn disable(&self, bits: u64) -> Result<(), TrackerError> {
        let bits = self.validate(bits)?;
        self.service.registry.unsubscribe(
            &self.collector,
            self.tracker.subscriber(),
            bits,
            &self.service.callbacks,
        );
        Ok(())
    }

    pub fn set_notification_threshold(&self, threshold: u32) -> Result<(), TrackerError> {
        match &self.tracker {
            Tracker::Queue(q) => q.set_threshold(threshold),
            Tracker::Counter(_) => Err(TrackerError::WrongTrackerKind { expected: "queue" }),
        }
    }

    /// Waits until the queue holds at least its threshold of unread records.
    pub async fn wait_for_events(&self) -> Result<(), TrackerError> {
        match &self.tracker {
            Tracker::Queue(q) => {
                q.wait_ready().await;
                Ok(())
            }
            Tracker::Counter(_) => Err(TrackerError::WrongTrackerKind { expected: "queue" }),
        }
    }

    pub fn close(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        let subscribed = self.tracker.subscribed();
        self.service.registry.unsubscribe(
            &self.collector,
            self.tracker.subscriber(),
            subscribed,
            &self.service.callbacks,
        );
        debug!(collector = self.collector.id().0, kind = self.tracker.kind(), "tracker detached");
    }
}

impl Drop for TrackerHandle {
    fn drop(&mut self) {
        self.detach();
    }
}
