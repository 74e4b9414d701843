#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use gpu_telemetry::kernel::channel::{Channel, ChannelId, CommandBatch};
use gpu_telemetry::kernel::collector::Collector;
use gpu_telemetry::kernel::telemetry::counter::{CounterName, CounterScope, COUNTER_BYTES};
use gpu_telemetry::kernel::telemetry::event::{EventRecord, EventType, RECORD_BYTES, RECORD_WORDS};
use gpu_telemetry::kernel::telemetry::queue::{control, CONTROL_BYTES};
use gpu_telemetry::memory::{BufferDescriptor, SharedWords, UserAddressSpace};
use gpu_telemetry::{
    AttachRequest, CounterAttach, QueueAttach, ToolsConfig, ToolsService, TrackerHandle,
};
use parking_lot::Mutex;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Device clock shared by every simulated channel.
static DEVICE_CLOCK: AtomicU64 = AtomicU64::new(1_000);

pub fn device_time() -> u64 {
    DEVICE_CLOCK.fetch_add(10, Ordering::SeqCst)
}

/// A software channel standing in for GPU hardware.
///
/// Submitted batches sit in flight until `update_progress` executes them:
/// every timestamp slot is written in order, then the completion fires.
pub struct SimChannel {
    id: ChannelId,
    inflight: Mutex<Vec<CommandBatch>>,
    progress_calls: AtomicUsize,
    hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl SimChannel {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id: ChannelId(id),
            inflight: Mutex::new(Vec::new()),
            progress_calls: AtomicUsize::new(0),
            hook: Mutex::new(None),
        })
    }

    pub fn batch(self: &Arc<Self>) -> CommandBatch {
        CommandBatch::new(self.clone())
    }

    pub fn submit(&self, batch: CommandBatch) {
        self.inflight.lock().push(batch);
    }

    /// Runs `hook` once, right after the next progress update.
    pub fn on_next_progress(&self, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    pub fn inflight(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn progress_calls(&self) -> usize {
        self.progress_calls.load(Ordering::SeqCst)
    }

    /// Runs every in-flight batch to completion.
    pub fn execute(&self) {
        let batches: Vec<CommandBatch> = std::mem::take(&mut *self.inflight.lock());
        for mut batch in batches {
            for slot in batch.timestamps() {
                slot.write(device_time());
            }
            if let Some(token) = batch.take_completion() {
                token.complete();
            }
        }
    }
}

impl Channel for SimChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn update_progress(&self) {
        self.progress_calls.fetch_add(1, Ordering::SeqCst);
        self.execute();
        let hook = self.hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// Consumer-side view of an attached ring, reading shared memory directly.
pub struct RingReader {
    pub control: Arc<SharedWords>,
    pub records: Arc<SharedWords>,
    pub capacity: u32,
}

impl RingReader {
    fn mask(&self) -> u64 {
        (self.capacity - 1) as u64
    }

    pub fn put(&self) -> u64 {
        self.control.load(control::PUT_BEHIND)
    }

    pub fn get(&self) -> u64 {
        self.control.load(control::GET_BEHIND)
    }

    pub fn unread(&self) -> u64 {
        (self.capacity as u64 + self.put() - self.get()) & self.mask()
    }

    pub fn dropped(&self, ty: EventType) -> u64 {
        self.control.load(control::DROPPED + ty.index())
    }

    pub fn slot(&self, index: u64) -> [u64; RECORD_WORDS] {
        let base = index as usize * RECORD_WORDS;
        std::array::from_fn(|i| self.records.load(base + i))
    }

    /// Unread records, oldest first, without consuming them.
    pub fn peek(&self) -> Vec<EventRecord> {
        let mut out = Vec::new();
        let mut get = self.get();
        while get != self.put() {
            if let Some(record) = EventRecord::decode(&self.slot(get)) {
                out.push(record);
            }
            get = (get + 1) & self.mask();
        }
        out
    }

    /// Reads everything unread and moves both get cursors past it.
    pub fn drain(&self) -> Vec<EventRecord> {
        let out = self.peek();
        let put = self.put();
        self.control.store(control::GET_AHEAD, put);
        self.control.store(control::GET_BEHIND, put);
        out
    }
}

#[derive(Debug)]
pub struct CounterReader {
    pub values: Arc<SharedWords>,
}

impl CounterReader {
    pub fn value(&self, name: CounterName) -> u64 {
        self.values.load(name.index())
    }
}

/// One monitored process plus the consumer that watches it.
pub struct Harness {
    pub service: Arc<ToolsService>,
    pub consumer: UserAddressSpace,
    next_va: AtomicU64,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ToolsConfig::default())
    }

    pub fn with_config(config: ToolsConfig) -> Self {
        init_tracing();
        Self {
            service: ToolsService::init(config),
            consumer: UserAddressSpace::new(),
            next_va: AtomicU64::new(0x10_0000),
        }
    }

    /// Maps a fresh shared buffer of at least `len` bytes.
    pub fn map(&self, len: u64) -> (BufferDescriptor, Arc<SharedWords>) {
        let len = len.div_ceil(4096) * 4096;
        let va = self.next_va.fetch_add(len + 4096, Ordering::SeqCst);
        let words = self
            .consumer
            .map_shared(va, len)
            .expect("fresh mapping never overlaps");
        (BufferDescriptor::new(va, len), words)
    }

    pub fn queue_request(&self, events: u64, capacity: u32) -> (AttachRequest, RingReader) {
        let (control, control_words) = self.map(CONTROL_BYTES);
        let (records, record_words) = self.map(capacity as u64 * RECORD_BYTES as u64);
        let request = AttachRequest::Queue(QueueAttach {
            events,
            control,
            records,
            capacity,
            notification_threshold: None,
        });
        let reader = RingReader {
            control: control_words,
            records: record_words,
            capacity,
        };
        (request, reader)
    }

    pub fn attach_queue(
        &self,
        collector: &Arc<Collector>,
        events: u64,
        capacity: u32,
    ) -> anyhow::Result<(TrackerHandle, RingReader)> {
        let (request, reader) = self.queue_request(events, capacity);
        let handle = self.service.attach(collector, &self.consumer, request)?;
        Ok((handle, reader))
    }

    pub fn attach_counters(
        &self,
        collector: &Arc<Collector>,
        counters: u64,
        scope: CounterScope,
    ) -> anyhow::Result<(TrackerHandle, CounterReader)> {
        let (values, words) = self.map(COUNTER_BYTES);
        let request = AttachRequest::Counter(CounterAttach {
            counters,
            values,
            scope,
        });
        let handle = self.service.attach(collector, &self.consumer, request)?;
        Ok((handle, CounterReader { values: words }))
    }
}
