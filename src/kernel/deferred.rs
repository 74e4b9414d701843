//! Events whose timestamps only exist once a command batch has executed.
//!
//! A producer opens a pending record when it submits a batch and stores the
//! resulting `CompletionToken` in the batch. When the hardware-progress side
//! sees the batch finish it calls `CompletionToken::complete`, which reads the
//! device timestamps and hands the record to the background worker. The
//! worker records the events with the collector's subscription lock held for
//! read.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use super::channel::{Channel, ChannelId, TimestampSlot};
use super::collector::Collector;
use super::registry::Registry;
use super::telemetry::event::{
    EventRecord, GpuFaultReplayInfo, MapRemoteInfo, MigrationCause, MigrationInfo,
};
use super::time::now_ns;

pub const RANGE_GROUP_ID_NONE: u64 = 0;

#[derive(Debug)]
pub(crate) struct MigrationDetail {
    pub address: u64,
    pub bytes: u64,
    pub cause: MigrationCause,
    pub end_timestamp_gpu: Arc<TimestampSlot>,
}

/// All copies pushed into one batch for one block.
#[derive(Debug)]
pub(crate) struct BlockMigration {
    pub collector: Arc<Collector>,
    pub src_index: u8,
    pub dst_index: u8,
    pub range_group_id: u64,
    pub start_timestamp_cpu: u64,
    pub start_timestamp_gpu: Arc<TimestampSlot>,
    pub events: Vec<MigrationDetail>,
}

#[derive(Debug)]
pub(crate) struct ReplayRecord {
    pub info: GpuFaultReplayInfo,
    pub timestamp_gpu: Arc<TimestampSlot>,
}

#[derive(Debug)]
pub(crate) struct MapRemoteDetail {
    pub address: u64,
    pub size: u64,
    pub timestamp_gpu: Arc<TimestampSlot>,
}

#[derive(Debug)]
pub(crate) struct BlockMapRemote {
    pub collector: Arc<Collector>,
    pub template: MapRemoteInfo,
    pub events: Vec<MapRemoteDetail>,
}

#[derive(Debug)]
pub(crate) enum PendingRecord {
    Migration(BlockMigration),
    Replay(ReplayRecord),
    MapRemote(BlockMapRemote),
}

impl PendingRecord {
    /// Reads every device timestamp. Only valid once the batch is done.
    fn resolve(self) -> ResolvedRecord {
        match self {
            PendingRecord::Migration(block) => {
                let template = MigrationInfo {
                    src_index: block.src_index,
                    dst_index: block.dst_index,
                    migration_cause: MigrationCause::Invalid,
                    address: 0,
                    migrated_bytes: 0,
                    begin_time_stamp: block.start_timestamp_cpu,
                    end_time_stamp: now_ns(),
                    begin_time_stamp_gpu: block.start_timestamp_gpu.read(),
                    end_time_stamp_gpu: 0,
                    range_group_id: block.range_group_id,
                };
                let details = block
                    .events
                    .into_iter()
                    .map(|d| ResolvedMigration {
                        address: d.address,
                        bytes: d.bytes,
                        cause: d.cause,
                        end_timestamp_gpu: d.end_timestamp_gpu.read(),
                    })
                    .collect();
                ResolvedRecord::Migration {
                    collector: block.collector,
                    template,
                    details,
                }
            }
            PendingRecord::Replay(replay) => ResolvedRecord::Replay(GpuFaultReplayInfo {
                time_stamp_gpu: replay.timestamp_gpu.read(),
                ..replay.info
            }),
            PendingRecord::MapRemote(block) => {
                let template = block.template;
                let events = block
                    .events
                    .into_iter()
                    .map(|d| {
                        EventRecord::MapRemote(MapRemoteInfo {
                            address: d.address,
                            size: d.size,
                            time_stamp_gpu: d.timestamp_gpu.read(),
                            ..template
                        })
                    })
                    .collect();
                ResolvedRecord::MapRemote {
                    collector: block.collector,
                    events,
                }
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct ResolvedMigration {
    address: u64,
    bytes: u64,
    cause: MigrationCause,
    end_timestamp_gpu: u64,
}

/// A completed record on its way to the worker.
#[derive(Debug)]
pub(crate) enum ResolvedRecord {
    Migration {
        collector: Arc<Collector>,
        template: MigrationInfo,
        details: Vec<ResolvedMigration>,
    },
    Replay(GpuFaultReplayInfo),
    MapRemote {
        collector: Arc<Collector>,
        events: Vec<EventRecord>,
    },
}

impl ResolvedRecord {
    /// Records every buffered event. Runs on the worker with no lock held
    /// on entry.
    pub(crate) fn deliver(self, registry: &Registry) {
        match self {
            ResolvedRecord::Migration {
                collector,
                template,
                details,
            } => {
                let tools = collector.tools.read();
                let mut gpu_timestamp = template.begin_time_stamp_gpu;
                for detail in details {
                    debug_assert!(detail.bytes > 0);
                    let event = EventRecord::Migration(MigrationInfo {
                        address: detail.address,
                        migrated_bytes: detail.bytes,
                        begin_time_stamp_gpu: gpu_timestamp,
                        end_time_stamp_gpu: detail.end_timestamp_gpu,
                        migration_cause: detail.cause,
                        ..template
                    });
                    gpu_timestamp = detail.end_timestamp_gpu;
                    tools.record(&event);
                }
            }
            ResolvedRecord::Replay(info) => registry.broadcast(&EventRecord::GpuFaultReplay(info)),
            ResolvedRecord::MapRemote { collector, events } => {
                let tools = collector.tools.read();
                for event in &events {
                    tools.record(event);
                }
            }
        }
    }
}

pub(crate) enum WorkItem {
    Deliver(ResolvedRecord),
    /// Answered once everything queued before it has been delivered.
    Flush(oneshot::Sender<()>),
}

#[derive(Debug)]
struct PendingChannel {
    channel: Arc<dyn Channel>,
    count: u32,
}

#[derive(Debug)]
struct PipelineInner {
    // Insertion order; new channels always go to the back.
    pending: Vec<PendingChannel>,
    sender: Option<mpsc::UnboundedSender<WorkItem>>,
}

impl PipelineInner {
    fn add_pending(&mut self, channel: &Arc<dyn Channel>) {
        let id = channel.id();
        match self.pending.iter_mut().find(|p| p.channel.id() == id) {
            Some(entry) => entry.count += 1,
            None => self.pending.push(PendingChannel {
                channel: channel.clone(),
                count: 1,
            }),
        }
    }

    fn remove_pending(&mut self, id: ChannelId) {
        let pos = self.pending.iter().position(|p| p.channel.id() == id);
        let Some(pos) = pos else {
            panic!("channel {id:?} has no pending events");
        };
        let entry = &mut self.pending[pos];
        assert!(entry.count > 0, "pending count underflow on {id:?}");
        entry.count -= 1;
        if entry.count == 0 {
            self.pending.remove(pos);
        }
    }
}

/// Channels with outstanding completions plus the worker's queue.
#[derive(Debug)]
pub struct DeferredPipeline {
    inner: Mutex<PipelineInner>,
    live_records: AtomicUsize,
    max_records: usize,
}

impl DeferredPipeline {
    pub(crate) fn new(max_records: usize, sender: mpsc::UnboundedSender<WorkItem>) -> Self {
        Self {
            inner: Mutex::new(PipelineInner {
                pending: Vec::new(),
                sender: Some(sender),
            }),
            live_records: AtomicUsize::new(0),
            max_records,
        }
    }

    /// Opens a pending record on `channel`. `None` when the record budget is
    /// spent; the telemetry is then dropped without any error.
    pub(crate) fn begin(
        self: &Arc<Self>,
        channel: &Arc<dyn Channel>,
        record: PendingRecord,
    ) -> Option<CompletionToken> {
        if self.live_records.fetch_add(1, Ordering::AcqRel) >= self.max_records {
            self.live_records.fetch_sub(1, Ordering::AcqRel);
            trace!(channel = channel.id().0, "pending record budget exhausted, dropping");
            return None;
        }
        self.inner.lock().add_pending(channel);
        Some(CompletionToken {
            record: Some(record),
            channel: channel.id(),
            pipeline: self.clone(),
        })
    }

    fn finish(&self, channel: ChannelId, resolved: Option<ResolvedRecord>) {
        let mut inner = self.inner.lock();
        inner.remove_pending(channel);
        let Some(resolved) = resolved else {
            self.retire();
            return;
        };
        let sent = inner
            .sender
            .as_ref()
            .is_some_and(|tx| tx.send(WorkItem::Deliver(resolved)).is_ok());
        if !sent {
            self.retire();
            trace!(channel = channel.0, "worker gone, dropping completed record");
        }
    }

    pub(crate) fn retire(&self) {
        let prev = self.live_records.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "live record count underflow");
    }

    pub fn pending_channels(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn live_records(&self) -> usize {
        self.live_records.load(Ordering::Acquire)
    }

    /// Delivers everything pending on the channels listed right now.
    ///
    /// Channels that gain their first pending record after the snapshot is
    /// taken are not covered.
    pub async fn flush(&self) {
        let snapshot: Vec<Arc<dyn Channel>> = {
            let mut inner = self.inner.lock();
            inner
                .pending
                .iter_mut()
                .map(|p| {
                    p.count += 1;
                    p.channel.clone()
                })
                .collect()
        };
        debug!(channels = snapshot.len(), "flushing pending channels");

        for channel in &snapshot {
            channel.update_progress();
        }

        let done = {
            let mut inner = self.inner.lock();
            for channel in &snapshot {
                inner.remove_pending(channel.id());
            }
            let (tx, rx) = oneshot::channel();
            let queued = inner
                .sender
                .as_ref()
                .is_some_and(|sender| sender.send(WorkItem::Flush(tx)).is_ok());
            queued.then_some(rx)
        };

        if let Some(rx) = done {
            let _ = rx.await;
        }
    }

    /// Stops accepting work; the worker exits once its queue is drained.
    pub(crate) fn close(&self) {
        self.inner.lock().sender = None;
    }
}

/// Move-once completion for one command batch.
///
/// Dropping it without `complete` releases the channel reference and
/// discards the buffered events.
#[derive(Debug)]
pub struct CompletionToken {
    record: Option<PendingRecord>,
    channel: ChannelId,
    pipeline: Arc<DeferredPipeline>,
}

impl CompletionToken {
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub(crate) fn record_mut(&mut self) -> Option<&mut PendingRecord> {
        self.record.as_mut()
    }

    /// Signals that the batch finished executing.
    pub fn complete(mut self) {
        if let Some(record) = self.record.take() {
            self.pipeline.finish(self.channel, Some(record.resolve()));
        }
    }
}

impl Drop for CompletionToken {
    fn drop(&mut self) {
        if self.record.take().is_some() {
            trace!(channel = self.channel.0, "batch abandoned before completion");
            self.pipeline.finish(self.channel, None);
        }
    }
}
