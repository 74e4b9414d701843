//! Entry points the fault handler, the migration engine and the replay logic
//! call to report what they did.
//!
//! None of these can fail. When nobody listens they return after a lock-free
//! check; when memory for deferred telemetry runs out the unit is dropped.

use std::sync::Arc;

use tracing::trace;

use super::channel::CommandBatch;
use super::collector::Collector;
use super::deferred::{
    BlockMapRemote, BlockMigration, CompletionToken, MapRemoteDetail, MigrationDetail,
    PendingRecord, ReplayRecord, RANGE_GROUP_ID_NONE,
};
use super::perf::{
    AccessCounterEntry, AccessCounterTarget, FaultEntry, FaultEvent, GpuFault, MakeResidentCause,
    MigrationEvent,
};
use super::processor::{ProcessorId, ProcessorMask, ProcessorUuid};
use super::service::ToolsService;
use super::telemetry::counter::CounterName;
use super::telemetry::event::{
    AccessCounterInfo, Aperture, CpuFaultInfo, EventRecord, EventType, FatalFaultInfo,
    FatalReason, FaultClientType, FaultType, GpuFaultInfo, GpuFaultReplayInfo, MapRemoteCause,
    MapRemoteInfo, MemoryAccessType, ProcessorSetInfo, ReadDuplicateInvalidateInfo,
    ThrottlingInfo,
};
use super::time::now_ns;
use crate::memory::PAGE_SIZE;

fn gpu_fault_info(gpu: ProcessorId, entry: &FaultEntry, batch_id: u32, time_stamp: u64) -> GpuFaultInfo {
    let (gpc_id, channel_id) = if entry.is_replayable {
        (entry.gpc_id, 0)
    } else {
        (0, entry.channel_id)
    };
    GpuFaultInfo {
        gpu_index: gpu.index(),
        fault_type: entry.fault_type,
        access_type: entry.access_type.into(),
        client_type: entry.client_type,
        gpc_id,
        channel_id,
        client_id: entry.client_id,
        address: entry.address,
        time_stamp,
        time_stamp_gpu: entry.timestamp,
        batch_id,
    }
}

// A rejected token is dropped, which releases its channel and record.
fn install(batch: &mut CommandBatch, token: CompletionToken) {
    if let Err(rejected) = batch.install_completion(token) {
        trace!(channel = rejected.channel().0, "batch already carries a completion, dropping");
    }
}

fn assert_page_aligned(address: u64) {
    assert!(address != 0, "null address reported");
    assert!(address % PAGE_SIZE == 0, "address {address:#x} is not page aligned");
}

impl ToolsService {
    /// Fault callback body. Runs with the collector's callback table held
    /// for read.
    pub(crate) fn on_fault(&self, collector: &Arc<Collector>, fault: &FaultEvent<'_>) {
        let tools = collector.tools.read();
        assert!(tools.fault_callback_needed(), "fault callback installed while unneeded");

        match fault {
            FaultEvent::Cpu(cpu) => {
                if tools.is_event_enabled(EventType::CpuFault) {
                    let access_type = if cpu.is_write {
                        MemoryAccessType::Write
                    } else {
                        MemoryAccessType::Read
                    };
                    tools.record(&EventRecord::CpuFault(CpuFaultInfo {
                        access_type,
                        preferred_location: cpu
                            .preferred_location
                            .map_or(ProcessorId::CPU.index(), ProcessorId::index),
                        address: cpu.address,
                        time_stamp: now_ns(),
                        pid: cpu.pid,
                        thread_id: cpu.thread_id,
                        pc: cpu.pc,
                    }));
                }
                if tools.is_counter_enabled(CounterName::CpuPageFaultCount) {
                    // Reported against the CPU and, for compatibility, against
                    // the buffer's preferred GPU as well.
                    tools.increment(CounterName::CpuPageFaultCount, 1, &ProcessorUuid::CPU_DEFAULT);
                    if let Some(preferred) = cpu.preferred_location.filter(|p| p.is_gpu()) {
                        if let Some(uuid) = self.processor_uuid(preferred) {
                            tools.increment(CounterName::CpuPageFaultCount, 1, &uuid);
                        }
                    }
                }
            }
            FaultEvent::Gpu(GpuFault { gpu, batch_id, entry }) => {
                if tools.is_event_enabled(EventType::GpuFault) {
                    let time_stamp = now_ns();
                    for instance in std::iter::once(*entry).chain(entry.merged_instances.iter()) {
                        tools.record(&EventRecord::GpuFault(gpu_fault_info(
                            *gpu, instance, *batch_id, time_stamp,
                        )));
                    }
                }
                if tools.is_counter_enabled(CounterName::GpuPageFaultCount) {
                    if let Some(uuid) = self.processor_uuid(*gpu) {
                        tools.increment(CounterName::GpuPageFaultCount, 1, &uuid);
                    }
                }
            }
        }
    }

    /// Migration callback body: one copy was pushed into the batch.
    pub(crate) fn on_migration(&self, collector: &Arc<Collector>, migration: &mut MigrationEvent<'_>) {
        let tools = collector.tools.read();
        assert!(tools.migration_callback_needed(), "migration callback installed while unneeded");

        if tools.is_event_enabled(EventType::Migration) {
            let batch = &mut *migration.batch;
            // No record means begin was skipped or dropped for this batch.
            let has_record = matches!(
                batch.completion_mut().and_then(|token| token.record_mut()),
                Some(PendingRecord::Migration(_))
            );
            let end_timestamp_gpu = has_record.then(|| batch.push_timestamp());
            let block = batch
                .completion_mut()
                .and_then(|token| token.record_mut())
                .and_then(|record| match record {
                    PendingRecord::Migration(block) => Some(block),
                    _ => None,
                });
            if let (Some(block), Some(end_timestamp_gpu)) = (block, end_timestamp_gpu) {
                if block.events.try_reserve(1).is_ok() {
                    block.events.push(MigrationDetail {
                        address: migration.address,
                        bytes: migration.bytes,
                        cause: migration.cause.into(),
                        end_timestamp_gpu,
                    });
                } else {
                    trace!(collector = collector.id().0, "migration detail dropped");
                }
            }
        }

        if migration.src.is_cpu() && tools.is_counter_enabled(CounterName::BytesXferHtD) {
            if let Some(uuid) = self.processor_uuid(migration.dst) {
                tools.increment(CounterName::BytesXferHtD, migration.bytes, &uuid);
            }
        }
        if migration.dst.is_cpu() && tools.is_counter_enabled(CounterName::BytesXferDtH) {
            if let Some(uuid) = self.processor_uuid(migration.src) {
                tools.increment(CounterName::BytesXferDtH, migration.bytes, &uuid);
            }
        }
    }

    /// Opens the migration record that groups every copy of one block pushed
    /// into `batch`. Copies are appended by the migration callback.
    pub fn record_block_migration_begin(
        &self,
        collector: &Arc<Collector>,
        batch: &mut CommandBatch,
        dst: ProcessorId,
        src: ProcessorId,
        range_group_id: Option<u64>,
        cause: MakeResidentCause,
    ) {
        assert!(
            cause != MakeResidentCause::ApiTools,
            "tools memory access must not migrate"
        );
        if !collector.is_enabled() {
            return;
        }

        let tools = collector.tools.read();
        if !tools.is_event_enabled(EventType::Migration) {
            return;
        }
        if batch.has_completion() {
            trace!(collector = collector.id().0, "batch already carries a completion, migration dropped");
            return;
        }

        // Range groups cannot be looked up during eviction.
        let range_group_id = match cause {
            MakeResidentCause::Eviction => RANGE_GROUP_ID_NONE,
            _ => range_group_id.unwrap_or(RANGE_GROUP_ID_NONE),
        };
        let channel = batch.channel().clone();
        let record = PendingRecord::Migration(BlockMigration {
            collector: collector.clone(),
            src_index: src.index(),
            dst_index: dst.index(),
            range_group_id,
            start_timestamp_cpu: now_ns(),
            start_timestamp_gpu: batch.push_timestamp(),
            events: Vec::new(),
        });
        if let Some(token) = self.pipeline.begin(&channel, record) {
            install(batch, token);
        }
    }

    /// Reports a fault replay whose GPU time is only known once `batch`
    /// has executed.
    pub fn broadcast_replay(
        &self,
        gpu: ProcessorId,
        batch: &mut CommandBatch,
        batch_id: u32,
        client_type: FaultClientType,
    ) {
        if !self.is_event_enabled_anywhere(EventType::GpuFaultReplay) {
            return;
        }
        if batch.has_completion() {
            trace!(batch_id, "batch already carries a completion, replay dropped");
            return;
        }
        let channel = batch.channel().clone();
        let record = PendingRecord::Replay(ReplayRecord {
            info: GpuFaultReplayInfo {
                gpu_index: gpu.index(),
                client_type,
                batch_id,
                time_stamp: now_ns(),
                time_stamp_gpu: 0,
            },
            timestamp_gpu: batch.push_timestamp(),
        });
        if let Some(token) = self.pipeline.begin(&channel, record) {
            install(batch, token);
        }
    }

    /// Replay on hardware that cannot signal it through a batch; the GPU
    /// time was read directly.
    pub fn broadcast_replay_sync(
        &self,
        gpu: ProcessorId,
        batch_id: u32,
        client_type: FaultClientType,
        gpu_time: u64,
    ) {
        if !self.is_event_enabled_anywhere(EventType::GpuFaultReplay) {
            return;
        }
        self.registry.broadcast(&EventRecord::GpuFaultReplay(GpuFaultReplayInfo {
            gpu_index: gpu.index(),
            client_type,
            batch_id,
            time_stamp: now_ns(),
            time_stamp_gpu: gpu_time,
        }));
    }

    pub fn broadcast_access_counter(&self, gpu: ProcessorId, entry: &AccessCounterEntry, on_managed: bool) {
        if !self.is_event_enabled_anywhere(EventType::TestAccessCounter) {
            return;
        }

        let mut info = AccessCounterInfo {
            src_index: gpu.index(),
            aperture: Aperture::Invalid,
            instance_ptr_aperture: Aperture::Invalid,
            is_virtual: false,
            is_from_cpu: entry.is_from_cpu,
            on_managed,
            ve_id: 0,
            address: 0,
            instance_ptr: 0,
            value: entry.counter_value,
            sub_granularity: entry.sub_granularity,
            tag: entry.tag,
            bank: entry.bank,
        };
        match entry.target {
            AccessCounterTarget::Virtual {
                address,
                instance_ptr,
                instance_ptr_aperture,
                ve_id,
            } => {
                info.is_virtual = true;
                info.address = address;
                info.instance_ptr = instance_ptr;
                info.instance_ptr_aperture = instance_ptr_aperture;
                info.ve_id = ve_id;
            }
            AccessCounterTarget::Physical { address, aperture } => {
                info.address = address;
                info.aperture = aperture;
            }
        }
        self.registry.broadcast(&EventRecord::TestAccessCounter(info));
    }

    pub fn test_hmm_split_invalidate(&self, collector: &Arc<Collector>) {
        if !collector.is_enabled() {
            return;
        }
        collector.tools.read().record(&EventRecord::TestHmmSplitInvalidate);
    }

    /// One event per page, each naming the processors the page is resident on.
    pub fn record_read_duplicate(
        &self,
        collector: &Arc<Collector>,
        pages: impl IntoIterator<Item = (u64, ProcessorMask)>,
    ) {
        if !collector.is_enabled() {
            return;
        }
        let tools = collector.tools.read();
        if !tools.is_event_enabled(EventType::ReadDuplicate) {
            return;
        }
        let time_stamp = now_ns();
        for (address, residents) in pages {
            tools.record(&EventRecord::ReadDuplicate(ProcessorSetInfo {
                processors: residents.bits(),
                address,
                size: PAGE_SIZE,
                time_stamp,
            }));
        }
    }

    pub fn record_read_duplicate_invalidate(
        &self,
        collector: &Arc<Collector>,
        resident: ProcessorId,
        pages: impl IntoIterator<Item = u64>,
    ) {
        if !collector.is_enabled() {
            return;
        }
        let tools = collector.tools.read();
        if !tools.is_event_enabled(EventType::ReadDuplicateInvalidate) {
            return;
        }
        let time_stamp = now_ns();
        for address in pages {
            tools.record(&EventRecord::ReadDuplicateInvalidate(ReadDuplicateInvalidateInfo {
                resident_index: resident.index(),
                address,
                size: PAGE_SIZE,
                time_stamp,
            }));
        }
    }

    pub fn record_cpu_fatal_fault(
        &self,
        collector: &Arc<Collector>,
        address: u64,
        is_write: bool,
        reason: FatalReason,
    ) {
        if !collector.is_enabled() {
            return;
        }
        let tools = collector.tools.read();
        if !tools.is_event_enabled(EventType::FatalFault) {
            return;
        }
        tools.record(&EventRecord::FatalFault(FatalFaultInfo {
            processor_index: ProcessorId::CPU.index(),
            access_type: if is_write {
                MemoryAccessType::Write
            } else {
                MemoryAccessType::Read
            },
            // Not meaningful for CPU faults.
            fault_type: FaultType::Invalid,
            reason,
            address,
            time_stamp: now_ns(),
        }));
    }

    pub fn record_gpu_fatal_fault(
        &self,
        collector: &Arc<Collector>,
        gpu: ProcessorId,
        entry: &FaultEntry,
        reason: FatalReason,
    ) {
        if !collector.is_enabled() {
            return;
        }
        let tools = collector.tools.read();
        if !tools.is_event_enabled(EventType::FatalFault) {
            return;
        }
        tools.record(&EventRecord::FatalFault(FatalFaultInfo {
            processor_index: gpu.index(),
            access_type: entry.access_type.into(),
            fault_type: entry.fault_type,
            reason,
            address: entry.address,
            time_stamp: now_ns(),
        }));
    }

    pub fn record_thrashing(
        &self,
        collector: &Arc<Collector>,
        address: u64,
        size: u64,
        processors: ProcessorMask,
    ) {
        assert_page_aligned(address);
        assert!(size > 0, "empty thrashing region");
        if !collector.is_enabled() {
            return;
        }
        let tools = collector.tools.read();
        if tools.is_event_enabled(EventType::ThrashingDetected) {
            tools.record(&EventRecord::ThrashingDetected(ProcessorSetInfo {
                processors: processors.bits(),
                address,
                size,
                time_stamp: now_ns(),
            }));
        }
    }

    pub fn record_throttling_start(&self, collector: &Arc<Collector>, address: u64, processor: ProcessorId) {
        self.record_throttling(collector, EventType::ThrottlingStart, address, processor);
    }

    pub fn record_throttling_end(&self, collector: &Arc<Collector>, address: u64, processor: ProcessorId) {
        self.record_throttling(collector, EventType::ThrottlingEnd, address, processor);
    }

    fn record_throttling(
        &self,
        collector: &Arc<Collector>,
        ty: EventType,
        address: u64,
        processor: ProcessorId,
    ) {
        assert_page_aligned(address);
        if !collector.is_enabled() {
            return;
        }
        let tools = collector.tools.read();
        if !tools.is_event_enabled(ty) {
            return;
        }
        let info = ThrottlingInfo {
            processor_index: processor.index(),
            address,
            time_stamp: now_ns(),
        };
        let event = match ty {
            EventType::ThrottlingStart => EventRecord::ThrottlingStart(info),
            _ => EventRecord::ThrottlingEnd(info),
        };
        tools.record(&event);
    }

    /// A processor mapped memory resident elsewhere.
    ///
    /// CPU mappings are recorded immediately. GPU mappings are deferred to
    /// `batch`: the first call on a batch opens the record, later calls add
    /// to it.
    #[allow(clippy::too_many_arguments)]
    pub fn record_map_remote(
        &self,
        collector: &Arc<Collector>,
        batch: Option<&mut CommandBatch>,
        processor: ProcessorId,
        residency: ProcessorId,
        address: u64,
        size: u64,
        cause: MapRemoteCause,
    ) {
        assert!(cause != MapRemoteCause::Invalid, "map remote without a cause");
        if !collector.is_enabled() {
            return;
        }
        let tools = collector.tools.read();
        if !tools.is_event_enabled(EventType::MapRemote) {
            return;
        }

        let template = MapRemoteInfo {
            src_index: processor.index(),
            dst_index: residency.index(),
            map_remote_cause: cause,
            address,
            size,
            time_stamp: now_ns(),
            time_stamp_gpu: 0,
        };

        if processor.is_cpu() {
            tools.record(&EventRecord::MapRemote(template));
            return;
        }

        let Some(batch) = batch else {
            trace!(collector = collector.id().0, "GPU remote mapping without a command batch, dropped");
            return;
        };
        if !batch.has_completion() {
            let channel = batch.channel().clone();
            let record = PendingRecord::MapRemote(BlockMapRemote {
                collector: collector.clone(),
                template,
                events: Vec::new(),
            });
            match self.pipeline.begin(&channel, record) {
                Some(token) => install(batch, token),
                None => return,
            }
        }

        let carries_map_remote = matches!(
            batch.completion_mut().and_then(|token| token.record_mut()),
            Some(PendingRecord::MapRemote(_))
        );
        if !carries_map_remote {
            trace!(collector = collector.id().0, "batch carries another completion, map remote dropped");
            return;
        }

        let timestamp_gpu = batch.push_timestamp();
        let Some(PendingRecord::MapRemote(block)) =
            batch.completion_mut().and_then(|token| token.record_mut())
        else {
            return;
        };
        if block.events.try_reserve(1).is_err() {
            trace!(collector = collector.id().0, "map remote detail dropped");
            return;
        }
        block.events.push(MapRemoteDetail {
            address,
            size,
            timestamp_gpu,
        });
    }
}
