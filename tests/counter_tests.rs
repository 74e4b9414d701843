mod common;

use common::{Harness, SimChannel};
use gpu_telemetry::kernel::perf::{
    CpuFault, FaultAccessType, FaultEntry, FaultEvent, GpuFault, MakeResidentCause,
    MigrationEvent, PerfEvent,
};
use gpu_telemetry::kernel::processor::{ProcessorId, ProcessorUuid};
use gpu_telemetry::kernel::telemetry::counter::{CounterMask, CounterName, CounterScope};
use gpu_telemetry::kernel::telemetry::event::{FaultClientType, FaultType};
use gpu_telemetry::TrackerError;

fn cpu_fault(preferred_location: Option<ProcessorId>) -> PerfEvent<'static> {
    PerfEvent::Fault(FaultEvent::Cpu(CpuFault {
        address: 0x7f00_0000,
        is_write: true,
        pc: 0x40_1000,
        pid: 42,
        thread_id: 43,
        preferred_location,
    }))
}

fn fault_entry(address: u64) -> FaultEntry {
    FaultEntry {
        address,
        fault_type: FaultType::InvalidPte,
        access_type: FaultAccessType::Read,
        client_type: FaultClientType::Gpc,
        is_replayable: true,
        gpc_id: 3,
        channel_id: 9,
        client_id: 1,
        timestamp: 555,
        merged_instances: Vec::new(),
    }
}

#[tokio::test]
async fn test_cpu_fault_counted_once_per_scope() -> anyhow::Result<()> {
    let h = Harness::new();
    let gpu = ProcessorId::gpu(1).expect("gpu 1");
    let gpu_uuid = ProcessorUuid::new_random();
    h.service.register_gpu(gpu, gpu_uuid);

    let collector = h.service.new_collector();
    let bit = CounterName::CpuPageFaultCount.bit();
    let (all, all_values) = h.attach_counters(&collector, bit, CounterScope::AllProcessors)?;
    let (cpu, cpu_values) =
        h.attach_counters(&collector, bit, CounterScope::Processor(ProcessorUuid::CPU_DEFAULT))?;
    let (on_gpu, gpu_values) = h.attach_counters(&collector, bit, CounterScope::Processor(gpu_uuid))?;

    // Preferred location on the GPU: reported against both the CPU and the GPU.
    collector.notify(&mut cpu_fault(Some(gpu)));
    assert_eq!(all_values.value(CounterName::CpuPageFaultCount), 1, "aggregate never counts twice");
    assert_eq!(cpu_values.value(CounterName::CpuPageFaultCount), 1);
    assert_eq!(gpu_values.value(CounterName::CpuPageFaultCount), 1);

    // No preferred location: only the CPU identity.
    collector.notify(&mut cpu_fault(None));
    assert_eq!(all_values.value(CounterName::CpuPageFaultCount), 2);
    assert_eq!(cpu_values.value(CounterName::CpuPageFaultCount), 2);
    assert_eq!(gpu_values.value(CounterName::CpuPageFaultCount), 1);

    // Preferred location on the CPU itself is not reported twice.
    collector.notify(&mut cpu_fault(Some(ProcessorId::CPU)));
    assert_eq!(all_values.value(CounterName::CpuPageFaultCount), 3);
    assert_eq!(cpu_values.value(CounterName::CpuPageFaultCount), 3);

    for handle in [all, cpu, on_gpu] {
        handle.close();
    }
    h.service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_gpu_fault_counter() -> anyhow::Result<()> {
    let h = Harness::new();
    let gpu = ProcessorId::gpu(2).expect("gpu 2");
    let gpu_uuid = ProcessorUuid::new_random();
    h.service.register_gpu(gpu, gpu_uuid);

    let collector = h.service.new_collector();
    let mask: CounterMask = [CounterName::GpuPageFaultCount, CounterName::CpuPageFaultCount]
        .into_iter()
        .collect();
    let (all, all_values) = h.attach_counters(&collector, mask.bits(), CounterScope::AllProcessors)?;
    let (other, other_values) = h.attach_counters(
        &collector,
        mask.bits(),
        CounterScope::Processor(ProcessorUuid::new_random()),
    )?;

    let mut entry = fault_entry(0x1000);
    entry.merged_instances.push(fault_entry(0x1000));
    for batch_id in 0..3 {
        collector.notify(&mut PerfEvent::Fault(FaultEvent::Gpu(GpuFault {
            gpu,
            batch_id,
            entry: &entry,
        })));
    }

    // Merged duplicates are events, not extra faults.
    assert_eq!(all_values.value(CounterName::GpuPageFaultCount), 3);
    assert_eq!(all_values.value(CounterName::CpuPageFaultCount), 0);
    assert_eq!(other_values.value(CounterName::GpuPageFaultCount), 0, "scope names another GPU");

    all.close();
    other.close();
    h.service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_bytes_transferred_by_direction() -> anyhow::Result<()> {
    let h = Harness::new();
    let gpu = ProcessorId::gpu(1).expect("gpu 1");
    let gpu_uuid = ProcessorUuid::new_random();
    h.service.register_gpu(gpu, gpu_uuid);

    let collector = h.service.new_collector();
    let bits = CounterName::BytesXferHtD.bit() | CounterName::BytesXferDtH.bit();
    let (all, all_values) = h.attach_counters(&collector, bits, CounterScope::AllProcessors)?;
    let (scoped, scoped_values) = h.attach_counters(&collector, bits, CounterScope::Processor(gpu_uuid))?;

    let channel = SimChannel::new(1);
    let mut batch = channel.batch();
    let copies = [
        (ProcessorId::CPU, gpu, 4096),
        (ProcessorId::CPU, gpu, 8192),
        (gpu, ProcessorId::CPU, 65536),
        // Zero-byte copies never touch the accumulators.
        (gpu, ProcessorId::CPU, 0),
    ];
    for (src, dst, bytes) in copies {
        collector.notify(&mut PerfEvent::Migration(MigrationEvent {
            batch: &mut batch,
            src,
            dst,
            address: 0x20_0000,
            bytes,
            cause: MakeResidentCause::Prefetch,
        }));
    }

    assert_eq!(all_values.value(CounterName::BytesXferHtD), 12288);
    assert_eq!(all_values.value(CounterName::BytesXferDtH), 65536);
    assert_eq!(scoped_values.value(CounterName::BytesXferHtD), 12288);
    assert_eq!(scoped_values.value(CounterName::BytesXferDtH), 65536);
    assert!(batch.timestamps().is_empty(), "no migration record, nothing deferred");

    all.close();
    scoped.close();
    h.service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_unsubscribed_counter_stays_zero() -> anyhow::Result<()> {
    let h = Harness::new();
    let collector = h.service.new_collector();
    let (handle, values) = h.attach_counters(
        &collector,
        CounterName::GpuPageFaultCount.bit(),
        CounterScope::AllProcessors,
    )?;

    // The fault callback is installed for the GPU counter; CPU faults pass
    // through it without touching anything.
    collector.notify(&mut cpu_fault(None));
    assert_eq!(values.value(CounterName::CpuPageFaultCount), 0);

    handle.enable(CounterName::CpuPageFaultCount.bit())?;
    collector.notify(&mut cpu_fault(None));
    assert_eq!(values.value(CounterName::CpuPageFaultCount), 1);

    handle.disable(CounterName::CpuPageFaultCount.bit())?;
    collector.notify(&mut cpu_fault(None));
    assert_eq!(values.value(CounterName::CpuPageFaultCount), 1);

    handle.close();
    h.service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_counter_mask_validation() -> anyhow::Result<()> {
    let h = Harness::new();
    let collector = h.service.new_collector();

    let err = h
        .attach_counters(&collector, 1 << 4, CounterScope::AllProcessors)
        .unwrap_err();
    let err = err.downcast::<TrackerError>()?;
    assert!(matches!(err, TrackerError::InvalidMask { mask: 16, legal: 0xF }));
    assert!(!collector.is_enabled());

    let (handle, _values) = h.attach_counters(&collector, 0, CounterScope::AllProcessors)?;
    assert!(!collector.is_enabled(), "an empty mask subscribes nothing");
    assert!(handle.enable(1 << 5).is_err());

    handle.close();
    h.service.shutdown().await;
    Ok(())
}
