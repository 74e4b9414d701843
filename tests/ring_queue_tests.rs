mod common;

use std::time::Duration;

use common::Harness;
use gpu_telemetry::kernel::processor::ProcessorId;
use gpu_telemetry::kernel::telemetry::counter::CounterScope;
use gpu_telemetry::kernel::telemetry::event::{EventRecord, EventType};
use gpu_telemetry::kernel::telemetry::queue::control;
use gpu_telemetry::memory::PAGE_SIZE;
use gpu_telemetry::TrackerError;

fn page(n: u64) -> u64 {
    (n + 1) * PAGE_SIZE
}

#[tokio::test]
async fn test_capacity_four_threshold_two() -> anyhow::Result<()> {
    let h = Harness::new();
    let collector = h.service.new_collector();
    let (handle, ring) = h.attach_queue(&collector, EventType::ThrottlingStart.bit(), 4)?;
    let queue = handle.queue().expect("queue tracker").clone();
    assert_eq!(queue.threshold(), 2, "default threshold is half the capacity");

    for n in 0..3 {
        h.service.record_throttling_start(&collector, page(n), ProcessorId::CPU);
    }
    assert_eq!(ring.unread(), 3);
    assert_eq!(ring.dropped(EventType::ThrottlingStart), 0);
    assert_eq!(queue.wakeup_count(), 1, "crossing the threshold wakes once");

    h.service.record_throttling_start(&collector, page(3), ProcessorId::CPU);
    assert_eq!(ring.dropped(EventType::ThrottlingStart), 1);
    assert_eq!(ring.unread(), 3, "one slot always stays empty");
    assert!(queue.wakeup_count() >= 1);

    // The stored records survived the overflow untouched.
    let addresses: Vec<u64> = ring
        .peek()
        .into_iter()
        .map(|r| match r {
            EventRecord::ThrottlingStart(info) => info.address,
            other => panic!("unexpected record {other:?}"),
        })
        .collect();
    assert_eq!(addresses, vec![page(0), page(1), page(2)]);

    tokio::time::timeout(Duration::from_millis(200), handle.wait_for_events()).await??;

    handle.close();
    h.service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_overflow_counts_every_loss() -> anyhow::Result<()> {
    let h = Harness::new();
    let collector = h.service.new_collector();
    let bits = EventType::ThrottlingStart.bit() | EventType::ThrottlingEnd.bit();
    let (handle, ring) = h.attach_queue(&collector, bits, 8)?;

    for n in 0..20 {
        h.service.record_throttling_start(&collector, page(n), ProcessorId::CPU);
    }
    h.service.record_throttling_end(&collector, page(0), ProcessorId::CPU);

    assert_eq!(ring.unread(), 7);
    assert_eq!(ring.dropped(EventType::ThrottlingStart), 13);
    assert_eq!(ring.dropped(EventType::ThrottlingEnd), 1, "drops are kept per type");

    // Draining frees the space again.
    assert_eq!(ring.drain().len(), 7);
    h.service.record_throttling_end(&collector, page(1), ProcessorId::CPU);
    assert_eq!(ring.unread(), 1);

    drop(handle);
    h.service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_hostile_consumer_cursors() -> anyhow::Result<()> {
    let h = Harness::new();
    let collector = h.service.new_collector();
    let (handle, ring) = h.attach_queue(&collector, EventType::ThrottlingStart.bit(), 4)?;

    ring.control.store(control::GET_BEHIND, u64::MAX);
    ring.control.store(control::GET_AHEAD, 0xdead_beef_dead_beef);
    ring.control.store(control::PUT_BEHIND, 1 << 40);

    for n in 0..10 {
        h.service.record_throttling_start(&collector, page(n), ProcessorId::CPU);
    }

    // Whatever the consumer wrote, published cursors stay inside the ring.
    assert!(ring.put() < 4);
    assert_eq!(ring.control.load(control::PUT_AHEAD), ring.put());
    let queue = handle.queue().expect("queue tracker");
    assert!(queue.unread() < 4);

    handle.close();
    h.service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_producers_publish_whole_records() -> anyhow::Result<()> {
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 200;

    let h = Harness::new();
    let collector = h.service.new_collector();
    let (handle, ring) = h.attach_queue(&collector, EventType::ThrottlingStart.bit(), 1024)?;

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let service = h.service.clone();
            let collector = collector.clone();
            std::thread::spawn(move || {
                let gpu = ProcessorId::gpu(t as u8 + 1).expect("valid gpu index");
                for i in 0..PER_THREAD {
                    service.record_throttling_start(&collector, page(t * 10_000 + i), gpu);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("producer thread panicked");
    }

    let records = ring.drain();
    assert_eq!(records.len() as u64, THREADS * PER_THREAD);

    let mut last_seen = vec![None::<u64>; THREADS as usize];
    for record in records {
        let EventRecord::ThrottlingStart(info) = record else {
            panic!("torn record {record:?}");
        };
        let t = (info.processor_index - 1) as u64;
        let i = info.address / PAGE_SIZE - 1 - t * 10_000;
        assert!(i < PER_THREAD, "address does not belong to its producer");
        // Each producer's own records stay in program order.
        if let Some(prev) = last_seen[t as usize] {
            assert!(i > prev);
        }
        last_seen[t as usize] = Some(i);
    }
    assert_eq!(ring.dropped(EventType::ThrottlingStart), 0);

    handle.close();
    h.service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_lowering_threshold_wakes_immediately() -> anyhow::Result<()> {
    let h = Harness::new();
    let collector = h.service.new_collector();
    let (handle, _ring) = h.attach_queue(&collector, EventType::ThrottlingEnd.bit(), 16)?;
    let queue = handle.queue().expect("queue tracker").clone();

    let waiter = tokio::spawn({
        let queue = queue.clone();
        async move { queue.wait_ready().await }
    });

    for n in 0..3 {
        h.service.record_throttling_end(&collector, page(n), ProcessorId::CPU);
    }
    assert_eq!(queue.wakeup_count(), 0, "3 unread is below the default of 8");

    handle.set_notification_threshold(3)?;
    assert_eq!(queue.wakeup_count(), 1);
    tokio::time::timeout(Duration::from_secs(1), waiter).await??;

    let err = handle.set_notification_threshold(17).unwrap_err();
    assert!(matches!(err, TrackerError::InvalidThreshold { threshold: 17, capacity: 16 }));

    handle.close();
    h.service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_wakeup_rearms_after_consumer_progress() -> anyhow::Result<()> {
    let h = Harness::new();
    let collector = h.service.new_collector();
    let (handle, ring) = h.attach_queue(&collector, EventType::ThrottlingEnd.bit(), 8)?;
    handle.set_notification_threshold(1)?;
    let queue = handle.queue().expect("queue tracker").clone();

    h.service.record_throttling_end(&collector, page(0), ProcessorId::CPU);
    h.service.record_throttling_end(&collector, page(1), ProcessorId::CPU);
    assert_eq!(queue.wakeup_count(), 1, "same get cursor, no second wakeup");

    ring.drain();
    h.service.record_throttling_end(&collector, page(2), ProcessorId::CPU);
    assert_eq!(queue.wakeup_count(), 2);

    handle.close();
    h.service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_threshold_is_queue_only() -> anyhow::Result<()> {
    let h = Harness::new();
    let collector = h.service.new_collector();
    let (handle, _values) = h.attach_counters(&collector, 0b1, CounterScope::AllProcessors)?;

    let err = handle.set_notification_threshold(1).unwrap_err();
    assert!(matches!(err, TrackerError::WrongTrackerKind { expected: "queue" }));
    assert!(handle.wait_for_events().await.is_err());
    assert!(handle.queue().is_none());

    handle.close();
    h.service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_records_stay_within_their_collector() -> anyhow::Result<()> {
    let h = Harness::new();
    let a = h.service.new_collector();
    let b = h.service.new_collector();
    let (ha, ring_a) = h.attach_queue(&a, EventType::ThrottlingStart.bit(), 8)?;
    let (hb, ring_b) = h.attach_queue(&b, EventType::ThrottlingStart.bit(), 8)?;

    h.service.record_throttling_start(&a, page(1), ProcessorId::CPU);
    assert_eq!(ring_a.unread(), 1);
    assert_eq!(ring_b.unread(), 0, "records stay within their collector");

    ha.close();
    hb.close();
    h.service.shutdown().await;
    Ok(())
}
