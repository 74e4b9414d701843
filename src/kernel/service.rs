use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::collector::{Collector, CollectorId};
use super::deferred::DeferredPipeline;
use super::perf::{PerfCallback, PerfEvent};
use super::processor::{ProcessorId, ProcessorTable, ProcessorUuid};
use super::registry::{Registry, ToolsCallbacks};
use super::telemetry::event::EventType;
use super::telemetry::metrics::{compute_snapshot, ToolsSnapshot};
use super::tracker::{self, AttachRequest, TrackerHandle};
use super::worker::Worker;
use crate::config::ToolsConfig;
use crate::error::TrackerError;
use crate::memory::UserAddressSpace;

/// Owner of every piece of global tools state.
///
/// Created by `init` when the driver loads and torn down by `shutdown`.
#[derive(Debug)]
pub struct ToolsService {
    pub(crate) config: ToolsConfig,
    pub(crate) registry: Arc<Registry>,
    pub(crate) pipeline: Arc<DeferredPipeline>,
    pub(crate) callbacks: ToolsCallbacks,
    processors: RwLock<ProcessorTable>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_collector: AtomicU64,
}

impl ToolsService {
    /// Brings the service up and starts the background worker on the
    /// current tokio runtime.
    pub fn init(config: ToolsConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Registry::new());
        let pipeline = Arc::new(DeferredPipeline::new(config.max_pending_records, tx));
        let worker = Worker::new(rx, registry.clone(), Arc::downgrade(&pipeline)).spawn();

        info!(
            builtin_tests = config.enable_builtin_tests,
            max_pending_records = config.max_pending_records,
            "tools service loaded"
        );

        Arc::new_cyclic(|weak: &Weak<ToolsService>| {
            let on_fault = weak.clone();
            let fault: PerfCallback = Arc::new(move |collector: &Arc<Collector>, event: &mut PerfEvent<'_>| {
                let Some(tools) = on_fault.upgrade() else {
                    return;
                };
                if let PerfEvent::Fault(fault) = event {
                    tools.on_fault(collector, fault);
                }
            });

            let on_migration = weak.clone();
            let migration: PerfCallback = Arc::new(move |collector: &Arc<Collector>, event: &mut PerfEvent<'_>| {
                let Some(tools) = on_migration.upgrade() else {
                    return;
                };
                if let PerfEvent::Migration(migration) = event {
                    tools.on_migration(collector, migration);
                }
            });

            ToolsService {
                config,
                registry,
                pipeline,
                callbacks: ToolsCallbacks { fault, migration },
                processors: RwLock::new(ProcessorTable::default()),
                worker: Mutex::new(Some(worker)),
                next_collector: AtomicU64::new(1),
            }
        })
    }

    pub fn config(&self) -> &ToolsConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Tracing state for a newly created address space.
    pub fn new_collector(&self) -> Arc<Collector> {
        let id = CollectorId(self.next_collector.fetch_add(1, Ordering::Relaxed));
        Arc::new(Collector::new(id, self.config.max_perf_callbacks))
    }

    pub fn register_gpu(&self, id: ProcessorId, uuid: ProcessorUuid) {
        self.processors.write().register_gpu(id, uuid);
    }

    pub fn unregister_gpu(&self, id: ProcessorId) -> bool {
        self.processors.write().unregister_gpu(id)
    }

    pub fn processor_uuid(&self, id: ProcessorId) -> Option<ProcessorUuid> {
        self.processors.read().uuid(id)
    }

    /// One identity per processor index, the CPU first.
    pub fn processor_uuid_table(&self) -> Vec<ProcessorUuid> {
        self.processors.read().uuid_table()
    }

    pub fn is_event_enabled_anywhere(&self, ty: EventType) -> bool {
        self.registry.is_event_enabled_anywhere(ty)
    }

    /// Validates, maps and subscribes a new tracker on `collector`.
    ///
    /// Buffers are looked up in `consumer`, the address space of the
    /// process that will read them.
    pub fn attach(
        self: &Arc<Self>,
        collector: &Arc<Collector>,
        consumer: &UserAddressSpace,
        request: AttachRequest,
    ) -> Result<TrackerHandle, TrackerError> {
        tracker::attach(self, collector, consumer, request)
    }

    /// Delivers everything pending on channels that have outstanding
    /// completions at the time of the call.
    pub async fn flush(&self) {
        self.pipeline.flush().await;
    }

    pub fn snapshot(&self) -> ToolsSnapshot {
        self.registry
            .with_global(|global| compute_snapshot(global, &self.pipeline))
    }

    /// Drains and stops the worker, then checks that every tracker is gone.
    pub async fn shutdown(&self) {
        self.pipeline.close();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                error!(error = %err, "tools worker failed");
                if err.is_panic() {
                    std::panic::resume_unwind(err.into_panic());
                }
                panic!("tools worker cancelled before draining: {err}");
            }
        }

        self.registry.with_global(|global| {
            assert!(global.collectors().is_empty(), "collectors still active at unload");
            assert!(
                global.enabled_events().iter().all(|c| *c == 0),
                "event subscriptions outstanding at unload"
            );
            assert!(
                global.enabled_counters().iter().all(|c| *c == 0),
                "counter subscriptions outstanding at unload"
            );
        });
        info!("tools service unloaded");
    }
}

impl Drop for ToolsService {
    fn drop(&mut self) {
        // Lets the worker run out its queue and exit when unload was skipped.
        self.pipeline.close();
    }
}
