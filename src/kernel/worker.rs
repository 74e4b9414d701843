use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::deferred::{DeferredPipeline, WorkItem};
use super::registry::Registry;

/// The single background task that delivers completed deferred records.
///
/// Holds the pipeline weakly: the pipeline owns the sender feeding this
/// task, and the task ends once that sender is gone.
pub(crate) struct Worker {
    receiver: mpsc::UnboundedReceiver<WorkItem>,
    registry: Arc<Registry>,
    pipeline: Weak<DeferredPipeline>,
}

impl Worker {
    pub(crate) fn new(
        receiver: mpsc::UnboundedReceiver<WorkItem>,
        registry: Arc<Registry>,
        pipeline: Weak<DeferredPipeline>,
    ) -> Self {
        Self {
            receiver,
            registry,
            pipeline,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!("tools worker started");
        let mut delivered = 0u64;

        while let Some(item) = self.receiver.recv().await {
            match item {
                WorkItem::Deliver(record) => {
                    record.deliver(&self.registry);
                    if let Some(pipeline) = self.pipeline.upgrade() {
                        pipeline.retire();
                    }
                    delivered += 1;
                }
                WorkItem::Flush(done) => {
                    debug!(delivered, "flush marker reached");
                    let _ = done.send(());
                }
            }
        }

        info!(delivered, "tools worker stopped");
    }
}
