//! Hardware command streams, as far as the tools core needs to see them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::deferred::CompletionToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

/// The hardware-progress side of a channel.
pub trait Channel: Send + Sync {
    fn id(&self) -> ChannelId;

    /// Observes finished batches and fires their completion tokens.
    ///
    /// Called from flush without any tools lock held.
    fn update_progress(&self);
}

impl std::fmt::Debug for dyn Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Channel").field(&self.id()).finish()
    }
}

/// A location the device writes a timestamp into when execution reaches it.
#[derive(Debug, Default)]
pub struct TimestampSlot(AtomicU64);

impl TimestampSlot {
    /// Device side.
    pub fn write(&self, value: u64) {
        self.0.store(value, Ordering::Release);
    }

    pub fn read(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

/// One submitted batch of commands on a channel.
pub struct CommandBatch {
    channel: Arc<dyn Channel>,
    timestamps: Vec<Arc<TimestampSlot>>,
    completion: Option<CompletionToken>,
}

impl CommandBatch {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            timestamps: Vec::new(),
            completion: None,
        }
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Appends a timestamp write to the batch and returns where it will land.
    pub fn push_timestamp(&mut self) -> Arc<TimestampSlot> {
        let slot = Arc::new(TimestampSlot::default());
        self.timestamps.push(slot.clone());
        slot
    }

    /// Timestamp writes in submission order.
    pub fn timestamps(&self) -> &[Arc<TimestampSlot>] {
        &self.timestamps
    }

    pub fn has_completion(&self) -> bool {
        self.completion.is_some()
    }

    /// A batch carries at most one completion; a second one is handed back.
    pub(crate) fn install_completion(&mut self, token: CompletionToken) -> Result<(), CompletionToken> {
        if self.completion.is_some() {
            return Err(token);
        }
        self.completion = Some(token);
        Ok(())
    }

    pub(crate) fn completion_mut(&mut self) -> Option<&mut CompletionToken> {
        self.completion.as_mut()
    }

    /// Hands the completion to the hardware-progress side once the batch is
    /// done executing.
    pub fn take_completion(&mut self) -> Option<CompletionToken> {
        self.completion.take()
    }
}

impl std::fmt::Debug for CommandBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBatch")
            .field("channel", &self.channel.id())
            .field("timestamps", &self.timestamps.len())
            .field("completion", &self.completion.is_some())
            .finish()
    }
}
