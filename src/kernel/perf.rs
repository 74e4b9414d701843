//! Producer-side performance events and the per-collector callback table.
//!
//! The fault handler and the migration engine report what they observe
//! through `Collector::notify`. Whoever registered for that kind of event
//! gets called, in registration order, with the event data.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::channel::CommandBatch;
use super::collector::Collector;
use super::processor::ProcessorId;
use super::telemetry::event::{
    Aperture, FaultClientType, FaultType, MemoryAccessType, MigrationCause,
};
use crate::error::TrackerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PerfEventKind {
    Fault,
    Migration,
}

impl PerfEventKind {
    const COUNT: usize = 2;

    fn slot(self) -> usize {
        match self {
            PerfEventKind::Fault => 0,
            PerfEventKind::Migration => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PerfEventKind::Fault => "fault",
            PerfEventKind::Migration => "migration",
        }
    }
}

/// Why the migration engine is moving pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MakeResidentCause {
    ReplayableFault,
    NonReplayableFault,
    AccessCounter,
    Prefetch,
    Eviction,
    /// The tools read/write-process-memory helpers. Never reported.
    ApiTools,
    ApiMigrate,
    ApiSetRangeGroup,
    ApiHint,
}

impl From<MakeResidentCause> for MigrationCause {
    fn from(cause: MakeResidentCause) -> Self {
        match cause {
            MakeResidentCause::ReplayableFault | MakeResidentCause::NonReplayableFault => {
                MigrationCause::Coherence
            }
            MakeResidentCause::AccessCounter => MigrationCause::AccessCounters,
            MakeResidentCause::Prefetch => MigrationCause::Prefetch,
            MakeResidentCause::Eviction => MigrationCause::Eviction,
            // Historical mapping, kept as is.
            MakeResidentCause::ApiTools => MigrationCause::Invalid,
            MakeResidentCause::ApiMigrate | MakeResidentCause::ApiHint => MigrationCause::User,
            MakeResidentCause::ApiSetRangeGroup => MigrationCause::Coherence,
        }
    }
}

/// Access type as decoded from a hardware fault buffer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultAccessType {
    Read,
    Write,
    AtomicStrong,
    AtomicWeak,
    Prefetch,
}

impl From<FaultAccessType> for MemoryAccessType {
    fn from(access: FaultAccessType) -> Self {
        match access {
            FaultAccessType::Read => MemoryAccessType::Read,
            FaultAccessType::Write => MemoryAccessType::Write,
            FaultAccessType::AtomicStrong | FaultAccessType::AtomicWeak => MemoryAccessType::Atomic,
            FaultAccessType::Prefetch => MemoryAccessType::Prefetch,
        }
    }
}

/// One decoded GPU fault buffer entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultEntry {
    pub address: u64,
    pub fault_type: FaultType,
    pub access_type: FaultAccessType,
    pub client_type: FaultClientType,
    pub is_replayable: bool,
    pub gpc_id: u16,
    pub channel_id: u16,
    pub client_id: u16,
    /// GPU time the fault was written to the buffer.
    pub timestamp: u64,
    /// Duplicates coalesced into this entry by the fault handler.
    pub merged_instances: Vec<FaultEntry>,
}

/// What an access counter notification points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCounterTarget {
    Virtual {
        address: u64,
        instance_ptr: u64,
        instance_ptr_aperture: Aperture,
        ve_id: u8,
    },
    Physical {
        address: u64,
        aperture: Aperture,
    },
}

/// One decoded access counter buffer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessCounterEntry {
    pub target: AccessCounterTarget,
    /// Raised by the CPU-side (MOMC) counters rather than the GPU's own.
    pub is_from_cpu: bool,
    pub counter_value: u32,
    pub sub_granularity: u32,
    pub tag: u32,
    pub bank: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuFault {
    pub address: u64,
    pub is_write: bool,
    pub pc: u64,
    pub pid: u32,
    pub thread_id: u32,
    pub preferred_location: Option<ProcessorId>,
}

#[derive(Debug, Clone, Copy)]
pub struct GpuFault<'a> {
    pub gpu: ProcessorId,
    pub batch_id: u32,
    pub entry: &'a FaultEntry,
}

#[derive(Debug, Clone, Copy)]
pub enum FaultEvent<'a> {
    Cpu(CpuFault),
    Gpu(GpuFault<'a>),
}

/// One copy pushed into `batch` by the migration engine.
#[derive(Debug)]
pub struct MigrationEvent<'a> {
    pub batch: &'a mut CommandBatch,
    pub src: ProcessorId,
    pub dst: ProcessorId,
    pub address: u64,
    pub bytes: u64,
    pub cause: MakeResidentCause,
}

#[derive(Debug)]
pub enum PerfEvent<'a> {
    Fault(FaultEvent<'a>),
    Migration(MigrationEvent<'a>),
}

impl PerfEvent<'_> {
    pub fn kind(&self) -> PerfEventKind {
        match self {
            PerfEvent::Fault(_) => PerfEventKind::Fault,
            PerfEvent::Migration(_) => PerfEventKind::Migration,
        }
    }
}

pub type PerfCallback = Arc<dyn Fn(&Arc<Collector>, &mut PerfEvent<'_>) + Send + Sync>;

struct Registration {
    owner: &'static str,
    callback: PerfCallback,
}

/// Registered callbacks per event kind, bounded in size.
pub struct PerfEventTable {
    capacity: usize,
    slots: [Vec<Registration>; PerfEventKind::COUNT],
}

impl PerfEventTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: [Vec::new(), Vec::new()],
        }
    }

    pub fn is_registered(&self, kind: PerfEventKind, owner: &'static str) -> bool {
        self.slots[kind.slot()].iter().any(|r| r.owner == owner)
    }

    pub fn register(
        &mut self,
        kind: PerfEventKind,
        owner: &'static str,
        callback: PerfCallback,
    ) -> Result<(), TrackerError> {
        let slot = &mut self.slots[kind.slot()];
        if slot.len() >= self.capacity {
            return Err(TrackerError::CallbackTableFull {
                kind: kind.name(),
                capacity: self.capacity,
            });
        }
        slot.push(Registration { owner, callback });
        Ok(())
    }

    pub fn unregister(&mut self, kind: PerfEventKind, owner: &'static str) -> bool {
        let slot = &mut self.slots[kind.slot()];
        let before = slot.len();
        slot.retain(|r| r.owner != owner);
        slot.len() != before
    }

    pub fn len(&self, kind: PerfEventKind) -> usize {
        self.slots[kind.slot()].len()
    }

    pub(crate) fn callbacks(&self, kind: PerfEventKind) -> impl Iterator<Item = &PerfCallback> {
        self.slots[kind.slot()].iter().map(|r| &r.callback)
    }
}

impl fmt::Debug for PerfEventTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owners = |kind: PerfEventKind| {
            self.slots[kind.slot()]
                .iter()
                .map(|r| r.owner)
                .collect::<Vec<_>>()
        };
        f.debug_struct("PerfEventTable")
            .field("capacity", &self.capacity)
            .field("fault", &owners(PerfEventKind::Fault))
            .field("migration", &owners(PerfEventKind::Migration))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> PerfCallback {
        Arc::new(|_: &Arc<Collector>, _: &mut PerfEvent<'_>| {})
    }

    #[test]
    fn cause_mapping_keeps_tools_invalid() {
        assert_eq!(MigrationCause::from(MakeResidentCause::ApiTools), MigrationCause::Invalid);
        assert_eq!(MigrationCause::from(MakeResidentCause::ApiSetRangeGroup), MigrationCause::Coherence);
        assert_eq!(MigrationCause::from(MakeResidentCause::ApiHint), MigrationCause::User);
        assert_eq!(MigrationCause::from(MakeResidentCause::AccessCounter), MigrationCause::AccessCounters);
    }

    #[test]
    fn both_atomic_flavours_map_to_atomic() {
        assert_eq!(MemoryAccessType::from(FaultAccessType::AtomicStrong), MemoryAccessType::Atomic);
        assert_eq!(MemoryAccessType::from(FaultAccessType::AtomicWeak), MemoryAccessType::Atomic);
    }

    #[test]
    fn table_is_bounded_per_kind() {
        let mut table = PerfEventTable::new(1);
        table.register(PerfEventKind::Fault, "a", noop()).unwrap();
        let err = table.register(PerfEventKind::Fault, "b", noop()).unwrap_err();
        assert!(matches!(err, TrackerError::CallbackTableFull { kind: "fault", capacity: 1 }));
        table.register(PerfEventKind::Migration, "b", noop()).unwrap();
        assert!(table.unregister(PerfEventKind::Fault, "a"));
        assert!(!table.is_registered(PerfEventKind::Fault, "a"));
    }
}
