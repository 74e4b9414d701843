use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Index of a processing unit. The CPU is always 0; GPUs follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessorId(u8);

impl ProcessorId {
    pub const CPU: ProcessorId = ProcessorId(0);
    /// The CPU plus 32 GPUs.
    pub const MAX_PROCESSORS: u8 = 33;

    pub fn gpu(index: u8) -> Option<Self> {
        (1..Self::MAX_PROCESSORS).contains(&index).then_some(Self(index))
    }

    #[inline]
    pub fn index(self) -> u8 {
        self.0
    }

    pub fn is_cpu(self) -> bool {
        self.0 == 0
    }

    pub fn is_gpu(self) -> bool {
        !self.is_cpu()
    }
}

/// Stable identity of a processing unit as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessorUuid(pub Uuid);

impl ProcessorUuid {
    pub const CPU_DEFAULT: ProcessorUuid = ProcessorUuid(Uuid::nil());

    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessorMask(u64);

impl ProcessorMask {
    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn insert(&mut self, id: ProcessorId) {
        self.0 |= 1u64 << id.index();
    }

    pub fn contains(self, id: ProcessorId) -> bool {
        self.0 & (1u64 << id.index()) != 0
    }
}

impl FromIterator<ProcessorId> for ProcessorMask {
    fn from_iter<I: IntoIterator<Item = ProcessorId>>(iter: I) -> Self {
        let mut mask = Self::default();
        iter.into_iter().for_each(|id| mask.insert(id));
        mask
    }
}

/// GPUs known to the driver.
#[derive(Debug, Default)]
pub struct ProcessorTable {
    gpus: BTreeMap<ProcessorId, ProcessorUuid>,
}

impl ProcessorTable {
    pub fn register_gpu(&mut self, id: ProcessorId, uuid: ProcessorUuid) {
        assert!(id.is_gpu(), "the CPU identity is fixed");
        self.gpus.insert(id, uuid);
    }

    pub fn unregister_gpu(&mut self, id: ProcessorId) -> bool {
        self.gpus.remove(&id).is_some()
    }

    pub fn uuid(&self, id: ProcessorId) -> Option<ProcessorUuid> {
        if id.is_cpu() {
            Some(ProcessorUuid::CPU_DEFAULT)
        } else {
            self.gpus.get(&id).copied()
        }
    }

    /// Identity per processor index; gaps hold the nil identity.
    pub fn uuid_table(&self) -> Vec<ProcessorUuid> {
        let len = self
            .gpus
            .keys()
            .next_back()
            .map_or(1, |id| id.index() as usize + 1);
        let mut table = vec![ProcessorUuid::CPU_DEFAULT; len];
        for (id, uuid) in &self.gpus {
            table[id.index() as usize] = *uuid;
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_ids_exclude_cpu_and_overflow() {
        assert!(ProcessorId::gpu(0).is_none());
        assert!(ProcessorId::gpu(ProcessorId::MAX_PROCESSORS).is_none());
        assert!(ProcessorId::gpu(1).is_some_and(ProcessorId::is_gpu));
    }

    #[test]
    fn uuid_table_is_indexed_by_processor() {
        let mut table = ProcessorTable::default();
        assert_eq!(table.uuid_table(), vec![ProcessorUuid::CPU_DEFAULT]);

        let gpu3 = ProcessorUuid::new_random();
        table.register_gpu(ProcessorId::gpu(3).unwrap(), gpu3);
        let uuids = table.uuid_table();
        assert_eq!(uuids.len(), 4);
        assert_eq!(uuids[3], gpu3);
        assert_eq!(uuids[0], ProcessorUuid::CPU_DEFAULT);
    }
}
