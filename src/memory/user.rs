use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::shared::SharedWords;
use crate::error::TrackerError;

pub const PAGE_SIZE: u64 = 4096;

const WORD: u64 = std::mem::size_of::<u64>() as u64;

/// A consumer-supplied virtual range, as handed over at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDescriptor {
    pub va: u64,
    pub len: u64,
}

impl BufferDescriptor {
    pub fn new(va: u64, len: u64) -> Self {
        Self { va, len }
    }

    fn end(&self) -> Option<u64> {
        self.va.checked_add(self.len)
    }
}

#[derive(Debug)]
enum Backing {
    Consumer(Arc<SharedWords>),
    /// The driver's own device mapping; never accepted as a tools buffer.
    Reserved,
}

#[derive(Debug)]
struct Vma {
    start: u64,
    len: u64,
    backing: Backing,
}

impl Vma {
    fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// The consumer process's view of memory it can share with the core.
#[derive(Debug, Default)]
pub struct UserAddressSpace {
    vmas: RwLock<BTreeMap<u64, Vma>>,
}

impl UserAddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates zeroed shared memory at `[va, va + len)`.
    pub fn map_shared(&self, va: u64, len: u64) -> Result<Arc<SharedWords>, TrackerError> {
        let words = Arc::new(SharedWords::zeroed((len / WORD) as usize));
        self.insert(va, len, Backing::Consumer(words.clone()))?;
        Ok(words)
    }

    pub fn map_reserved(&self, va: u64, len: u64) -> Result<(), TrackerError> {
        self.insert(va, len, Backing::Reserved)
    }

    /// Removes the mapping starting at `va`. Pinned regions keep their
    /// backing alive until released.
    pub fn unmap(&self, va: u64) -> bool {
        self.vmas.write().remove(&va).is_some()
    }

    fn insert(&self, va: u64, len: u64, backing: Backing) -> Result<(), TrackerError> {
        let desc = BufferDescriptor::new(va, len);
        if len == 0 || va % WORD != 0 || len % WORD != 0 {
            return Err(TrackerError::MisalignedBuffer { va, len });
        }
        let end = desc.end().ok_or(TrackerError::MappingConflict { va, len })?;

        let mut vmas = self.vmas.write();
        let overlaps = vmas
            .range(..end)
            .next_back()
            .is_some_and(|(_, vma)| vma.end() > va);
        if overlaps {
            return Err(TrackerError::MappingConflict { va, len });
        }
        vmas.insert(va, Vma { start: va, len, backing });
        Ok(())
    }

    /// Pins `desc` and returns a core-side view of it.
    ///
    /// The whole range has to sit inside one consumer mapping. Walking stops
    /// at the first reserved mapping it meets.
    pub fn pin(&self, desc: BufferDescriptor, max_pages: u64) -> Result<PinnedRegion, TrackerError> {
        let BufferDescriptor { va, len } = desc;
        if len == 0 || va % WORD != 0 || len % WORD != 0 {
            return Err(TrackerError::MisalignedBuffer { va, len });
        }
        let end = desc.end().ok_or(TrackerError::UnmappedRange { va, len })?;

        let pages = len.div_ceil(PAGE_SIZE);
        if pages > max_pages {
            return Err(TrackerError::TooManyPages { va, pages, limit: max_pages });
        }

        let vmas = self.vmas.read();
        let containing = |addr: u64| {
            vmas.range(..=addr)
                .next_back()
                .map(|(_, vma)| vma)
                .filter(|vma| addr < vma.end())
        };

        let mut addr = va;
        while addr < end {
            let vma = containing(addr).ok_or(TrackerError::UnmappedRange { va, len })?;
            if matches!(vma.backing, Backing::Reserved) {
                return Err(TrackerError::ReservedOverlap { va, len });
            }
            addr = vma.end();
        }

        let vma = containing(va).ok_or(TrackerError::UnmappedRange { va, len })?;
        if end > vma.end() {
            return Err(TrackerError::UnmappedRange { va, len });
        }
        let Backing::Consumer(words) = &vma.backing else {
            return Err(TrackerError::ReservedOverlap { va, len });
        };

        words.pin();
        Ok(PinnedRegion {
            backing: words.clone(),
            va,
            offset: ((va - vma.start) / WORD) as usize,
            len: (len / WORD) as usize,
        })
    }
}

/// A pinned, core-mapped window onto consumer memory. Unpins on drop.
#[derive(Debug)]
pub struct PinnedRegion {
    backing: Arc<SharedWords>,
    va: u64,
    offset: usize,
    len: usize,
}

impl PinnedRegion {
    pub fn va(&self) -> u64 {
        self.va
    }

    pub fn len_words(&self) -> usize {
        self.len
    }

    /// Bounds-checked against this window, not just the backing mapping.
    #[inline]
    pub fn word(&self, index: usize) -> Option<&AtomicU64> {
        if index < self.len {
            self.backing.word(self.offset + index)
        } else {
            None
        }
    }
}

impl Drop for PinnedRegion {
    fn drop(&mut self) {
        self.backing.unpin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u64 = 1 << 20;

    #[test]
    fn pin_inside_one_mapping() {
        let space = UserAddressSpace::new();
        let words = space.map_shared(0x10000, 0x2000).unwrap();
        let region = space.pin(BufferDescriptor::new(0x10800, 0x100), MAX).unwrap();
        assert_eq!(region.len_words(), 0x20);
        assert_eq!(words.pin_count(), 1);
        assert!(region.word(0x20).is_none());
        drop(region);
        assert_eq!(words.pin_count(), 0);
    }

    #[test]
    fn reserved_mapping_is_rejected() {
        let space = UserAddressSpace::new();
        space.map_shared(0x10000, 0x1000).unwrap();
        space.map_reserved(0x11000, 0x1000).unwrap();
        let err = space.pin(BufferDescriptor::new(0x10800, 0x1000), MAX).unwrap_err();
        assert!(matches!(err, TrackerError::ReservedOverlap { .. }));
        let err = space.pin(BufferDescriptor::new(0x11000, 0x40), MAX).unwrap_err();
        assert!(matches!(err, TrackerError::ReservedOverlap { .. }));
    }

    #[test]
    fn gaps_and_splits_are_unmapped() {
        let space = UserAddressSpace::new();
        space.map_shared(0x10000, 0x1000).unwrap();
        space.map_shared(0x11000, 0x1000).unwrap();
        let err = space.pin(BufferDescriptor::new(0x20000, 0x40), MAX).unwrap_err();
        assert!(matches!(err, TrackerError::UnmappedRange { .. }));
        let err = space.pin(BufferDescriptor::new(0x10f00, 0x200), MAX).unwrap_err();
        assert!(matches!(err, TrackerError::UnmappedRange { .. }));
    }

    #[test]
    fn page_limit_and_alignment() {
        let space = UserAddressSpace::new();
        space.map_shared(0x10000, 0x4000).unwrap();
        let err = space.pin(BufferDescriptor::new(0x10000, 0x4000), 2).unwrap_err();
        assert!(matches!(err, TrackerError::TooManyPages { pages: 4, .. }));
        let err = space.pin(BufferDescriptor::new(0x10004, 0x40), MAX).unwrap_err();
        assert!(matches!(err, TrackerError::MisalignedBuffer { .. }));
    }

    #[test]
    fn overlapping_mappings_conflict() {
        let space = UserAddressSpace::new();
        space.map_shared(0x10000, 0x1000).unwrap();
        assert!(matches!(
            space.map_shared(0x10800, 0x1000),
            Err(TrackerError::MappingConflict { .. })
        ));
    }
}
