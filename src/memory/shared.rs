use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Word-addressed memory visible to both the core and a consumer process.
///
/// Every word is atomic: the consumer may read or scribble over any of them
/// at any time, so the core never holds a plain reference into this memory.
#[derive(Debug)]
pub struct SharedWords {
    words: Box<[AtomicU64]>,
    pins: AtomicU32,
}

impl SharedWords {
    pub fn zeroed(len_words: usize) -> Self {
        Self {
            words: (0..len_words).map(|_| AtomicU64::new(0)).collect(),
            pins: AtomicU32::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn word(&self, index: usize) -> Option<&AtomicU64> {
        self.words.get(index)
    }

    /// Number of live pins taken by attached trackers.
    pub fn pin_count(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }

    pub(crate) fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        let prev = self.pins.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "unpin of an unpinned consumer mapping");
    }

    // Consumer-side accessors. The core itself only goes through PinnedRegion.

    pub fn load(&self, index: usize) -> u64 {
        self.words.get(index).map_or(0, |w| w.load(Ordering::Acquire))
    }

    pub fn store(&self, index: usize, value: u64) {
        if let Some(w) = self.words.get(index) {
            w.store(value, Ordering::Release);
        }
    }
}

/// Stops the processor from speculating past this point with values read
/// from consumer-writable memory.
///
/// Call before any read of a control block or counter page; the masked
/// index derived afterwards is the only one allowed to reach memory.
#[inline(always)]
pub fn speculation_barrier() {
    #[cfg(target_arch = "x86_64")]
    #[allow(unused_unsafe)]
    // SAFETY: lfence has no memory-safety preconditions and SSE2 is baseline on x86_64.
    unsafe {
        std::arch::x86_64::_mm_lfence();
    }
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(Ordering::SeqCst);
}
