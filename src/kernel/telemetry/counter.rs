use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::TrackerError;
use crate::kernel::processor::ProcessorUuid;
use crate::memory::{speculation_barrier, PinnedRegion};

pub const COUNTER_COUNT: usize = 4;
pub const COUNTER_BYTES: u64 = (COUNTER_COUNT * std::mem::size_of::<u64>()) as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CounterName {
    BytesXferHtD = 0,
    BytesXferDtH = 1,
    CpuPageFaultCount = 2,
    GpuPageFaultCount = 3,
}

impl CounterName {
    pub const ALL: [CounterName; COUNTER_COUNT] = [
        CounterName::BytesXferHtD,
        CounterName::BytesXferDtH,
        CounterName::CpuPageFaultCount,
        CounterName::GpuPageFaultCount,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn bit(self) -> u64 {
        1u64 << self.index()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CounterMask(u64);

impl CounterMask {
    pub const ALL: u64 = (1u64 << COUNTER_COUNT) - 1;

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, name: CounterName) -> bool {
        self.0 & name.bit() != 0
    }

    pub fn validate(bits: u64) -> Result<Self, TrackerError> {
        if bits & !Self::ALL != 0 {
            return Err(TrackerError::InvalidMask { mask: bits, legal: Self::ALL });
        }
        Ok(Self(bits))
    }
}

impl FromIterator<CounterName> for CounterMask {
    fn from_iter<I: IntoIterator<Item = CounterName>>(iter: I) -> Self {
        Self(iter.into_iter().fold(0, |bits, name| bits | name.bit()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterScope {
    AllProcessors,
    Processor(ProcessorUuid),
}

/// Whether an all-processors subscriber counts an increment issued for
/// `processor`.
///
/// CPU faults on memory with a preferred location are reported against that
/// location as well as the CPU itself; the aggregate only takes the CPU one.
pub fn counter_matches_processor(name: CounterName, processor: &ProcessorUuid) -> bool {
    match name {
        CounterName::CpuPageFaultCount => *processor == ProcessorUuid::CPU_DEFAULT,
        _ => true,
    }
}

/// Accumulator page of one counter subscriber.
#[derive(Debug)]
pub struct CounterSet {
    scope: CounterScope,
    values: PinnedRegion,
    subscribed: AtomicU64,
}

impl CounterSet {
    pub fn new(values: PinnedRegion, scope: CounterScope) -> Result<Self, TrackerError> {
        if values.len_words() < COUNTER_COUNT {
            return Err(TrackerError::BufferTooSmall {
                va: values.va(),
                len: (values.len_words() * 8) as u64,
                needed: COUNTER_BYTES,
            });
        }
        Ok(Self {
            scope,
            values,
            subscribed: AtomicU64::new(0),
        })
    }

    pub fn scope(&self) -> CounterScope {
        self.scope
    }

    pub fn matches(&self, name: CounterName, processor: &ProcessorUuid) -> bool {
        match &self.scope {
            CounterScope::AllProcessors => counter_matches_processor(name, processor),
            CounterScope::Processor(uuid) => uuid == processor,
        }
    }

    /// Adds `amount` when this subscriber's scope covers `processor`.
    pub fn add(&self, name: CounterName, amount: u64, processor: &ProcessorUuid) -> bool {
        if !self.matches(name, processor) {
            return false;
        }
        speculation_barrier();
        match self.values.word(name.index()) {
            Some(w) => {
                w.fetch_add(amount, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn value(&self, name: CounterName) -> u64 {
        self.values
            .word(name.index())
            .map_or(0, |w| w.load(Ordering::Relaxed))
    }

    pub(crate) fn subscribed(&self) -> u64 {
        self.subscribed.load(Ordering::Acquire)
    }

    pub(crate) fn set_subscribed(&self, bits: u64) {
        self.subscribed.store(bits, Ordering::Release);
    }
}
