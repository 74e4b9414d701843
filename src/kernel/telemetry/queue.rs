use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::event::{EventRecord, EventType, EVENT_TYPE_COUNT, RECORD_WORDS};
use crate::error::TrackerError;
use crate::memory::{speculation_barrier, PinnedRegion};

/// Word offsets inside the control block.
pub mod control {
    pub const GET_AHEAD: usize = 0;
    pub const GET_BEHIND: usize = 1;
    pub const PUT_AHEAD: usize = 2;
    pub const PUT_BEHIND: usize = 3;
    /// One drop counter per event type follows the cursors.
    pub const DROPPED: usize = 4;
}

pub const CONTROL_WORDS: usize = control::DROPPED + EVENT_TYPE_COUNT;
pub const CONTROL_BYTES: u64 = (CONTROL_WORDS * std::mem::size_of::<u64>()) as u64;

#[derive(Debug)]
struct WakeupState {
    threshold: u32,
    // A wakeup has been raised for this exact get_ahead value.
    wakeup_get: Option<u32>,
}

/// Cursor view taken under the queue lock, every value already masked.
#[derive(Debug, Clone, Copy)]
struct Snapshot {
    get_ahead: u32,
    put_behind: u32,
}

/// Single-producer-lock ring shared with one untrusted consumer.
///
/// One slot always stays empty, so a queue of capacity `C` holds at most
/// `C - 1` unread records.
#[derive(Debug)]
pub struct EventQueue {
    capacity: u32,
    control: PinnedRegion,
    records: PinnedRegion,
    state: Mutex<WakeupState>,
    notify: Notify,
    wakeups: AtomicU64,
    subscribed: AtomicU64,
}

impl EventQueue {
    pub fn new(control: PinnedRegion, records: PinnedRegion, capacity: u32) -> Result<Self, TrackerError> {
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(TrackerError::InvalidCapacity(capacity));
        }
        if control.len_words() < CONTROL_WORDS {
            return Err(TrackerError::BufferTooSmall {
                va: control.va(),
                len: (control.len_words() * 8) as u64,
                needed: CONTROL_BYTES,
            });
        }
        let needed_words = capacity as usize * RECORD_WORDS;
        if records.len_words() < needed_words {
            return Err(TrackerError::BufferTooSmall {
                va: records.va(),
                len: (records.len_words() * 8) as u64,
                needed: (needed_words * 8) as u64,
            });
        }

        Ok(Self {
            capacity,
            control,
            records,
            state: Mutex::new(WakeupState {
                threshold: capacity / 2,
                wakeup_get: None,
            }),
            notify: Notify::new(),
            wakeups: AtomicU64::new(0),
            subscribed: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    fn mask(&self) -> u32 {
        self.capacity - 1
    }

    #[inline]
    fn cursor(&self, index: usize) -> u32 {
        self.control
            .word(index)
            .map_or(0, |w| w.load(Ordering::Acquire) as u32)
    }

    fn publish(&self, put: u32) {
        for index in [control::PUT_AHEAD, control::PUT_BEHIND] {
            if let Some(w) = self.control.word(index) {
                w.store(put as u64, Ordering::Release);
            }
        }
    }

    /// Appends `record`, or bumps its type's drop counter when full.
    ///
    /// Returns whether the record was stored. Never blocks beyond the short
    /// per-queue lock.
    pub fn enqueue(&self, record: &EventRecord) -> bool {
        let ty = record.event_type();
        let mask = self.mask();

        speculation_barrier();
        let mut state = self.state.lock();

        // The consumer can write anything here; only masked values are used.
        let get_behind = self.cursor(control::GET_BEHIND) & mask;
        let put_behind = self.cursor(control::PUT_BEHIND) & mask;

        if (self.capacity + get_behind - put_behind) & mask == 1 {
            self.bump_dropped(ty);
            return false;
        }

        let base = put_behind as usize * RECORD_WORDS;
        for (i, word) in record.encode().into_iter().enumerate() {
            if let Some(slot) = self.records.word(base + i) {
                slot.store(word, Ordering::Relaxed);
            }
        }

        let put = (put_behind + 1) & mask;
        self.publish(put);

        let sn = Snapshot {
            get_ahead: self.cursor(control::GET_AHEAD) & mask,
            put_behind: put,
        };
        self.maybe_wake(&mut state, sn);
        true
    }

    fn bump_dropped(&self, ty: EventType) {
        if let Some(w) = self.control.word(control::DROPPED + ty.index()) {
            w.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn unread_in(&self, sn: Snapshot) -> u32 {
        (self.capacity + sn.put_behind - sn.get_ahead) & self.mask()
    }

    fn maybe_wake(&self, state: &mut WakeupState, sn: Snapshot) {
        if self.unread_in(sn) < state.threshold || state.wakeup_get == Some(sn.get_ahead) {
            return;
        }
        state.wakeup_get = Some(sn.get_ahead);
        self.wakeups.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    fn snapshot(&self) -> Snapshot {
        speculation_barrier();
        let mask = self.mask();
        Snapshot {
            get_ahead: self.cursor(control::GET_AHEAD) & mask,
            put_behind: self.cursor(control::PUT_BEHIND) & mask,
        }
    }

    /// Records published but not yet claimed by the consumer.
    pub fn unread(&self) -> u32 {
        let sn = self.snapshot();
        self.unread_in(sn)
    }

    pub fn threshold(&self) -> u32 {
        self.state.lock().threshold
    }

    /// Changes the wakeup threshold and re-evaluates it right away.
    pub fn set_threshold(&self, threshold: u32) -> Result<(), TrackerError> {
        if threshold > self.capacity {
            return Err(TrackerError::InvalidThreshold {
                threshold,
                capacity: self.capacity,
            });
        }
        let mut state = self.state.lock();
        state.threshold = threshold;
        let sn = self.snapshot();
        self.maybe_wake(&mut state, sn);
        Ok(())
    }

    /// Number of wakeups raised so far.
    pub fn wakeup_count(&self) -> u64 {
        self.wakeups.load(Ordering::Relaxed)
    }

    pub fn dropped(&self, ty: EventType) -> u64 {
        self.control
            .word(control::DROPPED + ty.index())
            .map_or(0, |w| w.load(Ordering::Relaxed))
    }

    /// Resolves once unread records reach the threshold.
    pub async fn wait_ready(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready = {
                let state = self.state.lock();
                self.unread() >= state.threshold
            };
            if ready {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn subscribed(&self) -> u64 {
        self.subscribed.load(Ordering::Acquire)
    }

    // Only ever written with the owning collector's subscription lock held
    // for write.
    pub(crate) fn set_subscribed(&self, bits: u64) {
        self.subscribed.store(bits, Ordering::Release);
    }
}
