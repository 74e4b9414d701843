//! What travels to consumers: wire records, the shared ring, counters and
//! the record path that feeds them.
//!
//! Nothing in here blocks or fails on the producer side. A full ring or an
//! unsubscribed type is accounted for and dropped.

pub mod counter;
pub mod event;
pub mod metrics;
pub mod queue;
pub mod recorder;
