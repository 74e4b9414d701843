//! Memory shared with consumer processes.
//!
//! The consumer owns these pages and may write anything into them at any
//! time. The core only ever touches them through a `PinnedRegion`, one
//! atomic word at a time, with indices validated before use.

pub mod shared;
pub mod user;

pub use shared::{speculation_barrier, SharedWords};
pub use user::{BufferDescriptor, PinnedRegion, UserAddressSpace, PAGE_SIZE};
