pub mod channel;
pub mod collector;
pub mod deferred;
pub mod perf;
pub mod processor;
pub mod producers;
pub mod registry;
pub mod service;
pub mod telemetry;
pub mod time;
pub mod tracker;
mod worker;
