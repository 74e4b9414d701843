pub mod config;
pub mod error;
pub mod kernel;
pub mod memory;

pub use config::ToolsConfig;
pub use error::{ErrorKind, TrackerError};
pub use kernel::service::ToolsService;
pub use kernel::tracker::{AttachRequest, CounterAttach, QueueAttach, Tracker, TrackerHandle};
