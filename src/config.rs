use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Upper bound on pages a single attach may pin. Stops a consumer from
/// handing the same pages over and over to overflow the pin count.
pub const DEFAULT_MAX_PAGE_COUNT: u64 = 1 << 20;

pub const DEFAULT_MAX_PENDING_RECORDS: usize = 65_536;

pub const DEFAULT_MAX_PERF_CALLBACKS: usize = 16;

/// Load-time knobs for the tools service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Makes the test-only event types legal in attach and enable masks.
    pub enable_builtin_tests: bool,
    pub max_page_count: u64,
    /// Live pending async records beyond this are dropped at submission.
    pub max_pending_records: usize,
    /// Capacity of each collector's producer callback table, per event kind.
    pub max_perf_callbacks: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enable_builtin_tests: false,
            max_page_count: DEFAULT_MAX_PAGE_COUNT,
            max_pending_records: DEFAULT_MAX_PENDING_RECORDS,
            max_perf_callbacks: DEFAULT_MAX_PERF_CALLBACKS,
        }
    }
}

impl ToolsConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: ToolsConfig = serde_json::from_str(text)?;
        if config.max_page_count == 0 {
            return Err(ConfigError::ZeroPageCount);
        }
        Ok(config)
    }

    pub fn with_builtin_tests(mut self) -> Self {
        self.enable_builtin_tests = true;
        self
    }
}
