use serde::Serialize;

use super::counter::CounterName;
use super::event::EventType;
use crate::kernel::deferred::DeferredPipeline;
use crate::kernel::registry::GlobalTools;

/// Point-in-time view of the tools core, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolsSnapshot {
    pub active_collectors: usize,
    /// Collectors with a non-empty list, per event type. Zero entries omitted.
    pub enabled_events: Vec<(EventType, u32)>,
    pub enabled_counters: Vec<(CounterName, u32)>,
    pub pending_channels: usize,
    pub live_records: usize,
}

impl ToolsSnapshot {
    pub fn events_enabled(&self, ty: EventType) -> u32 {
        self.enabled_events
            .iter()
            .find(|(t, _)| *t == ty)
            .map_or(0, |(_, n)| *n)
    }

    pub fn counters_enabled(&self, name: CounterName) -> u32 {
        self.enabled_counters
            .iter()
            .find(|(c, _)| *c == name)
            .map_or(0, |(_, n)| *n)
    }

    pub fn is_idle(&self) -> bool {
        self.active_collectors == 0
            && self.enabled_events.is_empty()
            && self.enabled_counters.is_empty()
            && self.pending_channels == 0
            && self.live_records == 0
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub fn compute_snapshot(global: &GlobalTools, pipeline: &DeferredPipeline) -> ToolsSnapshot {
    let enabled_events = global
        .enabled_events()
        .iter()
        .enumerate()
        .filter(|(_, n)| **n > 0)
        .filter_map(|(i, n)| EventType::from_wire(i as u8).map(|ty| (ty, *n)))
        .collect();

    let enabled_counters = CounterName::ALL
        .iter()
        .map(|name| (*name, global.enabled_counters()[name.index()]))
        .filter(|(_, n)| *n > 0)
        .collect();

    ToolsSnapshot {
        active_collectors: global.collectors().len(),
        enabled_events,
        enabled_counters,
        pending_channels: pipeline.pending_channels(),
        live_records: pipeline.live_records(),
    }
}
