//! Declarative data source configuration.
//!
//! These structures mirror the `linux.perf` data source config and are deserialized from JSON.
//! They are deliberately dumb: validation and derivation of kernel attributes happen in
//! [`crate::event_config::EventConfig::create`].
//!
//! A minimal config looks like:
//!
//! ```json
//! {
//!   "name": "linux.perf",
//!   "perf_event_config": {
//!     "timebase": { "frequency": 100, "counter": "SW_CPU_CLOCK" },
//!     "callstack_sampling": {
//!       "scope": { "target_cmdline": ["app*"] },
//!       "kernel_frames": true,
//!       "user_frames": "UNWIND_FRAME_POINTER"
//!     }
//!   }
//! }
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// The name under which the producer registers its data source.
pub const PERF_DATA_SOURCE_NAME: &str = "linux.perf";

/// Builtin counters, named the way `perf_events.proto` names them.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Counter {
    SwCpuClock,
    SwPageFaults,
    SwTaskClock,
    SwContextSwitches,
    SwCpuMigrations,
    SwPageFaultsMin,
    SwPageFaultsMaj,
    SwAlignmentFaults,
    SwEmulationFaults,
    SwDummy,
    HwCpuCycles,
    HwInstructions,
    HwCacheReferences,
    HwCacheMisses,
    HwBranchInstructions,
    HwBranchMisses,
    HwBusCycles,
    HwStalledCyclesFrontend,
    HwStalledCyclesBackend,
    HwRefCpuCycles,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PerfClock {
    PerfClockUnknown,
    PerfClockRealtime,
    PerfClockMonotonic,
    PerfClockMonotonicRaw,
    PerfClockBoottime,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventModifier {
    EventModifierCountUserspace,
    EventModifierCountKernel,
    EventModifierCountHypervisor,
}

/// How userspace frames get unwound. Anything we don't know about deserializes to
/// `Unsupported` and is rejected when the event config is built.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnwindModeConfig {
    #[default]
    UnwindUnknown,
    UnwindSkip,
    UnwindDwarf,
    UnwindFramePointer,
    #[serde(other)]
    Unsupported,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct Tracepoint {
    /// `group:name` or `group/name`.
    pub name: String,
    pub filter: String,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub type_: u32,
    pub config: u64,
    pub config1: u64,
    pub config2: u64,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields, default)]
pub struct Timebase {
    pub frequency: Option<u64>,
    pub period: Option<u64>,
    pub poll_period_ms: Option<u32>,
    pub counter: Option<Counter>,
    pub tracepoint: Option<Tracepoint>,
    pub raw_event: Option<RawEvent>,
    pub modifiers: Vec<EventModifier>,
    pub timestamp_clock: Option<PerfClock>,
    pub name: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields, default)]
pub struct Follower {
    pub counter: Option<Counter>,
    pub tracepoint: Option<Tracepoint>,
    pub raw_event: Option<RawEvent>,
    pub modifiers: Vec<EventModifier>,
    pub name: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields, default)]
pub struct Scope {
    pub target_pid: Vec<i32>,
    pub target_cmdline: Vec<String>,
    pub exclude_pid: Vec<i32>,
    pub exclude_cmdline: Vec<String>,
    pub additional_cmdline_count: u32,
    pub process_shard_count: u32,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields, default)]
pub struct CallstackSampling {
    pub scope: Option<Scope>,
    pub kernel_frames: bool,
    pub user_frames: UnwindModeConfig,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields, default)]
pub struct PerfEventConfig {
    pub timebase: Option<Timebase>,
    pub followers: Vec<Follower>,
    pub callstack_sampling: Option<CallstackSampling>,
    pub target_cpu: Vec<u32>,
    pub ring_buffer_read_period_ms: Option<u32>,
    pub ring_buffer_pages: Option<u32>,
    pub max_enqueued_footprint_kb: Option<u64>,
    pub max_daemon_memory_kb: Option<u32>,
    pub remote_descriptor_timeout_ms: Option<u32>,
    pub unwind_state_clear_period_ms: Option<u32>,
}

/// One data source instance as handed to the producer by the service.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct DataSourceConfig {
    #[serde(default = "default_data_source_name")]
    pub name: String,
    #[serde(default)]
    pub target_buffer: u32,
    #[serde(default)]
    pub tracing_session_id: u64,
    #[serde(default)]
    pub perf_event_config: PerfEventConfig,
}

fn default_data_source_name() -> String {
    PERF_DATA_SOURCE_NAME.to_string()
}

impl DataSourceConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse data source config")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Invalid config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let config = DataSourceConfig::from_json("{}").unwrap();
        assert_eq!(config.name, "linux.perf");
        assert!(config.perf_event_config.timebase.is_none());
        assert!(config.perf_event_config.callstack_sampling.is_none());
    }

    #[test]
    fn test_parse_full() {
        let json = r#"
        {
            "name": "linux.perf",
            "target_buffer": 1,
            "tracing_session_id": 42,
            "perf_event_config": {
                "timebase": {
                    "frequency": 100,
                    "counter": "HW_CPU_CYCLES",
                    "modifiers": ["EVENT_MODIFIER_COUNT_USERSPACE"],
                    "timestamp_clock": "PERF_CLOCK_BOOTTIME",
                    "name": "cycles"
                },
                "followers": [
                    { "counter": "SW_PAGE_FAULTS" },
                    { "tracepoint": { "name": "sched:sched_switch", "filter": "prev_pid == 1" } },
                    { "raw_event": { "type": 4, "config": 192 } }
                ],
                "callstack_sampling": {
                    "scope": {
                        "target_cmdline": ["app*"],
                        "exclude_pid": [7],
                        "process_shard_count": 4
                    },
                    "kernel_frames": true,
                    "user_frames": "UNWIND_DWARF"
                },
                "ring_buffer_pages": 64,
                "max_enqueued_footprint_kb": 1024
            }
        }"#;
        let config = DataSourceConfig::from_json(json).unwrap();
        assert_eq!(config.tracing_session_id, 42);
        let perf = &config.perf_event_config;
        let timebase = perf.timebase.as_ref().unwrap();
        assert_eq!(timebase.counter, Some(Counter::HwCpuCycles));
        assert_eq!(timebase.timestamp_clock, Some(PerfClock::PerfClockBoottime));
        assert_eq!(perf.followers.len(), 3);
        assert_eq!(perf.followers[2].raw_event.as_ref().unwrap().type_, 4);
        let callstack = perf.callstack_sampling.as_ref().unwrap();
        assert_eq!(callstack.user_frames, UnwindModeConfig::UnwindDwarf);
        assert_eq!(callstack.scope.as_ref().unwrap().process_shard_count, 4);
    }

    #[test]
    fn test_unknown_unwind_mode_is_unsupported() {
        let json = r#"{ "perf_event_config": { "callstack_sampling": { "user_frames": "UNWIND_FUTURE" } } }"#;
        let config = DataSourceConfig::from_json(json).unwrap();
        let callstack = config.perf_event_config.callstack_sampling.unwrap();
        assert_eq!(callstack.user_frames, UnwindModeConfig::Unsupported);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let json = r#"{ "perf_event_config": { "bogus": 1 } }"#;
        assert!(DataSourceConfig::from_json(json).is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf.json");
        std::fs::write(&path, r#"{ "target_buffer": 3 }"#).unwrap();
        let config = DataSourceConfig::from_file(&path).unwrap();
        assert_eq!(config.target_buffer, 3);
        assert!(DataSourceConfig::from_file(&dir.path().join("missing.json")).is_err());
    }
}
