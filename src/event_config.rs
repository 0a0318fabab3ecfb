//! Translation of a declarative [`PerfEventConfig`] into kernel event attributes and the
//! derived sampling policy.

use std::collections::HashSet;

use anyhow::{bail, Context, Result};

use crate::config::{
    CallstackSampling, Counter, EventModifier, Follower, PerfClock, PerfEventConfig, RawEvent,
    Timebase, Tracepoint, UnwindModeConfig,
};
use crate::perf::{self, perf_event_attr};
use crate::regs;
use crate::target_filter::{GlobPattern, ProcessSharding, TargetFilter};
use crate::utils::page_size;

const DEFAULT_SAMPLING_FREQUENCY_HZ: u64 = 10;
const DEFAULT_DATA_PAGES_PER_RING_BUFFER: u32 = 256;
const DEFAULT_READ_TICK_PERIOD_MS: u32 = 100;
const DEFAULT_REMOTE_DESCRIPTOR_TIMEOUT_MS: u32 = 100;

/// Requested userspace stack snapshot size. Multiple of 8 and small enough that a full sample
/// still fits the u16 record size, the kernel clamps it further when needed.
pub const SAMPLE_STACK_USER_BYTES: u32 = 64 * 1024 - 1024;

/// Resolves a tracepoint `(group, name)` to its id, 0 if unknown.
pub type TracepointIdLookup<'a> = dyn Fn(&str, &str) -> u32 + 'a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfCounterKind {
    BuiltinCounter,
    Tracepoint,
    RawEvent,
}

/// One logical event: what gets handed to `perf_event_open`, plus enough of the original
/// description to describe it in the trace.
#[derive(Debug, Clone)]
pub struct PerfCounter {
    pub kind: PerfCounterKind,
    /// Optional user supplied label.
    pub name: String,
    pub attr_type: u32,
    pub attr_config: u64,
    pub attr_config1: u64,
    pub attr_config2: u64,
    pub exclude_user: bool,
    pub exclude_kernel: bool,
    pub exclude_hv: bool,
    pub counter: Option<Counter>,
    pub tracepoint_name: String,
    pub tracepoint_filter: String,
}

impl PerfCounter {
    fn base(kind: PerfCounterKind, name: String, attr_type: u32, attr_config: u64) -> Self {
        PerfCounter {
            kind,
            name,
            attr_type,
            attr_config,
            attr_config1: 0,
            attr_config2: 0,
            exclude_user: false,
            exclude_kernel: false,
            exclude_hv: false,
            counter: None,
            tracepoint_name: String::new(),
            tracepoint_filter: String::new(),
        }
    }

    pub fn builtin_counter(name: String, counter: Counter) -> Self {
        let (attr_type, attr_config) = builtin_counter_attr(counter);
        let mut ret = Self::base(PerfCounterKind::BuiltinCounter, name, attr_type, attr_config);
        ret.counter = Some(counter);
        ret
    }

    pub fn tracepoint(name: String, tracepoint_name: &str, filter: &str, id: u32) -> Self {
        let mut ret = Self::base(
            PerfCounterKind::Tracepoint,
            name,
            perf::PERF_TYPE_TRACEPOINT,
            id as u64,
        );
        ret.tracepoint_name = tracepoint_name.to_string();
        ret.tracepoint_filter = filter.to_string();
        ret
    }

    pub fn raw_event(name: String, raw: &RawEvent) -> Self {
        let mut ret = Self::base(PerfCounterKind::RawEvent, name, raw.type_, raw.config);
        ret.attr_config1 = raw.config1;
        ret.attr_config2 = raw.config2;
        ret
    }

    pub fn is_tracepoint(&self) -> bool {
        self.kind == PerfCounterKind::Tracepoint
    }

    fn apply_modifiers(&mut self, modifiers: &[EventModifier]) {
        // No modifiers means count everything.
        if modifiers.is_empty() {
            return;
        }
        self.exclude_user = !modifiers.contains(&EventModifier::EventModifierCountUserspace);
        self.exclude_kernel = !modifiers.contains(&EventModifier::EventModifierCountKernel);
        self.exclude_hv = !modifiers.contains(&EventModifier::EventModifierCountHypervisor);
    }

    fn fill_attr(&self, attr: &mut perf_event_attr) {
        attr._type = self.attr_type;
        attr.config = self.attr_config;
        attr.bp_1.config1 = self.attr_config1;
        attr.bp_2.config2 = self.attr_config2;
        attr.flags.set_exclude_user(self.exclude_user as u64);
        attr.flags.set_exclude_kernel(self.exclude_kernel as u64);
        attr.flags.set_exclude_hv(self.exclude_hv as u64);
    }
}

fn builtin_counter_attr(counter: Counter) -> (u32, u64) {
    use perf::*;
    match counter {
        Counter::SwCpuClock => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_CLOCK),
        Counter::SwPageFaults => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS),
        Counter::SwTaskClock => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_TASK_CLOCK),
        Counter::SwContextSwitches => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CONTEXT_SWITCHES),
        Counter::SwCpuMigrations => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_MIGRATIONS),
        Counter::SwPageFaultsMin => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS_MIN),
        Counter::SwPageFaultsMaj => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS_MAJ),
        Counter::SwAlignmentFaults => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_ALIGNMENT_FAULTS),
        Counter::SwEmulationFaults => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_EMULATION_FAULTS),
        Counter::SwDummy => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_DUMMY),
        Counter::HwCpuCycles => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
        Counter::HwInstructions => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS),
        Counter::HwCacheReferences => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_REFERENCES),
        Counter::HwCacheMisses => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_MISSES),
        Counter::HwBranchInstructions => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_INSTRUCTIONS),
        Counter::HwBranchMisses => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_MISSES),
        Counter::HwBusCycles => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BUS_CYCLES),
        Counter::HwStalledCyclesFrontend => {
            (PERF_TYPE_HARDWARE, PERF_COUNT_HW_STALLED_CYCLES_FRONTEND)
        }
        Counter::HwStalledCyclesBackend => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_STALLED_CYCLES_BACKEND),
        Counter::HwRefCpuCycles => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_REF_CPU_CYCLES),
    }
}

/// Splits `group:name` or `group/name`.
fn split_tracepoint_name(full_name: &str) -> Option<(&str, &str)> {
    let (group, name) = full_name.split_once([':', '/'])?;
    if group.is_empty() || name.is_empty() {
        return None;
    }
    Some((group, name))
}

fn make_counter(
    name: Option<&String>,
    counter: Option<Counter>,
    tracepoint: Option<&Tracepoint>,
    raw_event: Option<&RawEvent>,
    modifiers: &[EventModifier],
    tracepoint_id_lookup: &TracepointIdLookup<'_>,
) -> Result<PerfCounter> {
    let name = name.cloned().unwrap_or_default();
    let mut ret = match (counter, tracepoint, raw_event) {
        (Some(counter), None, None) => PerfCounter::builtin_counter(name, counter),
        (None, Some(tp), None) => {
            let (group, tp_name) = split_tracepoint_name(&tp.name)
                .with_context(|| format!("Invalid tracepoint name {}", tp.name))?;
            let id = tracepoint_id_lookup(group, tp_name);
            if id == 0 {
                bail!("Failed to find tracepoint {}", tp.name);
            }
            PerfCounter::tracepoint(name, &tp.name, &tp.filter, id)
        }
        (None, None, Some(raw)) => PerfCounter::raw_event(name, raw),
        (None, None, None) => PerfCounter::builtin_counter(name, Counter::SwCpuClock),
        _ => bail!("An event can only be one of counter, tracepoint or raw_event"),
    };
    ret.apply_modifiers(modifiers);
    Ok(ret)
}

fn make_timebase(
    timebase: &Timebase,
    tracepoint_id_lookup: &TracepointIdLookup<'_>,
) -> Result<PerfCounter> {
    make_counter(
        timebase.name.as_ref(),
        timebase.counter,
        timebase.tracepoint.as_ref(),
        timebase.raw_event.as_ref(),
        &timebase.modifiers,
        tracepoint_id_lookup,
    )
}

fn make_follower(
    follower: &Follower,
    tracepoint_id_lookup: &TracepointIdLookup<'_>,
) -> Result<PerfCounter> {
    if follower.counter.is_none() && follower.tracepoint.is_none() && follower.raw_event.is_none()
    {
        bail!("Follower event without an event");
    }
    make_counter(
        follower.name.as_ref(),
        follower.counter,
        follower.tracepoint.as_ref(),
        follower.raw_event.as_ref(),
        &follower.modifiers,
        tracepoint_id_lookup,
    )
}

fn clock_id(clock: Option<PerfClock>) -> libc::clockid_t {
    match clock {
        Some(PerfClock::PerfClockRealtime) => libc::CLOCK_REALTIME,
        Some(PerfClock::PerfClockMonotonic) => libc::CLOCK_MONOTONIC,
        Some(PerfClock::PerfClockBoottime) => libc::CLOCK_BOOTTIME,
        Some(PerfClock::PerfClockMonotonicRaw) | Some(PerfClock::PerfClockUnknown) | None => {
            libc::CLOCK_MONOTONIC_RAW
        }
    }
}

fn parse_target_filter(
    callstack: &CallstackSampling,
    process_sharding: Option<ProcessSharding>,
) -> Result<TargetFilter> {
    let mut filter = TargetFilter {
        process_sharding,
        ..Default::default()
    };
    let Some(scope) = callstack.scope.as_ref() else {
        return Ok(filter);
    };
    for pattern in &scope.target_cmdline {
        filter.cmdlines.push(GlobPattern::new(pattern)?);
    }
    for pattern in &scope.exclude_cmdline {
        filter.exclude_cmdlines.push(GlobPattern::new(pattern)?);
    }
    filter.pids = scope.target_pid.iter().copied().collect::<HashSet<_>>();
    filter.exclude_pids = scope.exclude_pid.iter().copied().collect::<HashSet<_>>();
    filter.additional_cmdline_count = scope.additional_cmdline_count;
    Ok(filter)
}

/// How userspace frames are recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindMode {
    Skip,
    /// Full unwinding of the sampled stack.
    UnwindStack,
    FramePointer,
}

/// The sampling cadence of the timebase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingInterval {
    Frequency(u64),
    Period(u64),
    PollPeriodMs(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingMode {
    /// Counters are sampled into a ring buffer by the kernel.
    Sampling,
    /// Counters are read with `read(2)` on every tick.
    Polling,
}

/// Everything a data source needs to open, read and process its events. Immutable once
/// created.
#[derive(Debug, Clone)]
pub struct EventConfig {
    timebase: PerfCounter,
    followers: Vec<PerfCounter>,
    interval: SamplingInterval,
    perf_event_attr: perf_event_attr,
    perf_event_followers: Vec<perf_event_attr>,
    target_cpus: Vec<u32>,
    ring_buffer_pages: u32,
    read_tick_period_ms: u32,
    samples_per_tick_limit: u64,
    sample_callstacks: bool,
    kernel_frames: bool,
    unwind_mode: UnwindMode,
    filter: TargetFilter,
    max_enqueued_footprint_bytes: u64,
    remote_descriptor_timeout_ms: u32,
    unwind_state_clear_period_ms: u32,
    max_daemon_memory_kb: u32,
    timestamp_clock: Option<PerfClock>,
    timebase_name: Option<String>,
}

impl EventConfig {
    /// Validates `cfg` and derives the kernel attributes. Returns `None`, after logging why, if
    /// the config can't be honoured.
    pub fn create(
        cfg: &PerfEventConfig,
        process_sharding: Option<ProcessSharding>,
        tracepoint_id_lookup: &TracepointIdLookup<'_>,
    ) -> Option<EventConfig> {
        match Self::try_create(cfg, process_sharding, tracepoint_id_lookup) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::error!("Rejecting perf event config: {e:#}");
                None
            }
        }
    }

    fn try_create(
        cfg: &PerfEventConfig,
        process_sharding: Option<ProcessSharding>,
        tracepoint_id_lookup: &TracepointIdLookup<'_>,
    ) -> Result<EventConfig> {
        let default_timebase = Timebase::default();
        let tb = cfg.timebase.as_ref().unwrap_or(&default_timebase);

        let timebase = make_timebase(tb, tracepoint_id_lookup)?;
        let followers = cfg
            .followers
            .iter()
            .map(|f| make_follower(f, tracepoint_id_lookup))
            .collect::<Result<Vec<_>>>()?;

        let interval = match (tb.frequency, tb.period, tb.poll_period_ms) {
            (None, None, Some(poll_ms)) if poll_ms > 0 => {
                if cfg.callstack_sampling.is_some() {
                    bail!("Polling mode is incompatible with callstack sampling");
                }
                if !cfg.target_cpu.is_empty() {
                    bail!("Polling mode is incompatible with a target_cpu restriction");
                }
                if cfg.ring_buffer_read_period_ms.is_some() {
                    bail!("Polling mode is incompatible with ring_buffer_read_period_ms");
                }
                SamplingInterval::PollPeriodMs(poll_ms)
            }
            (Some(freq), None, None) if freq > 0 => SamplingInterval::Frequency(freq),
            (None, Some(period), None) if period > 0 => SamplingInterval::Period(period),
            (None, None, None) => SamplingInterval::Frequency(DEFAULT_SAMPLING_FREQUENCY_HZ),
            _ => bail!("Timebase needs exactly one non-zero frequency, period or poll_period_ms"),
        };

        let ring_buffer_pages = cfg
            .ring_buffer_pages
            .filter(|p| *p > 0)
            .unwrap_or(DEFAULT_DATA_PAGES_PER_RING_BUFFER);
        if !ring_buffer_pages.is_power_of_two() {
            bail!("ring_buffer_pages {ring_buffer_pages} is not a power of two");
        }

        let read_tick_period_ms = match interval {
            SamplingInterval::PollPeriodMs(poll_ms) => poll_ms,
            _ => cfg
                .ring_buffer_read_period_ms
                .filter(|p| *p > 0)
                .unwrap_or(DEFAULT_READ_TICK_PERIOD_MS),
        };

        // Bounds how long a single tick can spend draining the ring buffers. Period based
        // timebases have no predictable rate, assume the smallest possible sample.
        let samples_per_tick_limit = match interval {
            SamplingInterval::Frequency(freq) => {
                let per_tick = freq.saturating_mul(read_tick_period_ms as u64) / 1000;
                per_tick.saturating_add(1).saturating_mul(2)
            }
            SamplingInterval::Period(_) => {
                ring_buffer_pages as u64 * (page_size() as u64 / 8)
            }
            SamplingInterval::PollPeriodMs(_) => 0,
        };

        let sample_callstacks = cfg.callstack_sampling.is_some();
        let (kernel_frames, unwind_mode, filter) = match cfg.callstack_sampling.as_ref() {
            Some(callstack) => {
                let unwind_mode = match callstack.user_frames {
                    UnwindModeConfig::UnwindUnknown | UnwindModeConfig::UnwindDwarf => {
                        UnwindMode::UnwindStack
                    }
                    UnwindModeConfig::UnwindFramePointer => UnwindMode::FramePointer,
                    UnwindModeConfig::UnwindSkip => UnwindMode::Skip,
                    UnwindModeConfig::Unsupported => bail!("Unsupported user_frames unwind mode"),
                };
                if unwind_mode != UnwindMode::Skip && !regs::user_frames_supported() {
                    bail!("Userspace unwinding is not supported on this architecture");
                }
                let filter = parse_target_filter(callstack, process_sharding)?;
                (callstack.kernel_frames, unwind_mode, filter)
            }
            None => (false, UnwindMode::Skip, TargetFilter::default()),
        };
        let user_frames = sample_callstacks && unwind_mode != UnwindMode::Skip;

        let clock = clock_id(tb.timestamp_clock);
        let has_followers = !followers.is_empty();

        let mut attr = perf_event_attr::zeroed();
        timebase.fill_attr(&mut attr);
        // Enabled explicitly once every CPU's reader is set up.
        attr.flags.set_disabled(1);
        attr.flags.set_use_clockid(1);
        attr.clockid = clock;
        attr.sample_type = perf::PERF_SAMPLE_TID | perf::PERF_SAMPLE_TIME | perf::PERF_SAMPLE_READ;
        if has_followers {
            attr.read_format = perf::PERF_FORMAT_GROUP;
        }
        match interval {
            SamplingInterval::Frequency(freq) => {
                attr.flags.set_freq(1);
                attr.sample.sample_freq = freq;
            }
            SamplingInterval::Period(period) => {
                attr.sample.sample_period = period;
            }
            SamplingInterval::PollPeriodMs(_) => {}
        }
        if kernel_frames && sample_callstacks {
            attr.sample_type |= perf::PERF_SAMPLE_CALLCHAIN;
            // Userspace frames come from our own unwinding.
            attr.flags.set_exclude_callchain_user(1);
        }
        if user_frames {
            attr.sample_type |= perf::PERF_SAMPLE_REGS_USER | perf::PERF_SAMPLE_STACK_USER;
            attr.sample_regs_user = regs::USER_REGS_MASK;
            attr.sample_stack_user = SAMPLE_STACK_USER_BYTES;
        }

        let perf_event_followers = followers
            .iter()
            .map(|follower| {
                let mut follower_attr = perf_event_attr::zeroed();
                follower.fill_attr(&mut follower_attr);
                follower_attr.flags.set_use_clockid(1);
                follower_attr.clockid = clock;
                follower_attr.read_format = perf::PERF_FORMAT_GROUP;
                follower_attr
            })
            .collect();

        Ok(EventConfig {
            timebase,
            followers,
            interval,
            perf_event_attr: attr,
            perf_event_followers,
            target_cpus: cfg.target_cpu.clone(),
            ring_buffer_pages,
            read_tick_period_ms,
            samples_per_tick_limit,
            sample_callstacks,
            kernel_frames: sample_callstacks && kernel_frames,
            unwind_mode,
            filter,
            max_enqueued_footprint_bytes: cfg.max_enqueued_footprint_kb.unwrap_or(0) * 1024,
            remote_descriptor_timeout_ms: cfg
                .remote_descriptor_timeout_ms
                .filter(|t| *t > 0)
                .unwrap_or(DEFAULT_REMOTE_DESCRIPTOR_TIMEOUT_MS),
            unwind_state_clear_period_ms: cfg.unwind_state_clear_period_ms.unwrap_or(0),
            max_daemon_memory_kb: cfg.max_daemon_memory_kb.unwrap_or(0),
            timestamp_clock: tb.timestamp_clock,
            timebase_name: tb.name.clone(),
        })
    }

    pub fn timebase_event(&self) -> &PerfCounter {
        &self.timebase
    }

    pub fn follower_events(&self) -> &[PerfCounter] {
        &self.followers
    }

    pub fn perf_attr(&self) -> &perf_event_attr {
        &self.perf_event_attr
    }

    pub fn follower_attrs(&self) -> &[perf_event_attr] {
        &self.perf_event_followers
    }

    pub fn interval(&self) -> SamplingInterval {
        self.interval
    }

    pub fn recording_mode(&self) -> RecordingMode {
        match self.interval {
            SamplingInterval::PollPeriodMs(_) => RecordingMode::Polling,
            _ => RecordingMode::Sampling,
        }
    }

    pub fn target_cpus(&self) -> &[u32] {
        &self.target_cpus
    }

    pub fn ring_buffer_pages(&self) -> u32 {
        self.ring_buffer_pages
    }

    pub fn read_tick_period_ms(&self) -> u32 {
        self.read_tick_period_ms
    }

    pub fn samples_per_tick_limit(&self) -> u64 {
        self.samples_per_tick_limit
    }

    pub fn sample_callstacks(&self) -> bool {
        self.sample_callstacks
    }

    pub fn kernel_frames(&self) -> bool {
        self.kernel_frames
    }

    pub fn user_frames(&self) -> bool {
        self.sample_callstacks && self.unwind_mode != UnwindMode::Skip
    }

    pub fn unwind_mode(&self) -> UnwindMode {
        self.unwind_mode
    }

    pub fn filter(&self) -> &TargetFilter {
        &self.filter
    }

    pub fn max_enqueued_footprint_bytes(&self) -> u64 {
        self.max_enqueued_footprint_bytes
    }

    pub fn remote_descriptor_timeout_ms(&self) -> u32 {
        self.remote_descriptor_timeout_ms
    }

    pub fn unwind_state_clear_period_ms(&self) -> u32 {
        self.unwind_state_clear_period_ms
    }

    pub fn max_daemon_memory_kb(&self) -> u32 {
        self.max_daemon_memory_kb
    }

    pub fn timestamp_clock(&self) -> Option<PerfClock> {
        self.timestamp_clock
    }

    pub fn timebase_name(&self) -> Option<&str> {
        self.timebase_name.as_deref()
    }

    /// The clock the kernel stamps samples with.
    pub fn clock_id(&self) -> libc::clockid_t {
        self.perf_event_attr.clockid
    }
}
