//! Trace output: writers for finished packets, and the builders for every packet the producer
//! emits.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use perfetto_protos::builtin_clock::BuiltinClock;
use perfetto_protos::interned_data::InternedData;
use perfetto_protos::perf_events::perf_events::{
    Counter as ProtoCounter, FollowerEvent as ProtoFollower, RawEvent as ProtoRawEvent,
    Timebase as ProtoTimebase, Tracepoint as ProtoTracepoint,
};
use perfetto_protos::profile_packet::perf_sample::producer_event::DataSourceStopReason;
use perfetto_protos::profile_packet::perf_sample::{
    ProducerEvent, SampleSkipReason as ProtoSkipReason,
};
use perfetto_protos::profile_packet::profiling::{CpuMode, StackUnwindError};
use perfetto_protos::profile_packet::{PerfSample, PerfSampleDefaults};
use perfetto_protos::trace::Trace;
use perfetto_protos::trace_packet::trace_packet::SequenceFlags;
use perfetto_protos::trace_packet::TracePacket;
use perfetto_protos::trace_packet_defaults::TracePacketDefaults;
use protobuf::{Message, MessageField};

use crate::callstack_trie::InterningOutputTracker;
use crate::config::Counter;
use crate::event_config::{EventConfig, PerfCounter, PerfCounterKind, RecordingMode};
use crate::perf::{
    PERF_RECORD_MISC_GUEST_KERNEL, PERF_RECORD_MISC_GUEST_USER, PERF_RECORD_MISC_HYPERVISOR,
    PERF_RECORD_MISC_KERNEL, PERF_RECORD_MISC_USER,
};
use crate::sample::{CommonSampleData, SampleSkipReason, UnwindErrorCode};
use crate::utils::boot_time_ns;

/// Sink for the packets of one sequence.
pub trait TraceWriter: Send {
    fn write_packet(&mut self, packet: &TracePacket) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Collects packets in memory. Clones share the same storage.
#[derive(Clone, Default)]
pub struct VecTraceWriter {
    pub packets: Arc<Mutex<Vec<TracePacket>>>,
}

impl VecTraceWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packets(&self) -> Vec<TracePacket> {
        self.packets.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl TraceWriter for VecTraceWriter {
    fn write_packet(&mut self, packet: &TracePacket) -> Result<()> {
        self.packets
            .lock()
            .map_err(|_| anyhow!("trace packet buffer poisoned"))?
            .push(packet.clone());
        Ok(())
    }
}

/// A trace file shared by every sequence writing into it.
#[derive(Clone)]
pub struct TraceFile {
    out: Arc<Mutex<BufWriter<File>>>,
}

impl TraceFile {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create trace file: {}", path.display()))?;
        Ok(TraceFile {
            out: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }

    /// A writer for a new sequence.
    pub fn writer(&self, sequence_id: u32) -> FileTraceWriter {
        FileTraceWriter {
            out: self.out.clone(),
            sequence_id,
            packet_count: 0,
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.out
            .lock()
            .map_err(|_| anyhow!("trace file poisoned"))?
            .flush()?;
        Ok(())
    }
}

/// Appends packets to a [`TraceFile`]. Every packet is framed as a single-packet `Trace`, so
/// the file as a whole parses as one `Trace` message.
pub struct FileTraceWriter {
    out: Arc<Mutex<BufWriter<File>>>,
    sequence_id: u32,
    packet_count: u64,
}

impl FileTraceWriter {
    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }
}

impl TraceWriter for FileTraceWriter {
    fn write_packet(&mut self, packet: &TracePacket) -> Result<()> {
        let mut packet = packet.clone();
        packet.set_trusted_packet_sequence_id(self.sequence_id);
        let mut trace = Trace::default();
        trace.packet.push(packet);
        let mut out = self
            .out
            .lock()
            .map_err(|_| anyhow!("trace file poisoned"))?;
        trace.write_to_writer(&mut *out)?;
        self.packet_count += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.out
            .lock()
            .map_err(|_| anyhow!("trace file poisoned"))?
            .flush()?;
        Ok(())
    }
}

pub fn to_cpu_mode(perf_cpu_mode: u16) -> CpuMode {
    match perf_cpu_mode {
        PERF_RECORD_MISC_KERNEL => CpuMode::MODE_KERNEL,
        PERF_RECORD_MISC_USER => CpuMode::MODE_USER,
        PERF_RECORD_MISC_HYPERVISOR => CpuMode::MODE_HYPERVISOR,
        PERF_RECORD_MISC_GUEST_KERNEL => CpuMode::MODE_GUEST_KERNEL,
        PERF_RECORD_MISC_GUEST_USER => CpuMode::MODE_GUEST_USER,
        _ => CpuMode::MODE_UNKNOWN,
    }
}

pub fn to_skip_reason(reason: SampleSkipReason) -> ProtoSkipReason {
    match reason {
        SampleSkipReason::ReadFdTimeout => ProtoSkipReason::PROFILER_SKIP_READ_STAGE,
        SampleSkipReason::UnwindEnqueue => ProtoSkipReason::PROFILER_SKIP_UNWIND_ENQUEUE,
        SampleSkipReason::UnwindStage => ProtoSkipReason::PROFILER_SKIP_UNWIND_STAGE,
        SampleSkipReason::Rejected => ProtoSkipReason::PROFILER_SKIP_NOT_IN_SCOPE,
    }
}

pub fn to_unwind_error(error: UnwindErrorCode) -> StackUnwindError {
    match error {
        UnwindErrorCode::None => StackUnwindError::UNWIND_ERROR_NONE,
        UnwindErrorCode::MemoryInvalid => StackUnwindError::UNWIND_ERROR_MEMORY_INVALID,
        UnwindErrorCode::UnwindInfo => StackUnwindError::UNWIND_ERROR_UNWIND_INFO,
        UnwindErrorCode::Unsupported => StackUnwindError::UNWIND_ERROR_UNSUPPORTED,
        UnwindErrorCode::InvalidMap => StackUnwindError::UNWIND_ERROR_INVALID_MAP,
        UnwindErrorCode::MaxFramesExceeded => StackUnwindError::UNWIND_ERROR_MAX_FRAMES_EXCEEDED,
        UnwindErrorCode::RepeatedFrame => StackUnwindError::UNWIND_ERROR_REPEATED_FRAME,
        UnwindErrorCode::InvalidElf => StackUnwindError::UNWIND_ERROR_INVALID_ELF,
        UnwindErrorCode::SystemCall => StackUnwindError::UNWIND_ERROR_SYSTEM_CALL,
        UnwindErrorCode::ThreadTimeout => StackUnwindError::UNWIND_ERROR_THREAD_TIMEOUT,
        UnwindErrorCode::ThreadDoesNotExist => {
            StackUnwindError::UNWIND_ERROR_THREAD_DOES_NOT_EXIST
        }
        UnwindErrorCode::BadArch => StackUnwindError::UNWIND_ERROR_BAD_ARCH,
        UnwindErrorCode::MapsParse => StackUnwindError::UNWIND_ERROR_MAPS_PARSE,
        UnwindErrorCode::InvalidParameter => StackUnwindError::UNWIND_ERROR_INVALID_PARAMETER,
        UnwindErrorCode::PtraceCall => StackUnwindError::UNWIND_ERROR_PTRACE_CALL,
    }
}

fn to_builtin_clock(clock_id: libc::clockid_t) -> BuiltinClock {
    match clock_id {
        libc::CLOCK_REALTIME => BuiltinClock::BUILTIN_CLOCK_REALTIME,
        libc::CLOCK_MONOTONIC => BuiltinClock::BUILTIN_CLOCK_MONOTONIC,
        libc::CLOCK_MONOTONIC_RAW => BuiltinClock::BUILTIN_CLOCK_MONOTONIC_RAW,
        libc::CLOCK_BOOTTIME => BuiltinClock::BUILTIN_CLOCK_BOOTTIME,
        _ => BuiltinClock::BUILTIN_CLOCK_UNKNOWN,
    }
}

fn to_proto_counter(counter: Counter) -> ProtoCounter {
    match counter {
        Counter::SwCpuClock => ProtoCounter::SW_CPU_CLOCK,
        Counter::SwPageFaults => ProtoCounter::SW_PAGE_FAULTS,
        Counter::SwTaskClock => ProtoCounter::SW_TASK_CLOCK,
        Counter::SwContextSwitches => ProtoCounter::SW_CONTEXT_SWITCHES,
        Counter::SwCpuMigrations => ProtoCounter::SW_CPU_MIGRATIONS,
        Counter::SwPageFaultsMin => ProtoCounter::SW_PAGE_FAULTS_MIN,
        Counter::SwPageFaultsMaj => ProtoCounter::SW_PAGE_FAULTS_MAJ,
        Counter::SwAlignmentFaults => ProtoCounter::SW_ALIGNMENT_FAULTS,
        Counter::SwEmulationFaults => ProtoCounter::SW_EMULATION_FAULTS,
        Counter::SwDummy => ProtoCounter::SW_DUMMY,
        Counter::HwCpuCycles => ProtoCounter::HW_CPU_CYCLES,
        Counter::HwInstructions => ProtoCounter::HW_INSTRUCTIONS,
        Counter::HwCacheReferences => ProtoCounter::HW_CACHE_REFERENCES,
        Counter::HwCacheMisses => ProtoCounter::HW_CACHE_MISSES,
        Counter::HwBranchInstructions => ProtoCounter::HW_BRANCH_INSTRUCTIONS,
        Counter::HwBranchMisses => ProtoCounter::HW_BRANCH_MISSES,
        Counter::HwBusCycles => ProtoCounter::HW_BUS_CYCLES,
        Counter::HwStalledCyclesFrontend => ProtoCounter::HW_STALLED_CYCLES_FRONTEND,
        Counter::HwStalledCyclesBackend => ProtoCounter::HW_STALLED_CYCLES_BACKEND,
        Counter::HwRefCpuCycles => ProtoCounter::HW_REF_CPU_CYCLES,
    }
}

fn proto_tracepoint(event: &PerfCounter) -> ProtoTracepoint {
    let mut tracepoint = ProtoTracepoint::default();
    tracepoint.set_name(event.tracepoint_name.clone());
    tracepoint.set_filter(event.tracepoint_filter.clone());
    tracepoint
}

fn proto_raw_event(event: &PerfCounter) -> ProtoRawEvent {
    let mut raw = ProtoRawEvent::default();
    raw.set_type(event.attr_type);
    raw.set_config(event.attr_config);
    raw.set_config1(event.attr_config1);
    raw.set_config2(event.attr_config2);
    raw
}

fn proto_timebase(config: &EventConfig) -> ProtoTimebase {
    let attr = config.perf_attr();
    let mut timebase = ProtoTimebase::default();
    if config.recording_mode() == RecordingMode::Polling {
        timebase.set_poll_period_ms(config.read_tick_period_ms());
    } else if attr.flags.freq() != 0 {
        timebase.set_frequency(attr.sample_period_or_freq());
    } else {
        timebase.set_period(attr.sample_period_or_freq());
    }

    let event = config.timebase_event();
    match event.kind {
        PerfCounterKind::BuiltinCounter => {
            if let Some(counter) = event.counter {
                timebase.set_counter(to_proto_counter(counter));
            }
        }
        PerfCounterKind::Tracepoint => timebase.set_tracepoint(proto_tracepoint(event)),
        PerfCounterKind::RawEvent => timebase.set_raw_event(proto_raw_event(event)),
    }
    if let Some(name) = config.timebase_name() {
        timebase.set_name(name.to_string());
    }
    timebase
}

fn proto_follower(event: &PerfCounter) -> ProtoFollower {
    let mut follower = ProtoFollower::default();
    follower.set_name(event.name.clone());
    match event.kind {
        PerfCounterKind::BuiltinCounter => {
            if let Some(counter) = event.counter {
                follower.set_counter(to_proto_counter(counter));
            }
        }
        PerfCounterKind::Tracepoint => follower.set_tracepoint(proto_tracepoint(event)),
        PerfCounterKind::RawEvent => follower.set_raw_event(proto_raw_event(event)),
    }
    follower
}

/// A packet that depends on the incremental state of its sequence.
fn start_packet() -> TracePacket {
    let mut packet = TracePacket::default();
    packet.set_sequence_flags(SequenceFlags::SEQ_NEEDS_INCREMENTAL_STATE as u32);
    packet
}

/// Starts a new incremental state generation and describes how samples on this sequence were
/// taken.
pub fn perf_defaults_packet(config: &EventConfig) -> TracePacket {
    let mut packet = TracePacket::default();
    packet.set_timestamp(boot_time_ns());
    packet.set_timestamp_clock_id(BuiltinClock::BUILTIN_CLOCK_BOOTTIME as u32);
    packet.set_sequence_flags(SequenceFlags::SEQ_INCREMENTAL_STATE_CLEARED as u32);

    let mut defaults = TracePacketDefaults::default();
    if config.recording_mode() == RecordingMode::Polling {
        // Counters are snapshotted by us, on the boot clock.
        defaults.set_timestamp_clock_id(BuiltinClock::BUILTIN_CLOCK_BOOTTIME as u32);
    } else {
        defaults.set_timestamp_clock_id(to_builtin_clock(config.clock_id()) as u32);
    }

    let mut perf_defaults = PerfSampleDefaults::default();
    perf_defaults.timebase = MessageField::some(proto_timebase(config));
    // Lets analysis tell unsampled processes apart from processes outside the chosen shard.
    if let Some(sharding) = config.filter().process_sharding {
        perf_defaults.set_process_shard_count(sharding.shard_count);
        perf_defaults.set_chosen_process_shard(sharding.chosen_shard);
    }
    perf_defaults.followers = config.follower_events().iter().map(proto_follower).collect();

    defaults.perf_sample_defaults = MessageField::some(perf_defaults);
    packet.trace_packet_defaults = MessageField::some(defaults);
    packet
}

/// Interned entries every sequence relies on implicitly.
pub fn fixed_internings_packet() -> TracePacket {
    let mut packet = start_packet();
    let mut interned = InternedData::default();
    InterningOutputTracker::write_fixed_interning(&mut interned);
    packet.interned_data = Some(interned).into();
    packet
}

fn perf_sample_with_context(common: &CommonSampleData) -> PerfSample {
    let mut sample = PerfSample::default();
    sample.set_cpu(common.cpu);
    sample.set_pid(common.pid as u32);
    sample.set_tid(common.tid as u32);
    sample.set_cpu_mode(to_cpu_mode(common.cpu_mode));
    sample.set_timebase_count(common.timebase_count);
    sample.follower_counts = common.follower_counts.clone();
    sample
}

/// A sample with counts only. Polled counters have no process context.
pub fn counter_only_sample_packet(common: &CommonSampleData, has_process_context: bool) -> TracePacket {
    let mut packet = start_packet();
    packet.set_timestamp(common.timestamp);
    let sample = if has_process_context {
        perf_sample_with_context(common)
    } else {
        let mut sample = PerfSample::default();
        sample.set_cpu(common.cpu);
        sample.set_timebase_count(common.timebase_count);
        sample.follower_counts = common.follower_counts.clone();
        sample
    };
    packet.set_perf_sample(sample);
    packet
}

pub fn callstack_sample_packet(
    common: &CommonSampleData,
    callstack_iid: u64,
    unwind_error: UnwindErrorCode,
    interned: InternedData,
) -> TracePacket {
    let mut packet = start_packet();
    packet.set_timestamp(common.timestamp);
    packet.interned_data = Some(interned).into();
    let mut sample = perf_sample_with_context(common);
    sample.set_callstack_iid(callstack_iid);
    if unwind_error != UnwindErrorCode::None {
        sample.set_unwind_error(to_unwind_error(unwind_error));
    }
    packet.set_perf_sample(sample);
    packet
}

pub fn skipped_sample_packet(common: &CommonSampleData, reason: SampleSkipReason) -> TracePacket {
    let mut packet = start_packet();
    packet.set_timestamp(common.timestamp);
    let mut sample = perf_sample_with_context(common);
    sample.set_sample_skipped_reason(to_skip_reason(reason));
    packet.set_perf_sample(sample);
    packet
}

/// Records lost in one cpu's ring buffer since its last written record. There is no precise
/// time for the loss, the boot clock timestamp only orders the packet.
pub fn records_lost_packet(cpu: u32, records_lost: u64) -> TracePacket {
    let mut packet = start_packet();
    packet.set_timestamp(boot_time_ns());
    packet.set_timestamp_clock_id(BuiltinClock::BUILTIN_CLOCK_BOOTTIME as u32);
    let mut sample = PerfSample::default();
    sample.set_cpu(cpu);
    sample.set_kernel_records_lost(records_lost);
    packet.set_perf_sample(sample);
    packet
}

/// Marks a data source stopped early because the daemon exceeded its memory guardrail.
pub fn guardrail_stop_packet() -> TracePacket {
    let mut packet = start_packet();
    packet.set_timestamp(boot_time_ns());
    packet.set_timestamp_clock_id(BuiltinClock::BUILTIN_CLOCK_BOOTTIME as u32);
    let mut event = ProducerEvent::default();
    event.set_source_stop_reason(DataSourceStopReason::PROFILER_STOP_GUARDRAIL);
    let mut sample = PerfSample::default();
    sample.producer_event = MessageField::some(event);
    packet.set_perf_sample(sample);
    packet
}
