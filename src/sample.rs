//! Samples as they move through the pipeline: parsed out of the ring buffer, queued for
//! unwinding, and finally emitted.

use crate::regs::UserRegs;

/// The parts of a sample that every emitted packet carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommonSampleData {
    pub cpu: u32,
    /// `perf_event_header.misc & PERF_RECORD_MISC_CPUMODE_MASK`.
    pub cpu_mode: u16,
    pub pid: i32,
    pub tid: i32,
    pub timestamp: u64,
    pub timebase_count: u64,
    pub follower_counts: Vec<u64>,
}

/// One decoded `PERF_RECORD_SAMPLE`. Not `Clone`: a sample is either emitted, skipped or queued
/// for unwinding, exactly once.
#[derive(Debug, Default)]
pub struct ParsedSample {
    pub common: CommonSampleData,
    /// Absent for kernel threads.
    pub regs: Option<Box<UserRegs>>,
    pub stack: Vec<u8>,
    /// The kernel filled the whole requested stack size, the stack is likely truncated.
    pub stack_maxed: bool,
    pub kernel_ips: Vec<u64>,
}

/// Why a sample didn't make it to a callstack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleSkipReason {
    ReadFdTimeout,
    UnwindEnqueue,
    UnwindStage,
    Rejected,
}

/// Unwinding outcome recorded alongside every completed sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnwindErrorCode {
    #[default]
    None,
    MemoryInvalid,
    UnwindInfo,
    Unsupported,
    InvalidMap,
    MaxFramesExceeded,
    RepeatedFrame,
    InvalidElf,
    SystemCall,
    ThreadTimeout,
    ThreadDoesNotExist,
    BadArch,
    MapsParse,
    InvalidParameter,
    PtraceCall,
}

impl UnwindErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnwindErrorCode::None => "NONE",
            UnwindErrorCode::MemoryInvalid => "MEMORY_INVALID",
            UnwindErrorCode::UnwindInfo => "UNWIND_INFO",
            UnwindErrorCode::Unsupported => "UNSUPPORTED",
            UnwindErrorCode::InvalidMap => "INVALID_MAP",
            UnwindErrorCode::MaxFramesExceeded => "MAX_FRAMES_EXCEEDED",
            UnwindErrorCode::RepeatedFrame => "REPEATED_FRAME",
            UnwindErrorCode::InvalidElf => "INVALID_ELF",
            UnwindErrorCode::SystemCall => "SYSTEM_CALL",
            UnwindErrorCode::ThreadTimeout => "THREAD_TIMEOUT",
            UnwindErrorCode::ThreadDoesNotExist => "THREAD_DOES_NOT_EXIST",
            UnwindErrorCode::BadArch => "BAD_ARCH",
            UnwindErrorCode::MapsParse => "MAPS_PARSE",
            UnwindErrorCode::InvalidParameter => "INVALID_PARAMETER",
            UnwindErrorCode::PtraceCall => "PTRACE_CALL",
        }
    }
}

/// A symbolized frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FrameData {
    pub function_name: String,
    pub map_name: String,
    pub map_start: u64,
    pub map_end: u64,
    pub map_offset: u64,
    /// Program counter relative to the start of the mapped file.
    pub rel_pc: u64,
    /// Lowercase hex, empty if unknown.
    pub build_id: String,
}

#[derive(Debug, Default)]
pub struct CompletedSample {
    pub common: CommonSampleData,
    /// Outermost frame first.
    pub frames: Vec<FrameData>,
    pub unwind_error: UnwindErrorCode,
}
