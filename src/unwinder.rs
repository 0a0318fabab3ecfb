//! The unwinder thread.
//!
//! Samples needing userspace frames reach the unwinder through the unwind queue. Everything else
//! crosses threads as posted [`UnwinderTask`]s, and results go back to the producer through an
//! [`UnwinderDelegate`]. The unwinder keeps its own view of every data source and process, which
//! only changes in response to those tasks.

use std::collections::{HashMap, HashSet};
use std::os::unix::fs::FileExt;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
use crate::cfi::CfiUnwinder;
use crate::event_config::UnwindMode;
use crate::maps::{find_map, read_maps, MapEntry};
use crate::proc_fd::ProcDescriptors;
use crate::regs::UserRegs;
use crate::sample::{CompletedSample, FrameData, ParsedSample, UnwindErrorCode};
use crate::symbolize::FrameSymbolizer;
use crate::task_runner::{TaskRunner, TaskSender};
use crate::unwind_queue::{unwind_queue, DataSourceInstanceId, QueueReader, QueueWriter, UnwindEntry};

/// Userspace frames beyond this are cut off with [`UnwindErrorCode::MaxFramesExceeded`].
pub const MAX_FRAMES: usize = 1000;

/// How long a stopping data source waits before the queue is checked again for its samples.
const SHUTDOWN_RETRY_DELAY: Duration = Duration::from_millis(400);

/// The unwinder's only way back to the producer thread.
pub trait UnwinderDelegate: Send {
    fn post_emit_sample(&self, ds_id: DataSourceInstanceId, sample: CompletedSample);
    fn post_emit_unwinder_skipped_sample(&self, ds_id: DataSourceInstanceId, sample: ParsedSample);
    fn post_finish_data_source_stop(&self, ds_id: DataSourceInstanceId);
}

pub enum UnwinderTask {
    StartDataSource {
        ds_id: DataSourceInstanceId,
        kernel_frames: bool,
        unwind_mode: UnwindMode,
        clear_period_ms: u32,
    },
    AdoptProcDescriptors {
        ds_id: DataSourceInstanceId,
        pid: i32,
        fds: ProcDescriptors,
    },
    RecordTimedOutProcDescriptors {
        ds_id: DataSourceInstanceId,
        pid: i32,
    },
    RecordNoUserspaceProcess {
        ds_id: DataSourceInstanceId,
        pid: i32,
    },
    InitiateDataSourceStop {
        ds_id: DataSourceInstanceId,
    },
    PurgeDataSource {
        ds_id: DataSourceInstanceId,
    },
    ClearCachedStatePeriodic {
        ds_id: DataSourceInstanceId,
        period_ms: u32,
    },
    ProcessQueue,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataSourceStatus {
    Active,
    ShuttingDown,
}

struct ProcessMetadata {
    fds: ProcDescriptors,
    /// Parsed lazily, dropped on every cache clear.
    maps: Option<Vec<MapEntry>>,
    /// Built from `maps` on the first table based unwind, dropped whenever `maps` is.
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    cfi: Option<CfiUnwinder>,
}

impl ProcessMetadata {
    fn new(fds: ProcDescriptors) -> Self {
        ProcessMetadata {
            fds,
            maps: None,
            #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
            cfi: None,
        }
    }

    fn clear_cached_state(&mut self) {
        self.maps = None;
        #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
        {
            self.cfi = None;
        }
    }

    fn reparse_maps(&mut self) -> Result<&[MapEntry]> {
        let maps = read_maps(&self.fds.maps).context("Failed to parse maps")?;
        #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
        {
            self.cfi = None;
        }
        let maps = self.maps.insert(maps);
        Ok(maps.as_slice())
    }

    fn maps(&mut self) -> Result<&[MapEntry]> {
        if self.maps.is_none() {
            self.reparse_maps()?;
        }
        Ok(self.maps.as_deref().unwrap_or_default())
    }

    fn read_u64(&self, addr: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        self.fds.mem.read_exact_at(&mut buf, addr).ok()?;
        Some(u64::from_ne_bytes(buf))
    }
}

enum ProcessState {
    Initial,
    FdsResolved(ProcessMetadata),
    FdsTimedOut,
    NoUserspace,
}

struct DataSourceState {
    status: DataSourceStatus,
    kernel_frames: bool,
    unwind_mode: UnwindMode,
    process_states: HashMap<i32, ProcessState>,
}

pub struct Unwinder<D: UnwinderDelegate> {
    runner: TaskRunner<UnwinderTask>,
    delegate: D,
    queue: QueueReader,
    data_sources: HashMap<DataSourceInstanceId, DataSourceState>,
    symbolizer: FrameSymbolizer,
}

impl<D: UnwinderDelegate> Unwinder<D> {
    pub fn new(runner: TaskRunner<UnwinderTask>, delegate: D, queue: QueueReader) -> Self {
        Unwinder {
            runner,
            delegate,
            queue,
            data_sources: HashMap::new(),
            symbolizer: FrameSymbolizer::new(),
        }
    }

    /// Processes tasks until told to quit.
    pub fn run(&mut self) {
        loop {
            match self.runner.next_task() {
                UnwinderTask::Quit => break,
                task => self.handle_task(task),
            }
        }
        debug!("Unwinder exiting");
    }

    fn handle_task(&mut self, task: UnwinderTask) {
        match task {
            UnwinderTask::StartDataSource {
                ds_id,
                kernel_frames,
                unwind_mode,
                clear_period_ms,
            } => self.start_data_source(ds_id, kernel_frames, unwind_mode, clear_period_ms),
            UnwinderTask::AdoptProcDescriptors { ds_id, pid, fds } => {
                self.adopt_proc_descriptors(ds_id, pid, fds)
            }
            UnwinderTask::RecordTimedOutProcDescriptors { ds_id, pid } => {
                self.set_process_state(ds_id, pid, ProcessState::FdsTimedOut)
            }
            UnwinderTask::RecordNoUserspaceProcess { ds_id, pid } => {
                self.set_process_state(ds_id, pid, ProcessState::NoUserspace)
            }
            UnwinderTask::InitiateDataSourceStop { ds_id } => self.initiate_data_source_stop(ds_id),
            UnwinderTask::PurgeDataSource { ds_id } => self.purge_data_source(ds_id),
            UnwinderTask::ClearCachedStatePeriodic { ds_id, period_ms } => {
                self.clear_cached_state_periodic(ds_id, period_ms)
            }
            UnwinderTask::ProcessQueue => self.process_queue(),
            UnwinderTask::Quit => {}
        }
    }

    fn start_data_source(
        &mut self,
        ds_id: DataSourceInstanceId,
        kernel_frames: bool,
        unwind_mode: UnwindMode,
        clear_period_ms: u32,
    ) {
        debug!("Unwinder: starting data source {ds_id}");
        self.data_sources.insert(
            ds_id,
            DataSourceState {
                status: DataSourceStatus::Active,
                kernel_frames,
                unwind_mode,
                process_states: HashMap::new(),
            },
        );
        if clear_period_ms > 0 {
            self.runner.post_delayed(
                UnwinderTask::ClearCachedStatePeriodic {
                    ds_id,
                    period_ms: clear_period_ms,
                },
                Duration::from_millis(clear_period_ms as u64),
            );
        }
    }

    fn adopt_proc_descriptors(&mut self, ds_id: DataSourceInstanceId, pid: i32, fds: ProcDescriptors) {
        self.set_process_state(
            ds_id,
            pid,
            ProcessState::FdsResolved(ProcessMetadata::new(fds)),
        );
    }

    // A timeout and the descriptors can race, whichever message arrives last decides.
    fn set_process_state(&mut self, ds_id: DataSourceInstanceId, pid: i32, state: ProcessState) {
        let Some(ds) = self.data_sources.get_mut(&ds_id) else {
            return;
        };
        ds.process_states.insert(pid, state);
    }

    fn initiate_data_source_stop(&mut self, ds_id: DataSourceInstanceId) {
        let Some(ds) = self.data_sources.get_mut(&ds_id) else {
            return;
        };
        debug!("Unwinder: initiating stop of data source {ds_id}");
        ds.status = DataSourceStatus::ShuttingDown;
        self.runner.post(UnwinderTask::ProcessQueue);
    }

    fn finish_data_source_stop(&mut self, ds_id: DataSourceInstanceId) {
        debug!("Unwinder: finished stop of data source {ds_id}");
        self.data_sources.remove(&ds_id);
        self.delegate.post_finish_data_source_stop(ds_id);
    }

    fn purge_data_source(&mut self, ds_id: DataSourceInstanceId) {
        // Queued samples of a purged data source get dropped when next encountered.
        if self.data_sources.remove(&ds_id).is_some() {
            info!("Unwinder: purged data source {ds_id}");
        }
    }

    fn clear_cached_state_periodic(&mut self, ds_id: DataSourceInstanceId, period_ms: u32) {
        match self.data_sources.get(&ds_id) {
            Some(ds) if ds.status == DataSourceStatus::Active => {}
            _ => return,
        }
        debug!("Unwinder: clearing cached state");
        self.clear_cached_state();
        self.runner.post_delayed(
            UnwinderTask::ClearCachedStatePeriodic { ds_id, period_ms },
            Duration::from_millis(period_ms as u64),
        );
    }

    fn clear_cached_state(&mut self) {
        for ds in self.data_sources.values_mut() {
            for state in ds.process_states.values_mut() {
                if let ProcessState::FdsResolved(meta) = state {
                    meta.clear_cached_state();
                }
            }
        }
        self.symbolizer.clear_cached_state();
    }

    /// Unwinds whatever is ready, then finishes the stop of every stopping data source without
    /// samples left in the queue.
    pub fn process_queue(&mut self) {
        let pending = self.consume_and_unwind_ready_samples();

        let mut retry = false;
        let mut finished = Vec::new();
        for (ds_id, ds) in self.data_sources.iter() {
            if ds.status != DataSourceStatus::ShuttingDown {
                continue;
            }
            if pending.contains(ds_id) {
                retry = true;
            } else {
                finished.push(*ds_id);
            }
        }
        for ds_id in finished {
            self.finish_data_source_stop(ds_id);
        }
        if retry {
            self.runner
                .post_delayed(UnwinderTask::ProcessQueue, SHUTDOWN_RETRY_DELAY);
        }
    }

    /// Returns the data sources with samples still waiting on descriptors.
    fn consume_and_unwind_ready_samples(&mut self) -> HashSet<DataSourceInstanceId> {
        let mut pending = HashSet::new();
        let view = self.queue.begin_read();

        for pos in view.read_pos..view.write_pos {
            let entry = self.queue.at(pos);
            if !entry.valid {
                continue;
            }
            let ds_id = entry.data_source_id;
            let stack_bytes = entry.sample.stack.len() as u64;

            let Some(ds) = self.data_sources.get_mut(&ds_id) else {
                *entry = UnwindEntry::invalid();
                self.queue.decrement_enqueued_footprint(stack_bytes);
                continue;
            };

            let pid = entry.sample.common.pid;
            let state = ds.process_states.entry(pid).or_insert(ProcessState::Initial);
            let metadata = match state {
                ProcessState::Initial => {
                    pending.insert(ds_id);
                    continue;
                }
                ProcessState::FdsTimedOut => {
                    let mut sample = std::mem::take(&mut entry.sample);
                    sample.stack = Vec::new();
                    self.delegate.post_emit_unwinder_skipped_sample(ds_id, sample);
                    *entry = UnwindEntry::invalid();
                    self.queue.decrement_enqueued_footprint(stack_bytes);
                    continue;
                }
                ProcessState::FdsResolved(meta) => Some(meta),
                ProcessState::NoUserspace => None,
            };

            let sample = std::mem::take(&mut entry.sample);
            *entry = UnwindEntry::invalid();
            let completed = unwind_sample(
                &mut self.symbolizer,
                sample,
                metadata,
                ds.kernel_frames,
                ds.unwind_mode,
            );
            self.delegate.post_emit_sample(ds_id, completed);
            self.queue.decrement_enqueued_footprint(stack_bytes);
        }

        // Entries behind still pending ones stay in place, only leading handled ones are freed.
        let mut new_read_pos = view.read_pos;
        while new_read_pos < view.write_pos && !self.queue.at(new_read_pos).valid {
            new_read_pos += 1;
        }
        if new_read_pos != view.read_pos {
            self.queue.commit_new_read_position(new_read_pos);
        }
        pending
    }
}

/// Makes sure `pc` is covered by the parsed maps, rereading them once if it isn't.
fn check_pc_mapped(meta: &mut ProcessMetadata, pc: u64) -> Result<(), UnwindErrorCode> {
    let maps = match meta.maps() {
        Ok(maps) => maps,
        Err(e) => {
            debug!("{e:#}");
            return Err(UnwindErrorCode::MapsParse);
        }
    };
    if find_map(maps, pc).is_some() {
        return Ok(());
    }
    // The process may have mapped new code since the maps were parsed.
    match meta.reparse_maps() {
        Ok(maps) if find_map(maps, pc).is_some() => Ok(()),
        Ok(_) => Err(UnwindErrorCode::InvalidMap),
        Err(e) => {
            debug!("{e:#}");
            Err(UnwindErrorCode::MapsParse)
        }
    }
}

/// Reads a u64 at `addr` of a stack copy that starts at `sp`.
fn read_stack_copy(stack: &[u8], sp: u64, addr: u64) -> Option<u64> {
    let off = usize::try_from(addr.checked_sub(sp)?).ok()?;
    let bytes = stack.get(off..off.checked_add(8)?)?;
    Some(u64::from_ne_bytes(bytes.try_into().ok()?))
}

/// Walks the frame pointer chain, returning program counters innermost first.
fn unwind_frame_pointers(
    meta: &mut ProcessMetadata,
    regs: &UserRegs,
    stack: &[u8],
) -> (Vec<u64>, UnwindErrorCode) {
    let (Some(pc), Some(sp), Some(mut fp)) = (regs.pc(), regs.sp(), regs.fp()) else {
        return (Vec::new(), UnwindErrorCode::BadArch);
    };
    if let Err(error) = check_pc_mapped(meta, pc) {
        return (Vec::new(), error);
    }

    let read_stack_u64 = |addr: u64| read_stack_copy(stack, sp, addr);

    let mut pcs = vec![pc];
    loop {
        if fp == 0 {
            return (pcs, UnwindErrorCode::None);
        }
        if pcs.len() >= MAX_FRAMES {
            return (pcs, UnwindErrorCode::MaxFramesExceeded);
        }
        let record = read_stack_u64(fp)
            .zip(fp.checked_add(8).and_then(read_stack_u64))
            .or_else(|| Some((meta.read_u64(fp)?, meta.read_u64(fp.checked_add(8)?)?)));
        let Some((next_fp, ret_addr)) = record else {
            return (pcs, UnwindErrorCode::MemoryInvalid);
        };
        if ret_addr == 0 {
            return (pcs, UnwindErrorCode::None);
        }
        pcs.push(ret_addr);
        if next_fp == 0 {
            return (pcs, UnwindErrorCode::None);
        }
        if next_fp == fp {
            return (pcs, UnwindErrorCode::RepeatedFrame);
        }
        if next_fp < fp {
            // Caller frames live at higher addresses.
            return (pcs, UnwindErrorCode::UnwindInfo);
        }
        fp = next_fp;
    }
}

/// Unwinds with the call frame information of the mapped binaries. Reads past the stack copy go
/// to the process's memory.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
fn unwind_from_tables(
    pid: i32,
    meta: &mut ProcessMetadata,
    regs: &UserRegs,
    stack: &[u8],
) -> (Vec<u64>, UnwindErrorCode) {
    let (Some(pc), Some(sp)) = (regs.pc(), regs.sp()) else {
        return (Vec::new(), UnwindErrorCode::BadArch);
    };
    if let Err(error) = check_pc_mapped(meta, pc) {
        return (Vec::new(), error);
    }

    let ProcessMetadata { fds, maps, cfi } = meta;
    let cfi = cfi.get_or_insert_with(|| CfiUnwinder::new(pid, maps.as_deref().unwrap_or_default()));
    cfi.unwind(regs, |addr| {
        read_stack_copy(stack, sp, addr).or_else(|| {
            let mut buf = [0u8; 8];
            fds.mem.read_exact_at(&mut buf, addr).ok()?;
            Some(u64::from_ne_bytes(buf))
        })
    })
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn unwind_from_tables(
    _pid: i32,
    _meta: &mut ProcessMetadata,
    _regs: &UserRegs,
    _stack: &[u8],
) -> (Vec<u64>, UnwindErrorCode) {
    (Vec::new(), UnwindErrorCode::BadArch)
}

fn user_frames(
    symbolizer: &mut FrameSymbolizer,
    pid: i32,
    meta: &ProcessMetadata,
    pcs: &[u64],
) -> (Vec<FrameData>, bool) {
    let maps = meta.maps.as_deref().unwrap_or_default();
    let names = symbolizer.symbolize_user(pid, pcs);
    let mut frames = Vec::with_capacity(pcs.len());
    for (pc, name) in pcs.iter().zip(names) {
        let Some(map) = find_map(maps, *pc) else {
            return (frames, false);
        };
        frames.push(FrameData {
            function_name: name.unwrap_or_default(),
            map_name: map.path.clone(),
            map_start: map.start,
            map_end: map.end,
            map_offset: map.offset,
            rel_pc: map.rel_pc(*pc),
            build_id: symbolizer.build_id(pid, &map.path),
        });
    }
    (frames, true)
}

fn error_frame(error: UnwindErrorCode) -> FrameData {
    FrameData {
        function_name: format!("ERROR {}", error.as_str()),
        map_name: "ERROR".to_string(),
        ..Default::default()
    }
}

/// Produces the callstack for one sample. `metadata` is absent for processes whose userspace
/// isn't unwound.
fn unwind_sample(
    symbolizer: &mut FrameSymbolizer,
    sample: ParsedSample,
    metadata: Option<&mut ProcessMetadata>,
    kernel_frames: bool,
    unwind_mode: UnwindMode,
) -> CompletedSample {
    let pid = sample.common.pid;
    // Innermost first until the final reversal.
    let mut frames = Vec::new();
    let mut unwind_error = UnwindErrorCode::None;

    if kernel_frames {
        frames.extend(symbolizer.kernel_frames(&sample.kernel_ips));
    }

    if let (Some(meta), Some(regs)) = (metadata, sample.regs.as_deref()) {
        let unwound = match unwind_mode {
            UnwindMode::Skip => None,
            UnwindMode::FramePointer => Some(unwind_frame_pointers(meta, regs, &sample.stack)),
            UnwindMode::UnwindStack => Some(unwind_from_tables(pid, meta, regs, &sample.stack)),
        };
        if let Some((pcs, error)) = unwound {
            unwind_error = error;
            let (user, complete) = user_frames(symbolizer, pid, meta, &pcs);
            if !complete && unwind_error == UnwindErrorCode::None {
                unwind_error = UnwindErrorCode::InvalidMap;
            }
            frames.extend(user);
            if unwind_error != UnwindErrorCode::None {
                debug!(
                    "Unwinding pid {pid} stopped after {} frames: {}",
                    pcs.len(),
                    unwind_error.as_str()
                );
                frames.push(error_frame(unwind_error));
            }
        }
    }

    frames.reverse();
    CompletedSample {
        common: sample.common,
        frames,
        unwind_error,
    }
}

/// Owner of the unwinder thread, used from the producer thread.
pub struct UnwinderHandle {
    sender: TaskSender<UnwinderTask>,
    writer: QueueWriter,
    thread: Option<JoinHandle<()>>,
}

impl UnwinderHandle {
    pub fn start<D: UnwinderDelegate + 'static>(delegate: D) -> Result<Self> {
        let (writer, reader) = unwind_queue();
        let runner = TaskRunner::new();
        let sender = runner.sender();
        let thread = thread::Builder::new()
            .name("perf-unwinder".to_string())
            .spawn(move || Unwinder::new(runner, delegate, reader).run())
            .context("Failed to spawn the unwinder thread")?;
        Ok(UnwinderHandle {
            sender,
            writer,
            thread: Some(thread),
        })
    }

    pub fn queue(&mut self) -> &mut QueueWriter {
        &mut self.writer
    }

    fn post(&self, task: UnwinderTask) {
        if self.sender.post(task).is_err() {
            warn!("Unwinder thread is gone, dropping task");
        }
    }

    pub fn post_start_data_source(
        &self,
        ds_id: DataSourceInstanceId,
        kernel_frames: bool,
        unwind_mode: UnwindMode,
        clear_period_ms: u32,
    ) {
        self.post(UnwinderTask::StartDataSource {
            ds_id,
            kernel_frames,
            unwind_mode,
            clear_period_ms,
        });
    }

    pub fn post_adopt_proc_descriptors(&self, ds_id: DataSourceInstanceId, pid: i32, fds: ProcDescriptors) {
        self.post(UnwinderTask::AdoptProcDescriptors { ds_id, pid, fds });
    }

    pub fn post_record_timed_out_proc_descriptors(&self, ds_id: DataSourceInstanceId, pid: i32) {
        self.post(UnwinderTask::RecordTimedOutProcDescriptors { ds_id, pid });
    }

    pub fn post_record_no_userspace_process(&self, ds_id: DataSourceInstanceId, pid: i32) {
        self.post(UnwinderTask::RecordNoUserspaceProcess { ds_id, pid });
    }

    pub fn post_initiate_data_source_stop(&self, ds_id: DataSourceInstanceId) {
        self.post(UnwinderTask::InitiateDataSourceStop { ds_id });
    }

    pub fn post_purge_data_source(&self, ds_id: DataSourceInstanceId) {
        self.post(UnwinderTask::PurgeDataSource { ds_id });
    }

    pub fn post_process_queue(&self) {
        self.post(UnwinderTask::ProcessQueue);
    }
}

impl Drop for UnwinderHandle {
    fn drop(&mut self) {
        let _ = self.sender.post(UnwinderTask::Quit);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Unwinder thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unwind_queue::unwind_queue_for_testing;
    use std::fs::File;
    use std::sync::mpsc::{channel, Receiver, Sender};

    #[derive(Debug)]
    enum Event {
        Sample(DataSourceInstanceId, CompletedSample),
        Skipped(DataSourceInstanceId, ParsedSample),
        Finished(DataSourceInstanceId),
    }

    struct ChannelDelegate(Sender<Event>);

    impl UnwinderDelegate for ChannelDelegate {
        fn post_emit_sample(&self, ds_id: DataSourceInstanceId, sample: CompletedSample) {
            self.0.send(Event::Sample(ds_id, sample)).unwrap();
        }

        fn post_emit_unwinder_skipped_sample(&self, ds_id: DataSourceInstanceId, sample: ParsedSample) {
            self.0.send(Event::Skipped(ds_id, sample)).unwrap();
        }

        fn post_finish_data_source_stop(&self, ds_id: DataSourceInstanceId) {
            self.0.send(Event::Finished(ds_id)).unwrap();
        }
    }

    fn setup() -> (Unwinder<ChannelDelegate>, QueueWriter, Receiver<Event>) {
        let (writer, reader) = unwind_queue_for_testing(16);
        let (tx, rx) = channel();
        let unwinder = Unwinder::new(TaskRunner::new(), ChannelDelegate(tx), reader);
        (unwinder, writer, rx)
    }

    fn start(unwinder: &mut Unwinder<ChannelDelegate>, ds_id: DataSourceInstanceId) {
        unwinder.handle_task(UnwinderTask::StartDataSource {
            ds_id,
            kernel_frames: false,
            unwind_mode: UnwindMode::FramePointer,
            clear_period_ms: 0,
        });
    }

    fn enqueue(writer: &mut QueueWriter, ds_id: DataSourceInstanceId, pid: i32, stack_len: usize) {
        let mut sample = ParsedSample::default();
        sample.common.pid = pid;
        sample.common.tid = pid;
        sample.stack = vec![0; stack_len];
        assert!(writer.begin_write().valid);
        writer.increment_enqueued_footprint(stack_len as u64);
        writer.commit_write(UnwindEntry::new(ds_id, sample));
    }

    fn drain(rx: &Receiver<Event>) -> Vec<Event> {
        rx.try_iter().collect()
    }

    fn null_descriptors() -> ProcDescriptors {
        ProcDescriptors {
            maps: File::open("/dev/null").unwrap(),
            mem: File::open("/dev/null").unwrap(),
        }
    }

    #[test]
    fn test_stop_waits_for_queued_samples() {
        let (mut unwinder, mut writer, rx) = setup();
        start(&mut unwinder, 1);
        for _ in 0..3 {
            enqueue(&mut writer, 1, 10, 128);
        }

        unwinder.handle_task(UnwinderTask::InitiateDataSourceStop { ds_id: 1 });
        // The stop posts a queue pass, samples are still waiting on descriptors.
        match unwinder.runner.try_next_task() {
            Some(UnwinderTask::ProcessQueue) => unwinder.process_queue(),
            _ => panic!("expected a queue pass"),
        }
        assert!(drain(&rx).is_empty());
        assert_eq!(unwinder.runner.pending_delayed(), 1);
        assert_eq!(writer.enqueued_footprint(), 384);

        unwinder.handle_task(UnwinderTask::RecordNoUserspaceProcess { ds_id: 1, pid: 10 });
        unwinder.process_queue();
        let events = drain(&rx);
        assert_eq!(events.len(), 4);
        assert!(events[..3]
            .iter()
            .all(|e| matches!(e, Event::Sample(1, s) if s.common.pid == 10)));
        assert!(matches!(events[3], Event::Finished(1)));
        assert_eq!(writer.enqueued_footprint(), 0);
        assert!(unwinder.data_sources.is_empty());
        let view = unwinder.queue.begin_read();
        assert_eq!(view.read_pos, view.write_pos);
    }

    #[test]
    fn test_timed_out_then_adopted() {
        let (mut unwinder, mut writer, rx) = setup();
        start(&mut unwinder, 1);
        enqueue(&mut writer, 1, 20, 64);
        enqueue(&mut writer, 1, 20, 64);

        unwinder.handle_task(UnwinderTask::RecordTimedOutProcDescriptors { ds_id: 1, pid: 20 });
        unwinder.process_queue();
        let events = drain(&rx);
        assert_eq!(events.len(), 2);
        for event in &events {
            match event {
                Event::Skipped(1, sample) => assert!(sample.stack.is_empty()),
                e => panic!("unexpected {e:?}"),
            }
        }

        // Descriptors arriving late win over the timeout.
        unwinder.handle_task(UnwinderTask::AdoptProcDescriptors {
            ds_id: 1,
            pid: 20,
            fds: null_descriptors(),
        });
        enqueue(&mut writer, 1, 20, 64);
        unwinder.process_queue();
        let events = drain(&rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::Sample(1, _)));
        assert_eq!(writer.enqueued_footprint(), 0);
    }

    #[test]
    fn test_pending_entry_does_not_block_others() {
        let (mut unwinder, mut writer, rx) = setup();
        start(&mut unwinder, 1);
        enqueue(&mut writer, 1, 30, 0);
        enqueue(&mut writer, 1, 31, 0);
        unwinder.handle_task(UnwinderTask::RecordNoUserspaceProcess { ds_id: 1, pid: 31 });
        unwinder.process_queue();

        let events = drain(&rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::Sample(1, s) if s.common.pid == 31));
        // The pending entry at the head keeps the read cursor in place.
        assert_eq!(unwinder.queue.begin_read().read_pos, 0);
    }

    #[test]
    fn test_unknown_data_source_dropped() {
        let (mut unwinder, mut writer, rx) = setup();
        enqueue(&mut writer, 99, 10, 256);
        unwinder.process_queue();
        assert!(drain(&rx).is_empty());
        assert_eq!(writer.enqueued_footprint(), 0);
        let view = unwinder.queue.begin_read();
        assert_eq!(view.read_pos, view.write_pos);
    }

    #[test]
    fn test_purge_discards_samples() {
        let (mut unwinder, mut writer, rx) = setup();
        start(&mut unwinder, 1);
        enqueue(&mut writer, 1, 10, 32);
        unwinder.handle_task(UnwinderTask::PurgeDataSource { ds_id: 1 });
        unwinder.handle_task(UnwinderTask::RecordNoUserspaceProcess { ds_id: 1, pid: 10 });
        unwinder.process_queue();
        assert!(drain(&rx).is_empty());
        assert_eq!(writer.enqueued_footprint(), 0);
    }

    #[test]
    fn test_clear_cached_state_periodic_stops_with_data_source() {
        let (mut unwinder, _writer, _rx) = setup();
        start(&mut unwinder, 1);
        unwinder.handle_task(UnwinderTask::ClearCachedStatePeriodic {
            ds_id: 1,
            period_ms: 1000,
        });
        assert_eq!(unwinder.runner.pending_delayed(), 1);
        unwinder.handle_task(UnwinderTask::PurgeDataSource { ds_id: 1 });
        unwinder.handle_task(UnwinderTask::ClearCachedStatePeriodic {
            ds_id: 1,
            period_ms: 1000,
        });
        assert_eq!(unwinder.runner.pending_delayed(), 1);
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    mod frame_pointer {
        use super::*;

        pub(super) const SP: u64 = 0x7000;

        pub(super) fn metadata() -> ProcessMetadata {
            let mut meta = ProcessMetadata::new(null_descriptors());
            meta.maps = Some(vec![MapEntry {
                start: 0x4000,
                end: 0x6000,
                offset: 0x1000,
                executable: true,
                path: "/bin/app".to_string(),
            }]);
            meta
        }

        pub(super) fn stack_with_records(records: &[(u64, u64, u64)]) -> Vec<u8> {
            let mut stack = vec![0u8; 0x100];
            for (fp, next_fp, ret) in records {
                let off = (fp - SP) as usize;
                stack[off..off + 8].copy_from_slice(&next_fp.to_ne_bytes());
                stack[off + 8..off + 16].copy_from_slice(&ret.to_ne_bytes());
            }
            stack
        }

        #[test]
        fn test_walks_chain() {
            let mut meta = metadata();
            let stack = stack_with_records(&[(0x7010, 0x7020, 0x5000), (0x7020, 0, 0x5100)]);
            let regs = UserRegs::for_testing(0x4100, SP, 0x7010);
            let (pcs, error) = unwind_frame_pointers(&mut meta, &regs, &stack);
            assert_eq!(pcs, vec![0x4100, 0x5000, 0x5100]);
            assert_eq!(error, UnwindErrorCode::None);
        }

        #[test]
        fn test_repeated_frame() {
            let mut meta = metadata();
            let stack = stack_with_records(&[(0x7010, 0x7010, 0x5000)]);
            let regs = UserRegs::for_testing(0x4100, SP, 0x7010);
            let (pcs, error) = unwind_frame_pointers(&mut meta, &regs, &stack);
            assert_eq!(pcs.len(), 2);
            assert_eq!(error, UnwindErrorCode::RepeatedFrame);
        }

        #[test]
        fn test_frame_outside_stack_copy() {
            let mut meta = metadata();
            let stack = stack_with_records(&[]);
            // /dev/null can't back the read.
            let regs = UserRegs::for_testing(0x4100, SP, 0x9000);
            let (pcs, error) = unwind_frame_pointers(&mut meta, &regs, &stack);
            assert_eq!(pcs, vec![0x4100]);
            assert_eq!(error, UnwindErrorCode::MemoryInvalid);
        }

        #[test]
        fn test_unmapped_pc() {
            let mut meta = metadata();
            let regs = UserRegs::for_testing(0x100, SP, 0);
            let (pcs, error) = unwind_frame_pointers(&mut meta, &regs, &[]);
            assert!(pcs.is_empty());
            assert_eq!(error, UnwindErrorCode::InvalidMap);
        }

        #[test]
        fn test_completed_sample_order() {
            let mut symbolizer = FrameSymbolizer::new();
            let mut meta = metadata();
            let mut sample = ParsedSample::default();
            sample.common.pid = 1;
            sample.regs = Some(Box::new(UserRegs::for_testing(0x4100, SP, 0x7010)));
            sample.stack = stack_with_records(&[(0x7010, 0x7010, 0x5000)]);
            let completed = unwind_sample(
                &mut symbolizer,
                sample,
                Some(&mut meta),
                false,
                UnwindMode::FramePointer,
            );
            assert_eq!(completed.unwind_error, UnwindErrorCode::RepeatedFrame);
            // Error marker, then outermost to innermost.
            assert_eq!(completed.frames.len(), 3);
            assert_eq!(completed.frames[0].map_name, "ERROR");
            assert_eq!(completed.frames[1].rel_pc, 0x5000 - 0x4000 + 0x1000);
            assert_eq!(completed.frames[2].rel_pc, 0x4100 - 0x4000 + 0x1000);
            assert_eq!(completed.frames[2].map_name, "/bin/app");
        }
    }

    #[cfg(target_arch = "x86_64")]
    mod tables {
        use super::frame_pointer::{metadata, stack_with_records, SP};
        use super::*;
        use std::arch::asm;

        #[test]
        fn test_dwarf_sample_without_tables() {
            // Nothing backs /bin/app, the walk falls back to the frame pointer chain.
            let mut symbolizer = FrameSymbolizer::new();
            let mut meta = metadata();
            let mut sample = ParsedSample::default();
            sample.common.pid = i32::MAX;
            sample.regs = Some(Box::new(UserRegs::for_testing(0x4100, SP, 0x7010)));
            sample.stack = stack_with_records(&[(0x7010, 0x7020, 0x5000), (0x7020, 0, 0x5100)]);
            let completed = unwind_sample(
                &mut symbolizer,
                sample,
                Some(&mut meta),
                false,
                UnwindMode::UnwindStack,
            );
            assert_eq!(completed.unwind_error, UnwindErrorCode::None);
            let rel_pcs: Vec<u64> = completed.frames.iter().map(|f| f.rel_pc).collect();
            assert_eq!(rel_pcs, vec![0x2100, 0x2000, 0x1100]);
            assert_eq!(meta.cfi.as_ref().unwrap().module_count(), 0);
        }

        #[test]
        fn test_dwarf_sample_of_own_stack() {
            let pid = std::process::id() as i32;
            let mut meta = ProcessMetadata::new(ProcDescriptors {
                maps: File::open("/proc/self/maps").unwrap(),
                mem: File::open("/proc/self/mem").unwrap(),
            });
            let (pc, sp, fp): (u64, u64, u64);
            unsafe {
                asm!(
                    "lea {pc}, [rip]",
                    "mov {sp}, rsp",
                    "mov {fp}, rbp",
                    pc = out(reg) pc,
                    sp = out(reg) sp,
                    fp = out(reg) fp,
                );
            }
            let regs = UserRegs::for_testing(pc, sp, fp);

            // Without a stack copy every read goes through /proc/self/mem.
            let (pcs, _) = unwind_from_tables(pid, &mut meta, &regs, &[]);
            assert!(pcs.len() >= 3, "{pcs:x?}");
            assert_eq!(pcs[0], pc);
            let maps = meta.maps.as_deref().unwrap();
            let exe = std::env::current_exe().unwrap().display().to_string();
            assert_eq!(find_map(maps, pcs[0]).unwrap().path, exe);
            assert!(meta.cfi.as_ref().unwrap().module_count() > 0);
        }

        #[test]
        fn test_cache_clear_drops_tables() {
            let mut meta = metadata();
            let regs = UserRegs::for_testing(0x4100, SP, 0);
            unwind_from_tables(i32::MAX, &mut meta, &regs, &[]);
            assert!(meta.cfi.is_some());
            meta.clear_cached_state();
            assert!(meta.cfi.is_none());
            assert!(meta.maps.is_none());
        }
    }
}
