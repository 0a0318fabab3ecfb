//! The perf producer.
//!
//! Owns every data source, reads their per-cpu ring buffers on a timer and decides what
//! happens to each sample: written out as counts only, skipped with a reason, or handed to the
//! unwinder. Completed samples come back from the unwinder as [`ProducerTask`]s and are written
//! out with their interned callstacks.
//!
//! Everything runs on one thread, driven by a [`TaskRunner`]. The only state shared with the
//! unwinder thread is the unwind queue.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use perfetto_protos::interned_data::InternedData;
use perfetto_protos::trace_packet::TracePacket;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, warn};

use crate::callstack_trie::{CallstackTrie, InterningOutputTracker};
use crate::config::{DataSourceConfig, PERF_DATA_SOURCE_NAME};
use crate::event_config::{EventConfig, RecordingMode};
use crate::event_reader::EventReader;
use crate::guardrails::{exceeds_guardrail, FootprintSource, ProcessFootprint, GUARDRAIL_CHECK_PERIOD};
use crate::perf::PERF_RECORD_MISC_USER;
use crate::perfetto::{
    callstack_sample_packet, counter_only_sample_packet, fixed_internings_packet,
    guardrail_stop_packet, perf_defaults_packet, records_lost_packet, skipped_sample_packet,
    TraceWriter,
};
use crate::proc_fd::{DirectDescriptorGetter, ProcDescriptorCallback, ProcDescriptorGetter, ProcDescriptors};
use crate::sample::{CommonSampleData, CompletedSample, ParsedSample, SampleSkipReason};
use crate::service::{
    next_connection_backoff_ms, ConnectionState, Connector, ProducerEndpoint,
    INITIAL_CONNECTION_BACKOFF_MS,
};
use crate::target_filter::{read_proc_pid_cmdline, should_reject_due_to_filter, ProcessSharding};
use crate::task_runner::{TaskRunner, TaskSender};
use crate::unwind_queue::{DataSourceInstanceId, UnwindEntry};
use crate::unwinder::{UnwinderDelegate, UnwinderHandle};
use crate::utils::{cpu_mask, find_tracefs_root, num_configured_cpus, read_tracepoint_id, wall_time_ms};

pub const PRODUCER_NAME: &str = "perfetto.traced_perf";

/// Some descriptor getters race with a freshly exec'd process installing its signal handlers,
/// their requests are held back this long.
const PROC_DESCRIPTORS_REQUEST_DELAY: Duration = Duration::from_millis(50);

const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

pub enum ProducerTask {
    // Requests from the service.
    StartDataSource {
        ds_id: DataSourceInstanceId,
        config: DataSourceConfig,
    },
    StopDataSource {
        ds_id: DataSourceInstanceId,
    },
    Flush {
        flush_id: u64,
    },
    ClearIncrementalState {
        ds_ids: Vec<DataSourceInstanceId>,
    },
    // Connection lifecycle.
    ConnectService,
    Disconnected,
    Restart,
    // Periodic and deferred work.
    TickDataSourceRead(DataSourceInstanceId),
    CheckMemoryFootprintPeriodic(DataSourceInstanceId),
    EmitRingBufferLoss {
        ds_id: DataSourceInstanceId,
        cpu: u32,
        records_lost: u64,
    },
    StartDescriptorLookup {
        ds_id: DataSourceInstanceId,
        pid: i32,
        timeout_ms: u32,
    },
    EvaluateDescriptorLookupTimeout {
        ds_id: DataSourceInstanceId,
        pid: i32,
    },
    OnProcDescriptors {
        pid: i32,
        uid: u32,
        fds: ProcDescriptors,
    },
    // Results from the unwinder.
    EmitSample {
        ds_id: DataSourceInstanceId,
        sample: CompletedSample,
    },
    EmitUnwinderSkippedSample {
        ds_id: DataSourceInstanceId,
        sample: ParsedSample,
    },
    FinishDataSourceStop(DataSourceInstanceId),
    /// A task posted by one incarnation of the producer state. Dropped once a restart has
    /// replaced that state.
    Scoped {
        generation: u64,
        task: Box<ProducerTask>,
    },
    Quit,
}

impl ProducerTask {
    fn scoped(self, generation: u64) -> Self {
        ProducerTask::Scoped {
            generation,
            task: Box::new(self),
        }
    }
}

/// Hands the unwinder's results to the producer state that started it.
struct ScopedSender {
    sender: TaskSender<ProducerTask>,
    generation: u64,
}

impl ScopedSender {
    fn post(&self, task: ProducerTask) {
        let _ = self.sender.post(task.scoped(self.generation));
    }
}

impl UnwinderDelegate for ScopedSender {
    fn post_emit_sample(&self, ds_id: DataSourceInstanceId, sample: CompletedSample) {
        self.post(ProducerTask::EmitSample { ds_id, sample });
    }

    fn post_emit_unwinder_skipped_sample(&self, ds_id: DataSourceInstanceId, sample: ParsedSample) {
        self.post(ProducerTask::EmitUnwinderSkippedSample { ds_id, sample });
    }

    fn post_finish_data_source_stop(&self, ds_id: DataSourceInstanceId) {
        self.post(ProducerTask::FinishDataSourceStop(ds_id));
    }
}

/// Where a pid stands with one data source, from the producer's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessTrackingStatus {
    Initial,
    FdsResolving,
    FdsTimedOut,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataSourceStatus {
    Active,
    ShuttingDown,
}

struct DataSourceState {
    status: DataSourceStatus,
    event_config: EventConfig,
    tracing_session_id: u64,
    trace_writer: Box<dyn TraceWriter>,
    per_cpu_readers: Vec<EventReader>,
    interning_output: InterningOutputTracker,
    process_states: HashMap<i32, ProcessTrackingStatus>,
    /// Memo backing the filter's `additional_cmdline_count`.
    additional_cmdlines: HashSet<String>,
}

impl DataSourceState {
    fn write_packet(&mut self, packet: &TracePacket) {
        if let Err(e) = self.trace_writer.write_packet(packet) {
            warn!("Failed to write trace packet: {e:#}");
        }
    }

    fn emit_counter_only_sample(&mut self, common: &CommonSampleData, has_process_context: bool) {
        self.write_packet(&counter_only_sample_packet(common, has_process_context));
    }

    fn emit_skipped_sample(&mut self, common: &CommonSampleData, reason: SampleSkipReason) {
        self.write_packet(&skipped_sample_packet(common, reason));
    }

    fn flush(&mut self) {
        if let Err(e) = self.trace_writer.flush() {
            warn!("Failed to flush trace writer: {e:#}");
        }
    }
}

/// Everything torn down and rebuilt when the connection to the service is lost.
struct ProducerCore {
    /// Bumped on every restart, stamped into the tasks this state posts.
    generation: u64,
    state: ConnectionState,
    connection_backoff_ms: u64,
    endpoint: Option<Box<dyn ProducerEndpoint>>,
    // Ordered so descriptor responses are matched against data sources deterministically.
    data_sources: BTreeMap<DataSourceInstanceId, DataSourceState>,
    callstack_trie: CallstackTrie,
    unwinder: UnwinderHandle,
}

impl ProducerCore {
    fn new(sender: TaskSender<ProducerTask>, generation: u64) -> Result<Self> {
        Ok(ProducerCore {
            generation,
            state: ConnectionState::NotStarted,
            connection_backoff_ms: INITIAL_CONNECTION_BACKOFF_MS,
            endpoint: None,
            data_sources: BTreeMap::new(),
            callstack_trie: CallstackTrie::new(),
            unwinder: UnwinderHandle::start(ScopedSender { sender, generation })?,
        })
    }
}

pub struct PerfProducer {
    runner: TaskRunner<ProducerTask>,
    connector: Box<dyn Connector>,
    proc_fd_getter: Box<dyn ProcDescriptorGetter>,
    footprint: Box<dyn FootprintSource>,
    open_reader: fn(u32, &EventConfig) -> Option<EventReader>,
    core: ProducerCore,
}

/// A descriptor callback that hands results to the producer thread.
pub fn proc_descriptor_callback(sender: TaskSender<ProducerTask>) -> ProcDescriptorCallback {
    Box::new(move |pid, uid, fds| {
        let _ = sender.post(ProducerTask::OnProcDescriptors { pid, uid, fds });
    })
}

/// Delay until the next read tick of `ds_id`. Ticks land on multiples of the period, shifted by
/// an offset derived from the data source id so concurrent data sources don't all read at once.
pub fn time_to_next_read_tick_ms(ds_id: DataSourceInstanceId, period_ms: u32) -> u64 {
    let period = period_ms.max(1) as u64;
    let offset = StdRng::seed_from_u64(ds_id).random_range(0..period);
    period - (wall_time_ms().wrapping_sub(offset) % period)
}

fn tracepoint_id(group: &str, name: &str) -> u32 {
    find_tracefs_root()
        .map(|root| read_tracepoint_id(&root, group, name))
        .unwrap_or(0)
}

impl PerfProducer {
    /// A producer reading descriptors straight out of procfs and watching its own RSS.
    pub fn new(connector: Box<dyn Connector>) -> Result<Self> {
        Self::with_components(
            connector,
            |callback| Box::new(DirectDescriptorGetter::new(callback)),
            Box::new(ProcessFootprint::new()?),
        )
    }

    pub fn with_components<G>(
        connector: Box<dyn Connector>,
        make_proc_fd_getter: G,
        footprint: Box<dyn FootprintSource>,
    ) -> Result<Self>
    where
        G: FnOnce(ProcDescriptorCallback) -> Box<dyn ProcDescriptorGetter>,
    {
        let runner = TaskRunner::new();
        let proc_fd_getter = make_proc_fd_getter(proc_descriptor_callback(runner.sender()));
        let core = ProducerCore::new(runner.sender(), 0)?;
        Ok(PerfProducer {
            runner,
            connector,
            proc_fd_getter,
            footprint,
            open_reader: EventReader::configure_events,
            core,
        })
    }

    pub fn sender(&self) -> TaskSender<ProducerTask> {
        self.runner.sender()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.core.state
    }

    /// Connects and processes tasks until [`ProducerTask::Quit`].
    pub fn run(&mut self) {
        self.connect_with_retries();
        loop {
            match self.runner.next_task() {
                ProducerTask::Quit => break,
                task => self.handle_task(task),
            }
        }
        info!("Producer exiting");
    }

    fn handle_task(&mut self, task: ProducerTask) {
        match task {
            ProducerTask::StartDataSource { ds_id, config } => self.start_data_source(ds_id, &config),
            ProducerTask::StopDataSource { ds_id } => self.stop_data_source(ds_id),
            ProducerTask::Flush { flush_id } => self.flush(flush_id),
            ProducerTask::ClearIncrementalState { ds_ids } => self.clear_incremental_state(&ds_ids),
            ProducerTask::ConnectService => self.connect_service(),
            ProducerTask::Disconnected => self.on_disconnect(),
            ProducerTask::Restart => self.restart(),
            ProducerTask::TickDataSourceRead(ds_id) => self.tick_data_source_read(ds_id),
            ProducerTask::CheckMemoryFootprintPeriodic(ds_id) => {
                self.check_memory_footprint_periodic(ds_id)
            }
            ProducerTask::EmitRingBufferLoss {
                ds_id,
                cpu,
                records_lost,
            } => self.emit_ring_buffer_loss(ds_id, cpu, records_lost),
            ProducerTask::StartDescriptorLookup {
                ds_id,
                pid,
                timeout_ms,
            } => self.start_descriptor_lookup(ds_id, pid, timeout_ms),
            ProducerTask::EvaluateDescriptorLookupTimeout { ds_id, pid } => {
                self.evaluate_descriptor_lookup_timeout(ds_id, pid)
            }
            ProducerTask::OnProcDescriptors { pid, uid, fds } => {
                self.on_proc_descriptors(pid, uid, fds)
            }
            ProducerTask::EmitSample { ds_id, sample } => self.emit_sample(ds_id, sample),
            ProducerTask::EmitUnwinderSkippedSample { ds_id, sample } => {
                self.emit_skipped_sample(ds_id, &sample.common, SampleSkipReason::UnwindStage)
            }
            ProducerTask::FinishDataSourceStop(ds_id) => self.finish_data_source_stop(ds_id),
            ProducerTask::Scoped { generation, task } => {
                if generation == self.core.generation {
                    self.handle_task(*task);
                } else {
                    debug!("Dropping a task of producer generation {generation}");
                }
            }
            ProducerTask::Quit => {}
        }
    }

    fn start_data_source(&mut self, ds_id: DataSourceInstanceId, config: &DataSourceConfig) {
        info!("StartDataSource({ds_id}, {})", config.name);
        if config.name != PERF_DATA_SOURCE_NAME {
            return;
        }

        let shard_count = config
            .perf_event_config
            .callstack_sampling
            .as_ref()
            .and_then(|callstack| callstack.scope.as_ref())
            .map_or(0, |scope| scope.process_shard_count);
        let process_sharding = (shard_count > 0).then(|| {
            self.get_or_choose_callstack_process_shard(config.tracing_session_id, shard_count)
        });

        let Some(event_config) =
            EventConfig::create(&config.perf_event_config, process_sharding, &tracepoint_id)
        else {
            error!("PerfEventConfig rejected.");
            return;
        };

        let online_cpus = cpu_mask(
            Path::new(SYSFS_CPU_ROOT),
            num_configured_cpus(),
            event_config.target_cpus(),
        );
        if online_cpus.is_empty() {
            error!("No cpus to profile for data source {ds_id}");
            return;
        }

        let mut per_cpu_readers = Vec::with_capacity(online_cpus.len());
        for cpu in online_cpus {
            match (self.open_reader)(cpu, &event_config) {
                Some(reader) => per_cpu_readers.push(reader),
                None => {
                    error!("Failed to set up perf events for cpu{cpu}, discarding data source {ds_id}");
                    return;
                }
            }
        }

        let Some(endpoint) = self.core.endpoint.as_mut() else {
            warn!("Not connected, ignoring data source {ds_id}");
            return;
        };
        let trace_writer = endpoint.create_trace_writer(config.target_buffer);

        let mut ds = DataSourceState {
            status: DataSourceStatus::Active,
            event_config,
            tracing_session_id: config.tracing_session_id,
            trace_writer,
            per_cpu_readers,
            interning_output: InterningOutputTracker::new(),
            process_states: HashMap::new(),
            additional_cmdlines: HashSet::new(),
        };
        for reader in ds.per_cpu_readers.iter_mut() {
            if let Err(e) = reader.enable_events() {
                warn!("{e:#}");
            }
        }
        let defaults = perf_defaults_packet(&ds.event_config);
        ds.write_packet(&defaults);

        let recording_mode = ds.event_config.recording_mode();
        let read_period_ms = ds.event_config.read_tick_period_ms();
        let kernel_frames = ds.event_config.kernel_frames();
        let unwind_mode = ds.event_config.unwind_mode();
        let clear_period_ms = ds.event_config.unwind_state_clear_period_ms();
        let max_daemon_memory_kb = ds.event_config.max_daemon_memory_kb();
        if recording_mode == RecordingMode::Sampling {
            ds.write_packet(&fixed_internings_packet());
        }
        self.core.data_sources.insert(ds_id, ds);

        self.runner.post_delayed(
            ProducerTask::TickDataSourceRead(ds_id).scoped(self.core.generation),
            Duration::from_millis(time_to_next_read_tick_ms(ds_id, read_period_ms)),
        );

        if recording_mode == RecordingMode::Polling {
            return;
        }

        self.core
            .unwinder
            .post_start_data_source(ds_id, kernel_frames, unwind_mode, clear_period_ms);

        if max_daemon_memory_kb > 0 {
            self.runner.post_delayed(
                ProducerTask::CheckMemoryFootprintPeriodic(ds_id).scoped(self.core.generation),
                GUARDRAIL_CHECK_PERIOD,
            );
        }
    }

    fn check_memory_footprint_periodic(&mut self, ds_id: DataSourceInstanceId) {
        let Some(ds) = self.core.data_sources.get(&ds_id) else {
            return;
        };
        let max_kb = ds.event_config.max_daemon_memory_kb();
        if let Some(footprint_kb) = self.footprint.footprint_kb() {
            if exceeds_guardrail(footprint_kb, max_kb) {
                error!("Footprint of {footprint_kb} KB exceeds the {max_kb} KB guardrail, stopping data source {ds_id}");
                self.purge_data_source(ds_id);
                return;
            }
        }
        self.runner.post_delayed(
            ProducerTask::CheckMemoryFootprintPeriodic(ds_id).scoped(self.core.generation),
            GUARDRAIL_CHECK_PERIOD,
        );
    }

    fn stop_data_source(&mut self, ds_id: DataSourceInstanceId) {
        info!("StopDataSource({ds_id})");
        let Some(ds) = self.core.data_sources.get_mut(&ds_id) else {
            // Purged by a guardrail, or never started.
            if let Some(endpoint) = self.core.endpoint.as_mut() {
                endpoint.notify_data_source_stopped(ds_id);
            }
            return;
        };

        if ds.event_config.recording_mode() == RecordingMode::Polling {
            Self::read_counters(ds);
            ds.flush();
            self.core.data_sources.remove(&ds_id);
            if let Some(endpoint) = self.core.endpoint.as_mut() {
                endpoint.notify_data_source_stopped(ds_id);
            }
            return;
        }

        Self::initiate_reader_stop(ds);
    }

    /// Stops the kernel from writing more samples. Whatever is already buffered still gets read
    /// by the following ticks.
    fn initiate_reader_stop(ds: &mut DataSourceState) {
        if ds.status == DataSourceStatus::ShuttingDown {
            return;
        }
        ds.status = DataSourceStatus::ShuttingDown;
        for reader in ds.per_cpu_readers.iter_mut() {
            if let Err(e) = reader.disable_events() {
                warn!("{e:#}");
            }
        }
    }

    fn flush(&mut self, flush_id: u64) {
        // Packets go out as they are produced, there is nothing to flush.
        if let Some(endpoint) = self.core.endpoint.as_mut() {
            endpoint.notify_flush_complete(flush_id);
        }
    }

    fn clear_incremental_state(&mut self, ds_ids: &[DataSourceInstanceId]) {
        for ds_id in ds_ids {
            let Some(ds) = self.core.data_sources.get_mut(ds_id) else {
                continue;
            };
            debug!("Clearing incremental state of data source {ds_id}");
            let defaults = perf_defaults_packet(&ds.event_config);
            ds.write_packet(&defaults);
            ds.interning_output.clear_history();
            ds.write_packet(&fixed_internings_packet());
            // Ids stay unique across clears, other data sources keep referencing theirs.
            self.core.callstack_trie.clear_trie();
        }
    }

    fn tick_data_source_read(&mut self, ds_id: DataSourceInstanceId) {
        let ProducerCore {
            generation,
            data_sources,
            unwinder,
            ..
        } = &mut self.core;
        let generation = *generation;
        let Some(ds) = data_sources.get_mut(&ds_id) else {
            return;
        };

        if ds.event_config.recording_mode() == RecordingMode::Polling {
            Self::read_counters(ds);
        } else {
            let max_samples = ds.event_config.samples_per_tick_limit();
            let delay_lookups = self.proc_fd_getter.requires_delayed_request();
            let mut more_records_available = false;
            for idx in 0..ds.per_cpu_readers.len() {
                more_records_available |= Self::read_and_parse_per_cpu_buffer(
                    &mut self.runner,
                    unwinder,
                    generation,
                    ds_id,
                    ds,
                    idx,
                    max_samples,
                    delay_lookups,
                );
            }
            unwinder.post_process_queue();

            if ds.status == DataSourceStatus::ShuttingDown && !more_records_available {
                debug!("Ring buffers of data source {ds_id} drained");
                unwinder.post_initiate_data_source_stop(ds_id);
                return;
            }
        }

        let period_ms = ds.event_config.read_tick_period_ms();
        self.runner.post_delayed(
            ProducerTask::TickDataSourceRead(ds_id).scoped(generation),
            Duration::from_millis(time_to_next_read_tick_ms(ds_id, period_ms)),
        );
    }

    fn read_counters(ds: &mut DataSourceState) {
        let readings: Vec<_> = ds
            .per_cpu_readers
            .iter()
            .filter_map(|reader| reader.read_counters())
            .collect();
        for common in &readings {
            ds.emit_counter_only_sample(common, false);
        }
    }

    /// Reads up to `max_samples` samples from one cpu. Returns whether the ring buffer might
    /// still hold more.
    fn read_and_parse_per_cpu_buffer(
        runner: &mut TaskRunner<ProducerTask>,
        unwinder: &mut UnwinderHandle,
        generation: u64,
        ds_id: DataSourceInstanceId,
        ds: &mut DataSourceState,
        reader_idx: usize,
        max_samples: u64,
        delay_lookups: bool,
    ) -> bool {
        for _ in 0..max_samples {
            let reader = &mut ds.per_cpu_readers[reader_idx];
            let cpu = reader.cpu();
            let sample = reader.read_until_sample(|records_lost| {
                runner.post(
                    ProducerTask::EmitRingBufferLoss {
                        ds_id,
                        cpu,
                        records_lost,
                    }
                    .scoped(generation),
                )
            });
            let Some(sample) = sample else {
                return false;
            };

            if !ds.event_config.sample_callstacks() {
                ds.emit_counter_only_sample(&sample.common, true);
                continue;
            }

            let pid = sample.common.pid;
            let status = *ds
                .process_states
                .entry(pid)
                .or_insert(ProcessTrackingStatus::Initial);
            match status {
                ProcessTrackingStatus::FdsTimedOut => {
                    debug!("Skipping sample for pid [{pid}], descriptor lookup timed out");
                    ds.emit_skipped_sample(&sample.common, SampleSkipReason::ReadFdTimeout);
                    continue;
                }
                ProcessTrackingStatus::Rejected => {
                    ds.emit_skipped_sample(&sample.common, SampleSkipReason::Rejected);
                    continue;
                }
                ProcessTrackingStatus::Initial => {
                    let is_kthread = sample.regs.is_none();
                    let rejected = (is_kthread && !ds.event_config.kernel_frames())
                        || should_reject_due_to_filter(
                            pid,
                            ds.event_config.filter(),
                            is_kthread,
                            &mut ds.additional_cmdlines,
                            read_proc_pid_cmdline,
                        );
                    if rejected {
                        ds.process_states.insert(pid, ProcessTrackingStatus::Rejected);
                        ds.emit_skipped_sample(&sample.common, SampleSkipReason::Rejected);
                        continue;
                    }

                    if !is_kthread && ds.event_config.user_frames() {
                        ds.process_states
                            .insert(pid, ProcessTrackingStatus::FdsResolving);
                        let task = ProducerTask::StartDescriptorLookup {
                            ds_id,
                            pid,
                            timeout_ms: ds.event_config.remote_descriptor_timeout_ms(),
                        }
                        .scoped(generation);
                        if delay_lookups {
                            runner.post_delayed(task, PROC_DESCRIPTORS_REQUEST_DELAY);
                        } else {
                            runner.post(task);
                        }
                    } else {
                        ds.process_states.insert(pid, ProcessTrackingStatus::Accepted);
                        unwinder.post_record_no_userspace_process(ds_id, pid);
                    }
                }
                ProcessTrackingStatus::FdsResolving | ProcessTrackingStatus::Accepted => {}
            }

            // Only kernel frames were asked for, userspace samples have nothing to unwind.
            if !ds.event_config.user_frames() && sample.common.cpu_mode == PERF_RECORD_MISC_USER {
                ds.emit_counter_only_sample(&sample.common, true);
                continue;
            }

            let stack_size = sample.stack.len() as u64;
            let max_footprint = ds.event_config.max_enqueued_footprint_bytes();
            let queue = unwinder.queue();
            if max_footprint > 0 && queue.enqueued_footprint() + stack_size >= max_footprint {
                debug!("Skipping sample for pid [{pid}], unwind queue footprint limit reached");
                ds.emit_skipped_sample(&sample.common, SampleSkipReason::UnwindEnqueue);
                continue;
            }
            if !queue.begin_write().valid {
                debug!("Skipping sample for pid [{pid}], unwind queue full");
                ds.emit_skipped_sample(&sample.common, SampleSkipReason::UnwindEnqueue);
                continue;
            }
            queue.commit_write(UnwindEntry::new(ds_id, sample));
            queue.increment_enqueued_footprint(stack_size);
        }

        // Hit the per tick limit, there may be more.
        true
    }

    fn start_descriptor_lookup(&mut self, ds_id: DataSourceInstanceId, pid: i32, timeout_ms: u32) {
        self.proc_fd_getter.get_descriptors_for_pid(pid);
        self.runner.post_delayed(
            ProducerTask::EvaluateDescriptorLookupTimeout { ds_id, pid }.scoped(self.core.generation),
            Duration::from_millis(timeout_ms as u64),
        );
    }

    fn evaluate_descriptor_lookup_timeout(&mut self, ds_id: DataSourceInstanceId, pid: i32) {
        let Some(ds) = self.core.data_sources.get_mut(&ds_id) else {
            return;
        };
        let Some(status) = ds.process_states.get_mut(&pid) else {
            return;
        };
        if *status == ProcessTrackingStatus::FdsResolving {
            debug!("Descriptor lookup for pid [{pid}] timed out");
            *status = ProcessTrackingStatus::FdsTimedOut;
            self.core
                .unwinder
                .post_record_timed_out_proc_descriptors(ds_id, pid);
        }
    }

    fn on_proc_descriptors(&mut self, pid: i32, uid: u32, fds: ProcDescriptors) {
        // First data source still waiting for this pid gets the descriptors, even if it
        // already gave up on them.
        let target = self.core.data_sources.iter_mut().find_map(|(ds_id, ds)| {
            let status = ds.process_states.get_mut(&pid)?;
            match *status {
                ProcessTrackingStatus::FdsResolving | ProcessTrackingStatus::FdsTimedOut => {
                    *status = ProcessTrackingStatus::Accepted;
                    Some(*ds_id)
                }
                _ => None,
            }
        });
        match target {
            Some(ds_id) => {
                debug!("Received descriptors for pid [{pid}], uid {uid}");
                self.core
                    .unwinder
                    .post_adopt_proc_descriptors(ds_id, pid, fds);
            }
            None => debug!("Discarding descriptors for pid [{pid}], nobody is waiting for them"),
        }
    }

    fn emit_sample(&mut self, ds_id: DataSourceInstanceId, sample: CompletedSample) {
        let ProducerCore {
            data_sources,
            callstack_trie,
            ..
        } = &mut self.core;
        let Some(ds) = data_sources.get_mut(&ds_id) else {
            return;
        };
        let callstack_iid = callstack_trie.create_callstack(&sample.frames);
        let mut interned = InternedData::default();
        ds.interning_output
            .write_callstack(callstack_iid, callstack_trie, &mut interned);
        ds.write_packet(&callstack_sample_packet(
            &sample.common,
            callstack_iid,
            sample.unwind_error,
            interned,
        ));
    }

    fn emit_ring_buffer_loss(&mut self, ds_id: DataSourceInstanceId, cpu: u32, records_lost: u64) {
        let Some(ds) = self.core.data_sources.get_mut(&ds_id) else {
            return;
        };
        debug!("Data source {ds_id} lost {records_lost} records on cpu {cpu}");
        ds.write_packet(&records_lost_packet(cpu, records_lost));
    }

    fn emit_skipped_sample(
        &mut self,
        ds_id: DataSourceInstanceId,
        common: &CommonSampleData,
        reason: SampleSkipReason,
    ) {
        if let Some(ds) = self.core.data_sources.get_mut(&ds_id) {
            ds.emit_skipped_sample(common, reason);
        }
    }

    fn finish_data_source_stop(&mut self, ds_id: DataSourceInstanceId) {
        let Some(mut ds) = self.core.data_sources.remove(&ds_id) else {
            return;
        };
        info!("Finished stopping data source {ds_id}");
        ds.flush();
        if let Some(endpoint) = self.core.endpoint.as_mut() {
            endpoint.notify_data_source_stopped(ds_id);
        }
        if self.core.data_sources.is_empty() {
            self.core.callstack_trie.clear_trie();
        }
    }

    /// Drops a data source on the spot, discarding everything still in flight. The service's
    /// eventual stop request is acknowledged as for an unknown data source.
    fn purge_data_source(&mut self, ds_id: DataSourceInstanceId) {
        let Some(mut ds) = self.core.data_sources.remove(&ds_id) else {
            return;
        };
        self.core.unwinder.post_purge_data_source(ds_id);
        ds.write_packet(&guardrail_stop_packet());
        ds.flush();
        if self.core.data_sources.is_empty() {
            self.core.callstack_trie.clear_trie();
        }
    }

    /// Every data source of a tracing session has to agree on the shard, the first one to ask
    /// picks it.
    fn get_or_choose_callstack_process_shard(
        &self,
        tracing_session_id: u64,
        shard_count: u32,
    ) -> ProcessSharding {
        for ds in self.core.data_sources.values() {
            if ds.tracing_session_id != tracing_session_id {
                continue;
            }
            if let Some(sharding) = ds.event_config.filter().process_sharding {
                if sharding.shard_count != shard_count {
                    error!(
                        "Mismatched process shard count {shard_count} in tracing session {tracing_session_id}, using {}",
                        sharding.shard_count
                    );
                }
                return sharding;
            }
        }
        ProcessSharding::choose(shard_count, &mut rand::rng())
    }

    fn connect_with_retries(&mut self) {
        self.core.state = ConnectionState::NotConnected;
        self.core.connection_backoff_ms = INITIAL_CONNECTION_BACKOFF_MS;
        self.connect_service();
    }

    fn connect_service(&mut self) {
        self.core.state = ConnectionState::Connecting;
        match self.connector.connect(PRODUCER_NAME) {
            Ok(endpoint) => {
                self.core.endpoint = Some(endpoint);
                self.on_connect();
            }
            Err(e) => {
                warn!("Failed to connect to the tracing service: {e:#}");
                self.on_disconnect();
            }
        }
    }

    fn on_connect(&mut self) {
        info!("Connected to the service");
        self.core.state = ConnectionState::Connected;
        self.core.connection_backoff_ms = INITIAL_CONNECTION_BACKOFF_MS;
        if let Some(endpoint) = self.core.endpoint.as_mut() {
            if let Err(e) = endpoint.register_data_source(PERF_DATA_SOURCE_NAME) {
                error!("Failed to register {PERF_DATA_SOURCE_NAME}: {e:#}");
            }
        }
    }

    fn on_disconnect(&mut self) {
        info!("Disconnected from the tracing service");
        self.core.endpoint = None;
        if self.core.state == ConnectionState::Connected {
            self.runner.post(ProducerTask::Restart);
            return;
        }

        self.core.state = ConnectionState::NotConnected;
        self.core.connection_backoff_ms = next_connection_backoff_ms(self.core.connection_backoff_ms);
        info!("Retrying connection in {} ms", self.core.connection_backoff_ms);
        self.runner.post_delayed(
            ProducerTask::ConnectService,
            Duration::from_millis(self.core.connection_backoff_ms),
        );
    }

    /// Throws away every data source along with the unwinder and starts over with a fresh
    /// connection.
    fn restart(&mut self) {
        info!("Restarting the producer");
        let generation = self.core.generation + 1;
        match ProducerCore::new(self.runner.sender(), generation) {
            Ok(core) => self.core = core,
            Err(e) => {
                error!("Failed to restart the producer: {e:#}");
                return;
            }
        }
        // Stale tasks still in flight are dropped as they arrive, delayed ones can go now.
        self.runner.retain_delayed(|task| {
            !matches!(task, ProducerTask::Scoped { generation: g, .. } if *g != generation)
        });
        self.connect_with_retries();
    }
}
