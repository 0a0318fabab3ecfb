//! Per-CPU event descriptors and decoding of the records the kernel writes for them.

use std::os::fd::AsRawFd;

use anyhow::{bail, Context, Result};

use crate::event_config::{EventConfig, PerfCounter, RecordingMode};
use crate::perf::{self, perf_event_attr, perf_event_header, PerfEventFile};
use crate::regs::{regs_count, UserRegs};
use crate::ringbuf::PerfRingBuffer;
use crate::sample::{CommonSampleData, ParsedSample};
use crate::utils::boot_time_ns;

/// Which optional fields a sample record carries, derived from the timebase attr.
#[derive(Debug, Clone, Copy)]
struct SampleLayout {
    sample_type: u64,
    read_format: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
}

impl SampleLayout {
    fn from_attr(attr: &perf_event_attr) -> Self {
        SampleLayout {
            sample_type: attr.sample_type,
            read_format: attr.read_format,
            sample_regs_user: attr.sample_regs_user,
            sample_stack_user: attr.sample_stack_user,
        }
    }

    fn has(&self, bit: u64) -> bool {
        self.sample_type & bit != 0
    }
}

/// Sequential reader over the bytes of one record.
struct RecordCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        RecordCursor { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .with_context(|| {
                format!(
                    "record truncated: wanted {len} bytes at offset {} of {}",
                    self.pos,
                    self.data.len()
                )
            })?;
        let ret = &self.data[self.pos..end];
        self.pos = end;
        Ok(ret)
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_ne_bytes(bytes.try_into()?))
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes = self.bytes(8)?;
        Ok(u64::from_ne_bytes(bytes.try_into()?))
    }

    fn header(&mut self) -> Result<perf_event_header> {
        let bytes = self.bytes(std::mem::size_of::<perf_event_header>())?;
        let mut header = perf_event_header::default();
        plain::copy_from_bytes(&mut header, bytes)
            .map_err(|e| anyhow::anyhow!("bad record header: {e:?}"))?;
        Ok(header)
    }
}

/// Decodes one `PERF_RECORD_SAMPLE`. Fields appear in the kernel's fixed order, each only if
/// its bit is set in `sample_type`.
fn parse_sample_record(cpu: u32, layout: &SampleLayout, record: &[u8]) -> Result<ParsedSample> {
    let mut cursor = RecordCursor::new(record);
    let header = cursor.header()?;
    if header._type != perf::PERF_RECORD_SAMPLE {
        bail!("not a sample record: type {}", header._type);
    }

    let mut sample = ParsedSample::default();
    sample.common.cpu = cpu;
    sample.common.cpu_mode = header.misc & perf::PERF_RECORD_MISC_CPUMODE_MASK;

    if layout.has(perf::PERF_SAMPLE_TID) {
        sample.common.pid = cursor.u32()? as i32;
        sample.common.tid = cursor.u32()? as i32;
    }

    if layout.has(perf::PERF_SAMPLE_TIME) {
        sample.common.timestamp = cursor.u64()?;
    }

    if layout.has(perf::PERF_SAMPLE_READ) {
        if layout.read_format & perf::PERF_FORMAT_GROUP != 0 {
            let nr = cursor.u64()? as usize;
            if nr == 0 {
                bail!("group read with no values");
            }
            sample.common.timebase_count = cursor.u64()?;
            for _ in 1..nr {
                sample.common.follower_counts.push(cursor.u64()?);
            }
        } else {
            sample.common.timebase_count = cursor.u64()?;
        }
    }

    if layout.has(perf::PERF_SAMPLE_CALLCHAIN) {
        let nr = cursor.u64()? as usize;
        let mut ips = Vec::with_capacity(nr);
        for _ in 0..nr {
            let ip = cursor.u64()?;
            // Context markers like PERF_CONTEXT_KERNEL separate the kernel and user parts.
            if ip < perf::PERF_CONTEXT_MAX {
                ips.push(ip);
            }
        }
        sample.kernel_ips = ips;
    }

    if layout.has(perf::PERF_SAMPLE_REGS_USER) {
        let abi = cursor.u64()?;
        // Kernel threads have no userspace registers.
        if abi != perf::PERF_SAMPLE_REGS_ABI_NONE {
            let count = regs_count(layout.sample_regs_user);
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(cursor.u64()?);
            }
            sample.regs = Some(Box::new(UserRegs {
                abi,
                mask: layout.sample_regs_user,
                values,
            }));
        }
    }

    if layout.has(perf::PERF_SAMPLE_STACK_USER) {
        let max_stack_size = cursor.u64()? as usize;
        if max_stack_size > 0 {
            let stack = cursor.bytes(max_stack_size)?;
            let filled = cursor.u64()? as usize;
            if filled > max_stack_size {
                bail!("stack dyn_size {filled} larger than sampled size {max_stack_size}");
            }
            sample.stack = stack[..filled].to_vec();
            sample.stack_maxed = filled == layout.sample_stack_user as usize;
        }
    }

    Ok(sample)
}

fn open_event(
    cpu: u32,
    attr: &perf_event_attr,
    group_fd: libc::c_int,
    counter: &PerfCounter,
) -> Result<PerfEventFile> {
    let file = perf::perf_event_open(attr, -1, cpu as i32, group_fd, perf::PERF_FLAG_FD_CLOEXEC)
        .with_context(|| {
            format!(
                "perf_event_open failed for event type {} config {:#x} on cpu {cpu}, \
                 check /proc/sys/kernel/perf_event_paranoid",
                attr._type, attr.config
            )
        })?;
    if counter.is_tracepoint() && !counter.tracepoint_filter.is_empty() {
        file.set_filter(&counter.tracepoint_filter).with_context(|| {
            format!(
                "Failed to set filter \"{}\" on tracepoint {}",
                counter.tracepoint_filter, counter.tracepoint_name
            )
        })?;
    }
    Ok(file)
}

/// The timebase (and followers) of one data source on one CPU.
pub struct EventReader {
    cpu: u32,
    layout: SampleLayout,
    num_followers: usize,
    leader: PerfEventFile,
    // Kept open for as long as the group lives.
    _followers: Vec<PerfEventFile>,
    ring_buffer: Option<PerfRingBuffer>,
}

impl EventReader {
    /// Opens the events of `config` on `cpu`. Events start disabled.
    pub fn configure_events(cpu: u32, config: &EventConfig) -> Option<EventReader> {
        match Self::try_configure_events(cpu, config) {
            Ok(reader) => Some(reader),
            Err(e) => {
                tracing::error!("Failed to set up events on cpu {cpu}: {e:#}");
                None
            }
        }
    }

    fn try_configure_events(cpu: u32, config: &EventConfig) -> Result<EventReader> {
        let leader = open_event(cpu, config.perf_attr(), -1, config.timebase_event())?;

        let mut followers = Vec::with_capacity(config.follower_attrs().len());
        for (attr, counter) in config
            .follower_attrs()
            .iter()
            .zip(config.follower_events().iter())
        {
            followers.push(open_event(cpu, attr, leader.as_raw_fd(), counter)?);
        }

        let ring_buffer = match config.recording_mode() {
            RecordingMode::Sampling => Some(
                PerfRingBuffer::allocate(&leader, config.ring_buffer_pages() as usize)
                    .context("Failed to allocate ring buffer")?,
            ),
            RecordingMode::Polling => None,
        };

        Ok(EventReader {
            cpu,
            layout: SampleLayout::from_attr(config.perf_attr()),
            num_followers: followers.len(),
            leader,
            _followers: followers,
            ring_buffer,
        })
    }

    /// A reader whose "events" are a plain file and whose ring buffer is fed by the test.
    #[cfg(test)]
    pub(crate) fn for_testing(cpu: u32, config: &EventConfig) -> EventReader {
        let leader = std::fs::File::open("/dev/null").unwrap();
        let ring_buffer = match config.recording_mode() {
            RecordingMode::Sampling => Some(PerfRingBuffer::allocate_anonymous(1).unwrap()),
            RecordingMode::Polling => None,
        };
        EventReader {
            cpu,
            layout: SampleLayout::from_attr(config.perf_attr()),
            num_followers: config.follower_events().len(),
            leader: PerfEventFile::from(std::os::fd::OwnedFd::from(leader)),
            _followers: Vec::new(),
            ring_buffer,
        }
    }

    #[cfg(test)]
    pub(crate) fn ring_buffer_for_testing(&mut self) -> &mut PerfRingBuffer {
        self.ring_buffer.as_mut().unwrap()
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    pub fn enable_events(&mut self) -> Result<()> {
        self.leader
            .enable()
            .with_context(|| format!("Failed to enable events on cpu {}", self.cpu))
    }

    pub fn disable_events(&mut self) -> Result<()> {
        self.leader
            .disable()
            .with_context(|| format!("Failed to disable events on cpu {}", self.cpu))
    }

    /// Reads records until the next sample, which is returned parsed. Lost records are
    /// reported through `records_lost_callback`. Returns `None` once caught up with the kernel.
    pub fn read_until_sample<F>(&mut self, mut records_lost_callback: F) -> Option<ParsedSample>
    where
        F: FnMut(u64),
    {
        let ring = self.ring_buffer.as_mut()?;
        loop {
            let record = ring.read_record_nonconsuming()?;
            let size = record.len();
            let mut cursor = RecordCursor::new(record);
            let Ok(header) = cursor.header() else {
                ring.consume(size);
                continue;
            };

            match header._type {
                perf::PERF_RECORD_SAMPLE => {
                    let parsed = parse_sample_record(self.cpu, &self.layout, record);
                    ring.consume(size);
                    match parsed {
                        Ok(sample) => return Some(sample),
                        Err(e) => {
                            tracing::warn!("Dropping malformed sample on cpu {}: {e:#}", self.cpu)
                        }
                    }
                }
                perf::PERF_RECORD_LOST => {
                    // struct { header; u64 id; u64 lost; }
                    let lost = cursor.u64().and_then(|_id| cursor.u64());
                    ring.consume(size);
                    match lost {
                        Ok(lost) => records_lost_callback(lost),
                        Err(e) => tracing::warn!("Malformed lost record: {e:#}"),
                    }
                }
                perf::PERF_RECORD_THROTTLE | perf::PERF_RECORD_UNTHROTTLE => {
                    ring.consume(size);
                }
                other => {
                    tracing::error!(
                        "Unsupported record type {other} on cpu {}, skipping",
                        self.cpu
                    );
                    ring.consume(size);
                }
            }
        }
    }

    /// Reads the current counter values of the group, for polling.
    pub fn read_counters(&self) -> Option<CommonSampleData> {
        let group = self.layout.read_format & perf::PERF_FORMAT_GROUP != 0;
        let values = if group { 2 + self.num_followers } else { 1 };
        let mut buf = vec![0u64; values];
        let want = values * std::mem::size_of::<u64>();
        let ret = unsafe {
            libc::read(
                self.leader.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                want,
            )
        };
        if ret < 0 || ret as usize != want {
            tracing::warn!(
                "Failed to read counters on cpu {}: {}",
                self.cpu,
                std::io::Error::last_os_error()
            );
            return None;
        }

        let mut data = CommonSampleData {
            cpu: self.cpu,
            timestamp: boot_time_ns(),
            ..Default::default()
        };
        if group {
            // { u64 nr; u64 values[nr]; }
            data.timebase_count = buf[1];
            data.follower_counts = buf[2..].to_vec();
        } else {
            data.timebase_count = buf[0];
        }
        Some(data)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{CallstackSampling, PerfEventConfig, Timebase, UnwindModeConfig};
    use crate::regs;

    /// Builds sample records shaped by a given layout.
    pub(crate) struct SampleRecordBuilder {
        pub misc: u16,
        pub pid: u32,
        pub tid: u32,
        pub time: u64,
        pub counts: Vec<u64>,
        pub ips: Vec<u64>,
        pub regs: Option<Vec<u64>>,
        pub stack: Option<(usize, Vec<u8>)>,
    }

    impl SampleRecordBuilder {
        pub(crate) fn new(pid: u32, tid: u32, time: u64) -> Self {
            SampleRecordBuilder {
                misc: perf::PERF_RECORD_MISC_USER,
                pid,
                tid,
                time,
                counts: vec![1],
                ips: Vec::new(),
                regs: None,
                stack: None,
            }
        }

        pub(crate) fn build(&self, attr: &perf_event_attr) -> Vec<u8> {
            let mut body: Vec<u8> = Vec::new();
            let mut push = |v: u64| body.extend_from_slice(&v.to_ne_bytes());
            push(((self.tid as u64) << 32) | self.pid as u64);
            push(self.time);
            if attr.read_format & perf::PERF_FORMAT_GROUP != 0 {
                push(self.counts.len() as u64);
            }
            for c in &self.counts {
                push(*c);
            }
            if attr.sample_type & perf::PERF_SAMPLE_CALLCHAIN != 0 {
                push(self.ips.len() as u64);
                for ip in &self.ips {
                    push(*ip);
                }
            }
            if attr.sample_type & perf::PERF_SAMPLE_REGS_USER != 0 {
                match &self.regs {
                    Some(values) => {
                        push(2);
                        for v in values {
                            push(*v);
                        }
                    }
                    None => push(0),
                }
            }
            if attr.sample_type & perf::PERF_SAMPLE_STACK_USER != 0 {
                match &self.stack {
                    Some((size, data)) => {
                        push(*size as u64);
                        let mut padded = data.clone();
                        padded.resize(*size, 0);
                        body.extend_from_slice(&padded);
                        body.extend_from_slice(&(data.len() as u64).to_ne_bytes());
                    }
                    None => body.extend_from_slice(&0u64.to_ne_bytes()),
                }
            }
            let mut record = Vec::new();
            record.extend_from_slice(&perf::PERF_RECORD_SAMPLE.to_ne_bytes());
            record.extend_from_slice(&self.misc.to_ne_bytes());
            record.extend_from_slice(&((body.len() + 8) as u16).to_ne_bytes());
            record.extend_from_slice(&body);
            record
        }
    }

    pub(crate) fn lost_record(lost: u64) -> Vec<u8> {
        let mut record = Vec::new();
        record.extend_from_slice(&perf::PERF_RECORD_LOST.to_ne_bytes());
        record.extend_from_slice(&0u16.to_ne_bytes());
        record.extend_from_slice(&24u16.to_ne_bytes());
        record.extend_from_slice(&1u64.to_ne_bytes());
        record.extend_from_slice(&lost.to_ne_bytes());
        record
    }

    fn throttle_record() -> Vec<u8> {
        let mut record = Vec::new();
        record.extend_from_slice(&perf::PERF_RECORD_THROTTLE.to_ne_bytes());
        record.extend_from_slice(&0u16.to_ne_bytes());
        record.extend_from_slice(&32u16.to_ne_bytes());
        record.extend_from_slice(&[0u8; 24]);
        record
    }

    fn config(callstack: Option<CallstackSampling>) -> EventConfig {
        let cfg = PerfEventConfig {
            timebase: Some(Timebase {
                frequency: Some(1000),
                ..Default::default()
            }),
            callstack_sampling: callstack,
            ..Default::default()
        };
        EventConfig::create(&cfg, None, &|_, _| 0).unwrap()
    }

    #[test]
    fn test_counter_only_samples() {
        let config = config(None);
        let mut reader = EventReader::for_testing(3, &config);
        let mut builder = SampleRecordBuilder::new(10, 11, 1000);
        builder.counts = vec![42];
        let record = builder.build(config.perf_attr());
        reader.ring_buffer_for_testing().write_record_for_testing(&record);
        reader.ring_buffer_for_testing().write_record_for_testing(&throttle_record());

        let sample = reader.read_until_sample(|_| panic!("no loss")).unwrap();
        assert_eq!(sample.common.cpu, 3);
        assert_eq!(sample.common.pid, 10);
        assert_eq!(sample.common.tid, 11);
        assert_eq!(sample.common.timestamp, 1000);
        assert_eq!(sample.common.timebase_count, 42);
        assert_eq!(sample.common.cpu_mode, perf::PERF_RECORD_MISC_USER);
        assert!(sample.regs.is_none());
        assert!(sample.stack.is_empty());
        assert!(sample.kernel_ips.is_empty());
        assert!(reader.read_until_sample(|_| {}).is_none());
    }

    #[test]
    fn test_lost_records_reported() {
        let config = config(None);
        let mut reader = EventReader::for_testing(0, &config);
        let record = SampleRecordBuilder::new(1, 1, 5).build(config.perf_attr());
        reader
            .ring_buffer_for_testing()
            .write_record_for_testing(&lost_record(17));
        reader.ring_buffer_for_testing().write_record_for_testing(&record);

        let mut lost = 0;
        let sample = reader.read_until_sample(|n| lost += n).unwrap();
        assert_eq!(lost, 17);
        assert_eq!(sample.common.timestamp, 5);
    }

    #[test]
    fn test_kernel_callchain_drops_context_markers() {
        let config = config(Some(CallstackSampling {
            kernel_frames: true,
            user_frames: UnwindModeConfig::UnwindSkip,
            ..Default::default()
        }));
        let mut reader = EventReader::for_testing(0, &config);
        let mut builder = SampleRecordBuilder::new(0, 0, 1);
        builder.misc = perf::PERF_RECORD_MISC_KERNEL;
        builder.ips = vec![u64::MAX - 127, 0xffff_ffff_8100_0000, 0xffff_ffff_8100_0040];
        let record = builder.build(config.perf_attr());
        reader.ring_buffer_for_testing().write_record_for_testing(&record);

        let sample = reader.read_until_sample(|_| {}).unwrap();
        assert_eq!(sample.common.cpu_mode, perf::PERF_RECORD_MISC_KERNEL);
        assert_eq!(
            sample.kernel_ips,
            vec![0xffff_ffff_8100_0000, 0xffff_ffff_8100_0040]
        );
    }

    #[test]
    fn test_user_regs_and_stack() {
        if !regs::user_frames_supported() {
            return;
        }
        let config = config(Some(CallstackSampling {
            user_frames: UnwindModeConfig::UnwindFramePointer,
            ..Default::default()
        }));
        let mut reader = EventReader::for_testing(0, &config);

        let nregs = regs::regs_count(regs::USER_REGS_MASK);
        let mut builder = SampleRecordBuilder::new(100, 101, 7);
        builder.regs = Some((0..nregs as u64).collect());
        builder.stack = Some((256, vec![0xab; 64]));
        let record = builder.build(config.perf_attr());
        reader.ring_buffer_for_testing().write_record_for_testing(&record);

        // Kernel thread: no regs, no stack.
        let kthread = SampleRecordBuilder::new(2, 2, 8).build(config.perf_attr());
        reader.ring_buffer_for_testing().write_record_for_testing(&kthread);

        let sample = reader.read_until_sample(|_| {}).unwrap();
        let regs = sample.regs.as_ref().unwrap();
        assert_eq!(regs.values.len(), nregs);
        assert_eq!(sample.stack, vec![0xab; 64]);
        assert!(!sample.stack_maxed);

        let sample = reader.read_until_sample(|_| {}).unwrap();
        assert!(sample.regs.is_none());
        assert!(sample.stack.is_empty());
    }

    #[test]
    fn test_truncated_sample_is_dropped() {
        let config = config(None);
        let mut reader = EventReader::for_testing(0, &config);
        let mut record = SampleRecordBuilder::new(1, 1, 1).build(config.perf_attr());
        // Claim a size that cuts off the counter value.
        record.truncate(16);
        record[6..8].copy_from_slice(&16u16.to_ne_bytes());
        reader.ring_buffer_for_testing().write_record_for_testing(&record);
        assert!(reader.read_until_sample(|_| {}).is_none());
    }

    #[test]
    fn test_parse_group_read() {
        let mut cfg = PerfEventConfig::default();
        cfg.followers = vec![crate::config::Follower {
            counter: Some(crate::config::Counter::SwPageFaults),
            ..Default::default()
        }];
        let config = EventConfig::create(&cfg, None, &|_, _| 0).unwrap();
        let mut builder = SampleRecordBuilder::new(1, 2, 3);
        builder.counts = vec![100, 200];
        let record = builder.build(config.perf_attr());
        let layout = SampleLayout::from_attr(config.perf_attr());
        let sample = parse_sample_record(0, &layout, &record).unwrap();
        assert_eq!(sample.common.timebase_count, 100);
        assert_eq!(sample.common.follower_counts, vec![200]);
    }
}
