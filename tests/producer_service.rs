//! End to end tests of the producer against the in-process service.
//!
//! Tests that open perf events need `perf_event_paranoid` <= 1 (or CAP_PERFMON) and are marked
//! `#[ignore]`. To run them:
//! ```
//! cargo test --test producer_service -- --ignored
//! ```

use std::hint::black_box;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use perfetto_protos::trace::Trace;
use perfetto_protos::trace_packet::TracePacket;
use protobuf::Message;
use tempfile::TempDir;

use tracedperf::perfetto::TraceFile;
use tracedperf::service::{LocalConnector, ServiceEvent};
use tracedperf::{DataSourceConfig, PerfProducer, ProducerTask};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

fn wait_for_event(events: &Receiver<ServiceEvent>, want: &ServiceEvent) {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(left) {
            Ok(event) if event == *want => return,
            Ok(_) => continue,
            Err(e) => panic!("Never saw {want:?}: {e}"),
        }
    }
}

/// Runs the producer with `configs` started as data sources 1.., stops them after
/// `duration`, and returns every packet that made it to the trace file.
fn run_session(configs: &[&str], duration: Duration) -> Vec<TracePacket> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("trace.pb");
    let trace = TraceFile::create(&path).unwrap();
    let (tx, events) = channel();
    let mut producer = PerfProducer::new(Box::new(LocalConnector::new(trace.clone(), tx))).unwrap();
    let sender = producer.sender();
    let handle = thread::spawn(move || producer.run());

    wait_for_event(
        &events,
        &ServiceEvent::DataSourceRegistered("linux.perf".to_string()),
    );
    for (idx, json) in configs.iter().enumerate() {
        let config = DataSourceConfig::from_json(json).unwrap();
        sender
            .post(ProducerTask::StartDataSource {
                ds_id: idx as u64 + 1,
                config,
            })
            .unwrap();
    }

    thread::sleep(duration);

    sender.post(ProducerTask::Flush { flush_id: 1 }).unwrap();
    wait_for_event(&events, &ServiceEvent::FlushComplete(1));
    for idx in 0..configs.len() {
        let ds_id = idx as u64 + 1;
        sender.post(ProducerTask::StopDataSource { ds_id }).unwrap();
        wait_for_event(&events, &ServiceEvent::DataSourceStopped(ds_id));
    }
    sender.post(ProducerTask::Quit).unwrap();
    handle.join().unwrap();
    trace.flush().unwrap();

    read_trace(&path)
}

fn read_trace(path: &Path) -> Vec<TracePacket> {
    let bytes = std::fs::read(path).unwrap();
    Trace::parse_from_bytes(&bytes).unwrap().packet.into_iter().collect()
}

/// Keeps a cpu busy until dropped.
struct Spinner {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Spinner {
    fn start() -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = thread::spawn(move || {
            let mut x = 0u64;
            while !thread_stop.load(Ordering::Relaxed) {
                x = black_box(x.wrapping_mul(31).wrapping_add(7));
            }
        });
        Spinner {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[test]
fn test_unusable_configs_are_acked() {
    // Neither data source produces anything, but both stops must still be acknowledged.
    let other_source = r#"{ "name": "linux.ftrace" }"#;
    let bad_unwind = r#"
    {
        "perf_event_config": {
            "timebase": { "frequency": 100, "counter": "SW_CPU_CLOCK" },
            "callstack_sampling": { "user_frames": "UNWIND_SOMETHING_NEW" }
        }
    }"#;
    let packets = run_session(&[other_source, bad_unwind], Duration::from_millis(10));
    assert!(packets.iter().all(|p| !p.has_perf_sample()));
}

#[test]
#[ignore] // Requires perf_event access
fn test_callstack_sampling_of_self() {
    let config = format!(
        r#"
        {{
            "perf_event_config": {{
                "timebase": {{ "frequency": 1000, "counter": "SW_CPU_CLOCK" }},
                "callstack_sampling": {{
                    "scope": {{ "target_pid": [{}] }},
                    "kernel_frames": true,
                    "user_frames": "UNWIND_FRAME_POINTER"
                }},
                "ring_buffer_read_period_ms": 50
            }}
        }}"#,
        std::process::id()
    );
    let packets = {
        let _spinner = Spinner::start();
        run_session(&[&config], Duration::from_millis(500))
    };

    assert!(packets.iter().any(|p| p.has_trace_packet_defaults()));
    let pid = std::process::id();
    let ours: Vec<_> = packets
        .iter()
        .filter(|p| p.has_perf_sample() && p.perf_sample().pid() == pid)
        .collect();
    assert!(!ours.is_empty(), "No samples of pid {pid}");
    assert!(ours.iter().all(|p| p.timestamp() > 0));
    assert!(ours
        .iter()
        .any(|p| p.perf_sample().has_callstack_iid() || p.perf_sample().has_unwind_error()));
}

#[test]
#[ignore] // Requires perf_event access
fn test_counter_polling() {
    let config = r#"
    {
        "perf_event_config": {
            "timebase": { "poll_period_ms": 50, "counter": "SW_CPU_CLOCK" },
            "followers": [ { "counter": "SW_CONTEXT_SWITCHES" } ]
        }
    }"#;
    let packets = {
        let _spinner = Spinner::start();
        run_session(&[config], Duration::from_millis(300))
    };

    let samples: Vec<_> = packets
        .iter()
        .filter(|p| p.has_perf_sample())
        .map(|p| p.perf_sample())
        .collect();
    assert!(!samples.is_empty());
    assert!(samples.iter().all(|s| !s.has_callstack_iid()));
    assert!(samples.iter().any(|s| s.timebase_count() > 0));
}
