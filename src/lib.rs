//! tracedperf - a perf_event sampling profiler writing perfetto traces.
//!
//! The pipeline, leaf first:
//!
//! - [`event_config`] - validates a [`config::PerfEventConfig`] and derives the kernel attributes
//! - [`ringbuf`] - the mmap'd ring buffer shared with the kernel
//! - [`event_reader`] - one cpu's events, decodes samples out of the ring buffer
//! - [`target_filter`] - which processes get callstacks
//! - [`unwinder`] - the unwinding thread and its work queue ([`unwind_queue`])
//! - [`producer`] - the orchestrator tying the above together and writing packets
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::mpsc::channel;
//!
//! use tracedperf::perfetto::TraceFile;
//! use tracedperf::producer::PerfProducer;
//! use tracedperf::service::LocalConnector;
//!
//! let trace = TraceFile::create(Path::new("trace.pb")).unwrap();
//! let (tx, _events) = channel();
//! let mut producer = PerfProducer::new(Box::new(LocalConnector::new(trace, tx))).unwrap();
//! // Data sources are started by posting tasks through `producer.sender()`.
//! producer.run();
//! ```

pub mod callstack_trie;
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub mod cfi;
pub mod config;
pub mod event_config;
pub mod event_reader;
pub mod guardrails;
pub mod maps;
pub mod perf;
pub mod perfetto;
pub mod proc_fd;
pub mod producer;
pub mod regs;
pub mod ringbuf;
pub mod sample;
pub mod service;
pub mod symbolize;
pub mod target_filter;
pub mod task_runner;
pub mod unwind_queue;
pub mod unwinder;
pub mod utils;

pub use config::DataSourceConfig;
pub use producer::{PerfProducer, ProducerTask};
