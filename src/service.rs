//! The producer's side of the tracing service: the endpoint it talks to once connected, the
//! connector that gets it there, and an in-process service writing a single trace file.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{debug, info};

use crate::perfetto::{TraceFile, TraceWriter};
use crate::unwind_queue::DataSourceInstanceId;

pub const INITIAL_CONNECTION_BACKOFF_MS: u64 = 100;
pub const MAX_CONNECTION_BACKOFF_MS: u64 = 30 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotStarted,
    NotConnected,
    Connecting,
    Connected,
}

/// Doubles the reconnection delay, up to [`MAX_CONNECTION_BACKOFF_MS`].
pub fn next_connection_backoff_ms(current_ms: u64) -> u64 {
    (current_ms * 2).min(MAX_CONNECTION_BACKOFF_MS)
}

/// What the producer can ask of the service once connected.
pub trait ProducerEndpoint: Send {
    fn register_data_source(&mut self, name: &str) -> Result<()>;

    /// A writer for a new sequence in `target_buffer`.
    fn create_trace_writer(&mut self, target_buffer: u32) -> Box<dyn TraceWriter>;

    fn notify_data_source_stopped(&mut self, ds_id: DataSourceInstanceId);

    fn notify_flush_complete(&mut self, flush_id: u64);
}

/// Establishes the connection to the service.
pub trait Connector: Send {
    fn connect(&mut self, producer_name: &str) -> Result<Box<dyn ProducerEndpoint>>;
}

/// Everything an in-process service reports back to whoever drives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Connected(String),
    DataSourceRegistered(String),
    DataSourceStopped(DataSourceInstanceId),
    FlushComplete(u64),
}

/// Connects to an in-process service that writes every sequence into one trace file.
pub struct LocalConnector {
    trace: TraceFile,
    events: Sender<ServiceEvent>,
    // Shared by every endpoint so sequence ids stay unique across reconnects.
    next_sequence_id: Arc<AtomicU32>,
}

impl LocalConnector {
    pub fn new(trace: TraceFile, events: Sender<ServiceEvent>) -> Self {
        LocalConnector {
            trace,
            events,
            next_sequence_id: Arc::new(AtomicU32::new(1)),
        }
    }
}

impl Connector for LocalConnector {
    fn connect(&mut self, producer_name: &str) -> Result<Box<dyn ProducerEndpoint>> {
        self.events
            .send(ServiceEvent::Connected(producer_name.to_string()))
            .map_err(|_| anyhow!("Service is gone"))?;
        Ok(Box::new(LocalEndpoint {
            trace: self.trace.clone(),
            events: self.events.clone(),
            next_sequence_id: self.next_sequence_id.clone(),
        }))
    }
}

struct LocalEndpoint {
    trace: TraceFile,
    events: Sender<ServiceEvent>,
    next_sequence_id: Arc<AtomicU32>,
}

impl LocalEndpoint {
    fn send(&self, event: ServiceEvent) {
        if self.events.send(event).is_err() {
            debug!("Nobody is listening for service events");
        }
    }
}

impl ProducerEndpoint for LocalEndpoint {
    fn register_data_source(&mut self, name: &str) -> Result<()> {
        info!("Registered data source {name}");
        self.send(ServiceEvent::DataSourceRegistered(name.to_string()));
        Ok(())
    }

    fn create_trace_writer(&mut self, target_buffer: u32) -> Box<dyn TraceWriter> {
        let sequence_id = self.next_sequence_id.fetch_add(1, Ordering::Relaxed);
        debug!("New trace writer, sequence {sequence_id} in buffer {target_buffer}");
        Box::new(self.trace.writer(sequence_id))
    }

    fn notify_data_source_stopped(&mut self, ds_id: DataSourceInstanceId) {
        self.send(ServiceEvent::DataSourceStopped(ds_id));
    }

    fn notify_flush_complete(&mut self, flush_id: u64) {
        self.send(ServiceEvent::FlushComplete(flush_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perfetto_protos::trace::Trace;
    use perfetto_protos::trace_packet::TracePacket;
    use protobuf::Message;
    use std::sync::mpsc::channel;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = INITIAL_CONNECTION_BACKOFF_MS;
        let mut seen = Vec::new();
        for _ in 0..12 {
            backoff = next_connection_backoff_ms(backoff);
            seen.push(backoff);
        }
        assert_eq!(&seen[..4], &[200, 400, 800, 1600]);
        assert_eq!(*seen.last().unwrap(), MAX_CONNECTION_BACKOFF_MS);
        assert!(seen.iter().all(|b| *b <= MAX_CONNECTION_BACKOFF_MS));
    }

    #[test]
    fn test_local_service() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.pb");
        let trace = TraceFile::create(&path).unwrap();
        let (tx, rx) = channel();
        let mut connector = LocalConnector::new(trace.clone(), tx);

        let mut endpoint = connector.connect("producer").unwrap();
        endpoint.register_data_source("linux.perf").unwrap();
        let mut first = endpoint.create_trace_writer(0);
        let mut second = endpoint.create_trace_writer(0);
        let mut packet = TracePacket::default();
        packet.set_timestamp(1);
        first.write_packet(&packet).unwrap();
        second.write_packet(&packet).unwrap();
        endpoint.notify_data_source_stopped(7);
        endpoint.notify_flush_complete(3);
        trace.flush().unwrap();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                ServiceEvent::Connected("producer".to_string()),
                ServiceEvent::DataSourceRegistered("linux.perf".to_string()),
                ServiceEvent::DataSourceStopped(7),
                ServiceEvent::FlushComplete(3),
            ]
        );

        let parsed = Trace::parse_from_bytes(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed.packet.len(), 2);
        assert_eq!(parsed.packet[0].trusted_packet_sequence_id(), 1);
        assert_eq!(parsed.packet[1].trusted_packet_sequence_id(), 2);
    }
}
