//! Bounded single-producer single-consumer queue between the reader and the unwinder.
//!
//! The producer thread writes through a [`QueueWriter`], the unwinder thread reads through a
//! [`QueueReader`]. Slots in `[read_pos, write_pos)` belong to the reader, every other slot
//! belongs to the writer. Ownership changes hands through the release store of the respective
//! cursor.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::sample::ParsedSample;

pub const UNWIND_QUEUE_CAPACITY: usize = 1024;

pub type DataSourceInstanceId = u64;

#[derive(Debug, Default)]
pub struct UnwindEntry {
    pub data_source_id: DataSourceInstanceId,
    pub sample: ParsedSample,
    /// Cleared once the entry has been handled, the slot may still be behind the read cursor.
    pub valid: bool,
}

impl UnwindEntry {
    pub fn new(data_source_id: DataSourceInstanceId, sample: ParsedSample) -> Self {
        UnwindEntry {
            data_source_id,
            sample,
            valid: true,
        }
    }

    pub fn invalid() -> Self {
        UnwindEntry::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteView {
    /// False if the queue is full.
    pub valid: bool,
    pub write_pos: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadView {
    pub read_pos: u64,
    pub write_pos: u64,
}

struct Shared {
    slots: Box<[UnsafeCell<UnwindEntry>]>,
    wr_pos: AtomicU64,
    rd_pos: AtomicU64,
    footprint_allocated: AtomicU64,
    footprint_freed: AtomicU64,
}

// SAFETY: slot access is partitioned between exactly one writer and one reader by the cursors.
unsafe impl Sync for Shared {}
unsafe impl Send for Shared {}

impl Shared {
    fn slot(&self, pos: u64) -> *mut UnwindEntry {
        self.slots[(pos % self.slots.len() as u64) as usize].get()
    }
}

/// Creates a queue with [`UNWIND_QUEUE_CAPACITY`] slots.
pub fn unwind_queue() -> (QueueWriter, QueueReader) {
    unwind_queue_with_capacity(UNWIND_QUEUE_CAPACITY)
}

fn unwind_queue_with_capacity(capacity: usize) -> (QueueWriter, QueueReader) {
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(UnwindEntry::invalid()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let shared = Arc::new(Shared {
        slots,
        wr_pos: AtomicU64::new(0),
        rd_pos: AtomicU64::new(0),
        footprint_allocated: AtomicU64::new(0),
        footprint_freed: AtomicU64::new(0),
    });
    (
        QueueWriter {
            shared: shared.clone(),
        },
        QueueReader { shared },
    )
}

/// Producer side of the queue. Not `Clone`, there is exactly one writer.
pub struct QueueWriter {
    shared: Arc<Shared>,
}

impl QueueWriter {
    pub fn begin_write(&self) -> WriteView {
        let wr = self.shared.wr_pos.load(Ordering::Relaxed);
        let rd = self.shared.rd_pos.load(Ordering::Acquire);
        WriteView {
            valid: wr - rd < self.shared.slots.len() as u64,
            write_pos: wr,
        }
    }

    /// Publishes `entry` at the position returned by a valid [`begin_write`](Self::begin_write).
    pub fn commit_write(&mut self, entry: UnwindEntry) {
        let view = self.begin_write();
        assert!(view.valid, "commit_write on a full unwind queue");
        // SAFETY: the slot is outside [rd_pos, wr_pos), so the reader won't touch it until we
        // publish the new write position below.
        unsafe { *self.shared.slot(view.write_pos) = entry };
        self.shared
            .wr_pos
            .store(view.write_pos + 1, Ordering::Release);
    }

    pub fn increment_enqueued_footprint(&self, bytes: u64) {
        self.shared
            .footprint_allocated
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn enqueued_footprint(&self) -> u64 {
        enqueued_footprint(&self.shared)
    }
}

/// Consumer side of the queue.
pub struct QueueReader {
    shared: Arc<Shared>,
}

impl QueueReader {
    pub fn begin_read(&self) -> ReadView {
        ReadView {
            read_pos: self.shared.rd_pos.load(Ordering::Relaxed),
            write_pos: self.shared.wr_pos.load(Ordering::Acquire),
        }
    }

    /// The entry at `pos`, which must lie within the last [`begin_read`](Self::begin_read) view.
    pub fn at(&mut self, pos: u64) -> &mut UnwindEntry {
        let view = self.begin_read();
        assert!(
            pos >= view.read_pos && pos < view.write_pos,
            "unwind queue position {pos} outside of [{}, {})",
            view.read_pos,
            view.write_pos
        );
        // SAFETY: slots in [rd_pos, wr_pos) are owned by the reader, and &mut self guarantees
        // no other reference into the queue is alive.
        unsafe { &mut *self.shared.slot(pos) }
    }

    /// Hands every slot before `pos` back to the writer.
    pub fn commit_new_read_position(&mut self, pos: u64) {
        self.shared.rd_pos.store(pos, Ordering::Release);
    }

    pub fn decrement_enqueued_footprint(&self, bytes: u64) {
        self.shared
            .footprint_freed
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn enqueued_footprint(&self) -> u64 {
        enqueued_footprint(&self.shared)
    }
}

fn enqueued_footprint(shared: &Shared) -> u64 {
    let freed = shared.footprint_freed.load(Ordering::Relaxed);
    let allocated = shared.footprint_allocated.load(Ordering::Relaxed);
    allocated.saturating_sub(freed)
}

#[cfg(test)]
pub(crate) fn unwind_queue_for_testing(capacity: usize) -> (QueueWriter, QueueReader) {
    unwind_queue_with_capacity(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ds: u64, pid: i32) -> UnwindEntry {
        let mut sample = ParsedSample::default();
        sample.common.pid = pid;
        UnwindEntry::new(ds, sample)
    }

    #[test]
    fn test_fill_and_reopen() {
        let (mut writer, mut reader) = unwind_queue();
        for i in 0..UNWIND_QUEUE_CAPACITY {
            let view = writer.begin_write();
            assert!(view.valid);
            assert_eq!(view.write_pos, i as u64);
            writer.commit_write(entry(1, i as i32));
        }
        assert!(!writer.begin_write().valid);

        let view = reader.begin_read();
        assert_eq!(view.read_pos, 0);
        assert_eq!(view.write_pos, UNWIND_QUEUE_CAPACITY as u64);
        assert_eq!(reader.at(0).sample.common.pid, 0);
        *reader.at(0) = UnwindEntry::invalid();
        reader.commit_new_read_position(1);

        let view = writer.begin_write();
        assert!(view.valid);
        writer.commit_write(entry(1, 9999));
        assert!(!writer.begin_write().valid);

        // The new entry wrapped into slot 0.
        let view = reader.begin_read();
        assert_eq!(view.write_pos, UNWIND_QUEUE_CAPACITY as u64 + 1);
        assert_eq!(
            reader.at(UNWIND_QUEUE_CAPACITY as u64).sample.common.pid,
            9999
        );
    }

    #[test]
    fn test_footprint() {
        let (writer, reader) = unwind_queue();
        writer.increment_enqueued_footprint(4096);
        writer.increment_enqueued_footprint(1024);
        assert_eq!(writer.enqueued_footprint(), 5120);
        reader.decrement_enqueued_footprint(4096);
        assert_eq!(reader.enqueued_footprint(), 1024);
        assert_eq!(writer.enqueued_footprint(), 1024);
    }

    #[test]
    fn test_cross_thread() {
        let (mut writer, mut reader) = unwind_queue_for_testing(8);
        let consumer = std::thread::spawn(move || {
            let mut seen = Vec::new();
            while seen.len() < 100 {
                let view = reader.begin_read();
                for pos in view.read_pos..view.write_pos {
                    let entry = reader.at(pos);
                    seen.push(entry.sample.common.pid);
                    *entry = UnwindEntry::invalid();
                }
                reader.commit_new_read_position(view.write_pos);
                std::thread::yield_now();
            }
            seen
        });
        let mut next = 0;
        while next < 100 {
            if writer.begin_write().valid {
                writer.commit_write(entry(1, next));
                next += 1;
            } else {
                std::thread::yield_now();
            }
        }
        let seen = consumer.join().unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }
}
