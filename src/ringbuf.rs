//! Userspace side of the mmap'd perf ring buffer.
//!
//! The kernel is the only writer and advances `data_head`; we are the only reader and advance
//! `data_tail`. The two sides synchronize purely through those two cursors, so they are accessed
//! as atomics directly over the mapping.

use std::os::fd::{AsRawFd, RawFd};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::perf::perf_event_header;
use crate::utils::page_size;

/// Largest record the kernel can write, `perf_event_header.size` is a u16.
const MAX_RECORD_SIZE: usize = 1 << 16;

/// `struct perf_event_mmap_page`, up to the fields we use.
#[repr(C)]
#[allow(dead_code)]
struct PerfEventMmapPage {
    version: u32,
    compat_version: u32,
    lock: u32,
    index: u32,
    offset: i64,
    time_enabled: u64,
    time_running: u64,
    capabilities: u64,
    pmc_width: u16,
    time_shift: u16,
    time_mult: u32,
    time_offset: u64,
    time_zero: u64,
    size: u32,
    __reserved_1: u32,
    time_cycles: u64,
    time_mask: u64,
    __reserved: [u8; 116 * 8],
    data_head: AtomicU64,
    data_tail: AtomicU64,
    data_offset: u64,
    data_size: u64,
}

/// One CPU's ring buffer: a metadata page followed by a power of two number of data pages.
pub struct PerfRingBuffer {
    mmap_addr: NonNull<u8>,
    mmap_sz: usize,
    data_buf: NonNull<u8>,
    data_buf_sz: usize,
    /// Records that wrap around the end of the buffer are stitched together in here.
    reconstructed_record: Vec<u8>,
}

// SAFETY: the mapping is exclusively owned, the kernel side synchronizes through the cursors.
unsafe impl Send for PerfRingBuffer {}

impl PerfRingBuffer {
    /// Maps the ring buffer of the perf event `fd`. `data_page_count` must be a power of two.
    pub fn allocate(fd: &impl AsRawFd, data_page_count: usize) -> Option<PerfRingBuffer> {
        Self::map(Some(fd.as_raw_fd()), data_page_count)
    }

    /// A ring buffer over anonymous memory, only useful for feeding records by hand.
    #[cfg(test)]
    pub(crate) fn allocate_anonymous(data_page_count: usize) -> Option<PerfRingBuffer> {
        Self::map(None, data_page_count)
    }

    fn map(fd: Option<RawFd>, data_page_count: usize) -> Option<PerfRingBuffer> {
        if !data_page_count.is_power_of_two() {
            tracing::error!("Ring buffer page count {data_page_count} is not a power of two");
            return None;
        }
        let page_size = page_size();
        let data_buf_sz = data_page_count * page_size;
        let mmap_sz = page_size + data_buf_sz;

        let (flags, raw_fd) = match fd {
            Some(fd) => (libc::MAP_SHARED, fd),
            None => (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS, -1),
        };
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_sz,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                raw_fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            tracing::error!(
                "Failed to mmap {mmap_sz} byte ring buffer: {}",
                std::io::Error::last_os_error()
            );
            return None;
        }
        let mmap_addr = NonNull::new(addr as *mut u8)?;
        // SAFETY: the mapping is at least one page plus the data pages.
        let data_buf = unsafe { NonNull::new_unchecked(mmap_addr.as_ptr().add(page_size)) };

        Some(PerfRingBuffer {
            mmap_addr,
            mmap_sz,
            data_buf,
            data_buf_sz,
            reconstructed_record: vec![0; MAX_RECORD_SIZE],
        })
    }

    fn metadata_page(&self) -> &PerfEventMmapPage {
        // SAFETY: the first page of the mapping is the metadata page, and it lives as long as we
        // do.
        unsafe { &*(self.mmap_addr.as_ptr() as *const PerfEventMmapPage) }
    }

    fn data(&self) -> &[u8] {
        // SAFETY: the data pages are mapped for as long as we live. The kernel only writes the
        // range between data_head and data_tail, which we never read.
        unsafe { std::slice::from_raw_parts(self.data_buf.as_ptr(), self.data_buf_sz) }
    }

    /// Returns the next record without consuming it, or `None` if we're caught up with the
    /// kernel. The caller must [`consume`](Self::consume) the record's size once done with it.
    pub fn read_record_nonconsuming(&mut self) -> Option<&[u8]> {
        let meta = self.metadata_page();
        // Pairs with the kernel's release store, the record bytes are visible after this.
        let write_offset = meta.data_head.load(Ordering::Acquire);
        // We're the only writer of the tail.
        let read_offset = meta.data_tail.load(Ordering::Relaxed);
        if write_offset == read_offset {
            return None;
        }

        let read_pos = (read_offset as usize) & (self.data_buf_sz - 1);
        let header_sz = std::mem::size_of::<perf_event_header>();
        // The kernel keeps the 8 byte header contiguous.
        let mut header = perf_event_header::default();
        if plain::copy_from_bytes(&mut header, &self.data()[read_pos..read_pos + header_sz]).is_err()
        {
            return None;
        }
        let evt_size = header.size as usize;
        if evt_size < header_sz {
            tracing::error!("Corrupt ring buffer record of size {evt_size}, skipping to head");
            self.metadata_page()
                .data_tail
                .store(write_offset, Ordering::Release);
            return None;
        }

        if read_pos + evt_size > self.data_buf_sz {
            let prefix_sz = self.data_buf_sz - read_pos;
            // SAFETY: both source ranges are inside the data pages and the scratch buffer is
            // MAX_RECORD_SIZE long, which no record exceeds.
            unsafe {
                ptr::copy_nonoverlapping(
                    self.data_buf.as_ptr().add(read_pos),
                    self.reconstructed_record.as_mut_ptr(),
                    prefix_sz,
                );
                ptr::copy_nonoverlapping(
                    self.data_buf.as_ptr(),
                    self.reconstructed_record.as_mut_ptr().add(prefix_sz),
                    evt_size - prefix_sz,
                );
            }
            return Some(&self.reconstructed_record[..evt_size]);
        }
        Some(&self.data()[read_pos..read_pos + evt_size])
    }

    /// Releases `bytes` of the buffer back to the kernel.
    pub fn consume(&mut self, bytes: usize) {
        let meta = self.metadata_page();
        let read_offset = meta.data_tail.load(Ordering::Relaxed);
        // Release so our reads of the record happen before the kernel may overwrite it.
        meta.data_tail
            .store(read_offset + bytes as u64, Ordering::Release);
    }

    /// Test hook standing in for the kernel: appends `record` at `data_head`.
    #[cfg(test)]
    pub(crate) fn write_record_for_testing(&mut self, record: &[u8]) {
        let meta = self.metadata_page();
        let head = meta.data_head.load(Ordering::Relaxed);
        let tail = meta.data_tail.load(Ordering::Relaxed);
        assert!((head - tail) as usize + record.len() <= self.data_buf_sz);
        let mask = self.data_buf_sz - 1;
        for (i, b) in record.iter().enumerate() {
            let pos = (head as usize + i) & mask;
            // SAFETY: pos is masked into the data pages.
            unsafe { *self.data_buf.as_ptr().add(pos) = *b };
        }
        self.metadata_page()
            .data_head
            .store(head + record.len() as u64, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn data_size(&self) -> usize {
        self.data_buf_sz
    }
}

impl Drop for PerfRingBuffer {
    fn drop(&mut self) {
        // SAFETY: we own the mapping and nothing borrows from it past our lifetime.
        unsafe {
            libc::munmap(self.mmap_addr.as_ptr() as *mut libc::c_void, self.mmap_sz);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf::PERF_RECORD_SAMPLE;

    fn make_record(len: usize, fill: u8) -> Vec<u8> {
        let mut record = Vec::with_capacity(len);
        record.extend_from_slice(&PERF_RECORD_SAMPLE.to_ne_bytes());
        record.extend_from_slice(&0u16.to_ne_bytes());
        record.extend_from_slice(&(len as u16).to_ne_bytes());
        record.resize(len, fill);
        record
    }

    #[test]
    fn test_mmap_page_layout() {
        assert_eq!(std::mem::offset_of!(PerfEventMmapPage, data_head), 1024);
        assert_eq!(std::mem::offset_of!(PerfEventMmapPage, data_tail), 1032);
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        assert!(PerfRingBuffer::allocate_anonymous(3).is_none());
        assert!(PerfRingBuffer::allocate_anonymous(0).is_none());
    }

    #[test]
    fn test_empty() {
        let mut rb = PerfRingBuffer::allocate_anonymous(1).unwrap();
        assert!(rb.read_record_nonconsuming().is_none());
    }

    #[test]
    fn test_records_in_order_with_wraparound() {
        let mut rb = PerfRingBuffer::allocate_anonymous(1).unwrap();
        let size = rb.data_size();

        // Leave 24 bytes before the end so the next 64 byte record wraps.
        let first = make_record(size - 24, 0xaa);
        rb.write_record_for_testing(&first);
        let got = rb.read_record_nonconsuming().unwrap().to_vec();
        assert_eq!(got, first);
        rb.consume(got.len());

        let records: Vec<Vec<u8>> = (0..5u8).map(|i| make_record(64, i + 1)).collect();
        for record in &records {
            rb.write_record_for_testing(record);
        }
        for record in &records {
            let got = rb.read_record_nonconsuming().unwrap();
            assert_eq!(got, &record[..]);
            let len = got.len();
            rb.consume(len);
        }
        assert!(rb.read_record_nonconsuming().is_none());
    }

    #[test]
    fn test_nonconsuming_read_is_repeatable() {
        let mut rb = PerfRingBuffer::allocate_anonymous(1).unwrap();
        let record = make_record(32, 0x55);
        rb.write_record_for_testing(&record);
        assert_eq!(rb.read_record_nonconsuming().unwrap(), &record[..]);
        assert_eq!(rb.read_record_nonconsuming().unwrap(), &record[..]);
        rb.consume(32);
        assert!(rb.read_record_nonconsuming().is_none());
    }
}
