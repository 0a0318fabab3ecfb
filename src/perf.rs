//! Thin layer over the `perf_event_open(2)` ABI.
//!
//! Everything in here is a bit-exact mirror of the kernel's uapi headers. Policy (which events to
//! open, how to sample) lives in [`crate::event_config`]; this module only knows how to turn a
//! fully populated [`perf_event_attr`] into a file descriptor and how to poke that descriptor.

use std::ffi::CString;
use std::io::Error;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use bitfield::bitfield;
use nix::errno::Errno;
use nix::{ioctl_none, ioctl_write_ptr_bad, request_code_write};

#[repr(C)]
#[derive(Clone, Copy)]
pub union sample_un {
    pub sample_period: u64,
    pub sample_freq: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union wakeup_un {
    pub wakeup_events: u32,
    pub wakeup_watermark: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union bp_1_un {
    pub bp_addr: u64,
    pub kprobe_func: u64,
    pub uprobe_path: u64,
    pub config1: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union bp_2_un {
    pub bp_len: u64,
    pub kprobe_addr: u64,
    pub probe_offset: u64,
    pub config2: u64,
}

bitfield! {
    #[allow(non_camel_case_types)]
    #[derive(Clone, Copy)]
    pub struct perf_event_attr_flags(u64);
    impl Debug;
    pub disabled, set_disabled: 0, 0;
    pub inherit, set_inherit: 1, 1;
    pub pinned, set_pinned: 2, 2;
    pub exclusive, set_exclusive: 3, 3;
    pub exclude_user, set_exclude_user: 4, 4;
    pub exclude_kernel, set_exclude_kernel: 5, 5;
    pub exclude_hv, set_exclude_hv: 6, 6;
    pub exclude_idle, set_exclude_idle: 7, 7;
    pub mmap, set_mmap: 8, 8;
    pub comm, set_comm: 9, 9;
    pub freq, set_freq: 10, 10;
    pub inherit_stat, set_inherit_stat: 11, 11;
    pub enable_on_exec, set_enable_on_exec: 12, 12;
    pub task, set_task: 13, 13;
    pub watermark, set_watermark: 14, 14;
    pub precise_ip, set_precise_ip: 16, 15;
    pub mmap_data, set_mmap_data: 17, 17;
    pub sample_id_all, set_sample_id_all: 18, 18;
    pub exclude_host, set_exclude_host: 19, 19;
    pub exclude_guest, set_exclude_guest: 20, 20;
    pub exclude_callchain_kernel, set_exclude_callchain_kernel: 21, 21;
    pub exclude_callchain_user, set_exclude_callchain_user: 22, 22;
    pub mmap2, set_mmap2: 23, 23;
    pub comm_exec, set_comm_exec: 24, 24;
    pub use_clockid, set_use_clockid: 25, 25;
    pub context_switch, set_context_switch: 26, 26;
    pub write_backward, set_write_backward: 27, 27;
    pub namespaces, set_namespaces: 28, 28;
    pub ksymbol, set_ksymbol: 29, 29;
    pub bpf_event, set_bpf_event: 30, 30;
    pub aux_output, set_aux_output: 31, 31;
    pub cgroup, set_cgroup: 32, 32;
    pub text_poke, set_text_poke: 33, 33;
    pub build_id, set_build_id: 34, 34;
    pub inherit_thread, set_inherit_thread: 35, 35;
    pub remove_on_exec, set_remove_on_exec: 36, 36;
    pub sigtrap, set_sigtrap: 37, 37;
    pub __reserved_1, _: 63, 38;
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(non_camel_case_types)]
pub struct perf_event_attr {
    pub _type: u32,
    pub size: u32,
    pub config: u64,
    pub sample: sample_un,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: perf_event_attr_flags,
    pub wakeup: wakeup_un,
    pub bp_type: u32,
    pub bp_1: bp_1_un,
    pub bp_2: bp_2_un,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub __reserved_3: u32,
    pub sig_data: u64,
    pub config3: u64,
}

impl perf_event_attr {
    /// A zeroed attr with `size` filled in, which is what the kernel expects as a starting point.
    pub fn zeroed() -> Self {
        // SAFETY: every field is an integer or a union of integers, all-zeroes is a valid value.
        let mut attr: perf_event_attr = unsafe { mem::zeroed() };
        attr.size = mem::size_of::<perf_event_attr>() as u32;
        attr
    }

    pub fn config1(&self) -> u64 {
        // SAFETY: every variant of the union is a u64.
        unsafe { self.bp_1.config1 }
    }

    pub fn config2(&self) -> u64 {
        // SAFETY: every variant of the union is a u64.
        unsafe { self.bp_2.config2 }
    }

    pub fn sample_period_or_freq(&self) -> u64 {
        // SAFETY: both variants of the union are u64.
        unsafe { self.sample.sample_period }
    }
}

impl std::fmt::Debug for perf_event_attr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("perf_event_attr")
            .field("type", &self._type)
            .field("config", &self.config)
            .field("config1", &self.config1())
            .field("config2", &self.config2())
            .field("sample", &self.sample_period_or_freq())
            .field("sample_type", &format_args!("{:#x}", self.sample_type))
            .field("read_format", &format_args!("{:#x}", self.read_format))
            .field("flags", &self.flags)
            .field("sample_regs_user", &format_args!("{:#x}", self.sample_regs_user))
            .field("sample_stack_user", &self.sample_stack_user)
            .field("clockid", &self.clockid)
            .finish()
    }
}

/// `struct perf_event_header`, the framing of every record in the ring buffer.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
#[allow(non_camel_case_types)]
pub struct perf_event_header {
    pub _type: u32,
    pub misc: u16,
    pub size: u16,
}

// SAFETY: plain old data, any bit pattern is valid.
unsafe impl plain::Plain for perf_event_header {}

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_TRACEPOINT: u32 = 2;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
pub const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
pub const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
pub const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
pub const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;
pub const PERF_COUNT_HW_BUS_CYCLES: u64 = 6;
pub const PERF_COUNT_HW_STALLED_CYCLES_FRONTEND: u64 = 7;
pub const PERF_COUNT_HW_STALLED_CYCLES_BACKEND: u64 = 8;
pub const PERF_COUNT_HW_REF_CPU_CYCLES: u64 = 9;

pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
pub const PERF_COUNT_SW_TASK_CLOCK: u64 = 1;
pub const PERF_COUNT_SW_PAGE_FAULTS: u64 = 2;
pub const PERF_COUNT_SW_CONTEXT_SWITCHES: u64 = 3;
pub const PERF_COUNT_SW_CPU_MIGRATIONS: u64 = 4;
pub const PERF_COUNT_SW_PAGE_FAULTS_MIN: u64 = 5;
pub const PERF_COUNT_SW_PAGE_FAULTS_MAJ: u64 = 6;
pub const PERF_COUNT_SW_ALIGNMENT_FAULTS: u64 = 7;
pub const PERF_COUNT_SW_EMULATION_FAULTS: u64 = 8;
pub const PERF_COUNT_SW_DUMMY: u64 = 9;

pub const PERF_SAMPLE_IP: u64 = 1 << 0;
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_READ: u64 = 1 << 4;
pub const PERF_SAMPLE_CALLCHAIN: u64 = 1 << 5;
pub const PERF_SAMPLE_REGS_USER: u64 = 1 << 12;
pub const PERF_SAMPLE_STACK_USER: u64 = 1 << 13;

pub const PERF_FORMAT_GROUP: u64 = 1 << 3;

pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_THROTTLE: u32 = 5;
pub const PERF_RECORD_UNTHROTTLE: u32 = 6;
pub const PERF_RECORD_SAMPLE: u32 = 9;

pub const PERF_RECORD_MISC_CPUMODE_MASK: u16 = 7;
pub const PERF_RECORD_MISC_KERNEL: u16 = 1;
pub const PERF_RECORD_MISC_USER: u16 = 2;
pub const PERF_RECORD_MISC_HYPERVISOR: u16 = 3;
pub const PERF_RECORD_MISC_GUEST_KERNEL: u16 = 4;
pub const PERF_RECORD_MISC_GUEST_USER: u16 = 5;

/// Callchain entries at or above this value are context markers, not instruction pointers.
pub const PERF_CONTEXT_MAX: u64 = (-4095i64) as u64;

pub const PERF_SAMPLE_REGS_ABI_NONE: u64 = 0;

pub const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

extern "C" {
    fn syscall(number: libc::c_long, ...) -> libc::c_long;
}

pub fn perf_event_open(
    hw_event: &perf_event_attr,
    pid: libc::pid_t,
    cpu: libc::c_int,
    group_fd: libc::c_int,
    flags: libc::c_ulong,
) -> Result<PerfEventFile, Error> {
    let fd = unsafe {
        syscall(
            libc::SYS_perf_event_open,
            hw_event as *const perf_event_attr,
            pid,
            cpu,
            group_fd,
            flags,
        )
    } as i32;

    if fd < 0 {
        return Err(Error::last_os_error());
    }

    // SAFETY: the kernel just handed us this descriptor and nobody else owns it.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    Ok(PerfEventFile {
        fd,
        need_disable: false,
    })
}

const PERF_EVENT_MAGIC: u8 = b'$';
const PERF_EVENT_IOC_ENABLE: u8 = 0;
const PERF_EVENT_IOC_DISABLE: u8 = 1;
const PERF_EVENT_IOC_SET_FILTER: u8 = 6;
ioctl_none!(
    perf_event_ioc_enable,
    PERF_EVENT_MAGIC,
    PERF_EVENT_IOC_ENABLE
);
ioctl_none!(
    perf_event_ioc_disable,
    PERF_EVENT_MAGIC,
    PERF_EVENT_IOC_DISABLE
);
// The request is sized for a `char *`, but the string itself is the argument.
ioctl_write_ptr_bad!(
    perf_event_ioc_set_filter,
    request_code_write!(
        PERF_EVENT_MAGIC,
        PERF_EVENT_IOC_SET_FILTER,
        mem::size_of::<*const libc::c_char>()
    ),
    libc::c_char
);

/// An open perf event. The descriptor is closed on drop, and the event is disabled first if we
/// were the ones to enable it.
#[derive(Debug)]
pub struct PerfEventFile {
    fd: OwnedFd,
    need_disable: bool,
}

impl PerfEventFile {
    pub fn enable(&mut self) -> Result<(), Error> {
        unsafe { perf_event_ioc_enable(self.fd.as_raw_fd()) }?;
        self.need_disable = true;
        Ok(())
    }

    pub fn disable(&mut self) -> Result<(), Error> {
        match unsafe { perf_event_ioc_disable(self.fd.as_raw_fd()) } {
            Ok(_) => {
                self.need_disable = false;
                Ok(())
            }
            Err(Errno::ENOTTY) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Attach a tracepoint filter expression, `PERF_EVENT_IOC_SET_FILTER`.
    pub fn set_filter(&self, filter: &str) -> Result<(), Error> {
        let filter = CString::new(filter)?;
        // SAFETY: the string outlives the call and the kernel only reads it.
        unsafe { perf_event_ioc_set_filter(self.fd.as_raw_fd(), filter.as_ptr()) }?;
        Ok(())
    }
}

impl From<OwnedFd> for PerfEventFile {
    fn from(fd: OwnedFd) -> Self {
        PerfEventFile {
            fd,
            need_disable: false,
        }
    }
}

impl AsRawFd for PerfEventFile {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for PerfEventFile {
    fn drop(&mut self) {
        if !self.need_disable {
            return;
        }
        if let Err(e) = self.disable() {
            tracing::debug!("failed to disable perf event on drop: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_abi_size() {
        // PERF_ATTR_SIZE_VER8
        assert_eq!(mem::size_of::<perf_event_attr>(), 136);
        assert_eq!(perf_event_attr::zeroed().size, 136);
    }

    #[test]
    fn test_attr_flags_layout() {
        let mut attr = perf_event_attr::zeroed();
        attr.flags.set_disabled(1);
        attr.flags.set_freq(1);
        attr.flags.set_use_clockid(1);
        attr.flags.set_exclude_callchain_user(1);
        assert_eq!(attr.flags.0, (1 << 0) | (1 << 10) | (1 << 25) | (1 << 22));
    }

    #[test]
    fn test_header_from_bytes() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&PERF_RECORD_SAMPLE.to_ne_bytes());
        bytes.extend_from_slice(&PERF_RECORD_MISC_USER.to_ne_bytes());
        bytes.extend_from_slice(&48u16.to_ne_bytes());
        let mut header = perf_event_header::default();
        plain::copy_from_bytes(&mut header, &bytes).unwrap();
        assert_eq!(header._type, PERF_RECORD_SAMPLE);
        assert_eq!(header.misc & PERF_RECORD_MISC_CPUMODE_MASK, PERF_RECORD_MISC_USER);
        assert_eq!(header.size, 48);
    }

    #[test]
    fn test_set_filter_reaches_the_descriptor() {
        let null = std::fs::File::open("/dev/null").unwrap();
        let file = PerfEventFile::from(OwnedFd::from(null));
        let err = file.set_filter("common_pid != 0").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTTY));
        assert!(file.set_filter("bad\0filter").is_err());
    }

    #[test]
    fn test_context_max() {
        assert_eq!(PERF_CONTEXT_MAX, u64::MAX - 4094);
    }
}
