//! Unwinding from the call frame information (`.eh_frame`) of the mapped binaries, for code built
//! without frame pointers.
//!
//! Every executable file mapping of a process becomes one module of a framehop unwinder. Code
//! without unwind tables falls back to the frame pointer chain inside framehop.

use std::cell::Cell;
use std::fs::File;

use anyhow::{Context, Result};
use framehop::{FrameAddress, Module, ModuleSvmaInfo, ModuleUnwindData, Unwinder};
use memmap2::Mmap;
use object::{Object, ObjectSection, ObjectSegment};
use tracing::debug;

use crate::maps::MapEntry;
use crate::regs::UserRegs;
use crate::sample::UnwindErrorCode;
use crate::unwinder::MAX_FRAMES;

#[cfg(target_arch = "x86_64")]
mod arch {
    use framehop::x86_64::{CacheX86_64, UnwindRegsX86_64, UnwinderX86_64};

    use crate::regs::UserRegs;

    pub type NativeUnwinder = UnwinderX86_64<Vec<u8>>;
    pub type NativeCache = CacheX86_64;

    pub fn initial_regs(regs: &UserRegs) -> Option<(u64, UnwindRegsX86_64)> {
        let pc = regs.pc()?;
        Some((pc, UnwindRegsX86_64::new(pc, regs.sp()?, regs.fp()?)))
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use framehop::aarch64::{CacheAarch64, UnwindRegsAarch64, UnwinderAarch64};

    use crate::regs::UserRegs;

    pub type NativeUnwinder = UnwinderAarch64<Vec<u8>>;
    pub type NativeCache = CacheAarch64;

    pub fn initial_regs(regs: &UserRegs) -> Option<(u64, UnwindRegsAarch64)> {
        let pc = regs.pc()?;
        Some((pc, UnwindRegsAarch64::new(regs.lr()?, regs.sp()?, regs.fp()?)))
    }
}

/// Unwind tables of one process. Built from a maps snapshot, so it goes stale together with it.
pub struct CfiUnwinder {
    unwinder: arch::NativeUnwinder,
    cache: arch::NativeCache,
    modules: usize,
}

impl CfiUnwinder {
    /// Registers every executable file mapping of `pid`. Binaries are opened through the
    /// process's root so that mappings of containerized processes resolve.
    pub fn new(pid: i32, maps: &[MapEntry]) -> Self {
        let mut unwinder = arch::NativeUnwinder::default();
        let mut modules = 0;
        for map in maps.iter().filter(|m| m.executable && m.path.starts_with('/')) {
            let path = format!("/proc/{pid}/root{}", map.path);
            match load_module(&path, map) {
                Ok(module) => {
                    unwinder.add_module(module);
                    modules += 1;
                }
                Err(e) => debug!("No unwind tables for {}: {e:#}", map.path),
            }
        }
        CfiUnwinder {
            unwinder,
            cache: arch::NativeCache::new(),
            modules,
        }
    }

    pub fn module_count(&self) -> usize {
        self.modules
    }

    /// Returns program counters innermost first. `read_stack` resolves 8 byte reads of the
    /// sampled thread's memory.
    pub fn unwind<F>(&mut self, regs: &UserRegs, mut read_stack: F) -> (Vec<u64>, UnwindErrorCode)
    where
        F: FnMut(u64) -> Option<u64>,
    {
        let Some((pc, regs)) = arch::initial_regs(regs) else {
            return (Vec::new(), UnwindErrorCode::BadArch);
        };

        let read_failed = Cell::new(false);
        let mut read = |addr: u64| {
            let value = read_stack(addr);
            read_failed.set(value.is_none());
            value.ok_or(())
        };

        let mut pcs = Vec::new();
        let mut frames = self
            .unwinder
            .iter_frames(pc, regs, &mut self.cache, &mut read);
        loop {
            if pcs.len() >= MAX_FRAMES {
                return (pcs, UnwindErrorCode::MaxFramesExceeded);
            }
            match frames.next() {
                Ok(Some(FrameAddress::InstructionPointer(addr))) => pcs.push(addr),
                Ok(Some(FrameAddress::ReturnAddress(addr))) => pcs.push(u64::from(addr)),
                Ok(None) => return (pcs, UnwindErrorCode::None),
                Err(e) => {
                    debug!("Unwinding stopped after {} frames: {e}", pcs.len());
                    let error = if read_failed.get() {
                        UnwindErrorCode::MemoryInvalid
                    } else {
                        UnwindErrorCode::UnwindInfo
                    };
                    return (pcs, error);
                }
            }
        }
    }
}

/// Difference between where `map` sits in memory and the addresses the binary was linked at.
fn vma_bias(elf: &object::File, map: &MapEntry) -> Option<u64> {
    // Segments are page aligned when mapped, the closest one starting at or before the mapped
    // offset is the one in this mapping.
    elf.segments()
        .filter_map(|segment| {
            let (offset, size) = segment.file_range();
            let page_offset = offset & !0xfff;
            if map.offset < page_offset || map.offset >= offset.checked_add(size)? {
                return None;
            }
            let svma = segment.address().wrapping_add(map.offset).wrapping_sub(offset);
            Some(map.start.wrapping_sub(svma))
        })
        .last()
}

fn load_module(path: &str, map: &MapEntry) -> Result<Module<Vec<u8>>> {
    let file = File::open(path).with_context(|| format!("Failed to open {path}"))?;
    // Safety: the mapping is only read while parsing, and every section we keep is copied.
    let mmap = unsafe { Mmap::map(&file) }.with_context(|| format!("Failed to map {path}"))?;
    let elf = object::File::parse(&mmap[..]).with_context(|| format!("Failed to parse {path}"))?;

    let base_svma = elf.relative_address_base();
    let bias = vma_bias(&elf, map).context("No segment covers the mapped offset")?;
    let base_avma = base_svma.wrapping_add(bias);

    let svma_range = |name: &str| {
        elf.section_by_name(name)
            .map(|section| section.address()..section.address() + section.size())
    };
    let section_data = |name: &str| {
        elf.section_by_name(name)
            .and_then(|section| section.data().ok().map(<[u8]>::to_vec))
    };

    let svma_info = ModuleSvmaInfo {
        base_svma,
        text: svma_range(".text"),
        text_env: None,
        stubs: None,
        stub_helper: None,
        eh_frame: svma_range(".eh_frame"),
        eh_frame_hdr: svma_range(".eh_frame_hdr"),
        got: svma_range(".got"),
    };
    let unwind_data = match (section_data(".eh_frame_hdr"), section_data(".eh_frame")) {
        (Some(hdr), Some(eh_frame)) => ModuleUnwindData::EhFrameHdrAndEhFrame(hdr, eh_frame),
        (None, Some(eh_frame)) => ModuleUnwindData::EhFrame(eh_frame),
        _ => ModuleUnwindData::None,
    };

    Ok(Module::new(
        map.path.clone(),
        map.start..map.end,
        base_avma,
        svma_info,
        unwind_data,
        None,
    ))
}
