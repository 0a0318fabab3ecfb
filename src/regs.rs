//! Userspace register snapshots captured with `PERF_SAMPLE_REGS_USER`.
//!
//! The kernel writes the registers selected by `sample_regs_user` packed in ascending bit order,
//! so the position of a register in the blob is the number of mask bits below it.

#[cfg(target_arch = "x86_64")]
mod arch {
    pub const PERF_REG_X86_BP: u32 = 6;
    pub const PERF_REG_X86_SP: u32 = 7;
    pub const PERF_REG_X86_IP: u32 = 8;

    /// AX..SS and R8..R15. The segment registers DS, ES, FS and GS (12..15) are rejected by
    /// the kernel for 64 bit tasks.
    pub const USER_REGS_MASK: u64 = 0x0000_0000_00ff_0fff;

    pub const FP: u32 = PERF_REG_X86_BP;
    pub const SP: u32 = PERF_REG_X86_SP;
    pub const PC: u32 = PERF_REG_X86_IP;
}

#[cfg(target_arch = "aarch64")]
mod arch {
    pub const PERF_REG_ARM64_X29: u32 = 29;
    pub const PERF_REG_ARM64_LR: u32 = 30;
    pub const PERF_REG_ARM64_SP: u32 = 31;
    pub const PERF_REG_ARM64_PC: u32 = 32;

    /// X0..X30, SP and PC.
    pub const USER_REGS_MASK: u64 = (1 << 33) - 1;

    pub const FP: u32 = PERF_REG_ARM64_X29;
    pub const SP: u32 = PERF_REG_ARM64_SP;
    pub const PC: u32 = PERF_REG_ARM64_PC;
    pub const LR: u32 = PERF_REG_ARM64_LR;
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
mod arch {
    pub const USER_REGS_MASK: u64 = 0;
    pub const FP: u32 = 0;
    pub const SP: u32 = 0;
    pub const PC: u32 = 0;
}

/// Mask for `perf_event_attr.sample_regs_user` on this architecture, 0 if userspace unwinding
/// isn't supported here.
pub const USER_REGS_MASK: u64 = arch::USER_REGS_MASK;

pub fn user_frames_supported() -> bool {
    USER_REGS_MASK != 0
}

/// Number of u64 register values the kernel writes for `mask`.
pub fn regs_count(mask: u64) -> usize {
    mask.count_ones() as usize
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRegs {
    pub abi: u64,
    pub mask: u64,
    pub values: Vec<u64>,
}

impl UserRegs {
    fn get(&self, reg: u32) -> Option<u64> {
        if self.mask & (1u64 << reg) == 0 {
            return None;
        }
        let idx = (self.mask & ((1u64 << reg) - 1)).count_ones() as usize;
        self.values.get(idx).copied()
    }

    pub fn pc(&self) -> Option<u64> {
        self.get(arch::PC)
    }

    pub fn sp(&self) -> Option<u64> {
        self.get(arch::SP)
    }

    pub fn fp(&self) -> Option<u64> {
        self.get(arch::FP)
    }

    #[cfg(target_arch = "aarch64")]
    pub fn lr(&self) -> Option<u64> {
        self.get(arch::LR)
    }

    #[cfg(test)]
    pub(crate) fn for_testing(pc: u64, sp: u64, fp: u64) -> Self {
        let mut regs = UserRegs {
            abi: 2,
            mask: USER_REGS_MASK,
            values: vec![0; regs_count(USER_REGS_MASK)],
        };
        for (reg, value) in [(arch::PC, pc), (arch::SP, sp), (arch::FP, fp)] {
            let idx = (USER_REGS_MASK & ((1u64 << reg) - 1)).count_ones() as usize;
            if let Some(slot) = regs.values.get_mut(idx) {
                *slot = value;
            }
        }
        regs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_register_lookup() {
        let values: Vec<u64> = (0..regs_count(USER_REGS_MASK) as u64).map(|v| v * 10).collect();
        let regs = UserRegs {
            abi: 2,
            mask: USER_REGS_MASK,
            values,
        };
        if user_frames_supported() {
            assert!(regs.pc().is_some());
            assert!(regs.sp().is_some());
            assert!(regs.fp().is_some());
        }
        #[cfg(target_arch = "x86_64")]
        {
            assert_eq!(regs_count(USER_REGS_MASK), 20);
            assert_eq!(regs.fp(), Some(60));
            assert_eq!(regs.sp(), Some(70));
            assert_eq!(regs.pc(), Some(80));
        }
        #[cfg(target_arch = "aarch64")]
        {
            assert_eq!(regs_count(USER_REGS_MASK), 33);
            assert_eq!(regs.fp(), Some(290));
            assert_eq!(regs.sp(), Some(310));
            assert_eq!(regs.pc(), Some(320));
        }
    }

    #[test]
    fn test_missing_register() {
        let regs = UserRegs {
            abi: 2,
            mask: 0b1,
            values: vec![1],
        };
        assert_eq!(regs.pc(), None);
    }
}
