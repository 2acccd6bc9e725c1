// Guest CPU state container: the contract between translated blocks and the
// helper functions they call out to. Mutated exclusively by the dispatch
// loop, by code emitted into the arena, and by helpers invoked from that
// code -- never concurrently.

use crate::error::ExceptionCause;
use bitflags::bitflags;

/// Index of each named COP0 register within `Cpu::cop0_regs`. Only the
/// subset the guest actually uses is named; the rest stay addressable by
/// raw index for MFC0/MTC0.
pub mod cop0reg {
    pub const BADVADDR: usize = 8;
    pub const SR: usize = 12;
    pub const CAUSE: usize = 13;
    pub const EPC: usize = 14;
    pub const PRID: usize = 15;
}

bitflags! {
    /// COP0 Status Register. Only the bits the core gates on are named;
    /// unknown bits round-trip through MTC0/MFC0 untouched.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct StatusRegister: u32 {
        const IEC = 1 << 0;       // interrupt enable, current
        const KUC = 1 << 1;       // kernel/user, current
        const IEP = 1 << 2;       // interrupt enable, previous
        const KUP = 1 << 3;       // kernel/user, previous
        const IEO = 1 << 4;       // interrupt enable, old
        const KUO = 1 << 5;       // kernel/user, old
        const IM  = 0xFF << 8;    // interrupt mask
        const ISC = 1 << 16;      // isolate cache
        const CU0 = 1 << 28;      // coprocessor 0 usable
        const CU2 = 1 << 30;      // coprocessor 2 (GTE) usable
        const BEV = 1 << 22;      // bootstrap exception vectors
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct CauseRegister: u32 {
        const EXCCODE = 0x1F << 2;
        const IP      = 0xFF << 8;
        const BD       = 1 << 31;
    }
}

impl StatusRegister {
    pub fn interrupts_enabled(&self) -> bool {
        self.contains(Self::IEC)
    }
    pub fn interrupt_mask(&self) -> u32 {
        (self.bits() >> 8) & 0xFF
    }
    pub fn coprocessor_usable(&self, cop: u32) -> bool {
        match cop {
            0 => true, // CU0 is meaningless in user mode on real hardware but the core always permits it
            2 => self.contains(Self::CU2),
            _ => false,
        }
    }
}

/// Three-way idle classification for a compiled block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleClass {
    NotIdle,
    HardIdle,
    SoftIdle,
}

/// The guest CPU record: GPRs, HI/LO, COP0, the GTE's 64 words, and the
/// fields helpers and the dispatch loop use to hand off control.
pub struct Cpu {
    pub gpr: [u32; 32],
    pub hi: u32,
    pub lo: u32,
    pub pc: u32,
    /// Address of the instruction that last updated `pc`; used as EPC on
    /// exceptions raised by the *next* instruction.
    pub current_pc: u32,
    pub cop0_regs: [u32; 32],
    pub gte: crate::gte::GteRegs,

    /// Cycles left to run in the block currently executing. Decremented by
    /// emitted code; read back by the dispatch loop once the block returns.
    pub cycles_remaining: i32,

    /// Set by a helper that needs to unwind (overflow, alignment fault,
    /// coprocessor-unusable, syscall, break, bus error). Cleared by the
    /// dispatch loop after it has restored `abort_pc`.
    pub abort: bool,
    /// The guest PC a helper wants execution to resume at (or the exception
    /// vector, if the helper already redirected `pc`).
    pub abort_pc: u32,
}

impl Cpu {
    pub fn new() -> Self {
        let mut cop0_regs = [0u32; 32];
        cop0_regs[cop0reg::SR] = StatusRegister::BEV.bits();
        cop0_regs[cop0reg::PRID] = 0x0000_0002;
        Self {
            gpr: [0; 32],
            hi: 0,
            lo: 0,
            pc: 0xBFC0_0000,
            current_pc: 0xBFC0_0000,
            cop0_regs,
            gte: crate::gte::GteRegs::new(),
            cycles_remaining: 0,
            abort: false,
            abort_pc: 0,
        }
    }

    #[inline(always)]
    pub fn reg(&self, index: u8) -> u32 {
        if index == 0 { 0 } else { self.gpr[index as usize] }
    }

    #[inline(always)]
    pub fn set_reg(&mut self, index: u8, value: u32) {
        if index != 0 {
            self.gpr[index as usize] = value;
        }
    }

    pub fn sr(&self) -> StatusRegister {
        StatusRegister::from_bits_truncate(self.cop0_regs[cop0reg::SR])
    }

    pub fn set_sr(&mut self, value: u32) {
        self.cop0_regs[cop0reg::SR] = value;
    }

    pub fn cause(&self) -> CauseRegister {
        CauseRegister::from_bits_truncate(self.cop0_regs[cop0reg::CAUSE])
    }

    /// Set or clear CAUSE.IP bit 10 (the interrupt controller's line),
    /// independent of whatever software-driven IP bits (0/1) are set.
    pub fn set_hardware_interrupt_pending(&mut self, pending: bool) {
        if pending {
            self.cop0_regs[cop0reg::CAUSE] |= 1 << 10;
        } else {
            self.cop0_regs[cop0reg::CAUSE] &= !(1 << 10);
        }
    }

    /// Raise a guest exception: write CAUSE/EPC/BADVADDR, select the vector
    /// based on BEV, and set the abort flag. `in_branch_delay` and
    /// `bad_vaddr` are only meaningful for a subset of causes; callers pass
    /// 0/false when not applicable. Control returns through the abort
    /// trampoline, never via a host exception.
    pub fn exception(&mut self, cause: ExceptionCause, epc: u32, in_branch_delay: bool, bad_vaddr: Option<u32>) {
        let sr = self.sr();
        let mode = sr.bits() & 0x3F;
        let mut new_sr = (sr.bits() & !0x3F) | ((mode << 2) & 0x3F);
        new_sr &= !0b11; // disable interrupts, enter kernel mode
        self.set_sr(new_sr);

        let mut cause_bits = self.cop0_regs[cop0reg::CAUSE] & !0x7C;
        cause_bits |= (cause as u32) << 2;
        if in_branch_delay {
            cause_bits |= 1 << 31;
        } else {
            cause_bits &= !(1u32 << 31);
        }
        self.cop0_regs[cop0reg::CAUSE] = cause_bits;
        self.cop0_regs[cop0reg::EPC] = if in_branch_delay { epc.wrapping_sub(4) } else { epc };
        if let Some(addr) = bad_vaddr {
            self.cop0_regs[cop0reg::BADVADDR] = addr;
        }

        let vector = if StatusRegister::from_bits_truncate(new_sr).contains(StatusRegister::BEV) {
            0xBFC0_0180
        } else {
            0x8000_0080
        };
        log::debug!("guest exception {cause} at epc={epc:#010x} -> vector {vector:#010x}");
        self.abort = true;
        self.abort_pc = vector;
        self.pc = vector;
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_zero_is_hardwired() {
        let mut cpu = Cpu::new();
        cpu.set_reg(0, 0xDEAD_BEEF);
        assert_eq!(cpu.reg(0), 0);
    }

    #[test]
    fn exception_selects_bootstrap_vector_when_bev_set() {
        let mut cpu = Cpu::new();
        assert!(cpu.sr().contains(StatusRegister::BEV));
        cpu.exception(ExceptionCause::Syscall, 0x8001_0000, false, None);
        assert_eq!(cpu.pc, 0xBFC0_0180);
        assert!(cpu.abort);
        assert_eq!(cpu.cop0_regs[cop0reg::EPC], 0x8001_0000);
    }

    #[test]
    fn exception_selects_normal_vector_once_bev_clear() {
        let mut cpu = Cpu::new();
        cpu.set_sr(0);
        cpu.exception(ExceptionCause::Overflow, 0x8001_0004, true, None);
        assert_eq!(cpu.pc, 0x8000_0080);
        assert_eq!(cpu.cop0_regs[cop0reg::EPC], 0x8001_0000);
        assert_eq!(cpu.cause().bits() & (1 << 31), 1 << 31);
    }
}
