// Boot/main dispatch loop and the C-language helper functions translated
// blocks call out to. Both phases run the same inner routine; `Machine`
// just swaps which hook fires once a PSX-EXE or ISO has been handed to the
// loader (an external collaborator this core only exposes a hook for).

use crate::cpu::{Cpu, IdleClass};
use crate::devices::IrqLine;
use crate::dynarec::translator::{decode, HelperTable};
use crate::dynarec::Dynarec;
use crate::error::{CoreResult, ExceptionCause};
use crate::memory::{Bus, Size};
use crate::scheduler::{EventKind, Region, Scheduler};
use crate::spu::AudioSink;

const MIN_CYCLES_PER_BLOCK: i32 = 8;
const SOFT_IDLE_THRESHOLD: u32 = 3;
const DISPATCH_BATCH_CAP: u64 = 1024;

pub struct Machine {
    pub cpu: Cpu,
    pub bus: Bus,
    pub dynarec: Dynarec,
    pub scheduler: Scheduler,
    pub global_cycles: u64,
    soft_idle_counters: std::collections::HashMap<u32, u32>,
    last_poll_pc: Option<u32>,
    boot_complete: bool,
    io_event_hint: bool,
}

impl Machine {
    pub fn new(region: Region) -> CoreResult<Self> {
        let helpers = HelperTable {
            load: helper_load,
            store: helper_store,
            multiply: helper_multiply,
            divide: helper_divide,
            syscall: helper_syscall,
            breakpoint: helper_breakpoint,
            overflow_add: helper_overflow_add,
            overflow_sub: helper_overflow_sub,
            mfc0: helper_mfc0,
            mtc0: helper_mtc0,
            cop2_execute: helper_cop2_execute,
            cop_unusable: helper_cop_unusable,
            address_error: helper_address_error,
        };
        Ok(Self {
            cpu: Cpu::new(),
            bus: Bus::new(),
            dynarec: Dynarec::new(helpers)?,
            scheduler: Scheduler::new(region),
            global_cycles: 0,
            soft_idle_counters: std::collections::HashMap::new(),
            last_poll_pc: None,
            boot_complete: false,
            io_event_hint: false,
        })
    }

    pub fn load_bios(&mut self, image: &[u8]) -> CoreResult<()> {
        self.bus.load_bios(image)
    }

    pub fn is_executable_boot(&self) -> bool {
        self.boot_complete
    }

    /// Called by the external loader once a PSX-EXE's text section has been
    /// copied into RAM, to redirect execution past BIOS shell boot.
    pub fn hand_off_to_executable(&mut self, entry_pc: u32, initial_gp: u32, initial_sp: u32) {
        self.cpu.pc = entry_pc;
        self.cpu.current_pc = entry_pc;
        self.cpu.set_reg(28, initial_gp);
        self.cpu.set_reg(29, initial_sp);
        self.cpu.set_reg(30, initial_sp);
        self.boot_complete = true;
    }

    /// Runs one scheduler batch: fetch/compile/execute blocks until the
    /// earliest pending deadline, then dispatch due events and deliver
    /// interrupts. Returns the number of guest cycles integrated.
    pub fn run_batch(&mut self, sink: &mut dyn AudioSink) -> CoreResult<u64> {
        let start_cycles = self.global_cycles;
        let deadline = if self.scheduler.is_empty() { self.global_cycles + DISPATCH_BATCH_CAP } else { self.scheduler.earliest_deadline().min(self.global_cycles + DISPATCH_BATCH_CAP) };

        self.io_event_hint = false;
        while self.global_cycles < deadline && !self.io_event_hint {
            if self.cpu.pc % 4 != 0 {
                self.cpu.exception(ExceptionCause::AddressErrorLoad, self.cpu.current_pc, false, Some(self.cpu.pc));
                continue;
            }

            if let Some(skip_to) = self.check_idle_skip(self.cpu.pc, deadline) {
                self.global_cycles = skip_to;
                break;
            }

            let entry = self.dynarec.lookup_or_compile(&self.cpu, &mut self.bus, self.cpu.pc)?;
            let pc_before = self.cpu.pc;
            self.cpu.current_pc = pc_before;

            let cycles_used = self.execute_block(entry);
            self.global_cycles += cycles_used.max(MIN_CYCLES_PER_BLOCK) as u64;

            if self.cpu.abort {
                self.cpu.pc = self.cpu.abort_pc;
                self.cpu.abort = false;
            }

            if self.cpu.pc == pc_before {
                self.last_poll_pc = Some(pc_before);
            }
        }

        self.dispatch_due_events(sink);
        self.deliver_interrupts();
        Ok(self.global_cycles - start_cycles)
    }

    /// Executes a compiled block's native entry point (possibly chaining
    /// straight into further blocks via patched direct jumps before it
    /// finally returns). The block returns the total guest cycles it and
    /// anything it chained into accounted for, read out of
    /// `Cpu::cycles_remaining` by the shared epilogue just before return.
    fn execute_block(&mut self, entry: *const u8) -> i32 {
        self.cpu.cycles_remaining = 0;
        type BlockFn = unsafe extern "C" fn(*mut Cpu, *mut Bus) -> i32;
        let f: BlockFn = unsafe { std::mem::transmute(entry) };
        unsafe { f(&mut self.cpu as *mut Cpu, &mut self.bus as *mut Bus) }
    }

    /// Hard-idle blocks fast-forward on first re-entry; soft-idle blocks
    /// require `SOFT_IDLE_THRESHOLD` re-entries first. A block whose
    /// post-execution PC equalled its entry PC short-circuits the very next
    /// dispatch to the same PC regardless of its idle classification.
    fn check_idle_skip(&mut self, pc: u32, deadline: u64) -> Option<u64> {
        if self.last_poll_pc.take() == Some(pc) {
            return Some(deadline);
        }
        let Some(block) = self.dynarec.cache.lookup(pc) else { return None };
        match block.idle_class {
            IdleClass::HardIdle => Some(deadline),
            IdleClass::SoftIdle => {
                let counter = self.soft_idle_counters.entry(pc).or_insert(0);
                *counter += 1;
                if *counter >= SOFT_IDLE_THRESHOLD {
                    self.soft_idle_counters.remove(&pc);
                    Some(deadline)
                } else {
                    None
                }
            }
            IdleClass::NotIdle => None,
        }
    }

    fn dispatch_due_events(&mut self, sink: &mut dyn AudioSink) {
        for kind in self.scheduler.due(self.global_cycles) {
            match kind {
                EventKind::HBlank => {
                    let vblank = self.scheduler.advance_hblank(self.global_cycles);
                    if self.bus.io.timers.on_hblank() {
                        self.bus.io.irq.request(IrqLine::Timer1);
                    }
                    if vblank {
                        self.bus.io.irq.request(IrqLine::VBlank);
                        self.bus.io.spu.produce_frame(sink);
                    }
                }
                EventKind::Timer0 => self.bus.io.irq.request(IrqLine::Timer0),
                EventKind::Timer1 => self.bus.io.irq.request(IrqLine::Timer1),
                EventKind::Timer2 => self.bus.io.irq.request(IrqLine::Timer2),
                EventKind::CdRom => self.bus.io.irq.request(IrqLine::CdRom),
                EventKind::Sio => self.bus.io.irq.request(IrqLine::Sio),
                EventKind::VBlank => self.bus.io.irq.request(IrqLine::VBlank),
            }
        }
        self.bus.io.timers.sync_all(self.global_cycles);
    }

    fn deliver_interrupts(&mut self) {
        let pending = self.bus.io.irq.pending();
        self.cpu.set_hardware_interrupt_pending(pending);
        if pending && self.cpu.sr().interrupts_enabled() {
            self.cpu.exception(ExceptionCause::Interrupt, self.cpu.pc, false, None);
        }
    }
}

// ---------------------------------------------------------------------
// Helper functions called from translated code via the full/lite
// trampolines. Each receives `&mut Cpu`, `&mut Bus`, the raw instruction
// word that triggered the call, and the originating guest PC. Decoding the
// word again here (instead of having the emitted prologue stage operands
// into scratch fields) keeps the emitted call sequence uniform across every
// instruction family and needs no result hand-back: a helper reads and
// writes `Cpu::gpr` directly, the same array the emitted code itself
// addresses via the pinned `&mut Cpu` pointer.
// ---------------------------------------------------------------------

extern "C" fn helper_load(cpu: *mut Cpu, bus: *mut Bus, word: u32, pc: u32) {
    let cpu = unsafe { &mut *cpu };
    let bus = unsafe { &mut *bus };
    let f = decode(word);
    let addr = cpu.reg(f.rs).wrapping_add(f.imm as i16 as i32 as u32);
    // LWL/LWR (0x22/0x26) are simplified to a full-word load; see
    // Translator::emit_load.
    let (size, signed): (Size, bool) = match f.op {
        0x20 => (Size::Byte, true),
        0x24 => (Size::Byte, false),
        0x21 => (Size::Half, true),
        0x25 => (Size::Half, false),
        _ => (Size::Word, false),
    };
    let raw = bus.read(addr, size);
    let value = if signed {
        match size {
            Size::Byte => raw as i8 as i32 as u32,
            Size::Half => raw as i16 as i32 as u32,
            Size::Word => raw,
        }
    } else {
        raw
    };
    cpu.set_reg(f.rt, value);
}

extern "C" fn helper_store(cpu: *mut Cpu, bus: *mut Bus, word: u32, _pc: u32) {
    let cpu = unsafe { &mut *cpu };
    let bus = unsafe { &mut *bus };
    let f = decode(word);
    let addr = cpu.reg(f.rs).wrapping_add(f.imm as i16 as i32 as u32);
    // SWL/SWR (0x2A/0x2E) are simplified to a full-word store.
    let size = match f.op {
        0x28 => Size::Byte,
        0x29 => Size::Half,
        _ => Size::Word,
    };
    let value = cpu.reg(f.rt);
    bus.write(addr, size, value);
    bus.notify_ram_written(addr, size.bytes() as u32);
}

extern "C" fn helper_multiply(cpu: *mut Cpu, _bus: *mut Bus, word: u32, _pc: u32) {
    let cpu = unsafe { &mut *cpu };
    let f = decode(word);
    let signed = f.funct == 0x18;
    let product: u64 = if signed {
        let a = cpu.reg(f.rs) as i32 as i64;
        let b = cpu.reg(f.rt) as i32 as i64;
        a.wrapping_mul(b) as u64
    } else {
        let a = cpu.reg(f.rs) as u64;
        let b = cpu.reg(f.rt) as u64;
        a.wrapping_mul(b)
    };
    cpu.lo = product as u32;
    cpu.hi = (product >> 32) as u32;
}

extern "C" fn helper_divide(cpu: *mut Cpu, _bus: *mut Bus, word: u32, _pc: u32) {
    let cpu = unsafe { &mut *cpu };
    let f = decode(word);
    if f.funct == 0x1A {
        let dividend = cpu.reg(f.rs) as i32;
        let divisor = cpu.reg(f.rt) as i32;
        if divisor == 0 {
            cpu.lo = if dividend >= 0 { 0xFFFF_FFFF } else { 1 };
            cpu.hi = dividend as u32;
        } else if dividend == i32::MIN && divisor == -1 {
            cpu.lo = dividend as u32;
            cpu.hi = 0;
        } else {
            cpu.lo = dividend.wrapping_div(divisor) as u32;
            cpu.hi = dividend.wrapping_rem(divisor) as u32;
        }
    } else {
        let dividend = cpu.reg(f.rs);
        let divisor = cpu.reg(f.rt);
        if divisor == 0 {
            cpu.lo = 0xFFFF_FFFF;
            cpu.hi = dividend;
        } else {
            cpu.lo = dividend / divisor;
            cpu.hi = dividend % divisor;
        }
    }
}

extern "C" fn helper_syscall(cpu: *mut Cpu, _bus: *mut Bus, _word: u32, pc: u32) {
    let cpu = unsafe { &mut *cpu };
    cpu.exception(ExceptionCause::Syscall, pc, false, None);
}

extern "C" fn helper_breakpoint(cpu: *mut Cpu, _bus: *mut Bus, _word: u32, pc: u32) {
    let cpu = unsafe { &mut *cpu };
    cpu.exception(ExceptionCause::Break, pc, false, None);
}

extern "C" fn helper_overflow_add(cpu: *mut Cpu, _bus: *mut Bus, word: u32, pc: u32) {
    let cpu = unsafe { &mut *cpu };
    let f = decode(word);
    let a = cpu.reg(f.rs) as i32;
    let (b, dest) = if f.op == 0 { (cpu.reg(f.rt) as i32, f.rd) } else { (f.imm as i16 as i32, f.rt) };
    match a.checked_add(b) {
        Some(sum) => cpu.set_reg(dest, sum as u32),
        None => cpu.exception(ExceptionCause::Overflow, pc, false, None),
    }
}

extern "C" fn helper_overflow_sub(cpu: *mut Cpu, _bus: *mut Bus, word: u32, pc: u32) {
    let cpu = unsafe { &mut *cpu };
    let f = decode(word);
    let a = cpu.reg(f.rs) as i32;
    let b = cpu.reg(f.rt) as i32;
    match a.checked_sub(b) {
        Some(diff) => cpu.set_reg(f.rd, diff as u32),
        None => cpu.exception(ExceptionCause::Overflow, pc, false, None),
    }
}

extern "C" fn helper_mfc0(cpu: *mut Cpu, _bus: *mut Bus, word: u32, _pc: u32) {
    let cpu = unsafe { &mut *cpu };
    let f = decode(word);
    cpu.set_reg(f.rt, cpu.cop0_regs[f.rd as usize & 0x1F]);
}

extern "C" fn helper_mtc0(cpu: *mut Cpu, _bus: *mut Bus, word: u32, _pc: u32) {
    let cpu = unsafe { &mut *cpu };
    let f = decode(word);
    cpu.cop0_regs[f.rd as usize & 0x1F] = cpu.reg(f.rt);
}

/// Dispatches the COP2 (GTE) instruction word: bit 25 ("CO") selects a
/// compute instruction, handled entirely inside `gte::execute`; otherwise
/// `rs` picks one of the four register-transfer forms (MFC2/CFC2/MTC2/CTC2).
/// A reserved `rs` value is silently ignored.
extern "C" fn helper_cop2_execute(cpu: *mut Cpu, _bus: *mut Bus, word: u32, _pc: u32) {
    let cpu = unsafe { &mut *cpu };
    if word & (1 << 25) != 0 {
        let op = crate::gte::Opcode::decode(word);
        cpu.gte.execute(&op);
        return;
    }
    let f = decode(word);
    match f.rs {
        0x00 => cpu.set_reg(f.rt, cpu.gte.read_data(f.rd as usize)),
        0x02 => cpu.set_reg(f.rt, cpu.gte.read_ctrl(f.rd as usize)),
        0x04 => cpu.gte.write_data(f.rd as usize, cpu.reg(f.rt)),
        0x06 => cpu.gte.write_ctrl(f.rd as usize, cpu.reg(f.rt)),
        _ => {}
    }
}

extern "C" fn helper_cop_unusable(cpu: *mut Cpu, _bus: *mut Bus, _word: u32, pc: u32) {
    let cpu = unsafe { &mut *cpu };
    cpu.exception(ExceptionCause::CoprocessorUnusable, pc, false, None);
}

extern "C" fn helper_address_error(cpu: *mut Cpu, _bus: *mut Bus, word: u32, pc: u32) {
    let cpu = unsafe { &mut *cpu };
    let f = decode(word);
    let bad = cpu.reg(f.rs).wrapping_add(f.imm as i16 as i32 as u32);
    cpu.exception(ExceptionCause::AddressErrorLoad, pc, false, Some(bad));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_machine_boots_at_the_bios_reset_vector() {
        let machine = Machine::new(Region::Ntsc).expect("machine construction should succeed in a test environment");
        assert_eq!(machine.cpu.pc, 0xBFC0_0000);
        assert_eq!(machine.global_cycles, 0);
    }

    #[test]
    fn hand_off_to_executable_redirects_pc_and_stack() {
        let mut machine = Machine::new(Region::Ntsc).unwrap();
        machine.hand_off_to_executable(0x8001_0000, 0x8002_0000, 0x801F_FFF0);
        assert_eq!(machine.cpu.pc, 0x8001_0000);
        assert_eq!(machine.cpu.reg(29), 0x801F_FFF0);
        assert_eq!(machine.cpu.reg(28), 0x8002_0000);
    }

    #[test]
    fn unaligned_pc_raises_address_error() {
        let mut machine = Machine::new(Region::Ntsc).unwrap();
        machine.cpu.pc = 0x8001_0001;
        // Fresh machines boot with BEV set, so the bootstrap vector fires.
        assert!(machine.cpu.sr().contains(crate::cpu::StatusRegister::BEV));
        let mut sink = crate::spu::NullSink;
        let _ = machine.run_batch(&mut sink);
        assert_eq!(machine.cpu.pc, 0xBFC0_0180);
    }
}
