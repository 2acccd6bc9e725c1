// MIPS R3000A -> x86-64 block emitter. Walks guest instruction words
// starting at a PC, emits native code implementing each one, and ends the
// block once a branch/jump's delay slot has executed. Simple register/
// immediate ALU ops are emitted inline against the `Cpu` struct's known
// field offsets; everything that can raise a guest exception, touch
// memory, or needs MIPS's 64-bit multiply/divide semantics is routed
// through a helper call using the full or lite trampoline as appropriate.
//
// Every compiled block opens with a prologue that pins `&mut Cpu` in rbx
// and `&mut Bus` in r12 (plus the callee-saved registers the shared
// `abort_epilogue` trampoline expects to pop) and closes by funnelling
// every exit path -- taken/not-taken branch, jump, indirect jump,
// fallthrough, and mid-block abort -- through one local `epilogue` label
// that hands off to that trampoline. `chain_offset` marks the first byte
// after the prologue: a sibling block's direct-branch patch site is
// linked there instead of at `entry_offset`, so chained blocks never
// re-push a frame the call from Rust already owns.

use dynasmrt::{dynasm, DynasmApi, DynasmLabelApi};

use crate::cpu::Cpu;
use crate::cpu::IdleClass;
use crate::dynarec::arena::CodeArena;
use crate::dynarec::cache::{hash_instructions, CompiledBlock};
use crate::error::{CoreError, CoreResult};
use crate::memory::Bus;

const MAX_BLOCK_INSTRUCTIONS: usize = 128;

#[derive(Clone, Copy)]
pub(crate) struct Fields {
    pub op: u32,
    pub rs: u8,
    pub rt: u8,
    pub rd: u8,
    pub shamt: u8,
    pub funct: u32,
    pub imm: u16,
    pub target: u32,
}

pub(crate) fn decode(word: u32) -> Fields {
    Fields {
        op: word >> 26,
        rs: ((word >> 21) & 0x1F) as u8,
        rt: ((word >> 16) & 0x1F) as u8,
        rd: ((word >> 11) & 0x1F) as u8,
        shamt: ((word >> 6) & 0x1F) as u8,
        funct: word & 0x3F,
        imm: (word & 0xFFFF) as u16,
        target: word & 0x03FF_FFFF,
    }
}

/// True for any instruction whose execution ends the block: it has a
/// delay slot (branches, jumps, JR/JALR) or it always traps (SYSCALL,
/// BREAK). A delay-slot instruction is never itself one of these --
/// a branch in a branch delay slot is undefined on real MIPS hardware,
/// so the translator is free to assume it never occurs.
fn ends_block(f: &Fields) -> bool {
    match f.op {
        0x01 => true,
        0x02 | 0x03 => true,
        0x04..=0x07 => true,
        0x00 => matches!(f.funct, 0x08 | 0x09 | 0x0C | 0x0D),
        _ => false,
    }
}

/// Offset of `Cpu::gpr[index]` in bytes, used by emitted code to address a
/// guest register directly off the `&mut Cpu` pointer kept in a pinned host
/// register (rbx) across the block.
fn gpr_offset(index: u8) -> i32 {
    (index as i32) * 4
}

/// Function-pointer signature every helper call conforms to: the CPU and
/// bus records, the raw instruction word (decoded again inside the helper
/// so the translator never has to stage individual operands into scratch
/// fields), and the originating guest PC for exception reporting.
pub type HelperFn = extern "C" fn(*mut Cpu, *mut Bus, u32, u32);

/// Helpers the translator calls out to for anything not worth inlining.
/// Implemented in `dispatch.rs` and exposed as raw function pointers so
/// emitted code can `call` them directly, through the full/lite trampoline.
pub struct HelperTable {
    pub load: HelperFn,
    pub store: HelperFn,
    pub multiply: HelperFn,
    pub divide: HelperFn,
    pub syscall: HelperFn,
    pub breakpoint: HelperFn,
    pub overflow_add: HelperFn,
    pub overflow_sub: HelperFn,
    pub mfc0: HelperFn,
    pub mtc0: HelperFn,
    pub cop2_execute: HelperFn,
    pub cop_unusable: HelperFn,
    pub address_error: HelperFn,
}

pub struct Translator<'a> {
    arena: &'a mut CodeArena,
    helpers: &'a HelperTable,
    ops: dynasmrt::x64::Assembler,
    words: Vec<u32>,
    /// Unresolved direct-branch patch sites: (offset within this block's
    /// bytes once appended, target guest PC). Every site already defaults
    /// to a correct `jmp` into this block's own epilogue; `Dynarec` only
    /// ever narrows that to a more direct jump once the target is known.
    patch_sites: Vec<(usize, u32)>,
}

impl<'a> Translator<'a> {
    pub fn new(arena: &'a mut CodeArena, helpers: &'a HelperTable) -> CoreResult<Self> {
        Ok(Self {
            arena,
            helpers,
            ops: dynasmrt::x64::Assembler::new().map_err(|e| CoreError::Fatal(e.to_string()))?,
            words: Vec::new(),
            patch_sites: Vec::new(),
        })
    }

    fn fetch(&self, bus: &mut Bus, pc: u32) -> Option<u32> {
        let phys = pc & 0x1FFF_FFFF;
        match phys {
            crate::memory::map::RAM_START..=crate::memory::map::RAM_END | crate::memory::map::BIOS_START..=crate::memory::map::BIOS_END => Some(bus.read(pc, crate::memory::Size::Word)),
            _ => None,
        }
    }

    /// Compiles the block starting at `pc`. Returns the compiled block
    /// descriptor, or a translation-failure error if the first instruction
    /// cannot even be fetched.
    pub fn compile_block(mut self, bus: &mut Bus, generation: u32, pc: u32) -> CoreResult<(CompiledBlock, Vec<u8>, Vec<(usize, u32)>)> {
        dynasm!(self.ops; .arch x64);
        self.emit_prologue();
        let chain_offset = self.ops.offset().0;

        let mut cursor_pc = pc;
        let mut cycle_count: i32 = 0;
        let mut entry_pc_equals_exit = false;

        loop {
            let word = self.fetch(bus, cursor_pc).ok_or_else(|| CoreError::TranslationFailed { pc: cursor_pc, reason: "fetch outside RAM/BIOS".into() })?;
            self.words.push(word);
            let fields = decode(word);
            cycle_count += 1;

            if ends_block(&fields) {
                let delay_pc = cursor_pc.wrapping_add(4);
                let delay_word = self.fetch(bus, delay_pc).ok_or_else(|| CoreError::TranslationFailed { pc: delay_pc, reason: "delay slot fetch outside RAM/BIOS".into() })?;
                self.words.push(delay_word);
                let delay_fields = decode(delay_word);
                cycle_count += 1;

                // The delay slot always executes, taken or not; emit it
                // before the branch's own control transfer so it can never
                // become unreachable dead code.
                self.emit_instruction(delay_pc, delay_word, delay_fields);
                self.emit_control_transfer(cursor_pc, word, fields, cycle_count);

                entry_pc_equals_exit = delay_pc.wrapping_add(4) == pc;
                break;
            }

            self.emit_instruction(cursor_pc, word, fields);
            cursor_pc = cursor_pc.wrapping_add(4);

            if self.words.len() >= MAX_BLOCK_INSTRUCTIONS {
                self.emit_store_pc_and_exit(cursor_pc, cycle_count);
                break;
            }
        }

        dynasm!(self.ops
            ; .arch x64
            ; epilogue:
            ; mov eax, [rbx + std::mem::offset_of!(Cpu, cycles_remaining) as i32]
            ; mov r10, QWORD self.arena.trampolines.abort_epilogue as i64 + self.arena.base_ptr() as i64
            ; jmp r10
        );

        let idle_class = if entry_pc_equals_exit && self.words.len() <= 3 { IdleClass::HardIdle } else { IdleClass::NotIdle };

        let buffer = self.ops.finalize().map_err(|_| CoreError::Fatal("failed to finalize block assembler".into()))?;
        let code = buffer.to_vec();

        let block = CompiledBlock {
            entry_offset: 0, // patched in by the caller once appended to the arena
            chain_offset,    // relative for now; rebased the same way by the caller
            guest_pc: pc,
            instruction_count: self.words.len() as u32,
            cycle_count,
            generation,
            source_hash: hash_instructions(&self.words),
            idle_class,
        };
        Ok((block, code, self.patch_sites))
    }

    /// Pushes the callee-saved registers `abort_epilogue` restores and pins
    /// `&mut Cpu` (rdi, arg 1) in rbx and `&mut Bus` (rsi, arg 2) in r12 for
    /// the rest of the block.
    fn emit_prologue(&mut self) {
        dynasm!(self.ops
            ; .arch x64
            ; push rbp
            ; push rbx
            ; push r12
            ; push r13
            ; push r14
            ; push r15
            ; mov rbx, rdi
            ; mov r12, rsi
        );
    }

    /// Emits one non-block-ending instruction's native code.
    fn emit_instruction(&mut self, pc: u32, word: u32, f: Fields) {
        match f.op {
            0x00 => self.emit_special(pc, word, f),
            0x08 | 0x09 => self.emit_addi(pc, word, f, f.op == 0x08),
            0x0A => self.emit_slti(f, true),
            0x0B => self.emit_slti(f, false),
            0x0C => self.emit_logical_imm(f, LogicOp::And),
            0x0D => self.emit_logical_imm(f, LogicOp::Or),
            0x0E => self.emit_logical_imm(f, LogicOp::Xor),
            0x0F => self.emit_lui(f),
            0x10 => self.emit_cop0(pc, word, f),
            0x12 => self.emit_cop2(pc, word),
            0x20..=0x26 => self.emit_load(pc, word),
            0x28..=0x2E => self.emit_store(pc, word),
            _ => self.emit_nop(),
        }
    }

    fn emit_special(&mut self, pc: u32, word: u32, f: Fields) {
        match f.funct {
            0x00 => self.emit_shift_imm(f, ShiftOp::Sll),
            0x02 => self.emit_shift_imm(f, ShiftOp::Srl),
            0x03 => self.emit_shift_imm(f, ShiftOp::Sra),
            0x04 => self.emit_shift_var(f, ShiftOp::Sll),
            0x06 => self.emit_shift_var(f, ShiftOp::Srl),
            0x07 => self.emit_shift_var(f, ShiftOp::Sra),
            0x10 => self.emit_move_from_special(f, SpecialReg::Hi),
            0x11 => self.emit_move_to_special(f, SpecialReg::Hi),
            0x12 => self.emit_move_from_special(f, SpecialReg::Lo),
            0x13 => self.emit_move_to_special(f, SpecialReg::Lo),
            0x18 | 0x19 => self.emit_helper_call(self.helpers.multiply, word, pc, true),
            0x1A | 0x1B => self.emit_helper_call(self.helpers.divide, word, pc, true),
            0x20 | 0x21 => self.emit_reg_alu(pc, word, f, AluOp::Add, f.funct == 0x20),
            0x22 | 0x23 => self.emit_reg_alu(pc, word, f, AluOp::Sub, f.funct == 0x22),
            0x24 => self.emit_reg_logical(f, LogicOp::And),
            0x25 => self.emit_reg_logical(f, LogicOp::Or),
            0x26 => self.emit_reg_logical(f, LogicOp::Xor),
            0x27 => self.emit_reg_logical(f, LogicOp::Nor),
            0x2A => self.emit_slt_reg(f, true),
            0x2B => self.emit_slt_reg(f, false),
            _ => self.emit_nop(),
        }
    }

    /// Emits the control transfer for a block's final (non-delay-slot)
    /// instruction: the branch/jump itself, or a trap that always aborts.
    /// `total` is the block's final cycle count, already known because the
    /// delay slot has just been emitted.
    fn emit_control_transfer(&mut self, pc: u32, word: u32, f: Fields, total: i32) {
        match f.op {
            0x01 => self.emit_branch_regimm(pc, f, total),
            0x02 => self.emit_jump_link(pc, f, false, total),
            0x03 => self.emit_jump_link(pc, f, true, total),
            0x04 => self.emit_branch(pc, f, Cond::Eq, total),
            0x05 => self.emit_branch(pc, f, Cond::Ne, total),
            0x06 => self.emit_branch(pc, f, Cond::Lez, total),
            0x07 => self.emit_branch(pc, f, Cond::Gtz, total),
            0x00 => match f.funct {
                0x08 => self.emit_jr(f, total),
                0x09 => self.emit_jalr(pc, f, total),
                0x0C => {
                    self.emit_helper_call(self.helpers.syscall, word, pc, false);
                    self.emit_abort_check(total);
                }
                0x0D => {
                    self.emit_helper_call(self.helpers.breakpoint, word, pc, false);
                    self.emit_abort_check(total);
                }
                _ => unreachable!("ends_block guarantees funct is JR/JALR/SYSCALL/BREAK"),
            },
            _ => unreachable!("ends_block guarantees op is a branch/jump family"),
        }
    }

    // -- ALU: register/register ----------------------------------------

    fn emit_reg_alu(&mut self, pc: u32, word: u32, f: Fields, op: AluOp, trapping: bool) {
        if trapping {
            // ADD/SUB trap on signed overflow: run through the full helper
            // so the emitted abort-check sequence can unwind on overflow.
            let helper = if matches!(op, AluOp::Add) { self.helpers.overflow_add } else { self.helpers.overflow_sub };
            self.emit_helper_call(helper, word, pc, false);
            self.emit_abort_check(0);
            return;
        }
        dynasm!(self.ops
            ; .arch x64
            ; mov eax, [rbx + gpr_offset(f.rs)]
        );
        match op {
            AluOp::Add => dynasm!(self.ops; .arch x64; add eax, [rbx + gpr_offset(f.rt)]),
            AluOp::Sub => dynasm!(self.ops; .arch x64; sub eax, [rbx + gpr_offset(f.rt)]),
        }
        self.store_gpr(f.rd, Reg::Eax);
    }

    fn emit_reg_logical(&mut self, f: Fields, op: LogicOp) {
        dynasm!(self.ops
            ; .arch x64
            ; mov eax, [rbx + gpr_offset(f.rs)]
        );
        match op {
            LogicOp::And => dynasm!(self.ops; .arch x64; and eax, [rbx + gpr_offset(f.rt)]),
            LogicOp::Or => dynasm!(self.ops; .arch x64; or eax, [rbx + gpr_offset(f.rt)]),
            LogicOp::Xor => dynasm!(self.ops; .arch x64; xor eax, [rbx + gpr_offset(f.rt)]),
            LogicOp::Nor => {
                dynasm!(self.ops
                    ; .arch x64
                    ; or eax, [rbx + gpr_offset(f.rt)]
                    ; not eax
                );
            }
        }
        self.store_gpr(f.rd, Reg::Eax);
    }

    fn emit_slt_reg(&mut self, f: Fields, signed: bool) {
        dynasm!(self.ops
            ; .arch x64
            ; mov eax, [rbx + gpr_offset(f.rs)]
            ; cmp eax, [rbx + gpr_offset(f.rt)]
            ; mov eax, 0
            ; mov ecx, 1
        );
        if signed {
            dynasm!(self.ops; .arch x64; cmovl eax, ecx);
        } else {
            dynasm!(self.ops; .arch x64; cmovb eax, ecx);
        }
        self.store_gpr(f.rd, Reg::Eax);
    }

    fn emit_addi(&mut self, pc: u32, word: u32, f: Fields, trapping: bool) {
        if trapping {
            self.emit_helper_call(self.helpers.overflow_add, word, pc, false);
            self.emit_abort_check(0);
            return;
        }
        let imm = f.imm as i16 as i32;
        dynasm!(self.ops
            ; .arch x64
            ; mov eax, [rbx + gpr_offset(f.rs)]
            ; add eax, imm
        );
        self.store_gpr(f.rt, Reg::Eax);
    }

    fn emit_slti(&mut self, f: Fields, signed: bool) {
        let imm = f.imm as i16 as i32;
        dynasm!(self.ops
            ; .arch x64
            ; mov eax, [rbx + gpr_offset(f.rs)]
            ; cmp eax, imm
            ; mov eax, 0
            ; mov ecx, 1
        );
        if signed {
            dynasm!(self.ops; .arch x64; cmovl eax, ecx);
        } else {
            dynasm!(self.ops; .arch x64; cmovb eax, ecx);
        }
        self.store_gpr(f.rt, Reg::Eax);
    }

    fn emit_logical_imm(&mut self, f: Fields, op: LogicOp) {
        let imm = f.imm as u32 as i32;
        dynasm!(self.ops
            ; .arch x64
            ; mov eax, [rbx + gpr_offset(f.rs)]
        );
        match op {
            LogicOp::And => dynasm!(self.ops; .arch x64; and eax, imm),
            LogicOp::Or => dynasm!(self.ops; .arch x64; or eax, imm),
            LogicOp::Xor => dynasm!(self.ops; .arch x64; xor eax, imm),
            LogicOp::Nor => unreachable!("NOR has no immediate form"),
        }
        self.store_gpr(f.rt, Reg::Eax);
    }

    fn emit_lui(&mut self, f: Fields) {
        let imm = (f.imm as u32) << 16;
        dynasm!(self.ops
            ; .arch x64
            ; mov eax, imm as i32
        );
        self.store_gpr(f.rt, Reg::Eax);
    }

    fn emit_shift_imm(&mut self, f: Fields, op: ShiftOp) {
        dynasm!(self.ops
            ; .arch x64
            ; mov eax, [rbx + gpr_offset(f.rt)]
        );
        match op {
            ShiftOp::Sll => dynasm!(self.ops; .arch x64; shl eax, f.shamt as i8),
            ShiftOp::Srl => dynasm!(self.ops; .arch x64; shr eax, f.shamt as i8),
            ShiftOp::Sra => dynasm!(self.ops; .arch x64; sar eax, f.shamt as i8),
        }
        self.store_gpr(f.rd, Reg::Eax);
    }

    fn emit_shift_var(&mut self, f: Fields, op: ShiftOp) {
        dynasm!(self.ops
            ; .arch x64
            ; mov ecx, [rbx + gpr_offset(f.rs)]
            ; and ecx, 0x1F
            ; mov eax, [rbx + gpr_offset(f.rt)]
        );
        match op {
            ShiftOp::Sll => dynasm!(self.ops; .arch x64; shl eax, cl),
            ShiftOp::Srl => dynasm!(self.ops; .arch x64; shr eax, cl),
            ShiftOp::Sra => dynasm!(self.ops; .arch x64; sar eax, cl),
        }
        self.store_gpr(f.rd, Reg::Eax);
    }

    fn emit_move_from_special(&mut self, f: Fields, which: SpecialReg) {
        let offset = match which {
            SpecialReg::Hi => std::mem::offset_of!(Cpu, hi),
            SpecialReg::Lo => std::mem::offset_of!(Cpu, lo),
        } as i32;
        dynasm!(self.ops
            ; .arch x64
            ; mov eax, [rbx + offset]
        );
        self.store_gpr(f.rd, Reg::Eax);
    }

    fn emit_move_to_special(&mut self, f: Fields, which: SpecialReg) {
        let offset = match which {
            SpecialReg::Hi => std::mem::offset_of!(Cpu, hi),
            SpecialReg::Lo => std::mem::offset_of!(Cpu, lo),
        } as i32;
        dynasm!(self.ops
            ; .arch x64
            ; mov eax, [rbx + gpr_offset(f.rs)]
            ; mov [rbx + offset], eax
        );
    }

    // -- control flow -----------------------------------------------------

    fn emit_branch(&mut self, pc: u32, f: Fields, cond: Cond, total: i32) {
        let target = pc.wrapping_add(4).wrapping_add(((f.imm as i16 as i32) << 2) as u32);
        dynasm!(self.ops
            ; .arch x64
            ; mov eax, [rbx + gpr_offset(f.rs)]
        );
        match cond {
            Cond::Eq => dynasm!(self.ops; .arch x64; cmp eax, [rbx + gpr_offset(f.rt)]),
            Cond::Ne => dynasm!(self.ops; .arch x64; cmp eax, [rbx + gpr_offset(f.rt)]),
            Cond::Lez => dynasm!(self.ops; .arch x64; cmp eax, 0),
            Cond::Gtz => dynasm!(self.ops; .arch x64; cmp eax, 0),
        }
        self.emit_conditional_exit(cond, target, pc.wrapping_add(8), total);
    }

    fn emit_branch_regimm(&mut self, pc: u32, f: Fields, total: i32) {
        let target = pc.wrapping_add(4).wrapping_add(((f.imm as i16 as i32) << 2) as u32);
        let link = matches!(f.rt, 0x10 | 0x11);
        if link {
            let return_pc = pc.wrapping_add(8) as i32;
            dynasm!(self.ops; .arch x64; mov eax, return_pc);
            self.store_gpr(31, Reg::Eax);
        }
        dynasm!(self.ops
            ; .arch x64
            ; mov eax, [rbx + gpr_offset(f.rs)]
            ; cmp eax, 0
        );
        let cond = if f.rt & 1 == 0 { Cond::Lez /* BLTZ-family: less-than-zero branch */ } else { Cond::Gtz };
        self.emit_conditional_exit(cond, target, pc.wrapping_add(8), total);
    }

    fn emit_conditional_exit(&mut self, cond: Cond, taken_pc: u32, fallthrough_pc: u32, total: i32) {
        match cond {
            Cond::Eq => dynasm!(self.ops; .arch x64; jne >not_taken),
            Cond::Ne => dynasm!(self.ops; .arch x64; je >not_taken),
            Cond::Lez => dynasm!(self.ops; .arch x64; jg >not_taken),
            Cond::Gtz => dynasm!(self.ops; .arch x64; jle >not_taken),
        }
        self.emit_store_pc_and_exit(taken_pc, total);
        dynasm!(self.ops; .arch x64; not_taken:);
        self.emit_store_pc_and_exit(fallthrough_pc, total);
    }

    /// Writes `target_pc` into `Cpu::pc`, accounts the block's cycles, and
    /// jumps into this block's shared epilogue. The jump is a fixed-size
    /// `rel32` form so `Dynarec` can later overwrite just its displacement
    /// to link directly into a sibling block's `chain_offset` -- until
    /// then this is already a fully correct exit, never a dangling
    /// fallthrough into whatever bytes come next.
    fn emit_store_pc_and_exit(&mut self, target_pc: u32, total: i32) {
        let pc_offset = std::mem::offset_of!(Cpu, pc) as i32;
        let cycles_offset = std::mem::offset_of!(Cpu, cycles_remaining) as i32;
        dynasm!(self.ops
            ; .arch x64
            ; add dword [rbx + cycles_offset], total
            ; mov dword [rbx + pc_offset], target_pc as i32
            ; jmp DWORD >epilogue
        );
        let site = self.ops.offset().0 - 4;
        self.patch_sites.push((site, target_pc));
    }

    fn emit_jump_link(&mut self, pc: u32, f: Fields, link: bool, total: i32) {
        let target = (pc.wrapping_add(4) & 0xF000_0000) | (f.target << 2);
        if link {
            let return_pc = pc.wrapping_add(8) as i32;
            dynasm!(self.ops; .arch x64; mov eax, return_pc);
            self.store_gpr(31, Reg::Eax);
        }
        self.emit_store_pc_and_exit(target, total);
    }

    fn emit_jr(&mut self, f: Fields, total: i32) {
        dynasm!(self.ops
            ; .arch x64
            ; mov eax, [rbx + gpr_offset(f.rs)]
        );
        self.emit_indirect_exit(total);
    }

    fn emit_jalr(&mut self, pc: u32, f: Fields, total: i32) {
        let return_pc = pc.wrapping_add(8) as i32;
        dynasm!(self.ops
            ; .arch x64
            ; mov ecx, [rbx + gpr_offset(f.rs)]
            ; mov eax, return_pc
        );
        self.store_gpr(if f.rd == 0 { 31 } else { f.rd }, Reg::Eax);
        dynasm!(self.ops; .arch x64; mov eax, ecx);
        self.emit_indirect_exit(total);
    }

    /// JR/JALR targets are not known until runtime, so there is no patch
    /// site here: the block always hands the target PC back to the
    /// dispatch loop, which looks it up (or compiles it) the ordinary way.
    fn emit_indirect_exit(&mut self, total: i32) {
        let pc_offset = std::mem::offset_of!(Cpu, pc) as i32;
        let cycles_offset = std::mem::offset_of!(Cpu, cycles_remaining) as i32;
        dynasm!(self.ops
            ; .arch x64
            ; mov [rbx + pc_offset], eax
            ; add dword [rbx + cycles_offset], total
            ; jmp DWORD >epilogue
        );
    }

    fn emit_nop(&mut self) {
        dynasm!(self.ops; .arch x64; nop);
    }

    // -- memory -------------------------------------------------------------

    /// LWL/LWR (opcodes 0x22/0x26) are simplified to a plain full-word load
    /// rather than their true partial-register-merge semantics; games that
    /// rely on unaligned LWL/LWR pairs to assemble a word from two adjacent
    /// ones will not behave correctly. `helper_load` decodes the exact op
    /// to choose size/signedness.
    fn emit_load(&mut self, pc: u32, word: u32) {
        self.emit_helper_call(self.helpers.load, word, pc, true);
        self.emit_abort_check(0);
    }

    /// SWL/SWR (opcodes 0x2A/0x2E) are likewise simplified to a full-word
    /// store; see `emit_load`.
    fn emit_store(&mut self, pc: u32, word: u32) {
        self.emit_helper_call(self.helpers.store, word, pc, true);
        self.emit_abort_check(0);
    }

    // -- coprocessors ---------------------------------------------------

    fn emit_cop0(&mut self, pc: u32, word: u32, f: Fields) {
        match f.rs {
            0x00 => self.emit_helper_call(self.helpers.mfc0, word, pc, false),
            0x04 => self.emit_helper_call(self.helpers.mtc0, word, pc, false),
            _ => self.emit_helper_call(self.helpers.cop_unusable, word, pc, false),
        }
        self.emit_abort_check(0);
    }

    fn emit_cop2(&mut self, pc: u32, word: u32) {
        self.emit_helper_call(self.helpers.cop2_execute, word, pc, false);
        self.emit_abort_check(0);
    }

    // -- shared helper-call sequence -------------------------------------

    /// Stages the three arguments every helper needs (`&mut Cpu`, `&mut
    /// Bus`, the raw instruction word, and the originating PC) into the
    /// SysV argument registers and calls through the full or lite
    /// trampoline -- a genuine call-within-a-call: the trampoline's own
    /// `call rax; ret` returns control to the instruction right after our
    /// `call r10` once the helper itself returns.
    fn emit_helper_call(&mut self, helper: HelperFn, word: u32, pc: u32, lite: bool) {
        let helper_addr = helper as usize as i64;
        let trampoline_offset = if lite { self.arena.trampolines.helper_call_lite } else { self.arena.trampolines.helper_call_full };
        let trampoline_addr = unsafe { self.arena.base_ptr().add(trampoline_offset) } as i64;
        dynasm!(self.ops
            ; .arch x64
            ; mov rax, QWORD helper_addr
            ; mov rdi, rbx
            ; mov rsi, r12
            ; mov edx, word as i32
            ; mov ecx, pc as i32
            ; mov r10, QWORD trampoline_addr
            ; call r10
        );
    }

    /// Checks `Cpu::abort` and, if a helper set it, accounts `running_total`
    /// guest cycles (the count up to and including the instruction that
    /// just ran -- precise, not a reuse of the block's final total) and
    /// exits through the shared epilogue. `Cpu::exception` already wrote
    /// the vector into `Cpu::pc` before returning, so no store is needed
    /// here.
    fn emit_abort_check(&mut self, running_total: i32) {
        let abort_offset = std::mem::offset_of!(Cpu, abort) as i32;
        let cycles_offset = std::mem::offset_of!(Cpu, cycles_remaining) as i32;
        dynasm!(self.ops
            ; .arch x64
            ; cmp byte [rbx + abort_offset], 0
            ; jz >no_abort
            ; add dword [rbx + cycles_offset], running_total
            ; jmp DWORD >epilogue
            ; no_abort:
        );
    }

    fn store_gpr(&mut self, index: u8, reg: Reg) {
        if index == 0 {
            return;
        }
        let Reg::Eax = reg;
        dynasm!(self.ops
            ; .arch x64
            ; mov [rbx + gpr_offset(index)], eax
        );
    }
}

#[derive(Clone, Copy)]
enum Reg {
    Eax,
}

enum AluOp {
    Add,
    Sub,
}
enum LogicOp {
    And,
    Or,
    Xor,
    Nor,
}
enum ShiftOp {
    Sll,
    Srl,
    Sra,
}
enum SpecialReg {
    Hi,
    Lo,
}
enum Cond {
    Eq,
    Ne,
    Lez,
    Gtz,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_extracts_fields_from_an_addi_word() {
        // ADDI $t0, $zero, 42 -> opcode 0x08, rs=0, rt=8, imm=42
        let word = (0x08 << 26) | (0 << 21) | (8 << 16) | 42;
        let f = decode(word);
        assert_eq!(f.op, 0x08);
        assert_eq!(f.rt, 8);
        assert_eq!(f.imm, 42);
    }

    #[test]
    fn decode_extracts_jump_target() {
        let word = (0x02 << 26) | 0x03FF_FFFF;
        let f = decode(word);
        assert_eq!(f.op, 0x02);
        assert_eq!(f.target, 0x03FF_FFFF);
    }

    #[test]
    fn ends_block_recognizes_every_branch_jump_and_trap_family() {
        assert!(ends_block(&decode(0x04 << 26))); // BEQ
        assert!(ends_block(&decode(0x02 << 26))); // J
        assert!(ends_block(&decode(0x01 << 26))); // REGIMM
        assert!(ends_block(&decode(0x08))); // JR ($0)
        assert!(ends_block(&decode(0x09))); // JALR ($0, $0)
        assert!(ends_block(&decode(0x0C))); // SYSCALL
        assert!(ends_block(&decode(0x0D))); // BREAK
        assert!(!ends_block(&decode((0x08 << 26) | 1))); // ADDI
        assert!(!ends_block(&decode(0x20))); // ADD
    }
}
