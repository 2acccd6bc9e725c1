// Executable code arena: one mmap-backed region holding every compiled
// block plus a handful of fixed trampolines at the front. Writes go through
// a writable mapping; code only ever runs through the executable mapping
// produced by `make_exec`, so the arena toggles between the two rather than
// keeping a single W^X-violating region.

use dynasmrt::{dynasm, DynasmApi, DynasmLabelApi};
use mmap_rs::{Mmap, MmapMut, MmapOptions};

use crate::error::{CoreError, CoreResult};

pub const ARENA_SIZE: usize = 64 * 1024 * 1024;

/// Offsets of the fixed trampolines, assigned once by `build_trampolines`.
/// Every offset here has a real call site: `abort_epilogue` is jumped into
/// by every compiled block's shared epilogue, and `helper_call_full`/
/// `helper_call_lite` are jumped into by every helper call a block emits.
#[derive(Debug, Clone, Copy)]
pub struct TrampolineOffsets {
    pub abort_epilogue: usize,
    pub helper_call_full: usize,
    pub helper_call_lite: usize,
}

enum ArenaState {
    Writable(MmapMut),
    Executable(Mmap),
    Transitioning,
}

pub struct CodeArena {
    state: ArenaState,
    cursor: usize,
    pub trampolines: TrampolineOffsets,
}

impl CodeArena {
    pub fn new() -> CoreResult<Self> {
        let mapping = MmapOptions::new(ARENA_SIZE)
            .map_err(|e| CoreError::ArenaAllocation(e.to_string()))?
            .make_mut()
            .map_err(|(_, e)| CoreError::ArenaAllocation(e.to_string()))?;
        let mut arena = Self {
            state: ArenaState::Writable(mapping),
            cursor: 0,
            trampolines: TrampolineOffsets { abort_epilogue: 0, helper_call_full: 0, helper_call_lite: 0 },
        };
        arena.build_trampolines()?;
        Ok(arena)
    }

    fn writable(&mut self) -> &mut MmapMut {
        match &mut self.state {
            ArenaState::Writable(m) => m,
            _ => panic!("code arena must be in the writable state to append code"),
        }
    }

    /// Flips the arena from writable to executable (or back) before/after a
    /// block of append operations. Held separately so compiling several
    /// blocks in a row only pays the mprotect cost twice.
    pub fn begin_write(&mut self) -> CoreResult<()> {
        if matches!(self.state, ArenaState::Writable(_)) {
            return Ok(());
        }
        let exec = match std::mem::replace(&mut self.state, ArenaState::Transitioning) {
            ArenaState::Executable(m) => m,
            _ => unreachable!("arena was neither writable nor executable"),
        };
        let writable = exec.make_mut().map_err(|(_, e)| CoreError::ArenaAllocation(e.to_string()))?;
        self.state = ArenaState::Writable(writable);
        Ok(())
    }

    pub fn end_write(&mut self) -> CoreResult<()> {
        if matches!(self.state, ArenaState::Executable(_)) {
            return Ok(());
        }
        let writable = match std::mem::replace(&mut self.state, ArenaState::Transitioning) {
            ArenaState::Writable(m) => m,
            _ => unreachable!("arena was neither writable nor executable"),
        };
        let exec = writable.make_exec().map_err(|(_, e)| CoreError::ArenaAllocation(e.to_string()))?;
        self.state = ArenaState::Executable(exec);
        Ok(())
    }

    pub fn base_ptr(&self) -> *const u8 {
        match &self.state {
            ArenaState::Writable(m) => m.as_ptr(),
            ArenaState::Executable(m) => m.as_ptr(),
            ArenaState::Transitioning => unreachable!(),
        }
    }

    pub fn entry_at(&self, offset: usize) -> *const u8 {
        unsafe { self.base_ptr().add(offset) }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        ARENA_SIZE.saturating_sub(self.cursor)
    }

    /// Appends raw machine code at the current cursor, returning its offset.
    /// Callers must have called `begin_write` first.
    pub fn append(&mut self, code: &[u8]) -> CoreResult<usize> {
        if self.cursor + code.len() > ARENA_SIZE {
            return Err(CoreError::ArenaExhausted { blocks_compiled: 0 });
        }
        let offset = self.cursor;
        let base = self.writable().as_mut_ptr();
        unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), base.add(offset), code.len()) };
        self.cursor += code.len();
        Ok(offset)
    }

    /// Overwrites an already-emitted direct-branch patch site with the
    /// target block's entry offset, relative to the patch site's own end.
    pub fn patch_rel32(&mut self, site_offset: usize, target_offset: usize) -> CoreResult<()> {
        let rel = (target_offset as i64 - (site_offset as i64 + 4)) as i32;
        let base = self.writable().as_mut_ptr();
        unsafe {
            std::ptr::copy_nonoverlapping(rel.to_le_bytes().as_ptr(), base.add(site_offset), 4);
        }
        Ok(())
    }

    /// Discards everything compiled so far (full arena flush). The
    /// trampolines, which sit below `TRAMPOLINES_SIZE`, are preserved.
    pub fn flush(&mut self) {
        self.cursor = TRAMPOLINES_END;
    }

    fn build_trampolines(&mut self) -> CoreResult<()> {
        self.begin_write()?;
        let mut ops = dynasmrt::x64::Assembler::new().map_err(|e| CoreError::Fatal(e.to_string()))?;

        let abort_epilogue = ops.offset().0;
        dynasm!(ops
            ; .arch x64
            // A compiled block's own epilogue has already added this
            // block's cycle count into Cpu::cycles_remaining and loaded it
            // into eax; just unwind the prologue's pushes and return to
            // whoever called into the block (execute_block, or another
            // block that chained straight past its own epilogue).
            ; pop r15
            ; pop r14
            ; pop r13
            ; pop r12
            ; pop rbx
            ; pop rbp
            ; ret
        );

        let helper_call_full = ops.offset().0;
        dynasm!(ops
            ; .arch x64
            // rax holds the helper address; rdi/rsi/edx/ecx already hold its
            // four arguments, staged by the block that called into here.
            ; call rax
            ; ret
        );

        let helper_call_lite = ops.offset().0;
        dynasm!(ops
            ; .arch x64
            ; call rax
            ; ret
        );

        let buffer = ops.finalize().map_err(|_| CoreError::Fatal("failed to finalize trampoline assembler".into()))?;
        let offset = self.append(&buffer)?;
        debug_assert_eq!(offset, 0, "trampolines must be the first thing written to the arena");

        self.trampolines = TrampolineOffsets { abort_epilogue, helper_call_full, helper_call_lite };
        self.cursor = TRAMPOLINES_END.max(self.cursor);
        self.end_write()
    }
}

/// Trampolines are small; reserve a generous fixed region so block code
/// never has to share a cache line with them.
const TRAMPOLINES_END: usize = 4096;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_starts_executable_with_trampolines_built() {
        let arena = CodeArena::new().expect("arena allocation should succeed in a test environment");
        assert!(matches!(arena.state, ArenaState::Executable(_)));
        assert_eq!(arena.trampolines.abort_epilogue, 0);
        assert!(arena.cursor() >= TRAMPOLINES_END);
    }

    #[test]
    fn flush_resets_cursor_but_keeps_trampolines() {
        let mut arena = CodeArena::new().unwrap();
        arena.begin_write().unwrap();
        arena.append(&[0x90; 16]).unwrap();
        arena.end_write().unwrap();
        arena.flush();
        assert_eq!(arena.cursor(), TRAMPOLINES_END);
    }
}
