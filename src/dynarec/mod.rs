pub mod arena;
pub mod cache;
pub mod translator;

use crate::cpu::Cpu;
use crate::error::{CoreError, CoreResult};
use crate::memory::{Bus, PageGenerations};

use arena::CodeArena;
use cache::{BlockCache, CompiledBlock};
use translator::{HelperTable, Translator};

/// Owns the code arena and block cache together since compiling a block
/// touches both: code goes into the arena, the descriptor (with its
/// now-final `entry_offset`) goes into the cache.
pub struct Dynarec {
    pub arena: CodeArena,
    pub cache: BlockCache,
    helpers: HelperTable,
    blocks_compiled: usize,
}

impl Dynarec {
    pub fn new(helpers: HelperTable) -> CoreResult<Self> {
        Ok(Self { arena: CodeArena::new()?, cache: BlockCache::new(), helpers, blocks_compiled: 0 })
    }

    /// Compiles the block at `pc`, appends it to the arena, links any
    /// pending direct-branch patch sites that target it, and records
    /// patch sites it itself still owes to blocks not yet compiled.
    pub fn compile_block(&mut self, cpu: &Cpu, bus: &mut Bus, pc: u32) -> CoreResult<usize> {
        let _ = cpu;
        let current_generation = bus.page_generations.current(PageGenerations::page_of(pc & 0x1FFF_FFFF));

        let translator = Translator::new(&mut self.arena, &self.helpers)?;
        let (mut block, code, patch_sites) = translator.compile_block(bus, current_generation, pc)?;

        self.arena.begin_write()?;
        let entry_offset = match self.arena.append(&code) {
            Ok(offset) => offset,
            Err(CoreError::ArenaExhausted { .. }) => {
                self.flush();
                self.arena.begin_write()?;
                self.arena.append(&code)?
            }
            Err(e) => return Err(e),
        };
        self.arena.end_write()?;

        let relative_chain_offset = block.chain_offset;
        block.entry_offset = entry_offset;
        block.chain_offset = entry_offset + relative_chain_offset;

        // Every patch site already defaults to a working `jmp` into this
        // block's own epilogue (see `Translator::emit_store_pc_and_exit`);
        // narrowing it to a direct jump into an already-compiled sibling's
        // `chain_offset` is a pure optimization, never load-bearing for
        // correctness. A target compiled later than this site never gets
        // linked retroactively -- it simply keeps taking the epilogue exit
        // and lets the dispatch loop look the target up the ordinary way.
        for (site, target) in &patch_sites {
            let absolute_site = entry_offset + *site;
            if let Some(target_block) = self.cache.lookup(*target) {
                self.arena.begin_write()?;
                self.arena.patch_rel32(absolute_site, target_block.chain_offset)?;
                self.arena.end_write()?;
            }
        }
        self.cache.insert(block);
        self.blocks_compiled += 1;
        Ok(entry_offset)
    }

    pub fn lookup_or_compile(&mut self, cpu: &Cpu, bus: &mut Bus, pc: u32) -> CoreResult<*const u8> {
        let generation_page = PageGenerations::page_of(pc & 0x1FFF_FFFF);
        let current_generation = bus.page_generations.current(generation_page);
        let instruction_count = self.cache.lookup(pc).map(|b| b.instruction_count).unwrap_or(0);

        // Recompute the instruction hash lazily, only on the cold path
        // where the cheap generation check already failed.
        let mut rehash_words = Vec::with_capacity(instruction_count as usize);
        for i in 0..instruction_count {
            rehash_words.push(bus.read(pc.wrapping_add(i * 4), crate::memory::Size::Word));
        }

        let valid = self.cache.validate(pc, current_generation, || cache::hash_instructions(&rehash_words));
        if !valid {
            self.cache.invalidate(pc);
        }

        let offset = match self.cache.lookup(pc) {
            Some(block) => block.entry_offset,
            None => self.compile_block(cpu, bus, pc)?,
        };
        Ok(self.arena.entry_at(offset))
    }

    pub fn flush(&mut self) {
        self.arena.flush();
        self.cache.flush();
    }

    pub fn blocks_compiled(&self) -> usize {
        self.blocks_compiled
    }

    pub fn classify(&self, block: &CompiledBlock) -> crate::cpu::IdleClass {
        block.idle_class
    }
}
