// Block cache: a two-level lookup (page array -> per-page hash bucket)
// keyed by guest PC, self-modifying-code detection via page generation
// counters plus an order-sensitive instruction hash, and a two-way
// associative guest-PC -> entry-point table kept in sync with every
// insert/invalidate/flush. JR/JALR itself no longer probes this from
// native code (it exits to Rust and goes through the ordinary lookup-or-
// compile path instead); the table stays populated as a ready-made index
// for a future native fast path without being load-bearing today.

use std::collections::HashMap;

use crate::memory::PageGenerations;

pub const JR_HASH_TABLE_SIZE: usize = 4096;
pub const JR_HASH_WAYS: usize = 2;

#[derive(Clone, Copy)]
pub struct CompiledBlock {
    /// Where the dispatch loop calls in: right at the prologue, which pins
    /// `&mut Cpu`/`&mut Bus` and pushes the registers `abort_epilogue`
    /// expects to pop.
    pub entry_offset: usize,
    /// Where a sibling block's direct-branch patch site links to instead:
    /// right after the prologue, since the registers are already pinned by
    /// whoever originally called into `entry_offset`. Jumping here again
    /// would double the pushes and never balance the pops.
    pub chain_offset: usize,
    pub guest_pc: u32,
    pub instruction_count: u32,
    pub cycle_count: i32,
    /// Page generation observed when every instruction in the block was
    /// last fetched; cheap pre-filter before the opcode rehash.
    pub generation: u32,
    /// Order-sensitive hash of the source instructions, recomputed only
    /// when `generation` has changed since compile time.
    pub source_hash: u32,
    pub idle_class: crate::cpu::IdleClass,
}

/// Order-sensitive hash over the raw instruction words a block was compiled
/// from: seed, then repeatedly `hash = hash.wrapping_mul(M).wrapping_add(word)`.
pub fn hash_instructions(words: &[u32]) -> u32 {
    const SEED: u32 = 0x811C_9DC5;
    const MULTIPLIER: u32 = 0x0100_0193;
    words.iter().fold(SEED, |hash, &word| hash.wrapping_mul(MULTIPLIER).wrapping_add(word))
}

#[derive(Default, Clone, Copy)]
struct JrSlot {
    guest_pc: u32,
    entry_offset: usize,
    valid: bool,
    recently_used: bool,
}

/// Two-way associative table mapping a guest PC to a native entry point.
/// Not currently probed from emitted code (see the module comment);
/// collisions evict the less-recently-used of the two ways.
pub struct IndirectDispatchTable {
    slots: Box<[[JrSlot; JR_HASH_WAYS]]>,
}

impl IndirectDispatchTable {
    pub fn new() -> Self {
        Self { slots: vec![[JrSlot::default(); JR_HASH_WAYS]; JR_HASH_TABLE_SIZE].into_boxed_slice() }
    }

    fn index(pc: u32) -> usize {
        ((pc >> 2) as usize ^ (pc >> 14) as usize) % JR_HASH_TABLE_SIZE
    }

    pub fn lookup(&mut self, pc: u32) -> Option<usize> {
        let index = Self::index(pc);
        let bucket = &mut self.slots[index];
        for slot in bucket.iter_mut() {
            if slot.valid && slot.guest_pc == pc {
                slot.recently_used = true;
                for other in bucket.iter_mut() {
                    if other.guest_pc != pc {
                        other.recently_used = false;
                    }
                }
                return Some(self.slots[index].iter().find(|s| s.valid && s.guest_pc == pc).map(|s| s.entry_offset).unwrap());
            }
        }
        None
    }

    pub fn insert(&mut self, pc: u32, entry_offset: usize) {
        let index = Self::index(pc);
        let bucket = &mut self.slots[index];
        let victim = bucket.iter().position(|s| !s.valid).unwrap_or_else(|| bucket.iter().position(|s| !s.recently_used).unwrap_or(0));
        bucket[victim] = JrSlot { guest_pc: pc, entry_offset, valid: true, recently_used: true };
        for (i, slot) in bucket.iter_mut().enumerate() {
            if i != victim {
                slot.recently_used = false;
            }
        }
    }

    pub fn remove(&mut self, pc: u32) {
        let index = Self::index(pc);
        for slot in self.slots[index].iter_mut() {
            if slot.valid && slot.guest_pc == pc {
                slot.valid = false;
            }
        }
    }

    pub fn clear(&mut self) {
        for bucket in self.slots.iter_mut() {
            for slot in bucket.iter_mut() {
                slot.valid = false;
            }
        }
    }
}

impl Default for IndirectDispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

enum PageSource {
    Ram,
    Bios,
}

fn classify(pc: u32) -> Option<(PageSource, usize)> {
    let phys = pc & 0x1FFF_FFFF;
    match phys {
        crate::memory::map::RAM_START..=crate::memory::map::RAM_END => Some((PageSource::Ram, PageGenerations::page_of(phys))),
        crate::memory::map::BIOS_START..=crate::memory::map::BIOS_END => Some((PageSource::Bios, ((phys - crate::memory::map::BIOS_START) as usize) / crate::memory::PAGE_SIZE)),
        _ => None,
    }
}

/// The first-level page array (RAM vs BIOS) each holding a per-page hash
/// bucket of compiled blocks, plus the JR/JALR indirect dispatch table that
/// must stay consistent with it.
pub struct BlockCache {
    ram_pages: Vec<HashMap<u32, CompiledBlock>>,
    bios_pages: Vec<HashMap<u32, CompiledBlock>>,
    pub indirect: IndirectDispatchTable,
}

impl BlockCache {
    pub fn new() -> Self {
        let ram_page_count = crate::memory::RAM_SIZE / crate::memory::PAGE_SIZE;
        let bios_page_count = crate::memory::BIOS_SIZE / crate::memory::PAGE_SIZE;
        Self {
            ram_pages: (0..ram_page_count).map(|_| HashMap::new()).collect(),
            bios_pages: (0..bios_page_count).map(|_| HashMap::new()).collect(),
            indirect: IndirectDispatchTable::new(),
        }
    }

    fn bucket(&self, pc: u32) -> Option<&HashMap<u32, CompiledBlock>> {
        let (source, page) = classify(pc)?;
        Some(match source {
            PageSource::Ram => &self.ram_pages[page],
            PageSource::Bios => &self.bios_pages[page],
        })
    }

    fn bucket_mut(&mut self, pc: u32) -> Option<&mut HashMap<u32, CompiledBlock>> {
        let (source, page) = classify(pc)?;
        Some(match source {
            PageSource::Ram => &mut self.ram_pages[page],
            PageSource::Bios => &mut self.bios_pages[page],
        })
    }

    pub fn lookup(&self, pc: u32) -> Option<&CompiledBlock> {
        self.bucket(pc)?.get(&pc)
    }

    pub fn insert(&mut self, block: CompiledBlock) {
        let pc = block.guest_pc;
        // Index by chain_offset, not entry_offset: anything probing this
        // table is jumping straight into already-pinned guest code, not
        // calling in fresh, and must not re-run the prologue.
        self.indirect.insert(pc, block.chain_offset);
        if let Some(bucket) = self.bucket_mut(pc) {
            bucket.insert(pc, block);
        }
    }

    /// Validates a cached block against the current page generation and, on
    /// mismatch, the source-instruction hash. Returns `true` if the block is
    /// still valid (and re-latches its generation when only the cheap check
    /// failed), `false` if it must be recompiled.
    pub fn validate(&mut self, pc: u32, current_generation: u32, current_hash: impl FnOnce() -> u32) -> bool {
        let Some(bucket) = self.bucket_mut(pc) else { return false };
        let Some(block) = bucket.get_mut(&pc) else { return false };
        if block.generation == current_generation {
            return true;
        }
        if block.source_hash == current_hash() {
            block.generation = current_generation;
            true
        } else {
            false
        }
    }

    pub fn invalidate(&mut self, pc: u32) {
        if let Some(bucket) = self.bucket_mut(pc) {
            bucket.remove(&pc);
        }
        self.indirect.remove(pc);
    }

    /// Drops every compiled block and clears the indirect-dispatch table;
    /// paired with `CodeArena::flush`.
    pub fn flush(&mut self) {
        for bucket in self.ram_pages.iter_mut().chain(self.bios_pages.iter_mut()) {
            bucket.clear();
        }
        self.indirect.clear();
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block(pc: u32, entry: usize) -> CompiledBlock {
        CompiledBlock {
            entry_offset: entry,
            chain_offset: entry + 8,
            guest_pc: pc,
            instruction_count: 4,
            cycle_count: 4,
            generation: 0,
            source_hash: hash_instructions(&[0, 1, 2, 3]),
            idle_class: crate::cpu::IdleClass::NotIdle,
        }
    }

    #[test]
    fn lookup_finds_inserted_block() {
        let mut cache = BlockCache::new();
        cache.insert(sample_block(0x1000, 256));
        assert_eq!(cache.lookup(0x1000).map(|b| b.entry_offset), Some(256));
    }

    #[test]
    fn validate_skips_rehash_when_generation_matches() {
        let mut cache = BlockCache::new();
        cache.insert(sample_block(0x1000, 256));
        assert!(cache.validate(0x1000, 0, || panic!("should not rehash when generation matches")));
    }

    #[test]
    fn validate_rehashes_and_invalidates_on_mismatch() {
        let mut cache = BlockCache::new();
        cache.insert(sample_block(0x1000, 256));
        assert!(!cache.validate(0x1000, 1, || 0xDEAD_BEEF));
    }

    #[test]
    fn indirect_table_evicts_least_recently_used_way_on_collision() {
        let mut table = IndirectDispatchTable::new();
        let index = IndirectDispatchTable::index(0x1000);
        // Construct a second PC that maps to the same bucket.
        let mut other_pc = 0x1004;
        while IndirectDispatchTable::index(other_pc) != index {
            other_pc += 4;
        }
        table.insert(0x1000, 10);
        table.lookup(0x1000);
        table.insert(other_pc, 20);
        let mut third_pc = other_pc + 4;
        while IndirectDispatchTable::index(third_pc) != index {
            third_pc += 4;
        }
        table.insert(third_pc, 30);
        assert_eq!(table.lookup(0x1000), Some(10));
    }
}
