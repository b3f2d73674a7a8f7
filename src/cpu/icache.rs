//! Decoded-instruction cache.
//!
//! A direct-mapped memo from instruction pc to its decoded form, consulted
//! before fetch+decode. Entries stay valid until an explicit invalidation:
//! FENCE.I, SRET/MRET, any trap entry, or SFENCE.VMA (whole, or the slot
//! covering one virtual address).

use super::decode::Instr;

const ICACHE_SIZE: usize = 1024;
const ICACHE_MASK: u64 = (ICACHE_SIZE as u64) - 1;

pub struct ICache {
    entries: Box<[Option<(u64, Instr)>; ICACHE_SIZE]>,
}

impl ICache {
    pub fn new() -> Self {
        Self {
            entries: Box::new([None; ICACHE_SIZE]),
        }
    }

    #[inline]
    fn slot(pc: u64) -> usize {
        // pc is 2-byte aligned; drop the dead bit before indexing.
        ((pc >> 1) & ICACHE_MASK) as usize
    }

    #[inline]
    pub fn get(&self, pc: u64) -> Option<Instr> {
        match self.entries[Self::slot(pc)] {
            Some((cached_pc, instr)) if cached_pc == pc => Some(instr),
            _ => None,
        }
    }

    #[inline]
    pub fn insert(&mut self, pc: u64, instr: Instr) {
        self.entries[Self::slot(pc)] = Some((pc, instr));
    }

    pub fn invalidate_all(&mut self) {
        self.entries.fill(None);
    }

    /// Invalidate the slot covering one virtual address (SFENCE.VMA rs1!=x0).
    pub fn invalidate_addr(&mut self, vaddr: u64) {
        self.entries[Self::slot(vaddr)] = None;
    }
}

impl Default for ICache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy(raw: u32) -> Instr {
        Instr::new(raw, 4)
    }

    #[test]
    fn hit_requires_exact_pc() {
        let mut cache = ICache::new();
        cache.insert(0x8000_0000, dummy(0x13));
        assert!(cache.get(0x8000_0000).is_some());
        // Same slot, different tag.
        assert!(cache.get(0x8000_0000 + (ICACHE_SIZE as u64) * 2).is_none());
    }

    #[test]
    fn invalidation() {
        let mut cache = ICache::new();
        cache.insert(0x8000_0000, dummy(0x13));
        cache.insert(0x8000_0004, dummy(0x6f));

        cache.invalidate_addr(0x8000_0000);
        assert!(cache.get(0x8000_0000).is_none());
        assert!(cache.get(0x8000_0004).is_some());

        cache.invalidate_all();
        assert!(cache.get(0x8000_0004).is_none());
    }
}
