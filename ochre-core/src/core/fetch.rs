//! Instruction fetch with a page-indexed cache.

use crate::bus::{Bus, BusError, PAGE_WORDS};
use crate::core::trap::Trap;

const CACHE_ENTRIES: usize = 1024;

// A cache line holds exactly the 4 KiB page the index and tag arithmetic
// assume.
const_assert_eq!(4 * PAGE_WORDS, 4096);

struct CacheLine {
    data: Box<[u32; PAGE_WORDS]>,
    page_base: u32,
    valid: bool,
}

/// Direct-mapped cache of 4 KiB instruction pages.
///
/// The index is `(pc >> 12) % 1024`, the tag is the page base address. On a
/// miss the full page is pulled from the bus in one `read_page` transfer.
/// `fence.i` invalidates every line.
pub struct FetchCache {
    lines: Vec<CacheLine>,
}

impl std::fmt::Debug for FetchCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let valid = self.lines.iter().filter(|line| line.valid).count();
        f.debug_struct("FetchCache").field("valid_lines", &valid).finish()
    }
}

impl Default for FetchCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchCache {
    pub fn new() -> Self {
        Self {
            lines: (0..CACHE_ENTRIES)
                .map(|_| CacheLine {
                    data: Box::new([0; PAGE_WORDS]),
                    page_base: 0,
                    valid: false,
                })
                .collect(),
        }
    }

    /// Fetches the instruction word at `pc`.
    pub fn fetch(&mut self, bus: &mut dyn Bus, pc: u32) -> Result<u32, Trap> {
        if pc & 0x3 != 0 {
            return Err(Trap::InstAddressMisaligned);
        }

        let page_base = pc & 0xffff_f000;
        let line = &mut self.lines[(pc as usize >> 12) % CACHE_ENTRIES];

        if !line.valid || line.page_base != page_base {
            if let Err(error) = bus.read_page(u64::from(page_base), &mut line.data) {
                line.valid = false;
                return Err(match error {
                    BusError::OutOfRange | BusError::AccessFault | BusError::NotSupported => {
                        Trap::InstAccessFault
                    }
                    BusError::DeviceError => Trap::IllegalInstruction,
                    BusError::Unaligned => Trap::InstAddressMisaligned,
                });
            }
            line.valid = true;
            line.page_base = page_base;
        }

        Ok(line.data[(pc as usize & 0xfff) >> 2])
    }

    /// Invalidates every cache line (the `fence.i` hook).
    pub fn fencei(&mut self) {
        for line in &mut self.lines {
            line.valid = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockMemory, FillPolicy};
    use crate::word::Word;

    fn memory_with_pattern() -> BlockMemory {
        let mut memory = BlockMemory::new(64 * 1024, FillPolicy::Zero);
        for word in 0..(64 * 1024 / 4) as u64 {
            memory.write(word * 4, word as u32, Word::ONES).unwrap();
        }
        memory
    }

    #[test]
    fn fetch_hits_after_miss() {
        let mut memory = memory_with_pattern();
        let mut cache = FetchCache::new();
        assert_eq!(Ok(0), cache.fetch(&mut memory, 0));
        assert_eq!(Ok(1), cache.fetch(&mut memory, 4));
        assert_eq!(Ok(0x400), cache.fetch(&mut memory, 0x1000));

        // A hit no longer consults the bus: stale data is served until the
        // cache is invalidated.
        memory.write(4, 0xffff_ffff, Word::ONES).unwrap();
        assert_eq!(Ok(1), cache.fetch(&mut memory, 4));
        cache.fencei();
        assert_eq!(Ok(0xffff_ffff), cache.fetch(&mut memory, 4));
    }

    #[test]
    fn misaligned_pc() {
        let mut memory = memory_with_pattern();
        let mut cache = FetchCache::new();
        assert_eq!(
            Err(Trap::InstAddressMisaligned),
            cache.fetch(&mut memory, 2)
        );
    }

    #[test]
    fn fetch_outside_memory() {
        let mut memory = memory_with_pattern();
        let mut cache = FetchCache::new();
        assert_eq!(
            Err(Trap::InstAccessFault),
            cache.fetch(&mut memory, 0x10_0000)
        );
    }
}
