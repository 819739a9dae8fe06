use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::error::{Error, Result};
use crate::nand::{Block, NandDriver, Page};

// Default simulated geometry: 512-byte pages, 8 pages per block, 113
// blocks. Small enough that the journal wraps quickly under test.
pub const LOG2_PAGE_SIZE: u8 = 9;
pub const LOG2_PAGES_PER_BLOCK: u8 = 3;
pub const NUM_BLOCKS: u32 = 113;
pub const PAGE_SIZE: usize = 1 << LOG2_PAGE_SIZE;

const BLOCK_BAD_MARK: u8 = 0x01;
const BLOCK_FAILED: u8 = 0x02;

#[derive(Clone, Copy)]
struct BlockState {
    flags: u8,
    // Index of the next unprogrammed page. Zero for a freshly erased
    // block, the pages-per-block count for a full one.
    next_page: u32,
    // Operations until permanent failure. Zero means disarmed.
    timebomb: u32,
}

/// NAND operation counters, for tests that want to bound or compare I/O.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub is_bad: usize,
    pub mark_bad: usize,
    pub erase: usize,
    pub erase_fail: usize,
    pub is_free: usize,
    pub prog: usize,
    pub prog_fail: usize,
    pub read: usize,
    pub read_bytes: usize,
}

/// An in-memory NAND chip with fault injection.
///
/// Blocks can be pre-marked bad, set to fail outright, or armed with a
/// timebomb that fires after a number of erase/program operations.
/// Failed operations scramble the affected range the way interrupted
/// flash writes do. Driver contract violations (programming out of
/// order, touching a block marked bad) panic.
pub struct SimNand {
    log2_page_size: u8,
    log2_ppb: u8,
    num_blocks: u32,
    data: Vec<u8>,
    blocks: Vec<BlockState>,
    stats: Stats,
    frozen: bool,
}

impl SimNand {
    /// Create a chip with the given geometry, filled with stale garbage
    /// so that every block needs an erase before use.
    pub fn new(log2_page_size: u8, log2_ppb: u8, num_blocks: u32) -> Self {
        let block_size = 1usize << (log2_page_size + log2_ppb);

        SimNand {
            log2_page_size,
            log2_ppb,
            num_blocks,
            data: vec![0x55; block_size * num_blocks as usize],
            blocks: vec![
                BlockState {
                    flags: 0,
                    next_page: 1 << log2_ppb,
                    timebomb: 0,
                };
                num_blocks as usize
            ],
            stats: Stats::default(),
            frozen: false,
        }
    }

    /// Make a block fail all future erase and program operations.
    pub fn set_failed(&mut self, block: Block) {
        self.blocks[block as usize].flags |= BLOCK_FAILED;
    }

    /// Arm a block to fail permanently after `ttl` more erase or program
    /// operations.
    pub fn set_timebomb(&mut self, block: Block, ttl: u32) {
        self.blocks[block as usize].timebomb = ttl;
    }

    /// Mark `count` randomly chosen blocks as factory-bad: flagged bad
    /// and failing.
    pub fn inject_bad(&mut self, rng: &mut SmallRng, count: usize) {
        for _ in 0..count {
            let block = rng.gen_range(0..self.num_blocks) as usize;
            self.blocks[block].flags |= BLOCK_BAD_MARK | BLOCK_FAILED;
        }
    }

    /// Make `count` randomly chosen blocks fail without being marked,
    /// the way blocks wear out in the field.
    pub fn inject_failed(&mut self, rng: &mut SmallRng, count: usize) {
        for _ in 0..count {
            let block = rng.gen_range(0..self.num_blocks);
            self.set_failed(block);
        }
    }

    /// Arm timebombs with ttl in `1..=max_ttl` on `count` randomly
    /// chosen blocks.
    pub fn inject_timebombs(&mut self, rng: &mut SmallRng, count: usize, max_ttl: u32) {
        for _ in 0..count {
            let block = rng.gen_range(0..self.num_blocks);
            let ttl = rng.gen_range(1..=max_ttl);
            self.set_timebomb(block, ttl);
        }
    }

    /// Stop counting operations, for checks that shouldn't show up in
    /// the numbers.
    pub fn freeze_stats(&mut self) {
        self.frozen = true;
    }

    /// Resume counting operations.
    pub fn thaw_stats(&mut self) {
        self.frozen = false;
    }

    /// Operation counters so far.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    fn timebomb_tick(&mut self, block: usize) {
        if self.blocks[block].timebomb != 0 {
            self.blocks[block].timebomb -= 1;
            if self.blocks[block].timebomb == 0 {
                self.blocks[block].flags |= BLOCK_FAILED;
            }
        }
    }
}

impl Default for SimNand {
    fn default() -> Self {
        SimNand::new(LOG2_PAGE_SIZE, LOG2_PAGES_PER_BLOCK, NUM_BLOCKS)
    }
}

impl NandDriver for SimNand {
    fn log2_page_size(&self) -> u8 {
        self.log2_page_size
    }

    fn log2_ppb(&self) -> u8 {
        self.log2_ppb
    }

    fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    fn is_bad(&mut self, block: Block) -> bool {
        assert!(block < self.num_blocks, "is_bad on invalid block {block}");
        if !self.frozen {
            self.stats.is_bad += 1;
        }
        self.blocks[block as usize].flags & BLOCK_BAD_MARK != 0
    }

    fn mark_bad(&mut self, block: Block) {
        assert!(block < self.num_blocks, "mark_bad on invalid block {block}");
        if !self.frozen {
            self.stats.mark_bad += 1;
        }
        self.blocks[block as usize].flags |= BLOCK_BAD_MARK;
    }

    fn erase(&mut self, block: Block) -> Result<()> {
        assert!(block < self.num_blocks, "erase on invalid block {block}");
        assert!(
            self.blocks[block as usize].flags & BLOCK_BAD_MARK == 0,
            "erase on block {block} which is marked bad"
        );

        if !self.frozen {
            self.stats.erase += 1;
        }

        let block = block as usize;
        let block_size = 1usize << (self.log2_page_size + self.log2_ppb);
        let start = block * block_size;

        self.blocks[block].next_page = 0;
        self.timebomb_tick(block);

        if self.blocks[block].flags & BLOCK_FAILED != 0 {
            if !self.frozen {
                self.stats.erase_fail += 1;
            }
            seq_gen(
                (block * 57 + 29) as u64,
                &mut self.data[start..start + block_size],
            );
            return Err(Error::BadBlock);
        }

        self.data[start..start + block_size].fill(0xff);
        Ok(())
    }

    fn prog(&mut self, page: Page, data: &[u8]) -> Result<()> {
        let block = (page >> self.log2_ppb) as usize;
        let pageno = page & ((1 << self.log2_ppb) - 1);
        let start = (page as usize) << self.log2_page_size;
        let page_size = self.page_size();

        assert!(block < self.num_blocks as usize, "prog on invalid block {block}");
        assert!(
            self.blocks[block].flags & BLOCK_BAD_MARK == 0,
            "prog on block {block} which is marked bad"
        );
        assert!(
            pageno >= self.blocks[block].next_page,
            "out-of-order program of block {block}: page {pageno}, expected {}",
            self.blocks[block].next_page
        );

        if !self.frozen {
            self.stats.prog += 1;
        }

        self.blocks[block].next_page = pageno + 1;
        self.timebomb_tick(block);

        if self.blocks[block].flags & BLOCK_FAILED != 0 {
            if !self.frozen {
                self.stats.prog_fail += 1;
            }
            seq_gen(
                (page * 57 + 29) as u64,
                &mut self.data[start..start + page_size],
            );
            return Err(Error::BadBlock);
        }

        self.data[start..start + page_size].copy_from_slice(data);
        Ok(())
    }

    fn is_free(&mut self, page: Page) -> bool {
        let block = (page >> self.log2_ppb) as usize;
        let pageno = page & ((1 << self.log2_ppb) - 1);
        assert!(block < self.num_blocks as usize, "is_free on invalid block {block}");

        if !self.frozen {
            self.stats.is_free += 1;
        }
        self.blocks[block].next_page <= pageno
    }

    fn read(&mut self, page: Page, offset: usize, buf: &mut [u8]) -> Result<()> {
        let block = (page >> self.log2_ppb) as usize;
        let start = ((page as usize) << self.log2_page_size) + offset;

        assert!(block < self.num_blocks as usize, "read on invalid block {block}");
        assert!(
            offset + buf.len() <= self.page_size(),
            "read past page end: offset {offset}, length {}",
            buf.len()
        );

        if !self.frozen {
            self.stats.read += 1;
            self.stats.read_bytes += buf.len();
        }

        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn copy(&mut self, src: Page, dst: Page) -> Result<()> {
        let mut buf = vec![0u8; self.page_size()];
        self.read(src, 0, &mut buf)?;
        self.prog(dst, &buf)
    }
}

/// Fill a buffer with the byte stream for the given seed.
pub fn seq_gen(seed: u64, buf: &mut [u8]) {
    let mut rng = SmallRng::seed_from_u64(seed);
    rng.fill_bytes(buf);
}

/// Assert that a buffer holds exactly the byte stream for the given seed.
pub fn seq_assert(seed: u64, buf: &[u8]) {
    let mut expected = vec![0u8; buf.len()];
    seq_gen(seed, &mut expected);
    assert!(buf == expected, "seeded sequence mismatch for seed {seed}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn test_prog_read_roundtrip() {
        // Program a deterministic stream into every page of every good
        // block, then read everything back.
        let mut rng = SmallRng::seed_from_u64(1);
        let mut nand = SimNand::default();
        nand.inject_bad(&mut rng, 5);

        let ppb = 1u32 << LOG2_PAGES_PER_BLOCK;
        let mut buf = [0u8; PAGE_SIZE];

        for block in 0..NUM_BLOCKS {
            if nand.is_bad(block) {
                continue;
            }
            nand.erase(block).expect("erase failed");

            for pageno in 0..ppb {
                let page = block * ppb + pageno;
                seq_gen(page as u64, &mut buf);
                nand.prog(page, &buf).expect("prog failed");
            }
        }

        for block in 0..NUM_BLOCKS {
            if nand.is_bad(block) {
                continue;
            }
            for pageno in 0..ppb {
                let page = block * ppb + pageno;
                nand.read(page, 0, &mut buf).expect("read failed");
                seq_assert(page as u64, &buf);
            }
        }
    }

    #[test]
    fn test_is_free_tracks_programming() {
        let mut nand = SimNand::default();

        // A fresh chip reads as stale garbage, nothing is free.
        assert!(!nand.is_free(0));

        nand.erase(0).expect("erase failed");
        assert!(nand.is_free(0));
        assert!(nand.is_free(7));

        let buf = [0xabu8; PAGE_SIZE];
        nand.prog(0, &buf).expect("prog failed");
        assert!(!nand.is_free(0));
        assert!(nand.is_free(1));
    }

    #[test]
    fn test_failed_block_reports_bad_block() {
        let mut nand = SimNand::default();
        nand.set_failed(3);

        assert_eq!(nand.erase(3), Err(Error::BadBlock));
        // The failure is not a bad-block mark; that is the caller's call.
        assert!(!nand.is_bad(3));
    }

    #[test]
    fn test_timebomb_fires_after_ttl() {
        let mut nand = SimNand::default();
        nand.set_timebomb(0, 2);

        let buf = [0u8; PAGE_SIZE];
        nand.erase(0).expect("first operation should survive");
        assert_eq!(nand.prog(0, &buf), Err(Error::BadBlock));
        // The page contents were scrambled, not left erased.
        let mut check = [0u8; PAGE_SIZE];
        nand.read(0, 0, &mut check).expect("read failed");
        assert!(check.iter().any(|&b| b != 0xff));
    }

    #[test]
    #[should_panic(expected = "out-of-order")]
    fn test_out_of_order_prog_panics() {
        let mut nand = SimNand::default();
        nand.erase(0).expect("erase failed");

        let buf = [0u8; PAGE_SIZE];
        nand.prog(1, &buf).expect("prog failed");
        let _ = nand.prog(0, &buf);
    }

    #[test]
    fn test_copy_moves_page_contents() {
        let mut nand = SimNand::default();
        nand.erase(0).expect("erase failed");
        nand.erase(1).expect("erase failed");

        let mut buf = [0u8; PAGE_SIZE];
        seq_gen(99, &mut buf);
        nand.prog(0, &buf).expect("prog failed");

        nand.copy(0, 8).expect("copy failed");
        let mut check = [0u8; PAGE_SIZE];
        nand.read(8, 0, &mut check).expect("read failed");
        seq_assert(99, &check);
    }
}
