use log::debug;

use crate::config::JournalConfig;
use crate::error::{Error, Result};
use crate::nand::{align_eq, is_aligned, Block, NandDriver, Page, PAGE_NONE};

use super::header::{Header, HEADER_SIZE};

/// Upper bound on the checkpoint group size (2^6 pages).
const MAX_LOG2_PPC: u8 = 6;

/// Journal state flags.
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct Flags {
    /// Pages have been enqueued since the last checkpoint.
    pub dirty: bool,
    /// The dumped-metadata page went bad mid-recovery; marking its block
    /// is deferred until recovery completes.
    pub bad_meta: bool,
    /// A bad-block recovery is in progress.
    pub recovery: bool,
    /// The recovery enumeration has handed out its last page.
    pub enum_done: bool,
}

/// The journal presents the NAND chip as a double-ended queue of pages.
///
/// Pages with associated metadata are pushed onto the head and popped
/// from the tail. Block erasure and metadata checkpointing are handled
/// internally: user pages are grouped into checkpoint groups of
/// `2^log2_ppc` contiguous pages whose trailing page holds the header,
/// the cookie, and the metadata rows for the group's user pages.
///
/// Bad blocks are handled by relocating data to the next good page in
/// sequence. If the head would run onto the block holding the last
/// synced tail, enqueueing fails with `JournalFull`.
pub struct Journal<N: NandDriver> {
    pub(super) nand: N,
    pub(super) config: JournalConfig,

    /// Page-sized buffer accumulating the metadata page for the group
    /// currently under the head.
    pub(super) scratch: Vec<u8>,

    /// Log2 of the checkpoint group size in pages.
    pub(super) log2_ppc: u8,

    /// Incremented whenever the head wraps past the end of the chip.
    pub(super) epoch: u8,

    pub(super) flags: Flags,

    /// Bad-block counters. `bb_last` is the estimate for the chip as a
    /// whole from the previous pass; `bb_current` counts bad blocks seen
    /// before the current head this pass.
    pub(super) bb_current: u32,
    pub(super) bb_last: u32,

    /// The tail points at the oldest live user page, the head at the
    /// next raw page to program. `tail_sync` is the tail as of the last
    /// checkpoint and is what actually frees space.
    pub(super) tail_sync: Page,
    pub(super) tail: Page,
    pub(super) head: Page,

    /// The most recently written user page, or PAGE_NONE when empty.
    pub(super) root: Page,

    /// Recovery enumeration state: `recover_root` is the last valid user
    /// page of the block under recovery, `recover_next` the next page to
    /// hand out, `recover_meta` the page holding dumped metadata (if a
    /// group was open when the block failed).
    pub(super) recover_next: Page,
    pub(super) recover_root: Page,
    pub(super) recover_meta: Page,
}

impl<N: NandDriver> Journal<N> {
    /// Initialize a journal over the given chip. Performs no NAND
    /// operations; call `resume` to pick up any existing state.
    pub fn new(nand: N, config: JournalConfig) -> Journal<N> {
        let log2_ppc = choose_ppc(&config, nand.log2_page_size(), nand.log2_ppb());
        let scratch = vec![0u8; nand.page_size()];

        let mut journal = Journal {
            nand,
            config,
            scratch,
            log2_ppc,
            epoch: 0,
            flags: Flags::default(),
            bb_current: 0,
            bb_last: 0,
            tail_sync: 0,
            tail: 0,
            head: 0,
            root: PAGE_NONE,
            recover_next: PAGE_NONE,
            recover_root: PAGE_NONE,
            recover_meta: PAGE_NONE,
        };
        journal.reset();
        journal
    }

    /// Search the chip for the most recent checkpoint and restore the
    /// journal from it. O(log n) in the number of pages; every other
    /// operation is O(1).
    ///
    /// On failure the journal is left in the empty reset state.
    pub fn resume(&mut self) -> Result<()> {
        let (first, header) = match self.find_checkblock(0) {
            Ok(found) => found,
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };

        // Find the last checkpoint-containing block of the same epoch,
        // then the last programmed group within it.
        self.epoch = header.epoch;
        let last = self.find_last_checkblock(first);
        let last_group = self.find_last_group(last);

        // Linear scan back to the last good checkpoint, which names the
        // root and carries the state to restore.
        let header = match self.find_root(last_group) {
            Ok(header) => header,
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };

        self.tail = header.tail;
        self.bb_current = header.bb_current;
        self.bb_last = header.bb_last;
        self.clear_user_meta();

        // Another linear scan for the next free user page.
        self.find_head(last_group);

        self.flags = Flags::default();
        self.tail_sync = self.tail;
        self.clear_recovery();

        debug!(
            "journal: resumed at epoch {}, head {}, tail {}, root {}",
            self.epoch, self.head, self.tail, self.root
        );
        Ok(())
    }

    /// Upper bound on the number of user pages the journal can hold.
    /// Shrinks as bad blocks are discovered.
    pub fn capacity(&self) -> u32 {
        let max_bad = self.bb_last.max(self.bb_current);
        let good_blocks = self.nand.num_blocks().saturating_sub(max_bad + 1);
        let log2_cpb = self.nand.log2_ppb() - self.log2_ppc;
        let good_cps = good_blocks << log2_cpb;

        // Good checkpoint groups, one metadata page each.
        (good_cps << self.log2_ppc) - good_cps
    }

    /// Upper bound on the number of user pages currently in the journal.
    pub fn size(&self) -> u32 {
        // Count raw pages and checkpoint groups between the synced tail
        // and the head; the difference is the user pages.
        let mut num_pages = self.head;
        let mut num_cps = self.head >> self.log2_ppc;

        if self.head < self.tail_sync {
            let total = self.total_pages();
            num_pages += total;
            num_cps += total >> self.log2_ppc;
        }

        num_pages -= self.tail_sync;
        num_cps -= self.tail_sync >> self.log2_ppc;

        num_pages - num_cps
    }

    /// The most recently written user page, if any.
    pub fn root(&self) -> Option<Page> {
        if self.root == PAGE_NONE {
            None
        } else {
            Some(self.root)
        }
    }

    /// The cookie, a caller-owned payload checkpointed with every journal
    /// header and restored by `resume`.
    pub fn cookie(&self) -> &[u8] {
        &self.scratch[HEADER_SIZE..HEADER_SIZE + self.config.cookie_size]
    }

    /// Mutable access to the cookie. Changes become persistent at the
    /// next checkpoint.
    pub fn cookie_mut(&mut self) -> &mut [u8] {
        &mut self.scratch[HEADER_SIZE..HEADER_SIZE + self.config.cookie_size]
    }

    /// Read the metadata row for a live user page. Resolves against the
    /// in-memory scratch buffer for the group under the head, against the
    /// recovery dump page if one exists, and against the group's metadata
    /// page otherwise.
    pub fn read_meta(&mut self, page: Page, buf: &mut [u8]) -> Result<()> {
        let ppc_mask = (1u32 << self.log2_ppc) - 1;
        let offset = self.user_offset(page & ppc_mask);
        let meta_size = self.config.meta_size;

        if align_eq(page, self.head, self.log2_ppc) {
            buf[..meta_size].copy_from_slice(&self.scratch[offset..offset + meta_size]);
            return Ok(());
        }

        if self.recover_meta != PAGE_NONE && align_eq(page, self.recover_root, self.log2_ppc) {
            return self.nand.read(self.recover_meta, offset, &mut buf[..meta_size]);
        }

        self.nand.read(page | ppc_mask, offset, &mut buf[..meta_size])
    }

    /// Advance the tail past any bad blocks and return the page ready to
    /// be read next, or None if the journal is empty.
    pub fn peek(&mut self) -> Option<Page> {
        if self.head == self.tail {
            return None;
        }

        let log2_ppb = self.nand.log2_ppb();

        if is_aligned(self.tail, log2_ppb) {
            let mut blk = self.tail >> log2_ppb;

            for _ in 0..self.config.max_retries {
                if blk == self.head >> log2_ppb || !self.nand.is_bad(blk) {
                    self.tail = blk << log2_ppb;
                    if self.tail == self.head {
                        self.root = PAGE_NONE;
                    }
                    return Some(self.tail);
                }
                blk = self.next_block(blk);
            }
        }

        Some(self.tail)
    }

    /// Remove the oldest page from the journal. The removal becomes
    /// permanent at the next checkpoint.
    pub fn dequeue(&mut self) {
        if self.head == self.tail {
            return;
        }

        self.tail = self.next_upage(self.tail);

        // A clean dequeue removes data that was durably obsolete, so the
        // space can be reused immediately.
        if !(self.flags.dirty || self.flags.recovery) {
            self.tail_sync = self.tail;
        }

        if self.head == self.tail {
            self.root = PAGE_NONE;
        }
    }

    /// Remove all pages. Takes permanent effect at the next checkpoint.
    pub fn clear(&mut self) {
        self.tail = self.head;
        self.root = PAGE_NONE;
        self.flags.dirty = true;
        self.clear_user_meta();
    }

    /// Append a page to the journal. `data` may be None for a padding
    /// entry with no page contents; `meta` may be None for an all-0xff
    /// metadata row. Not persistent until the group checkpoints.
    ///
    /// May fail with `Recover`, in which case the caller must complete
    /// the assisted recovery procedure and try again. Further failures
    /// during recovery also return `Recover` and restart it.
    pub fn enqueue(&mut self, data: Option<&[u8]>, meta: Option<&[u8]>) -> Result<()> {
        for _ in 0..self.config.max_retries {
            let res = self.prepare_head().and_then(|_| match data {
                Some(data) => self.nand.prog(self.head, data),
                None => Ok(()),
            });

            match res {
                Ok(()) => return self.push_meta(meta),
                Err(e) => self.recover_from(e)?,
            }
        }
        Err(Error::TooBad)
    }

    /// Copy an existing page to the head of the journal under new
    /// metadata. Same persistence and recovery contract as `enqueue`.
    pub fn copy(&mut self, src: Page, meta: Option<&[u8]>) -> Result<()> {
        for _ in 0..self.config.max_retries {
            let res = self
                .prepare_head()
                .and_then(|_| self.nand.copy(src, self.head));

            match res {
                Ok(()) => return self.push_meta(meta),
                Err(e) => self.recover_from(e)?,
            }
        }
        Err(Error::TooBad)
    }

    /// Mark the journal dirty, forcing the next `sync` to checkpoint.
    pub fn mark_dirty(&mut self) {
        self.flags.dirty = true;
    }

    /// Is the journal checkpointed? If so, everything enqueued so far is
    /// persistent.
    pub fn is_clean(&self) -> bool {
        !self.flags.dirty
    }

    // Read-only accessors, mainly for harnesses and invariant checks.

    /// Next raw page to be programmed.
    pub fn head(&self) -> Page {
        self.head
    }

    /// Oldest live user page.
    pub fn tail(&self) -> Page {
        self.tail
    }

    /// Tail as of the last checkpoint.
    pub fn tail_sync(&self) -> Page {
        self.tail_sync
    }

    /// Current epoch counter.
    pub fn epoch(&self) -> u8 {
        self.epoch
    }

    /// Log2 of the checkpoint group size.
    pub fn log2_ppc(&self) -> u8 {
        self.log2_ppc
    }

    /// Bad blocks observed before the current head this pass.
    pub fn bb_current(&self) -> u32 {
        self.bb_current
    }

    /// Bad-block estimate for the chip from the previous pass.
    pub fn bb_last(&self) -> u32 {
        self.bb_last
    }

    /// Configured retry budget.
    pub fn max_retries(&self) -> usize {
        self.config.max_retries
    }

    /// The underlying NAND driver.
    pub fn nand(&self) -> &N {
        &self.nand
    }

    /// Mutable access to the underlying NAND driver.
    pub fn nand_mut(&mut self) -> &mut N {
        &mut self.nand
    }

    /// Consume the journal and hand the driver back.
    pub fn into_nand(self) -> N {
        self.nand
    }
}

// Geometry and setup helpers.
impl<N: NandDriver> Journal<N> {
    pub(super) fn total_pages(&self) -> u32 {
        self.nand.num_blocks() << self.nand.log2_ppb()
    }

    fn next_block(&self, block: Block) -> Block {
        let next = block + 1;
        if next >= self.nand.num_blocks() {
            0
        } else {
            next
        }
    }

    /// The user page following `page`, skipping metadata slots and
    /// wrapping at the end of the chip.
    pub(super) fn next_upage(&self, page: Page) -> Page {
        let mut p = page + 1;

        if is_aligned(p + 1, self.log2_ppc) {
            p += 1;
        }

        if p >= self.total_pages() {
            p = 0;
        }
        p
    }

    /// Move the head to the start of the next block, rolling the
    /// bad-block statistics on wrap-around.
    pub(super) fn skip_block(&mut self) -> Result<()> {
        let log2_ppb = self.nand.log2_ppb();
        let next = self.next_block(self.head >> log2_ppb);

        // We can't roll onto the same block as the tail.
        if self.tail_sync >> log2_ppb == next {
            return Err(Error::JournalFull);
        }

        self.head = next << log2_ppb;
        if self.head == 0 {
            self.roll_stats();
        }
        Ok(())
    }

    pub(super) fn roll_stats(&mut self) {
        self.bb_last = self.bb_current;
        self.bb_current = 0;
        self.epoch = self.epoch.wrapping_add(1);
    }

    /// Byte offset of a user page's metadata row within its group's
    /// metadata page.
    pub(super) fn user_offset(&self, which: u32) -> usize {
        HEADER_SIZE + self.config.cookie_size + which as usize * self.config.meta_size
    }

    /// Reset all metadata rows in the scratch buffer to the erased state,
    /// leaving the header and cookie alone.
    pub(super) fn clear_user_meta(&mut self) {
        let start = HEADER_SIZE + self.config.cookie_size;
        self.scratch[start..].fill(0xff);
    }

    /// Set up an empty journal.
    fn reset(&mut self) {
        // No bad block estimate yet, so guess conservatively.
        self.epoch = 0;
        self.bb_last = self.nand.num_blocks() >> 6;
        self.bb_current = 0;
        self.flags = Flags::default();

        self.head = 0;
        self.tail = 0;
        self.tail_sync = 0;
        self.root = PAGE_NONE;

        self.clear_recovery();
        self.scratch.fill(0xff);
    }
}

// Resume scan helpers.
impl<N: NandDriver> Journal<N> {
    /// Find the first checkpoint-containing block at or after `blk`. If a
    /// block contains any checkpoint at all it contains one in the first
    /// group position, since it would otherwise have been erasable.
    ///
    /// Reads the candidate metadata page into the scratch buffer; a read
    /// error or missing magic means "no checkpoint here" and the scan
    /// moves on.
    fn find_checkblock(&mut self, mut blk: Block) -> Result<(Block, Header)> {
        for _ in 0..self.config.max_retries {
            if blk >= self.nand.num_blocks() {
                break;
            }

            let p = (blk << self.nand.log2_ppb()) | ((1u32 << self.log2_ppc) - 1);

            if !self.nand.is_bad(blk) && self.nand.read(p, 0, &mut self.scratch).is_ok() {
                if let Some(header) = Header::decode(&self.scratch) {
                    return Ok((blk, header));
                }
            }
            blk += 1;
        }

        Err(Error::TooBad)
    }

    /// Binary search for the highest-numbered block still carrying a
    /// checkpoint of the current epoch.
    fn find_last_checkblock(&mut self, first: Block) -> Block {
        let mut low = first;
        let mut high = self.nand.num_blocks() - 1;

        while low <= high {
            let mid = (low + high) >> 1;

            match self.find_checkblock(mid) {
                Ok((found, header)) if header.epoch == self.epoch => {
                    if found + 1 >= self.nand.num_blocks() {
                        return found;
                    }
                    match self.find_checkblock(found + 1) {
                        Ok((next, header)) if header.epoch == self.epoch => low = next,
                        _ => return found,
                    }
                }
                _ => {
                    if mid == 0 {
                        return first;
                    }
                    high = mid - 1;
                }
            }
        }

        first
    }

    /// Is this checkpoint group fit for reprogramming?
    ///
    /// `is_free` may have no way to tell an unprogrammed page from one
    /// programmed with all-0xff bytes, so every page of the group is
    /// probed: a completed group always has non-0xff bytes in its
    /// trailing metadata page, and a partially programmed group with
    /// some all-0xff user pages changes nothing for us.
    fn cp_free(&mut self, first_user: Page) -> bool {
        let count = 1u32 << self.log2_ppc;
        (0..count).all(|i| self.nand.is_free(first_user + i))
    }

    /// Binary search for the last programmed checkpoint group in a
    /// block. Once a group is completely unprogrammed, everything after
    /// it is too.
    fn find_last_group(&mut self, blk: Block) -> Page {
        let num_groups = 1i32 << (self.nand.log2_ppb() - self.log2_ppc);
        let mut low = 0i32;
        let mut high = num_groups - 1;

        while low <= high {
            let mid = (low + high) >> 1;
            let page = ((mid as u32) << self.log2_ppc) | (blk << self.nand.log2_ppb());

            if self.cp_free(page) {
                high = mid - 1;
            } else if mid + 1 >= num_groups || self.cp_free(page + (1u32 << self.log2_ppc)) {
                return page;
            } else {
                low = mid + 1;
            }
        }

        blk << self.nand.log2_ppb()
    }

    /// Scan backward over the groups of the root block for the last good
    /// checkpoint, setting the journal root and returning the restored
    /// header. Leaves the checkpoint page in the scratch buffer so the
    /// cookie survives.
    fn find_root(&mut self, start: Page) -> Result<Header> {
        let log2_ppb = self.nand.log2_ppb();
        let blk = start >> log2_ppb;
        let mut group = ((start & ((1u32 << log2_ppb) - 1)) >> self.log2_ppc) as i32;

        while group >= 0 {
            let page = (blk << log2_ppb) + ((group as u32 + 1) << self.log2_ppc) - 1;

            if self.nand.read(page, 0, &mut self.scratch).is_ok() {
                if let Some(header) = Header::decode(&self.scratch) {
                    if header.epoch == self.epoch {
                        self.root = page - 1;
                        return Ok(header);
                    }
                }
            }
            group -= 1;
        }

        Err(Error::TooBad)
    }

    /// Starting from the last good checkpoint, find either the next free
    /// user page in the same block or the first page of the next block.
    /// The block we land on may be bad; that is dealt with when the next
    /// write prepares the head.
    fn find_head(&mut self, start: Page) {
        let log2_ppb = self.nand.log2_ppb();
        self.head = start;

        loop {
            self.head = self.next_upage(self.head);
            if self.head == 0 {
                self.roll_stats();
            }

            // If we hit the end of the block, we're done. Make sure we
            // don't chase over the tail.
            if is_aligned(self.head, log2_ppb) {
                if align_eq(self.head, self.tail, log2_ppb) {
                    self.tail = self.next_block(self.tail >> log2_ppb) << log2_ppb;
                }
                break;
            }

            if self.cp_free(self.head) {
                break;
            }
        }
    }
}

// Write path.
impl<N: NandDriver> Journal<N> {
    /// Make sure the head is on a ready-to-program page, erasing on block
    /// entry and skipping bad blocks.
    pub(super) fn prepare_head(&mut self) -> Result<()> {
        let log2_ppb = self.nand.log2_ppb();
        let next = self.next_upage(self.head);

        // Refuse to write if doing so would roll the head onto the same
        // block as the last-synced tail.
        if align_eq(next, self.tail_sync, log2_ppb) && !align_eq(next, self.head, log2_ppb) {
            return Err(Error::JournalFull);
        }

        self.flags.dirty = true;
        if !is_aligned(self.head, log2_ppb) {
            return Ok(());
        }

        for _ in 0..self.config.max_retries {
            let blk = self.head >> log2_ppb;

            if !self.nand.is_bad(blk) {
                return self.nand.erase(blk);
            }

            self.bb_current += 1;
            self.skip_block()?;
        }

        Err(Error::TooBad)
    }

    /// Record the metadata row for the page just written at the head and
    /// advance. When the row completes a group, the header is filled in
    /// and the scratch buffer is programmed as the group's metadata page,
    /// checkpointing the journal.
    pub(super) fn push_meta(&mut self, meta: Option<&[u8]>) -> Result<()> {
        let old_head = self.head;
        let offset = self.user_offset(self.head & ((1u32 << self.log2_ppc) - 1));
        let row = &mut self.scratch[offset..offset + self.config.meta_size];

        match meta {
            Some(meta) => row.copy_from_slice(meta),
            None => row.fill(0xff),
        }

        // Unless the group is now full, no I/O is needed.
        if !is_aligned(self.head + 2, self.log2_ppc) {
            self.root = self.head;
            self.head += 1;
            return Ok(());
        }

        // No need to check for an immediate recover here: the metadata
        // page is never block-aligned.
        Header {
            epoch: self.epoch,
            tail: self.tail,
            bb_current: self.bb_current,
            bb_last: self.bb_last,
        }
        .encode(&mut self.scratch[..HEADER_SIZE]);

        if let Err(e) = self.nand.prog(self.head + 1, &self.scratch) {
            return self.recover_from(e);
        }

        self.flags.dirty = false;
        self.root = old_head;
        self.head = self.next_upage(self.head);
        if self.head == 0 {
            self.roll_stats();
        }

        if self.flags.enum_done {
            self.finish_recovery();
        }

        if !self.flags.recovery {
            self.tail_sync = self.tail;
        }

        Ok(())
    }
}

/// The largest group size such that one header, one cookie and the
/// metadata rows for the group's user pages fit in a single page.
fn choose_ppc(config: &JournalConfig, log2_page_size: u8, log2_ppb: u8) -> u8 {
    let max = log2_ppb.min(MAX_LOG2_PPC);
    let max_meta = (1usize << log2_page_size) - HEADER_SIZE - config.cookie_size;
    let mut total_meta = config.meta_size;
    let mut ppc = 1;

    while ppc < max {
        total_meta = (total_meta << 1) + config.meta_size;
        if total_meta > max_meta {
            break;
        }
        ppc += 1;
    }
    ppc
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{
        check_invariants, dequeue_sequence, enqueue_sequence, sim_journal, suspend_resume,
    };
    use super::*;
    use crate::sim::SimNand;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn test_choose_ppc() {
        let config = JournalConfig::default();
        // 512-byte pages hold 3 rows plus header and cookie.
        assert_eq!(choose_ppc(&config, 9, 3), 2);
        // 2048-byte pages hold 15 rows.
        assert_eq!(choose_ppc(&config, 11, 6), 4);
        // Never larger than the block itself.
        assert_eq!(choose_ppc(&config, 14, 2), 2);
    }

    #[test]
    fn test_initial_state() {
        let journal = sim_journal(SimNand::default());

        assert_eq!(journal.log2_ppc(), 2);
        assert_eq!(journal.size(), 0);
        assert_eq!(journal.root(), None);
        assert!(journal.is_clean());
        assert!(!journal.in_recovery());
        // 113 blocks, one reserved, one guessed bad, 6 user pages each.
        assert_eq!(journal.capacity(), 666);
        check_invariants(&journal);
    }

    #[test]
    fn test_empty_peek_dequeue() {
        let mut journal = sim_journal(SimNand::default());
        assert_eq!(journal.peek(), None);
        journal.dequeue();
        assert_eq!(journal.size(), 0);
        check_invariants(&journal);
    }

    #[test]
    fn test_enqueue_updates_root_meta() {
        let mut journal = sim_journal(SimNand::default());
        let count = enqueue_sequence(&mut journal, 0, Some(30));
        assert_eq!(count, 30);
        assert!(journal.size() >= 30);
    }

    #[test]
    fn test_fill_and_drain() {
        let mut rng = SmallRng::seed_from_u64(2);
        let mut nand = SimNand::default();
        nand.inject_bad(&mut rng, 20);

        let mut journal = sim_journal(nand);

        for rep in 0..20 {
            let count = enqueue_sequence(&mut journal, rep * 100, Some(100));
            assert_eq!(count, 100);
            dequeue_sequence(&mut journal, rep * 100, 100);
        }
        assert_eq!(journal.size(), 0);
    }

    #[test]
    fn test_fill_and_drain_with_resume() {
        let mut rng = SmallRng::seed_from_u64(3);
        let mut nand = SimNand::default();
        nand.inject_bad(&mut rng, 20);

        let mut journal = sim_journal(nand);

        for rep in 0..20 {
            let mut count = enqueue_sequence(&mut journal, rep * 200, Some(100));
            assert_eq!(count, 100);

            // Top up to a checkpoint: only checkpointed pages survive a
            // suspend.
            while !journal.is_clean() {
                let c = enqueue_sequence(&mut journal, rep * 200 + count, Some(1));
                assert_eq!(c, 1);
                count += 1;
            }

            let (head, tail, root) = (journal.head(), journal.tail(), journal.root());
            journal = suspend_resume(journal);
            assert_eq!(journal.head(), head);
            assert_eq!(journal.tail(), tail);
            assert_eq!(journal.root(), root);

            dequeue_sequence(&mut journal, rep * 200, count);
        }
    }

    #[test]
    fn test_fill_to_capacity_and_refill() {
        // Fill until the journal refuses, drain everything, force the
        // tail sync forward, repeat. Draining must free all the space a
        // pass consumed: after the first pass the counts settle to a
        // fixed point and never shrink.
        let mut journal = sim_journal(SimNand::default());
        let mut counts = Vec::new();

        for _ in 0..4 {
            let count = enqueue_sequence(&mut journal, 0, None);
            assert!(count as u32 > journal.capacity() - 16);
            dequeue_sequence(&mut journal, 0, count);
            journal.tail_sync = journal.tail;
            counts.push(count);
        }

        assert_eq!(counts[1], counts[2]);
        assert_eq!(counts[2], counts[3]);
    }

    #[test]
    fn test_resume_after_epoch_wrap() {
        // Run the head past the end of the chip, then make sure a resume
        // lands on the new epoch and still finds the newest pages.
        let mut journal = sim_journal(SimNand::default());
        let total = 678;

        let count = enqueue_sequence(&mut journal, 0, Some(600));
        assert_eq!(count, 600);
        dequeue_sequence(&mut journal, 0, 550);
        let count = enqueue_sequence(&mut journal, 600, Some(total - 600));
        assert_eq!(count, total - 600);
        assert_eq!(journal.epoch(), 1);

        journal = suspend_resume(journal);
        assert_eq!(journal.epoch(), 1);
        dequeue_sequence(&mut journal, 550, total - 550);
        assert_eq!(journal.size(), 0);
    }

    #[test]
    fn test_resume_blank_chip_fails_clean() {
        let mut journal = sim_journal(SimNand::default());
        assert_eq!(journal.resume(), Err(Error::TooBad));
        assert_eq!(journal.size(), 0);
        assert_eq!(journal.root(), None);
        // And again, to the same effect.
        assert_eq!(journal.resume(), Err(Error::TooBad));
        check_invariants(&journal);
    }

    #[test]
    fn test_resume_is_idempotent() {
        let mut journal = sim_journal(SimNand::default());
        enqueue_sequence(&mut journal, 0, Some(30));

        journal = suspend_resume(journal);
        let (head, tail, root) = (journal.head(), journal.tail(), journal.root());

        journal.resume().expect("second resume failed");
        assert_eq!(journal.head(), head);
        assert_eq!(journal.tail(), tail);
        assert_eq!(journal.root(), root);
    }

    #[test]
    fn test_cookie_persists_across_resume() {
        let mut journal = sim_journal(SimNand::default());
        journal.cookie_mut().copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        // The cookie rides along with the next checkpoint.
        enqueue_sequence(&mut journal, 0, Some(6));

        journal = suspend_resume(journal);
        assert_eq!(journal.cookie(), &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_clear_drops_contents() {
        let mut journal = sim_journal(SimNand::default());
        enqueue_sequence(&mut journal, 0, Some(20));

        journal.clear();
        assert_eq!(journal.root(), None);
        assert_eq!(journal.peek(), None);
        assert!(!journal.is_clean());
        check_invariants(&journal);
    }
}
