use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::config::{JournalConfig, MapConfig};
use crate::error::{Error, Result};
use crate::journal::Journal;
use crate::nand::{NandDriver, Page, PAGE_NONE};

use super::meta::{self, radix_bit, Sector, META_SIZE, RADIX_DEPTH, SECTOR_NONE};

/// The map exposes randomly writable logical sectors on top of the
/// journal. Every user page carries its sector id and one alt pointer
/// per id bit, which together form a binary radix trie rooted at the
/// newest page in the journal: each write appends a page whose metadata
/// re-roots the trie, so lookup, write and delete all cost one path.
///
/// Old representations of a sector become garbage and are reclaimed by
/// copying still-live pages forward from the tail, interleaved with user
/// writes according to the configured GC ratio.
pub struct Map<N: NandDriver> {
    journal: Journal<N>,
    gc_ratio: u8,
    count: Sector,
}

impl<N: NandDriver> Map<N> {
    /// Initialize a map over the given chip. Performs no NAND
    /// operations; call `resume` to pick up any existing state.
    pub fn new(nand: N, config: MapConfig) -> Map<N> {
        let journal_config = JournalConfig::default()
            .meta_size(META_SIZE)
            .cookie_size(config.cookie_size.max(4))
            .max_retries(config.max_retries);

        Map {
            journal: Journal::new(nand, journal_config),
            gc_ratio: config.gc_ratio.max(1),
            count: 0,
        }
    }

    /// Recover stored state from the chip. If no valid state is found,
    /// an error is returned and the map comes up empty.
    pub fn resume(&mut self) -> Result<()> {
        if let Err(e) = self.journal.resume() {
            self.count = 0;
            return Err(e);
        }

        self.count = LittleEndian::read_u32(&self.journal.cookie()[..4]);
        debug!("map: resumed with {} sectors", self.count);
        Ok(())
    }

    /// Delete all sectors.
    pub fn clear(&mut self) {
        if self.count != 0 {
            self.count = 0;
            self.journal.clear();
        }
    }

    /// Number of sectors the map can hold. May be zero if the garbage
    /// collection reserve and the bad-block safety margin exceed the
    /// journal's capacity.
    pub fn capacity(&self) -> Sector {
        let cap = self.journal.capacity();
        let reserve = cap / (self.gc_ratio as u32 + 1);
        let safety_margin = (self.journal.max_retries() as u32) << self.journal.nand().log2_ppb();

        cap.saturating_sub(reserve + safety_margin)
    }

    /// Number of sectors currently mapped.
    pub fn size(&self) -> Sector {
        self.count
    }

    /// Find the physical page currently holding a sector.
    pub fn find(&mut self, target: Sector) -> Result<Page> {
        self.trace_path(target, None)
    }

    /// Read a logical sector into a page-sized buffer. An unmapped
    /// sector reads as a blank (all 0xff) page.
    pub fn read(&mut self, sector: Sector, data: &mut [u8]) -> Result<()> {
        match self.find(sector) {
            Ok(page) => self.journal.nand_mut().read(page, 0, data),
            Err(Error::NotFound) => {
                data.fill(0xff);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Write a full page of data to a logical sector.
    pub fn write(&mut self, dst: Sector, data: &[u8]) -> Result<()> {
        let mut meta = [0u8; META_SIZE];

        loop {
            let old_count = self.count;
            self.prepare_write(dst, &mut meta)?;

            match self.journal.enqueue(Some(data), Some(&meta)) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.count = old_count;
                    self.try_recover(e)?;
                }
            }
        }
    }

    /// Map a logical sector to the contents of any physical page.
    pub fn copy_page(&mut self, src: Page, dst: Sector) -> Result<()> {
        let mut meta = [0u8; META_SIZE];

        loop {
            let old_count = self.count;
            self.prepare_write(dst, &mut meta)?;

            match self.journal.copy(src, Some(&meta)) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.count = old_count;
                    self.try_recover(e)?;
                }
            }
        }
    }

    /// Copy one sector to another. If the source is unmapped, the
    /// destination is trimmed.
    pub fn copy_sector(&mut self, src: Sector, dst: Sector) -> Result<()> {
        match self.find(src) {
            Ok(page) => self.copy_page(page, dst),
            Err(Error::NotFound) => self.trim(dst),
            Err(e) => Err(e),
        }
    }

    /// Delete a logical sector. Not required before rewriting, but a
    /// useful hint when the sector's data is no longer needed.
    pub fn trim(&mut self, sector: Sector) -> Result<()> {
        loop {
            self.auto_gc()?;

            match self.try_delete(sector) {
                Ok(()) => return Ok(()),
                Err(e) => self.try_recover(e)?,
            }
        }
    }

    /// Synchronize the map. When this returns Ok, all changes so far are
    /// durable; nothing is promised about unsynchronized changes.
    pub fn sync(&mut self) -> Result<()> {
        while !self.journal.is_clean() {
            let res = match self.journal.peek() {
                None => self.pad_queue(),
                Some(page) => {
                    // The tail page is dropped only once its live data
                    // (if any) has definitely been copied forward.
                    let res = self.raw_gc(page);
                    if res.is_ok() {
                        self.journal.dequeue();
                    }
                    res
                }
            };

            if let Err(e) = res {
                self.try_recover(e)?;
            }
        }
        Ok(())
    }

    /// Run one garbage collection step. Never required: collection
    /// happens automatically, interleaved with writes and trims.
    pub fn gc(&mut self) -> Result<()> {
        if self.count == 0 {
            return Ok(());
        }

        loop {
            let tail = match self.journal.peek() {
                Some(page) => page,
                None => break,
            };

            match self.raw_gc(tail) {
                Ok(()) => {
                    self.journal.dequeue();
                    break;
                }
                Err(e) => self.try_recover(e)?,
            }
        }
        Ok(())
    }

    /// The underlying journal, exposed for harnesses and invariant
    /// checks.
    pub fn journal(&self) -> &Journal<N> {
        &self.journal
    }

    /// Mutable access to the underlying journal.
    pub fn journal_mut(&mut self) -> &mut Journal<N> {
        &mut self.journal
    }
}

// Index maintenance.
impl<N: NandDriver> Map<N> {
    /// Trace the path from the trie root to the given sector, returning
    /// the physical page holding it.
    ///
    /// When `new_meta` is given it is filled with an up-to-date path: at
    /// every level where the descent stayed on the matching branch the
    /// current page's alt pointer is carried over, and at every level
    /// where it diverged the page we left becomes the alt. A page
    /// written under the resulting row supersedes the sector while
    /// keeping every other subtree reachable.
    ///
    /// If the sector can't be found, the remaining levels are filled
    /// with "none" and `NotFound` is returned.
    fn trace_path(&mut self, target: Sector, mut new_meta: Option<&mut [u8]>) -> Result<Page> {
        let mut meta = [0u8; META_SIZE];
        let mut depth = 0;

        if let Some(m) = new_meta.as_deref_mut() {
            meta::set_id(m, target);
        }

        let mut p = match self.journal.root() {
            Some(p) => p,
            None => return trace_not_found(new_meta, depth),
        };

        self.journal.read_meta(p, &mut meta)?;

        while depth < RADIX_DEPTH {
            let id = meta::id(&meta);

            if id == SECTOR_NONE {
                return trace_not_found(new_meta, depth);
            }

            if (target ^ id) & radix_bit(depth) != 0 {
                if let Some(m) = new_meta.as_deref_mut() {
                    meta::set_alt(m, depth, p);
                }

                p = meta::alt(&meta, depth);
                if p == PAGE_NONE {
                    return trace_not_found(new_meta, depth + 1);
                }

                self.journal.read_meta(p, &mut meta)?;
            } else if let Some(m) = new_meta.as_deref_mut() {
                meta::set_alt(m, depth, meta::alt(&meta, depth));
            }

            depth += 1;
        }

        Ok(p)
    }

    /// Check the given page. If it's garbage, do nothing; otherwise
    /// rewrite it at the head under a refreshed path. Journal errors are
    /// returned raw, with no recovery attempted here.
    fn raw_gc(&mut self, src: Page) -> Result<()> {
        let mut meta = [0u8; META_SIZE];

        self.journal.read_meta(src, &mut meta)?;

        // Filler pages have nothing to keep.
        let target = meta::id(&meta);
        if target == SECTOR_NONE {
            return Ok(());
        }

        // Find where the sector this page once held lives now, if
        // anywhere.
        let current = match self.trace_path(target, Some(&mut meta)) {
            Ok(page) => page,
            Err(Error::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };

        // A superseded page is garbage too.
        if current != src {
            return Ok(());
        }

        self.write_count_cookie(self.count);
        self.journal.copy(src, Some(&meta))
    }

    /// Feed the journal one entry without changing any mapping: copy the
    /// root forward under its own metadata, or enqueue a filler entry if
    /// the journal is empty.
    fn pad_queue(&mut self) -> Result<()> {
        let mut root_meta = [0u8; META_SIZE];

        self.write_count_cookie(self.count);

        let root = match self.journal.root() {
            Some(page) => page,
            None => return self.journal.enqueue(None, None),
        };

        self.journal.read_meta(root, &mut root_meta)?;
        self.journal.copy(root, Some(&root_meta))
    }

    /// Drive the journal's recovery procedure to completion, requeueing
    /// each recoverable page that still holds live data.
    fn try_recover(&mut self, cause: Error) -> Result<()> {
        if cause != Error::Recover {
            return Err(cause);
        }

        let mut restarts = 0;

        while self.journal.in_recovery() {
            let res = match self.journal.next_recoverable() {
                None => self.pad_queue(),
                Some(page) => self.raw_gc(page),
            };

            match res {
                Ok(()) => {}
                Err(Error::Recover) => {
                    if restarts >= self.journal.max_retries() {
                        warn!("map: recovery restarted {restarts} times, giving up");
                        return Err(Error::TooBad);
                    }
                    restarts += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn auto_gc(&mut self) -> Result<()> {
        if self.journal.size() < self.capacity() {
            return Ok(());
        }

        for _ in 0..self.gc_ratio {
            self.gc()?;
        }
        Ok(())
    }

    /// Collect garbage if needed, build the metadata row for a write to
    /// `dst`, and account for the sector if it's new.
    fn prepare_write(&mut self, dst: Sector, meta: &mut [u8]) -> Result<()> {
        self.auto_gc()?;

        match self.trace_path(dst, Some(meta)) {
            Ok(_) => {}
            Err(Error::NotFound) => {
                if self.count >= self.capacity() {
                    return Err(Error::MapFull);
                }
                self.count += 1;
            }
            Err(e) => return Err(e),
        }

        self.write_count_cookie(self.count);
        Ok(())
    }

    /// Unlink a sector by rewriting its deepest cousin with a path that
    /// no longer reaches the sector's page.
    fn try_delete(&mut self, sector: Sector) -> Result<()> {
        let mut meta = [0u8; META_SIZE];
        let mut alt_meta = [0u8; META_SIZE];

        match self.trace_path(sector, Some(&mut meta)) {
            Ok(_) => {}
            Err(Error::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        }

        // Pick the closest cousin subtree of the doomed page.
        let mut level = RADIX_DEPTH as i32 - 1;
        let mut alt_page = PAGE_NONE;

        while level >= 0 {
            alt_page = meta::alt(&meta, level as usize);
            if alt_page != PAGE_NONE {
                break;
            }
            level -= 1;
        }

        // No cousin at all: this was the last sector.
        if level < 0 {
            self.count = 0;
            self.journal.clear();
            return Ok(());
        }
        let level = level as usize;

        // Rewrite the cousin with an up-to-date path that doesn't point
        // at the original page.
        self.journal.read_meta(alt_page, &mut alt_meta)?;

        meta::set_id(&mut meta, meta::id(&alt_meta));
        meta::set_alt(&mut meta, level, PAGE_NONE);
        for i in level + 1..RADIX_DEPTH {
            meta::set_alt(&mut meta, i, meta::alt(&alt_meta, i));
        }

        self.write_count_cookie(self.count - 1);
        self.journal.copy(alt_page, Some(&meta))?;

        self.count -= 1;
        Ok(())
    }

    fn write_count_cookie(&mut self, count: Sector) {
        LittleEndian::write_u32(&mut self.journal.cookie_mut()[..4], count);
    }
}

fn trace_not_found(new_meta: Option<&mut [u8]>, mut depth: usize) -> Result<Page> {
    if let Some(meta) = new_meta {
        while depth < RADIX_DEPTH {
            meta::set_alt(meta, depth, PAGE_NONE);
            depth += 1;
        }
    }
    Err(Error::NotFound)
}
