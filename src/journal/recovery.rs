use log::debug;

use crate::error::{Error, Result};
use crate::nand::{align_eq, is_aligned, NandDriver, Page, PAGE_NONE};

use super::journal::Journal;

// Bad-block recovery.
//
// A page program that fails mid-block leaves live user pages stranded on
// a block that can no longer be completed. The journal moves its head to
// a fresh block, dumps any buffered metadata, and then hands the stranded
// pages out one at a time through `next_recoverable` so the caller can
// copy forward whichever ones still matter. Once the enumeration is done
// and the next checkpoint lands, the failed block is marked bad.
impl<N: NandDriver> Journal<N> {
    /// Is a recovery in progress?
    pub fn in_recovery(&self) -> bool {
        self.flags.recovery
    }

    /// The next page of the failing block to be recovered, or None when
    /// the enumeration is finished (or no recovery is in progress).
    ///
    /// After an operation fails with `Recover`, keep requeueing the pages
    /// returned here (rewrites of recovered data are fine, new data is
    /// not) until the journal reaches a checkpoint; recovery then
    /// finishes on its own. A further bad block during recovery returns
    /// `Recover` again and restarts the enumeration.
    pub fn next_recoverable(&mut self) -> Option<Page> {
        if !self.in_recovery() || self.flags.enum_done {
            return None;
        }

        let page = self.recover_next;

        if self.recover_next == self.recover_root {
            self.flags.enum_done = true;
        } else {
            self.recover_next = self.next_upage(self.recover_next);
        }

        Some(page)
    }

    pub(super) fn clear_recovery(&mut self) {
        self.recover_next = PAGE_NONE;
        self.recover_root = PAGE_NONE;
        self.recover_meta = PAGE_NONE;
        self.flags.bad_meta = false;
        self.flags.recovery = false;
        self.flags.enum_done = false;
    }

    /// React to a failed program at the head. Moves the head to the next
    /// block and decides whether stranded data needs recovering.
    pub(super) fn recover_from(&mut self, write_err: Error) -> Result<()> {
        if write_err != Error::BadBlock {
            return Err(write_err);
        }

        let log2_ppb = self.nand.log2_ppb();
        let old_head = self.head;

        // Advance to the next free block.
        self.bb_current += 1;
        self.skip_block()?;

        // Already mid-recovery? Start over.
        if self.in_recovery() {
            self.restart_recovery(old_head);
            return Err(Error::Recover);
        }

        // A block-aligned head has no stranded data: mark and move on.
        if is_aligned(old_head, log2_ppb) {
            debug!(
                "journal: block {} failed before holding data, retired",
                old_head >> log2_ppb
            );
            self.nand.mark_bad(old_head >> log2_ppb);
            return Ok(());
        }

        self.recover_root = self.root;
        self.recover_next = self.recover_root & !((1u32 << log2_ppb) - 1);

        // Holding buffered metadata for the failed block? Dump it first.
        if !is_aligned(old_head, self.log2_ppc) {
            self.dump_meta()?;
        }

        self.flags.recovery = true;
        debug!(
            "journal: block {} failed, recovering {} onward",
            old_head >> log2_ppb,
            self.recover_next
        );
        Err(Error::Recover)
    }

    /// A block failed while recovery was already running. Mark the
    /// failed head bad, unless it holds our metadata dump (then the
    /// marking is deferred to the end of recovery), and reset the source
    /// enumeration to the start of the original bad block.
    fn restart_recovery(&mut self, old_head: Page) {
        let log2_ppb = self.nand.log2_ppb();

        if self.recover_meta == PAGE_NONE || !align_eq(self.recover_meta, old_head, log2_ppb) {
            self.nand.mark_bad(old_head >> log2_ppb);
        } else {
            self.flags.bad_meta = true;
        }

        debug!("journal: recovery restarted");
        self.flags.enum_done = false;
        self.recover_next = self.recover_root & !((1u32 << log2_ppb) - 1);
        self.root = self.recover_root;
    }

    /// Recovery has begun on a fresh block while the scratch buffer holds
    /// metadata rows for the failed one. Program the buffer as-is onto
    /// the head so `read_meta` can keep serving the stranded pages.
    fn dump_meta(&mut self) -> Result<()> {
        for _ in 0..self.config.max_retries {
            let res = self
                .prepare_head()
                .and_then(|_| self.nand.prog(self.head, &self.scratch));

            match res {
                Ok(()) => {
                    self.recover_meta = self.head;
                    self.head = self.next_upage(self.head);
                    if self.head == 0 {
                        self.roll_stats();
                    }
                    self.clear_user_meta();
                    return Ok(());
                }
                Err(Error::BadBlock) => {
                    self.bb_current += 1;
                    let blk = self.head >> self.nand.log2_ppb();
                    self.nand.mark_bad(blk);
                    self.skip_block()?;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::TooBad)
    }

    /// The last recoverable page has been requeued and checkpointed.
    /// Retire the failed block, and the dump block too if it also failed.
    pub(super) fn finish_recovery(&mut self) {
        let log2_ppb = self.nand.log2_ppb();
        let failed = self.recover_root >> log2_ppb;
        self.nand.mark_bad(failed);

        if self.flags.bad_meta {
            let dump = self.recover_meta >> log2_ppb;
            self.nand.mark_bad(dump);
        }

        debug!("journal: recovery complete, block {failed} retired");
        self.clear_recovery();
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{dequeue_sequence, enqueue_sequence, sim_journal, SimJournal};
    use crate::nand::NandDriver;
    use crate::sim::SimNand;

    // Each scenario arms a fault schedule, enqueues 30 pages (driving
    // whatever recoveries the faults provoke) and drains all 30 back in
    // order. Garbage runs between live pages stay bounded by the group
    // size throughout.
    fn run_scenario(name: &str, arm: fn(&mut SimNand)) {
        let mut nand = SimNand::default();
        arm(&mut nand);

        let mut journal = sim_journal(nand);
        assert_eq!(journal.log2_ppc(), 2, "{name}: scenarios assume 4-page groups");

        let count = enqueue_sequence(&mut journal, 0, Some(30));
        assert_eq!(count, 30, "{name}: short enqueue");
        dequeue_sequence(&mut journal, 0, 30);
    }

    fn assert_marked_bad(journal: &mut SimJournal, scenario: &str) {
        // Provoked failures must end with a write-triggered bad mark.
        assert!(
            journal.nand_mut().stats().mark_bad > 0,
            "{scenario}: no block was retired"
        );
    }

    #[test]
    fn test_control() {
        run_scenario("control", |_| {});
    }

    #[test]
    fn test_instant_fail() {
        // Block 0 fails its erase; no user data is at risk.
        run_scenario("instant fail", |nand| nand.set_failed(0));
    }

    #[test]
    fn test_fail_after_checkpoint() {
        run_scenario("after checkpoint", |nand| nand.set_timebomb(0, 6));
    }

    #[test]
    fn test_fail_mid_checkpoint() {
        run_scenario("mid checkpoint", |nand| nand.set_timebomb(0, 3));
    }

    #[test]
    fn test_fail_on_metadata_page() {
        run_scenario("metadata page", |nand| nand.set_timebomb(0, 5));
    }

    #[test]
    fn test_cascade_after_checkpoint() {
        run_scenario("cascade after checkpoint", |nand| {
            nand.set_timebomb(0, 6);
            nand.set_timebomb(1, 3);
            nand.set_timebomb(2, 3);
        });
    }

    #[test]
    fn test_cascade_mid_checkpoint() {
        run_scenario("cascade mid checkpoint", |nand| {
            nand.set_timebomb(0, 3);
            nand.set_timebomb(1, 3);
        });
    }

    #[test]
    fn test_metadata_dump_failure() {
        // The block picked to receive the metadata dump fails as well;
        // the dump moves on and both blocks end up retired.
        let mut nand = SimNand::default();
        nand.set_timebomb(0, 3);
        nand.set_failed(1);

        let mut journal = sim_journal(nand);
        let count = enqueue_sequence(&mut journal, 0, Some(30));
        assert_eq!(count, 30);
        dequeue_sequence(&mut journal, 0, 30);

        assert!(journal.nand_mut().is_bad(0));
        assert!(journal.nand_mut().is_bad(1));
        assert_marked_bad(&mut journal, "metadata dump failure");
    }

    #[test]
    fn test_bad_day() {
        run_scenario("bad day", |nand| {
            nand.set_timebomb(0, 7);
            for blk in 1..5 {
                nand.set_timebomb(blk, 3);
            }
        });
    }
}
