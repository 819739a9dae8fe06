use byteorder::{ByteOrder, LittleEndian};

use crate::config::JournalConfig;
use crate::error::{Error, Result};
use crate::nand::{NandDriver, Page};
use crate::sim::{seq_assert, seq_gen, SimNand};

use super::Journal;

pub(crate) type SimJournal = Journal<SimNand>;

pub(crate) fn sim_journal(nand: SimNand) -> SimJournal {
    Journal::new(nand, JournalConfig::default())
}

/// Tear the journal down to the bare chip and bring it back up again.
pub(crate) fn suspend_resume(journal: SimJournal) -> SimJournal {
    let nand = journal.into_nand();
    let mut journal = sim_journal(nand);
    journal.resume().expect("resume failed");
    journal
}

fn check_upage(journal: &SimJournal, page: Page) {
    let mask = (1u32 << journal.log2_ppc()) - 1;
    // Never a metadata slot, never out of bounds.
    assert!((!page) & mask != 0, "page {page} is a metadata slot");
    assert!(page < journal.total_pages(), "page {page} out of bounds");
}

/// Structural checks that must hold between any two journal operations.
pub(crate) fn check_invariants(journal: &SimJournal) {
    check_upage(journal, journal.head());
    check_upage(journal, journal.tail());
    check_upage(journal, journal.tail_sync());

    // The head never advances onto the block of the synced tail.
    let log2_ppb = journal.nand().log2_ppb();
    if (journal.head() ^ journal.tail_sync()) >> log2_ppb == 0 {
        assert!(journal.head() >= journal.tail_sync());
    }

    // The tail lies between the synced tail and the head.
    assert!(
        journal.head().wrapping_sub(journal.tail_sync())
            >= journal.tail().wrapping_sub(journal.tail_sync())
    );

    // The root points at a valid user page in a non-empty journal, and
    // is strictly older than the head.
    if let Some(root) = journal.root() {
        let raw_size = journal.head().wrapping_sub(journal.tail());
        let root_offset = root.wrapping_sub(journal.tail());

        check_upage(journal, root);
        assert!(root_offset < raw_size);
    }
}

/// Drive the journal's recovery enumeration the way a map would: requeue
/// every recoverable page under its existing metadata, padding once the
/// enumeration runs dry, until the journal reports recovery complete.
pub(crate) fn recover(journal: &mut SimJournal) {
    let mut restarts = 0;

    while journal.in_recovery() {
        let res = match journal.next_recoverable() {
            Some(page) => {
                let mut meta = vec![0u8; journal.config.meta_size];
                journal.read_meta(page, &mut meta).expect("read_meta failed");
                journal.copy(page, Some(&meta))
            }
            None => journal.enqueue(None, None),
        };

        check_invariants(journal);

        match res {
            Ok(()) => {}
            Err(Error::Recover) => {
                restarts += 1;
                assert!(
                    restarts < journal.max_retries(),
                    "recovery kept restarting"
                );
            }
            Err(e) => panic!("recovery requeue failed: {e}"),
        }
    }

    check_invariants(journal);
}

fn enqueue_one(journal: &mut SimJournal, id: u32) -> Result<()> {
    let mut page = vec![0u8; journal.nand().page_size()];
    let mut meta = vec![0xffu8; journal.config.meta_size];

    seq_gen(id as u64, &mut page);
    LittleEndian::write_u32(&mut meta[..4], id);

    for _ in 0..journal.max_retries() {
        check_invariants(journal);
        match journal.enqueue(Some(&page), Some(&meta)) {
            Ok(()) => return Ok(()),
            Err(Error::Recover) => recover(journal),
            Err(e) => return Err(e),
        }
    }
    Err(Error::TooBad)
}

/// Enqueue `count` seeded pages carrying ids `start..`, or as many as fit
/// when `count` is None. Returns the number enqueued.
pub(crate) fn enqueue_sequence(
    journal: &mut SimJournal,
    start: usize,
    count: Option<usize>,
) -> usize {
    let count = count.unwrap_or(journal.total_pages() as usize);

    for i in 0..count {
        match enqueue_one(journal, (start + i) as u32) {
            Ok(()) => {}
            Err(Error::JournalFull) => return i,
            Err(e) => panic!("enqueue {i} failed: {e}"),
        }

        assert!(journal.size() >= i as u32);

        let root = journal.root().expect("no root after enqueue");
        let mut meta = vec![0u8; journal.config.meta_size];
        journal.read_meta(root, &mut meta).expect("read_meta failed");
        assert_eq!(LittleEndian::read_u32(&meta[..4]), (start + i) as u32);
    }
    count
}

/// Drain `count` pages, expecting ids `next..` in order with garbage runs
/// shorter than one checkpoint group, and verify every page's contents.
pub(crate) fn dequeue_sequence(journal: &mut SimJournal, next: usize, count: usize) {
    let max_garbage = 1usize << journal.log2_ppc();
    let mut garbage = 0;
    let mut next = next;
    let mut remaining = count;

    while remaining > 0 {
        let mut meta = vec![0u8; journal.config.meta_size];
        let tail = journal.peek().expect("journal drained early");

        check_invariants(journal);
        journal.read_meta(tail, &mut meta).expect("read_meta failed");

        check_invariants(journal);
        journal.dequeue();

        let id = LittleEndian::read_u32(&meta[..4]);
        if id == 0xffff_ffff {
            garbage += 1;
            assert!(garbage < max_garbage, "garbage run exceeds group size");
        } else {
            assert_eq!(id as usize, next, "dequeued out of order");
            garbage = 0;
            next += 1;
            remaining -= 1;

            let mut page = vec![0u8; journal.nand().page_size()];
            journal
                .nand_mut()
                .read(tail, 0, &mut page)
                .expect("page read failed");
            seq_assert(id as u64, &page);
        }

        check_invariants(journal);
    }
}
