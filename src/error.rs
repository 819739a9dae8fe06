use std::fmt::Display;

/// Cinder errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// A block erase or page program failed. Raised by NAND drivers only;
    /// the journal always consumes it and relocates the affected data.
    BadBlock,
    /// A page read failed with an uncorrectable ECC error.
    Ecc,
    /// Too many retries. The operation gave up after exhausting the
    /// configured number of replacement blocks.
    TooBad,
    /// A write failed mid-block and live data must be copied off the
    /// failing block before the operation can be retried. Handled
    /// internally by the map; journal users must drive the recovery
    /// enumeration themselves.
    Recover,
    /// The journal has no free space. Dequeue or sync to reclaim some.
    JournalFull,
    /// The requested sector is not mapped.
    NotFound,
    /// The map has reached its sector capacity.
    MapFull,
    /// The on-flash index is inconsistent.
    CorruptMap,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::BadBlock => write!(f, "bad block"),
            Error::Ecc => write!(f, "uncorrectable ECC error"),
            Error::TooBad => write!(f, "too many bad blocks"),
            Error::Recover => write!(f, "journal recovery required"),
            Error::JournalFull => write!(f, "journal is full"),
            Error::NotFound => write!(f, "sector not found"),
            Error::MapFull => write!(f, "map is full"),
            Error::CorruptMap => write!(f, "map is corrupt"),
        }
    }
}

/// A cinder Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;
