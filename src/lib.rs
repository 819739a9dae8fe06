pub mod config;
pub mod error;
pub mod journal;
pub mod map;
pub mod nand;
pub mod sim;

pub use config::{JournalConfig, MapConfig};
pub use error::{Error, Result};
pub use journal::Journal;
pub use map::{Map, Sector, META_SIZE, SECTOR_NONE};
pub use nand::{Block, NandDriver, Page, PAGE_NONE};
