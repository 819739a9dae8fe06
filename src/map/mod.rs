mod map;
pub mod meta;

pub use map::Map;
pub use meta::{Sector, META_SIZE, SECTOR_NONE};
