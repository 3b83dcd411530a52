mod cache;
mod error;
pub mod filter;
pub mod iterator;
pub mod opt;
pub mod sset;
pub mod sstable;
pub mod storage;
mod table_cache;
mod util;

pub use error::{Error, IResult};
pub use table_cache::TableCache;
pub use util::comparator::{BytewiseComparator, Comparator};
