pub mod storage;

mod assert;
mod error;

pub use error::ChertError;
pub use storage::block::{Addr, BlockManager};
pub use storage::btree::{
    btree_link_child, btree_link_disk_child, Btree, Page, PageModify, PageRef, PageType,
    RecOutcome, Ref, RefState, PAGE_REC_EMPTY, PAGE_REC_MASK, PAGE_REC_REPLACE, PAGE_REC_SPLIT,
    PAGE_REC_SPLIT_MERGE,
};
pub use storage::cache::{Cache, CacheOptions, CacheStats, HazardGuard, Session};
pub use storage::evict::{EvictFlags, Evictor};
pub use storage::reconcile::Reconciler;

pub type Result<T, E = ChertError> = std::result::Result<T, E>;
