pub mod block;
pub mod btree;
pub mod cache;
pub mod evict;
pub mod hazard;
pub mod reconcile;
