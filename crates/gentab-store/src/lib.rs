//! LanceDB-backed storage: the table registry, per-table columnar row
//! storage with dynamic Arrow schemas, and the persisted `lock_till`
//! compare-and-set.

pub mod cache;
pub mod db;
pub mod rows;
pub mod schema;
pub mod store;

pub use store::TableStore;
