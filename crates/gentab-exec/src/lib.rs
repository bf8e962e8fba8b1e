//! Generative column execution and table/row concurrency control.

pub mod admin;
pub mod chat;
pub mod events;
pub mod executor;
pub mod locks;

pub use admin::TableAdmin;
pub use events::CompletionChunk;
pub use executor::{Executor, GenResponse, Providers, MAX_ROWS_PER_REQUEST};
pub use locks::RowLocks;
