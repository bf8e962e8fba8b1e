pub mod chunker;
pub mod config;
pub mod error;
pub mod template;
pub mod types;

pub use error::{Error, Result};
