//! Storage backends holding records between ingest and flush.

pub mod memory;
pub mod sql;
pub mod traits;

pub use memory::MemoryBackend;
pub use sql::SqlBackend;
pub use traits::{Backend, BackendError};
