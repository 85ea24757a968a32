use async_trait::async_trait;
use thiserror::Error;

use crate::record::{CacheRecord, RecordKind};

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("{kind} buffer at capacity: {pending} pending, max {max}")]
    AtCapacity {
        kind: RecordKind,
        pending: u64,
        max: u64,
    },
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage backend error: {0}")]
    Store(String),
}

/// A destination that can hold records between ingest and acknowledged
/// delivery. One implementation per tier (memory, database).
///
/// Ids are assigned by the backend at append time and are monotonically
/// increasing per kind for the lifetime of the backend. Flush cursors
/// live with the backend that owns the id space, so a cursor can never be
/// compared against ids from another tier.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Persist `record`, assigning and returning its id. The record's
    /// incoming `id` field is ignored.
    async fn append(&self, record: CacheRecord) -> Result<u64, BackendError>;

    /// Read up to `max_batch` records of `kind` with id greater than
    /// `after_id`, in id order. Non-destructive: records stay in place
    /// until [`purge`](Backend::purge).
    async fn drain(
        &self,
        kind: RecordKind,
        after_id: u64,
        max_batch: usize,
    ) -> Result<Vec<CacheRecord>, BackendError>;

    /// Delete the given records after acknowledged delivery. Returns the
    /// number actually removed.
    async fn purge(&self, kind: RecordKind, ids: &[u64]) -> Result<u64, BackendError>;

    /// Number of records of `kind` currently held.
    async fn pending(&self, kind: RecordKind) -> Result<u64, BackendError>;

    /// Drop unacknowledged records of `kind` with `clock` older than
    /// `horizon_clock`. Returns the number discarded.
    async fn expire(&self, kind: RecordKind, horizon_clock: i64) -> Result<u64, BackendError>;

    /// Last acknowledged id for `kind`, 0 when nothing was ever acked.
    async fn load_cursor(&self, kind: RecordKind) -> Result<u64, BackendError>;

    /// Record that everything up to and including `acked_id` was
    /// delivered and acknowledged.
    async fn store_cursor(&self, kind: RecordKind, acked_id: u64) -> Result<(), BackendError>;
}
