use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::traits::{Backend, BackendError};
use crate::record::{CacheRecord, RecordKind};

/// Bounded in-memory buffer, one queue per kind.
///
/// Fast and non-durable: buffered records are lost on process exit, which
/// is the accepted trade-off of memory mode. When a queue is full,
/// `append` fails instead of evicting; the ingest layer treats that as
/// "memory tier unavailable" and falls back to the database. Cursors are
/// process-local for the same reason the data is.
pub struct MemoryBackend {
    buffers: DashMap<RecordKind, VecDeque<CacheRecord>>,
    cursors: DashMap<RecordKind, u64>,
    next_id: AtomicU64,
    capacity: usize,
}

impl MemoryBackend {
    /// `capacity` is per kind; zero means the tier is unusable and every
    /// append reports it as unavailable.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: DashMap::new(),
            cursors: DashMap::new(),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Configured per-kind capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn append(&self, mut record: CacheRecord) -> Result<u64, BackendError> {
        if self.capacity == 0 {
            return Err(BackendError::Unavailable(
                "memory buffer has zero configured capacity".to_string(),
            ));
        }

        let kind = record.kind();
        let mut buffer = self.buffers.entry(kind).or_default();
        if buffer.len() >= self.capacity {
            return Err(BackendError::AtCapacity {
                kind,
                pending: buffer.len() as u64,
                max: self.capacity as u64,
            });
        }

        // Id assignment happens while the queue guard is held, so within
        // a kind the queue order and the id order are the same thing.
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        record.id = id;
        buffer.push_back(record);
        Ok(id)
    }

    async fn drain(
        &self,
        kind: RecordKind,
        after_id: u64,
        max_batch: usize,
    ) -> Result<Vec<CacheRecord>, BackendError> {
        let records = match self.buffers.get(&kind) {
            Some(buffer) => buffer
                .iter()
                .filter(|r| r.id > after_id)
                .take(max_batch)
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        Ok(records)
    }

    async fn purge(&self, kind: RecordKind, ids: &[u64]) -> Result<u64, BackendError> {
        let Some(mut buffer) = self.buffers.get_mut(&kind) else {
            return Ok(0);
        };
        let acked: HashSet<u64> = ids.iter().copied().collect();
        let before = buffer.len();
        buffer.retain(|r| !acked.contains(&r.id));
        Ok((before - buffer.len()) as u64)
    }

    async fn pending(&self, kind: RecordKind) -> Result<u64, BackendError> {
        Ok(self.buffers.get(&kind).map_or(0, |b| b.len() as u64))
    }

    async fn expire(&self, kind: RecordKind, horizon_clock: i64) -> Result<u64, BackendError> {
        let Some(mut buffer) = self.buffers.get_mut(&kind) else {
            return Ok(0);
        };
        let before = buffer.len();
        buffer.retain(|r| r.clock >= horizon_clock);
        Ok((before - buffer.len()) as u64)
    }

    async fn load_cursor(&self, kind: RecordKind) -> Result<u64, BackendError> {
        Ok(self.cursors.get(&kind).map_or(0, |c| *c))
    }

    async fn store_cursor(&self, kind: RecordKind, acked_id: u64) -> Result<(), BackendError> {
        let mut cursor = self.cursors.entry(kind).or_insert(0);
        if acked_id > *cursor {
            *cursor = acked_id;
        }
        Ok(())
    }
}
