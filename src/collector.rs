// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Upstream delivery contract.
//!
//! The flush engine hands [`DeliveryBatch`]es to a [`Collector`] and
//! treats the returned result as the acknowledgment: `Ok` means the
//! server took custody of every record in the batch and the cache may
//! purge them; any error means the whole batch will be re-sent later,
//! unchanged. There is no partial acknowledgment.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::record::{CacheRecord, RecordKind};

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
    #[error("collector rejected batch: {0}")]
    Rejected(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

/// An ordered slice of one kind's backlog, owned so a retry re-sends
/// exactly the same records.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryBatch {
    pub kind: RecordKind,
    pub records: Vec<CacheRecord>,
}

impl DeliveryBatch {
    pub fn new(kind: RecordKind, records: Vec<CacheRecord>) -> Self {
        Self { kind, records }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Lowest id in the batch, if any.
    pub fn first_id(&self) -> Option<u64> {
        self.records.first().map(|r| r.id)
    }

    /// Highest id in the batch, if any. This is what the flush cursor
    /// advances to on acknowledgment.
    pub fn last_id(&self) -> Option<u64> {
        self.records.last().map(|r| r.id)
    }

    pub fn ids(&self) -> Vec<u64> {
        self.records.iter().map(|r| r.id).collect()
    }

    /// Wire form: `{"kind": "...", "records": [...]}`.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Whatever sits upstream of the proxy: the real server connection in
/// production, scripted doubles in tests.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn deliver(&self, batch: &DeliveryBatch) -> Result<(), DeliveryError>;
}

/// Acknowledges everything without sending it anywhere.
///
/// Used by deployments where an external poller drains the database
/// directly, and as the default in tests that only exercise ingest.
pub struct NullCollector;

#[async_trait]
impl Collector for NullCollector {
    async fn deliver(&self, _batch: &DeliveryBatch) -> Result<(), DeliveryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{HistoryPayload, RecordPayload};

    fn batch_of(ids: &[u64]) -> DeliveryBatch {
        let records = ids
            .iter()
            .map(|&id| CacheRecord {
                id,
                clock: 1000,
                payload: RecordPayload::History(HistoryPayload {
                    itemid: 1,
                    value: "v".to_string(),
                    ns: 0,
                    state: 0,
                }),
            })
            .collect();
        DeliveryBatch::new(RecordKind::History, records)
    }

    #[test]
    fn test_batch_id_accessors() {
        let batch = batch_of(&[3, 4, 5]);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.first_id(), Some(3));
        assert_eq!(batch.last_id(), Some(5));
        assert_eq!(batch.ids(), vec![3, 4, 5]);

        let empty = batch_of(&[]);
        assert!(empty.is_empty());
        assert_eq!(empty.last_id(), None);
    }

    #[test]
    fn test_wire_form_names_the_kind() {
        let json = batch_of(&[1]).to_json().unwrap();
        assert!(json.contains("\"kind\":\"history\""));
        assert!(json.contains("\"records\""));
    }

    #[tokio::test]
    async fn test_null_collector_acks() {
        let collector = NullCollector;
        assert!(collector.deliver(&batch_of(&[1, 2])).await.is_ok());
    }
}
