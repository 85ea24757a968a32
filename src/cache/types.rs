//! Shared types for the proxy data cache engine.

use thiserror::Error;

use crate::collector::DeliveryError;
use crate::record::RecordKind;
use crate::state::{CacheMode, Destination};

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    Created,
    /// Connecting to the database store.
    Connecting,
    /// Connected and ready, main loop not yet running.
    Ready,
    /// Main loop running, records are being flushed upstream.
    Running,
    /// Shutdown in progress, no new flush batches start.
    ShuttingDown,
    /// Shutdown complete.
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Connecting => write!(f, "Connecting"),
            EngineState::Ready => write!(f, "Ready"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Errors surfaced to producers by [`write`](crate::cache::ProxyDataCache::write).
///
/// Producers are expected to handle these per record: a failed write never
/// crashes the cache and never blocks other producers.
#[derive(Error, Debug)]
pub enum IngestError {
    /// The payload variant does not match the declared record kind.
    #[error("payload is {got} but was submitted as {expected}")]
    UnsupportedKind {
        expected: RecordKind,
        got: RecordKind,
    },

    /// The cache is in disabled mode and accepts nothing.
    #[error("proxy data cache is disabled")]
    CacheDisabled,

    /// No backend can take the record right now.
    #[error("no backend available: {0}")]
    BackendUnavailable(String),

    /// The database store rejected or failed the append.
    #[error("store write failed: {0}")]
    StoreError(String),

    /// This node is an HA standby and must not write to the shared database.
    #[error("not the active node, database writes refused")]
    NotActiveNode,
}

/// Errors surfaced by a single flush pass over one record kind.
#[derive(Error, Debug)]
pub enum FlushError {
    /// Draining or acknowledging against the backend failed.
    #[error("backend access failed during flush: {0}")]
    Store(#[from] crate::storage::BackendError),

    /// Every delivery attempt for the batch failed.
    #[error("delivery failed after {attempts} attempts: {last}")]
    Delivery {
        attempts: usize,
        last: DeliveryError,
    },
}

/// Result of a single flush pass over one record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing pending past the cursor.
    Idle,
    /// A batch was delivered and acknowledged.
    Delivered { records: usize, last_id: u64 },
    /// Skipped: this node is an HA standby.
    NotActive,
    /// Skipped: cache is disabled, there is no destination to drain.
    Disabled,
    /// Aborted between delivery attempts because shutdown was signalled.
    Stopped,
}

/// Backlog and flush progress for one kind, as seen by [`stats`](crate::cache::ProxyDataCache::stats).
#[derive(Debug, Clone, serde::Serialize)]
pub struct KindStats {
    pub kind: RecordKind,
    pub destination: Destination,
    /// Records appended but not yet acknowledged upstream.
    pub pending: u64,
    /// Highest record id acknowledged upstream, 0 before the first ack.
    pub cursor: u64,
}

/// Snapshot of cache health and throughput counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub mode: CacheMode,
    /// True once the memory tier has been abandoned for this process lifetime.
    pub fell_back: bool,
    pub per_kind: Vec<KindStats>,
    pub total_written: u64,
    pub total_flushed: u64,
    pub total_expired: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
    }

    #[test]
    fn test_ingest_error_messages() {
        let e = IngestError::UnsupportedKind {
            expected: RecordKind::History,
            got: RecordKind::Discovery,
        };
        assert!(e.to_string().contains("discovery"));
        assert!(e.to_string().contains("history"));

        let e = IngestError::CacheDisabled;
        assert_eq!(e.to_string(), "proxy data cache is disabled");
    }

    #[test]
    fn test_flush_outcome_equality() {
        assert_eq!(
            FlushOutcome::Delivered {
                records: 3,
                last_id: 7
            },
            FlushOutcome::Delivered {
                records: 3,
                last_id: 7
            }
        );
        assert_ne!(FlushOutcome::Idle, FlushOutcome::Stopped);
    }
}
