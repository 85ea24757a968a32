//! Cached record data structures.
//!
//! The [`CacheRecord`] is the unit of data that flows through the proxy
//! data cache. Each record carries a kind-specific payload, the clock the
//! producer stamped it with, and the cache-assigned id that fixes its
//! position in the flush order.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The kinds of collected data the cache buffers.
///
/// Each kind has its own buffer, its own flush cursor, and its own
/// database table. Adding a kind means adding a variant here plus its
/// payload struct; everything downstream is keyed on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Active agent autoregistration requests observed by the proxy.
    Autoregistration,
    /// Collected item values awaiting upload.
    History,
    /// Network discovery check results.
    Discovery,
}

impl RecordKind {
    /// All kinds, in flush-loop spawn order.
    pub const ALL: [RecordKind; 3] = [
        RecordKind::Autoregistration,
        RecordKind::History,
        RecordKind::Discovery,
    ];

    /// Stable lowercase name, used for metrics labels and cursor keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Autoregistration => "autoregistration",
            RecordKind::History => "history",
            RecordKind::Discovery => "discovery",
        }
    }

    /// Backing table for this kind in the local database.
    pub fn table(&self) -> &'static str {
        match self {
            RecordKind::Autoregistration => "proxy_autoreg_host",
            RecordKind::History => "proxy_history",
            RecordKind::Discovery => "proxy_dhistory",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Autoregistration request fields, as reported by the listening proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoregPayload {
    /// Host name the agent announced.
    pub host: String,
    /// Source IP the connection arrived from (empty if DNS-resolved).
    pub listen_ip: String,
    /// Reverse-resolved DNS name (empty if none).
    pub listen_dns: String,
    /// Port the agent listens on.
    pub listen_port: u16,
    /// TLS connection type the agent connected with.
    pub tls_accepted: u32,
    /// Free-form host metadata string from the agent.
    pub host_metadata: String,
    /// Registration flags (metadata source bits).
    pub flags: u32,
}

/// A single collected item value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPayload {
    /// Item the value belongs to.
    pub itemid: u64,
    /// Raw value text as collected.
    pub value: String,
    /// Nanosecond part of the collection timestamp.
    pub ns: i32,
    /// Item state at collection time (0 = normal, 1 = not supported).
    pub state: u8,
}

/// One discovery check result for a discovered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    /// Discovery rule that produced the result.
    pub druleid: u64,
    /// Discovery check within the rule (0 for rule-level records).
    pub dcheckid: u64,
    /// Address the check ran against.
    pub ip: String,
    /// DNS name of the checked host (empty if none).
    pub dns: String,
    /// Port the check probed.
    pub port: u16,
    /// Value returned by the check.
    pub value: String,
    /// Service status (0 = up, 1 = down).
    pub status: u8,
}

/// Kind-specific record content.
///
/// Serialized with external tagging, so the wire form a collector sees is
/// `{"history": {...}}` and the kind is recoverable from the JSON alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordPayload {
    Autoregistration(AutoregPayload),
    History(HistoryPayload),
    Discovery(DiscoveryPayload),
}

impl RecordPayload {
    /// The kind this payload belongs to.
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordPayload::Autoregistration(_) => RecordKind::Autoregistration,
            RecordPayload::History(_) => RecordKind::History,
            RecordPayload::Discovery(_) => RecordKind::Discovery,
        }
    }
}

/// A record held by the cache, from ingest until acknowledged flush.
///
/// # Example
///
/// ```
/// use proxy_data_cache::{AutoregPayload, CacheRecord, RecordKind, RecordPayload};
///
/// let record = CacheRecord::new(
///     RecordPayload::Autoregistration(AutoregPayload {
///         host: "web-01".into(),
///         listen_ip: "10.0.0.1".into(),
///         listen_dns: String::new(),
///         listen_port: 10050,
///         tls_accepted: 0,
///         host_metadata: "{}".into(),
///         flags: 0,
///     }),
///     1_700_000_000,
/// );
///
/// assert_eq!(record.kind(), RecordKind::Autoregistration);
/// assert_eq!(record.id, 0); // unassigned until appended to a backend
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Cache-assigned id, monotonically increasing within a kind on a
    /// given destination. Zero until a backend appends the record.
    pub id: u64,
    /// Producer-supplied timestamp (epoch seconds). Ordering within a
    /// kind follows id, not clock; clock drives retention expiry.
    pub clock: i64,
    /// The actual collected data.
    pub payload: RecordPayload,
}

impl CacheRecord {
    /// Create a record awaiting id assignment.
    pub fn new(payload: RecordPayload, clock: i64) -> Self {
        Self {
            id: 0,
            clock,
            payload,
        }
    }

    /// The kind of this record, derived from its payload.
    pub fn kind(&self) -> RecordKind {
        self.payload.kind()
    }
}
