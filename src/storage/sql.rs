// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL storage backend: the durable buffer tier.
//!
//! One table per record kind, mirroring the classic proxy schema:
//!
//! ```sql
//! CREATE TABLE proxy_autoreg_host (
//!   id BIGINT PRIMARY KEY,   -- cache-assigned, from proxy_ids
//!   clock BIGINT NOT NULL,   -- producer timestamp
//!   host VARCHAR(128), listen_ip VARCHAR(46), listen_dns VARCHAR(255),
//!   listen_port INT, tls_accepted INT, host_metadata TEXT, flags INT
//! )
//! ```
//!
//! plus `proxy_history` and `proxy_dhistory` for the other kinds,
//! `proxy_ids` holding one id sequence row per table, and
//! `proxy_flush_cursor` persisting per-kind flush progress so a restart
//! resumes from the last acknowledged record.
//!
//! Ids are reserved by bumping the `proxy_ids` row inside the same
//! transaction that inserts the record. Holding that row lock until
//! commit serializes appends per table, which is what lets a drain trust
//! `WHERE id > cursor`: no lower id can ever appear after a higher one
//! was already visible.
//!
//! ## sqlx Any Driver Quirks
//!
//! TEXT/LONGTEXT columns come back as `Vec<u8>` under the `Any` driver on
//! MySQL, so text reads go through a String-then-bytes fallback.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};

use super::traits::{Backend, BackendError};
use crate::record::{
    AutoregPayload, CacheRecord, DiscoveryPayload, HistoryPayload, RecordKind, RecordPayload,
};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const PURGE_CHUNK_SIZE: usize = 500;

pub struct SqlBackend {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlBackend {
    /// Connect with startup-mode retry (fails fast if config is wrong)
    /// and create any missing tables.
    pub async fn new(connection_string: &str) -> Result<Self, BackendError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| BackendError::Unavailable(e.to_string()))
        })
        .await?;

        let backend = Self { pool, is_sqlite };

        if is_sqlite {
            backend.enable_wal_mode().await?;
        }

        backend.init_schema().await?;
        Ok(backend)
    }

    /// Get a clone of the connection pool for sharing with other components.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    /// Enable WAL (Write-Ahead Logging) mode for SQLite.
    async fn enable_wal_mode(&self) -> Result<(), BackendError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| BackendError::Store(format!("Failed to enable WAL mode: {}", e)))?;

        // WAL is safe with NORMAL, no need for a second fsync per commit
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| BackendError::Store(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), BackendError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS proxy_autoreg_host (
                    id INTEGER PRIMARY KEY,
                    clock INTEGER NOT NULL,
                    host TEXT NOT NULL,
                    listen_ip TEXT NOT NULL DEFAULT '',
                    listen_dns TEXT NOT NULL DEFAULT '',
                    listen_port INTEGER NOT NULL DEFAULT 0,
                    tls_accepted INTEGER NOT NULL DEFAULT 0,
                    host_metadata TEXT NOT NULL DEFAULT '',
                    flags INTEGER NOT NULL DEFAULT 0
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS proxy_history (
                    id INTEGER PRIMARY KEY,
                    clock INTEGER NOT NULL,
                    itemid INTEGER NOT NULL,
                    value TEXT NOT NULL DEFAULT '',
                    ns INTEGER NOT NULL DEFAULT 0,
                    state INTEGER NOT NULL DEFAULT 0
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS proxy_dhistory (
                    id INTEGER PRIMARY KEY,
                    clock INTEGER NOT NULL,
                    druleid INTEGER NOT NULL,
                    dcheckid INTEGER NOT NULL DEFAULT 0,
                    ip TEXT NOT NULL DEFAULT '',
                    dns TEXT NOT NULL DEFAULT '',
                    port INTEGER NOT NULL DEFAULT 0,
                    value TEXT NOT NULL DEFAULT '',
                    status INTEGER NOT NULL DEFAULT 0
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS proxy_ids (
                    table_name TEXT PRIMARY KEY,
                    nextid INTEGER NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS proxy_flush_cursor (
                    kind TEXT PRIMARY KEY,
                    acked_id INTEGER NOT NULL
                )
                "#,
            ]
        } else {
            // MySQL - LONGTEXT instead of native JSON/TEXT oddities under
            // the sqlx Any driver; reads fall back to bytes, see read_text
            &[
                r#"
                CREATE TABLE IF NOT EXISTS proxy_autoreg_host (
                    id BIGINT PRIMARY KEY,
                    clock BIGINT NOT NULL,
                    host VARCHAR(128) NOT NULL,
                    listen_ip VARCHAR(46) NOT NULL DEFAULT '',
                    listen_dns VARCHAR(255) NOT NULL DEFAULT '',
                    listen_port INT NOT NULL DEFAULT 0,
                    tls_accepted INT NOT NULL DEFAULT 0,
                    host_metadata TEXT NOT NULL,
                    flags INT NOT NULL DEFAULT 0,
                    INDEX idx_autoreg_clock (clock)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS proxy_history (
                    id BIGINT PRIMARY KEY,
                    clock BIGINT NOT NULL,
                    itemid BIGINT NOT NULL,
                    value LONGTEXT NOT NULL,
                    ns INT NOT NULL DEFAULT 0,
                    state TINYINT NOT NULL DEFAULT 0,
                    INDEX idx_history_clock (clock)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS proxy_dhistory (
                    id BIGINT PRIMARY KEY,
                    clock BIGINT NOT NULL,
                    druleid BIGINT NOT NULL,
                    dcheckid BIGINT NOT NULL DEFAULT 0,
                    ip VARCHAR(46) NOT NULL DEFAULT '',
                    dns VARCHAR(255) NOT NULL DEFAULT '',
                    port INT NOT NULL DEFAULT 0,
                    value LONGTEXT NOT NULL,
                    status TINYINT NOT NULL DEFAULT 0,
                    INDEX idx_dhistory_clock (clock)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS proxy_ids (
                    table_name VARCHAR(64) PRIMARY KEY,
                    nextid BIGINT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS proxy_flush_cursor (
                    kind VARCHAR(32) PRIMARY KEY,
                    acked_id BIGINT NOT NULL
                )
                "#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| BackendError::Store(e.to_string()))
            })
            .await?;
        }

        // Seed one sequence row per table; ignored when already present.
        let seed = if self.is_sqlite {
            "INSERT OR IGNORE INTO proxy_ids (table_name, nextid) VALUES (?, 0)"
        } else {
            "INSERT IGNORE INTO proxy_ids (table_name, nextid) VALUES (?, 0)"
        };
        for kind in RecordKind::ALL {
            retry("sql_seed_ids", &RetryConfig::startup(), || async {
                sqlx::query(seed)
                    .bind(kind.table())
                    .execute(&self.pool)
                    .await
                    .map_err(|e| BackendError::Store(e.to_string()))
            })
            .await?;
        }

        Ok(())
    }

    /// Read a text column, tolerating the Any driver returning MySQL
    /// TEXT/LONGTEXT as raw bytes.
    fn read_text(row: &AnyRow, column: &str) -> Result<String, BackendError> {
        if let Ok(s) = row.try_get::<String, _>(column) {
            return Ok(s);
        }
        let bytes: Vec<u8> = row
            .try_get(column)
            .map_err(|e| BackendError::Store(e.to_string()))?;
        String::from_utf8(bytes)
            .map_err(|e| BackendError::Store(format!("invalid utf-8 in {column}: {e}")))
    }

    fn read_i64(row: &AnyRow, column: &str) -> Result<i64, BackendError> {
        row.try_get(column)
            .map_err(|e| BackendError::Store(e.to_string()))
    }

    fn record_from_row(kind: RecordKind, row: &AnyRow) -> Result<CacheRecord, BackendError> {
        let id = Self::read_i64(row, "id")? as u64;
        let clock = Self::read_i64(row, "clock")?;

        let payload = match kind {
            RecordKind::Autoregistration => RecordPayload::Autoregistration(AutoregPayload {
                host: Self::read_text(row, "host")?,
                listen_ip: Self::read_text(row, "listen_ip")?,
                listen_dns: Self::read_text(row, "listen_dns")?,
                listen_port: Self::read_i64(row, "listen_port")? as u16,
                tls_accepted: Self::read_i64(row, "tls_accepted")? as u32,
                host_metadata: Self::read_text(row, "host_metadata")?,
                flags: Self::read_i64(row, "flags")? as u32,
            }),
            RecordKind::History => RecordPayload::History(HistoryPayload {
                itemid: Self::read_i64(row, "itemid")? as u64,
                value: Self::read_text(row, "value")?,
                ns: Self::read_i64(row, "ns")? as i32,
                state: Self::read_i64(row, "state")? as u8,
            }),
            RecordKind::Discovery => RecordPayload::Discovery(DiscoveryPayload {
                druleid: Self::read_i64(row, "druleid")? as u64,
                dcheckid: Self::read_i64(row, "dcheckid")? as u64,
                ip: Self::read_text(row, "ip")?,
                dns: Self::read_text(row, "dns")?,
                port: Self::read_i64(row, "port")? as u16,
                value: Self::read_text(row, "value")?,
                status: Self::read_i64(row, "status")? as u8,
            }),
        };

        Ok(CacheRecord { id, clock, payload })
    }
}

#[async_trait]
impl Backend for SqlBackend {
    /// Reserve an id and insert the row in one transaction.
    ///
    /// The sequence-row UPDATE takes a row lock that is held until
    /// commit, so concurrent appends to the same table serialize and
    /// rows become visible in id order. Not retried: a failed append
    /// surfaces to the producer as-is, and the rollback releases the
    /// reserved id.
    async fn append(&self, record: CacheRecord) -> Result<u64, BackendError> {
        let kind = record.kind();
        let table = kind.table();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let updated = sqlx::query("UPDATE proxy_ids SET nextid = nextid + 1 WHERE table_name = ?")
            .bind(table)
            .execute(&mut *tx)
            .await
            .map_err(|e| BackendError::Store(e.to_string()))?;
        if updated.rows_affected() == 0 {
            return Err(BackendError::Store(format!(
                "no id sequence row for table {table}"
            )));
        }

        let row = sqlx::query("SELECT nextid FROM proxy_ids WHERE table_name = ?")
            .bind(table)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| BackendError::Store(e.to_string()))?;
        let id: i64 = row
            .try_get("nextid")
            .map_err(|e| BackendError::Store(e.to_string()))?;

        let insert = match &record.payload {
            RecordPayload::Autoregistration(p) => sqlx::query(
                "INSERT INTO proxy_autoreg_host \
                 (id, clock, host, listen_ip, listen_dns, listen_port, tls_accepted, host_metadata, flags) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(record.clock)
            .bind(&p.host)
            .bind(&p.listen_ip)
            .bind(&p.listen_dns)
            .bind(p.listen_port as i64)
            .bind(p.tls_accepted as i64)
            .bind(&p.host_metadata)
            .bind(p.flags as i64),
            RecordPayload::History(p) => sqlx::query(
                "INSERT INTO proxy_history (id, clock, itemid, value, ns, state) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(record.clock)
            .bind(p.itemid as i64)
            .bind(&p.value)
            .bind(p.ns as i64)
            .bind(p.state as i64),
            RecordPayload::Discovery(p) => sqlx::query(
                "INSERT INTO proxy_dhistory \
                 (id, clock, druleid, dcheckid, ip, dns, port, value, status) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(record.clock)
            .bind(p.druleid as i64)
            .bind(p.dcheckid as i64)
            .bind(&p.ip)
            .bind(&p.dns)
            .bind(p.port as i64)
            .bind(&p.value)
            .bind(p.status as i64),
        };

        insert
            .execute(&mut *tx)
            .await
            .map_err(|e| BackendError::Store(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| BackendError::Store(e.to_string()))?;

        Ok(id as u64)
    }

    async fn drain(
        &self,
        kind: RecordKind,
        after_id: u64,
        max_batch: usize,
    ) -> Result<Vec<CacheRecord>, BackendError> {
        let sql = match kind {
            RecordKind::Autoregistration => {
                "SELECT id, clock, host, listen_ip, listen_dns, listen_port, tls_accepted, \
                 host_metadata, flags FROM proxy_autoreg_host WHERE id > ? ORDER BY id LIMIT ?"
            }
            RecordKind::History => {
                "SELECT id, clock, itemid, value, ns, state FROM proxy_history \
                 WHERE id > ? ORDER BY id LIMIT ?"
            }
            RecordKind::Discovery => {
                "SELECT id, clock, druleid, dcheckid, ip, dns, port, value, status \
                 FROM proxy_dhistory WHERE id > ? ORDER BY id LIMIT ?"
            }
        };

        let rows = retry("sql_drain", &RetryConfig::query(), || async {
            sqlx::query(sql)
                .bind(after_id as i64)
                .bind(max_batch as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| BackendError::Store(e.to_string()))
        })
        .await?;

        rows.iter()
            .map(|row| Self::record_from_row(kind, row))
            .collect()
    }

    async fn purge(&self, kind: RecordKind, ids: &[u64]) -> Result<u64, BackendError> {
        if ids.is_empty() {
            return Ok(0);
        }

        // MySQL max_allowed_packet caps how many placeholders fit in one
        // statement, so delete in chunks.
        let mut removed = 0u64;
        for chunk in ids.chunks(PURGE_CHUNK_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "DELETE FROM {} WHERE id IN ({})",
                kind.table(),
                placeholders
            );

            let result = retry("sql_purge", &RetryConfig::query(), || async {
                let mut query = sqlx::query(&sql);
                for id in chunk {
                    query = query.bind(*id as i64);
                }
                query
                    .execute(&self.pool)
                    .await
                    .map_err(|e| BackendError::Store(e.to_string()))
            })
            .await?;

            removed += result.rows_affected();
        }
        Ok(removed)
    }

    async fn pending(&self, kind: RecordKind) -> Result<u64, BackendError> {
        let sql = format!("SELECT COUNT(*) AS cnt FROM {}", kind.table());
        let row = retry("sql_pending", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| BackendError::Store(e.to_string()))
        })
        .await?;

        let count: i64 = row
            .try_get("cnt")
            .map_err(|e| BackendError::Store(e.to_string()))?;
        Ok(count as u64)
    }

    async fn expire(&self, kind: RecordKind, horizon_clock: i64) -> Result<u64, BackendError> {
        let sql = format!("DELETE FROM {} WHERE clock < ?", kind.table());
        let result = retry("sql_expire", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(horizon_clock)
                .execute(&self.pool)
                .await
                .map_err(|e| BackendError::Store(e.to_string()))
        })
        .await?;
        Ok(result.rows_affected())
    }

    async fn load_cursor(&self, kind: RecordKind) -> Result<u64, BackendError> {
        let row = retry("sql_load_cursor", &RetryConfig::query(), || async {
            sqlx::query("SELECT acked_id FROM proxy_flush_cursor WHERE kind = ?")
                .bind(kind.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| BackendError::Store(e.to_string()))
        })
        .await?;

        match row {
            Some(row) => {
                let acked: i64 = row
                    .try_get("acked_id")
                    .map_err(|e| BackendError::Store(e.to_string()))?;
                Ok(acked as u64)
            }
            None => Ok(0),
        }
    }

    async fn store_cursor(&self, kind: RecordKind, acked_id: u64) -> Result<(), BackendError> {
        // Monotonic upsert: a replayed or late ack can never move the
        // cursor backwards.
        let sql = if self.is_sqlite {
            "INSERT INTO proxy_flush_cursor (kind, acked_id) VALUES (?, ?) \
             ON CONFLICT(kind) DO UPDATE SET acked_id = MAX(acked_id, excluded.acked_id)"
        } else {
            "INSERT INTO proxy_flush_cursor (kind, acked_id) VALUES (?, ?) \
             ON DUPLICATE KEY UPDATE acked_id = GREATEST(acked_id, VALUES(acked_id))"
        };

        retry("sql_store_cursor", &RetryConfig::query(), || async {
            sqlx::query(sql)
                .bind(kind.as_str())
                .bind(acked_id as i64)
                .execute(&self.pool)
                .await
                .map_err(|e| BackendError::Store(e.to_string()))
        })
        .await?;
        Ok(())
    }
}
