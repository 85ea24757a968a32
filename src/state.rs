// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache operating mode and destination routing.
//!
//! The cache runs in one of four modes, and every write or flush resolves
//! the current destination through [`CacheState`] before touching a
//! backend. Mode changes are serialized through a single write lock, so a
//! transition never interleaves with another transition.
//!
//! # Example
//!
//! ```
//! use proxy_data_cache::{CacheMode, CacheState, Destination, RecordKind};
//!
//! let state = CacheState::new(CacheMode::Memory);
//! assert_eq!(
//!     state.current_destination(RecordKind::History),
//!     Destination::Memory
//! );
//!
//! // The memory tier turned out to be unusable: demote, permanently.
//! assert!(state.demote_to_database_only());
//! assert_eq!(state.mode(), CacheMode::DatabaseOnly);
//!
//! // Asking for memory mode again does not bring it back.
//! assert_eq!(state.transition(CacheMode::Memory), CacheMode::DatabaseOnly);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::record::RecordKind;

/// Cache operating mode.
///
/// - **Disabled**: no buffering, every write is rejected.
/// - **Memory**: records buffer in bounded per-kind memory queues.
/// - **Database**: records buffer in the local database.
/// - **DatabaseOnly**: like Database, entered automatically when the
///   memory tier proves unusable. The cache never leaves it on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    Disabled = 0,
    Memory = 1,
    Database = 2,
    DatabaseOnly = 3,
}

impl CacheMode {
    /// Stable lowercase name, used for logs and the mode gauge label.
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Disabled => "disabled",
            CacheMode::Memory => "memory",
            CacheMode::Database => "database",
            CacheMode::DatabaseOnly => "database_only",
        }
    }
}

impl Default for CacheMode {
    fn default() -> Self {
        CacheMode::Database
    }
}

impl std::fmt::Display for CacheMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a write or flush for a given kind goes right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    /// The in-memory buffer.
    Memory,
    /// The local database.
    Database,
    /// Nowhere: the cache is disabled for this kind.
    None,
}

impl Destination {
    /// Stable lowercase name, used for logs and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Memory => "memory",
            Destination::Database => "database",
            Destination::None => "none",
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared mode state, constructed once and passed by reference.
///
/// Reads ([`mode`](CacheState::mode),
/// [`current_destination`](CacheState::current_destination)) are cheap and
/// never block behind a transition in progress for longer than the lock
/// hand-off itself; all mutation funnels through
/// [`transition`](CacheState::transition) and
/// [`demote_to_database_only`](CacheState::demote_to_database_only).
#[derive(Debug)]
pub struct CacheState {
    mode: RwLock<CacheMode>,
    /// Latched on the first memory-tier failure. Survives later
    /// transitions so a reload back to memory mode cannot undo the
    /// demotion.
    fell_back: AtomicBool,
}

impl CacheState {
    pub fn new(mode: CacheMode) -> Self {
        Self {
            mode: RwLock::new(mode),
            fell_back: AtomicBool::new(false),
        }
    }

    /// The current operating mode.
    #[must_use]
    pub fn mode(&self) -> CacheMode {
        *self.mode.read()
    }

    /// Resolve the destination for `kind` under the current mode.
    ///
    /// Pure lookup, no side effects. Destinations are resolved per kind
    /// even though every kind currently maps the same way.
    #[must_use]
    pub fn current_destination(&self, _kind: RecordKind) -> Destination {
        match *self.mode.read() {
            CacheMode::Disabled => Destination::None,
            CacheMode::Memory => Destination::Memory,
            CacheMode::Database | CacheMode::DatabaseOnly => Destination::Database,
        }
    }

    /// Whether the memory tier has been abandoned for this process.
    #[must_use]
    pub fn has_fallen_back(&self) -> bool {
        self.fell_back.load(Ordering::Acquire)
    }

    /// Switch to `requested`, returning the mode actually in effect.
    ///
    /// Requests for [`CacheMode::Memory`] after a demotion are answered
    /// with [`CacheMode::DatabaseOnly`]: the fallback is one-way for the
    /// lifetime of the process.
    pub fn transition(&self, requested: CacheMode) -> CacheMode {
        let mut mode = self.mode.write();
        let effective =
            if requested == CacheMode::Memory && self.fell_back.load(Ordering::Acquire) {
                CacheMode::DatabaseOnly
            } else {
                requested
            };
        *mode = effective;
        effective
    }

    /// Abandon the memory tier and latch [`CacheMode::DatabaseOnly`].
    ///
    /// Returns `true` for exactly one caller, the one that performed the
    /// demotion; concurrent callers racing on the same failure get
    /// `false`. The winner is expected to log the fallback warning.
    pub fn demote_to_database_only(&self) -> bool {
        let mut mode = self.mode.write();
        if *mode != CacheMode::Memory {
            return false;
        }
        *mode = CacheMode::DatabaseOnly;
        self.fell_back.store(true, Ordering::Release);
        true
    }
}
