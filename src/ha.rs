// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! High-availability ownership gate.
//!
//! When the proxy runs as part of an HA cluster, only the active node may
//! write to the shared database or flush upstream. The gate wraps a
//! `watch::Receiver` fed by the cluster manager, so role checks are a
//! lock-free borrow of the latest announced role. A standalone proxy
//! (no `ha_node_name` configured) is always active.
//!
//! # Example
//!
//! ```
//! use proxy_data_cache::{HaGate, NodeRole};
//! use tokio::sync::watch;
//!
//! let standalone = HaGate::standalone();
//! assert!(standalone.is_active_node());
//!
//! let (role_tx, role_rx) = watch::channel(NodeRole::Standby);
//! let gate = HaGate::watched("node-2".to_string(), role_rx);
//! assert!(!gate.is_active_node());
//!
//! role_tx.send(NodeRole::Active).unwrap();
//! assert!(gate.is_active_node());
//! ```

use tokio::sync::watch;

/// This node's role in the HA cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Owns the database and the upstream connection.
    Active,
    /// Hot standby: must not write or flush.
    Standby,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Active => f.write_str("active"),
            NodeRole::Standby => f.write_str("standby"),
        }
    }
}

/// Answers "may this node touch shared state right now?".
///
/// Cheap to clone; clones share the underlying role channel.
#[derive(Debug, Clone)]
pub struct HaGate {
    node_name: Option<String>,
    role_rx: Option<watch::Receiver<NodeRole>>,
}

impl HaGate {
    /// Gate for a proxy running outside any HA cluster. Always active.
    pub fn standalone() -> Self {
        Self {
            node_name: None,
            role_rx: None,
        }
    }

    /// Gate for HA node `node_name`, following roles announced on `role_rx`.
    pub fn watched(node_name: String, role_rx: watch::Receiver<NodeRole>) -> Self {
        Self {
            node_name: Some(node_name),
            role_rx: Some(role_rx),
        }
    }

    /// The configured HA node name, if clustered.
    pub fn node_name(&self) -> Option<&str> {
        self.node_name.as_deref()
    }

    /// Whether this node currently owns writes and flushes.
    ///
    /// Non-blocking: reads the last role the cluster manager published.
    #[must_use]
    pub fn is_active_node(&self) -> bool {
        match &self.role_rx {
            Some(rx) => *rx.borrow() == NodeRole::Active,
            None => true,
        }
    }
}
