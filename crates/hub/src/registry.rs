//! Shared label -> connection map used by the accept, keepalive and operator
//! loops.
//!
//! One async `RwLock` guards the map. It is held for the map operation only;
//! every network call happens on a snapshot after the guard is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionId};
use crate::error::{ChannelError, RegistryError};
use crate::protocol::MessageKind;

/// Outcome of one broadcast pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    /// Mid-write when the pass reached them. A write in progress shows the
    /// socket is alive, so these are left alone.
    pub busy: Vec<String>,
    pub pruned: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, Arc<Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under its proposed label and return the label
    /// it ended up with.
    ///
    /// An empty or colliding label is replaced by the remote port, or by
    /// `{port}-{id}` when even the port is already taken as a label.
    pub async fn insert(&self, conn: Arc<Connection>) -> String {
        let mut entries = self.entries.write().await;
        let proposed = conn.label();

        let label = if !proposed.is_empty() && !entries.contains_key(&proposed) {
            proposed
        } else {
            let port = conn.port_label();
            let fallback = if entries.contains_key(&port) {
                format!("{port}-{}", conn.id().0)
            } else {
                port
            };
            if !proposed.is_empty() {
                info!(requested = %proposed, label = %fallback, "label taken, using fallback");
            }
            fallback
        };

        conn.set_label(label.clone());
        entries.insert(label.clone(), conn);
        label
    }

    pub async fn lookup(&self, label: &str) -> Option<Arc<Connection>> {
        self.entries.read().await.get(label).cloned()
    }

    pub async fn lookup_id(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.entries
            .read()
            .await
            .values()
            .find(|conn| conn.id() == id)
            .cloned()
    }

    pub async fn contains(&self, label: &str) -> bool {
        self.entries.read().await.contains_key(label)
    }

    pub async fn remove(&self, label: &str) -> Option<Arc<Connection>> {
        self.entries.write().await.remove(label)
    }

    /// Remove `conn` if it is still registered. A label since taken over by
    /// another connection is left alone. Returns whether anything was removed.
    pub async fn remove_connection(&self, conn: &Connection) -> bool {
        let mut entries = self.entries.write().await;
        let label = conn.label();
        match entries.get(&label) {
            Some(existing) if existing.id() == conn.id() => {
                entries.remove(&label);
                true
            }
            _ => false,
        }
    }

    /// Move the entry at `old` to `new`, updating the connection's label.
    /// Fails without changing anything if `new` is already in use.
    pub async fn relabel(&self, old: &str, new: &str) -> Result<(), RegistryError> {
        if new.is_empty() {
            return Err(RegistryError::EmptyLabel);
        }
        let mut entries = self.entries.write().await;
        if !entries.contains_key(old) {
            return Err(RegistryError::NotFound(old.to_string()));
        }
        if old == new {
            return Ok(());
        }
        if entries.contains_key(new) {
            return Err(RegistryError::DuplicateLabel(new.to_string()));
        }

        if let Some(conn) = entries.remove(old) {
            conn.set_label(new.to_string());
            entries.insert(new.to_string(), conn);
        }
        Ok(())
    }

    /// Copy of the current entries, safe to iterate while others mutate.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.entries.read().await.keys().cloned().collect();
        labels.sort();
        labels
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Send one message to every connection registered when the call starts.
    ///
    /// Connections that fail are removed. A send that times out also gets
    /// its transport shut down, since the peer is unresponsive rather than
    /// gone. Connections already busy writing are skipped rather than
    /// queued behind. Entries added during the pass are not sent to.
    pub async fn broadcast(
        &self,
        kind: MessageKind,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> BroadcastReport {
        let targets = self.snapshot().await;
        let mut report = BroadcastReport::default();

        for conn in targets {
            let label = conn.label();
            match conn.send_if_idle(kind, payload, timeout).await {
                Ok(true) => report.delivered.push(label),
                Ok(false) => {
                    debug!(label = %label, "agent busy with a transfer, skipped");
                    report.busy.push(label);
                }
                Err(ChannelError::Timeout(limit)) => {
                    warn!(label = %label, addr = %conn.addr(), ?limit, "agent unresponsive, closing");
                    if self.remove_connection(&conn).await {
                        report.pruned.push(label);
                    }
                    conn.close().await;
                }
                Err(err) => {
                    debug!(label = %label, addr = %conn.addr(), error = %err, "send failed");
                    if self.remove_connection(&conn).await {
                        info!(label = %label, addr = %conn.addr(), "agent disconnected");
                        report.pruned.push(label);
                    }
                }
            }
        }

        report
    }
}
