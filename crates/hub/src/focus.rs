use std::sync::Arc;

use tracing::{info, warn};

use crate::connection::{Connection, ConnectionId};
use crate::error::{FocusError, RegistryError};
use crate::ops::{self, ExchangePolicy};
use crate::registry::Registry;

/// Outcome of replacing a dead focus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failover {
    /// Exactly one agent was left and it is now focused.
    Switched(String),
    /// Several agents remain; someone has to pick one.
    Ambiguous(Vec<String>),
    /// Nobody is left.
    Exhausted,
}

/// The agent the operator is currently talking to.
///
/// Holds a label plus the connection id so a focus survives relabels and
/// never silently follows a label over to a different connection.
pub struct Focus {
    registry: Arc<Registry>,
    current: Option<(String, ConnectionId)>,
    cwd: Option<String>,
    policy: ExchangePolicy,
}

impl Focus {
    pub fn new(registry: Arc<Registry>, policy: ExchangePolicy) -> Self {
        Self {
            registry,
            current: None,
            cwd: None,
            policy,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn policy(&self) -> ExchangePolicy {
        self.policy
    }

    pub fn focus_on(&mut self, conn: &Connection) {
        self.current = Some((conn.label(), conn.id()));
        self.cwd = None;
    }

    pub fn label(&self) -> Option<&str> {
        self.current.as_ref().map(|(label, _)| label.as_str())
    }

    /// Last working directory reported by the focused agent.
    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    /// Look the focused connection up in the registry.
    pub async fn resolve(&mut self) -> Result<Arc<Connection>, FocusError> {
        let (label, id) = self.current.as_mut().ok_or(FocusError::NoFocus)?;

        if let Some(conn) = self.registry.lookup(label).await {
            if conn.id() == *id {
                return Ok(conn);
            }
        }
        match self.registry.lookup_id(*id).await {
            Some(conn) => {
                *label = conn.label();
                Ok(conn)
            }
            None => Err(FocusError::Lost(label.clone())),
        }
    }

    /// Focus the agent registered as `label`. The focus is unchanged when
    /// there is no such agent.
    pub async fn switch(&mut self, label: &str) -> Result<Arc<Connection>, FocusError> {
        let conn = self
            .registry
            .lookup(label)
            .await
            .ok_or_else(|| RegistryError::NotFound(label.to_string()))?;
        self.focus_on(&conn);
        info!(label = %label, addr = %conn.addr(), "focus switched");
        Ok(conn)
    }

    /// Rename the focused agent; the focus follows it.
    pub async fn relabel(&mut self, new: &str) -> Result<(), FocusError> {
        let conn = self.resolve().await?;
        let old = conn.label();
        self.registry.relabel(&old, new).await?;
        if let Some((label, _)) = self.current.as_mut() {
            *label = new.to_string();
        }
        info!(old = %old, new = %new, "agent relabelled");
        Ok(())
    }

    /// Ask the focused agent for its working directory and cache it.
    pub async fn refresh_cwd(&mut self) -> Result<&str, FocusError> {
        let conn = self.resolve().await?;
        let cwd = ops::current_dir(&conn, self.policy).await?;
        Ok(self.cwd.insert(cwd).as_str())
    }

    /// Sorted labels of every agent that could be focused.
    pub async fn candidates(&self) -> Vec<String> {
        self.registry.labels().await
    }

    /// Drop the focused connection and pick a replacement if the choice is
    /// unambiguous.
    pub async fn failover(&mut self) -> Failover {
        if let Some((label, id)) = self.current.take() {
            if let Some(conn) = self.registry.lookup_id(id).await {
                self.registry.remove_connection(&conn).await;
                conn.close().await;
            }
            warn!(label = %label, "focused agent disconnected");
        }
        self.cwd = None;

        loop {
            let mut labels = self.registry.labels().await;
            match labels.len() {
                0 => return Failover::Exhausted,
                1 => {
                    let label = labels.remove(0);
                    // Lost a race with the keepalive loop; look again.
                    if self.switch(&label).await.is_ok() {
                        return Failover::Switched(label);
                    }
                }
                _ => return Failover::Ambiguous(labels),
            }
        }
    }
}
