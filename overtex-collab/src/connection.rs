//! Per-connection bookkeeping held by a live document.

use std::collections::HashSet;
use uuid::Uuid;

use crate::auth::{Identity, Permission};
use crate::presence::ClientId;

/// Opaque handle for one transport session.
pub type ConnectionId = Uuid;

/// A transport session attached to a document.
///
/// Documents refer to connections only by [`ConnectionId`]; the socket
/// itself is owned by the transport task.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    /// `None` for share-token access
    pub identity: Option<Identity>,
    pub permission: Permission,
    /// Initial file hint from the upgrade request
    pub active_file: Option<String>,
    /// Awareness client ids this connection has published
    pub awareness_ids: HashSet<ClientId>,
}

impl Connection {
    pub fn new(identity: Option<Identity>, permission: Permission) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            permission,
            active_file: None,
            awareness_ids: HashSet::new(),
        }
    }

    pub fn with_active_file(mut self, file: Option<String>) -> Self {
        self.active_file = file;
        self
    }

    pub fn can_edit(&self) -> bool {
        self.permission.can_edit()
    }

    /// Name used in log lines.
    pub fn label(&self) -> &str {
        self.identity
            .as_ref()
            .map(|i| i.email.as_str())
            .unwrap_or("anonymous")
    }
}
