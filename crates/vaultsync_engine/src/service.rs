//! Per-entity-type service registrations.

use crate::crypto::PayloadCipher;
use crate::gateway::EntityGateway;
use std::sync::Arc;

/// Table name of the user profile service.
pub const USERS_TABLE: &str = "users";
/// Table name of the documents service.
pub const DOCUMENTS_TABLE: &str = "documents";
/// Table name of the vaults service.
pub const VAULTS_TABLE: &str = "vaults";

/// One syncable entity type: its gateway, cipher, and table mapping.
#[derive(Clone)]
pub struct SyncService {
    /// Entity kind on the wire and in realtime events (e.g. `document`).
    pub entity_kind: String,
    /// Local table name (e.g. `documents`).
    pub table: String,
    /// Remote client for this entity type.
    pub gateway: Arc<dyn EntityGateway>,
    /// Payload cipher; a no-op passthrough for types that opt out.
    pub cipher: Arc<dyn PayloadCipher>,
    /// Whether records must carry a `filepath` before they count as
    /// materialized locally.
    pub requires_filepath: bool,
}

impl SyncService {
    /// Creates a service registration.
    pub fn new(
        entity_kind: impl Into<String>,
        table: impl Into<String>,
        gateway: Arc<dyn EntityGateway>,
        cipher: Arc<dyn PayloadCipher>,
    ) -> Self {
        Self {
            entity_kind: entity_kind.into(),
            table: table.into(),
            gateway,
            cipher,
            requires_filepath: false,
        }
    }

    /// Marks this entity type as requiring on-disk materialization.
    pub fn with_filepath_requirement(mut self) -> Self {
        self.requires_filepath = true;
        self
    }
}

/// The set of services one session syncs, with lookup by table and kind.
pub struct ServiceRegistry {
    services: Vec<SyncService>,
}

impl ServiceRegistry {
    /// Creates a registry.
    pub fn new(services: Vec<SyncService>) -> Self {
        Self { services }
    }

    /// Iterates the services in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &SyncService> {
        self.services.iter()
    }

    /// Returns the registered table names in order.
    pub fn tables(&self) -> Vec<String> {
        self.services.iter().map(|s| s.table.clone()).collect()
    }

    /// Returns true if the table belongs to a registered service.
    pub fn is_syncable(&self, table: &str) -> bool {
        self.services.iter().any(|s| s.table == table)
    }

    /// Looks a service up by table name.
    pub fn by_table(&self, table: &str) -> Option<&SyncService> {
        self.services.iter().find(|s| s.table == table)
    }

    /// Looks a service up by entity kind.
    pub fn by_kind(&self, kind: &str) -> Option<&SyncService> {
        self.services.iter().find(|s| s.entity_kind == kind)
    }

    /// The documents service, if registered.
    pub fn documents(&self) -> Option<&SyncService> {
        self.by_table(DOCUMENTS_TABLE)
    }

    /// The user profile service, if registered.
    pub fn users(&self) -> Option<&SyncService> {
        self.by_table(USERS_TABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PassthroughCipher;
    use crate::gateway::MockGateway;

    fn service(kind: &str, table: &str) -> SyncService {
        SyncService::new(
            kind,
            table,
            Arc::new(MockGateway::new(kind)),
            Arc::new(PassthroughCipher),
        )
    }

    #[test]
    fn registry_lookups() {
        let registry = ServiceRegistry::new(vec![
            service("document", "documents"),
            service("task", "tasks"),
            service("user", "users"),
        ]);

        assert!(registry.is_syncable("documents"));
        assert!(!registry.is_syncable("images"));
        assert_eq!(registry.by_kind("task").unwrap().table, "tasks");
        assert_eq!(registry.documents().unwrap().entity_kind, "document");
        assert_eq!(registry.users().unwrap().entity_kind, "user");
        assert_eq!(registry.tables(), vec!["documents", "tasks", "users"]);
    }

    #[test]
    fn filepath_requirement_flag() {
        let svc = service("document", "documents").with_filepath_requirement();
        assert!(svc.requires_filepath);
        assert!(!service("task", "tasks").requires_filepath);
    }
}
