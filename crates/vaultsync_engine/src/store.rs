//! Local store contracts consumed by the engine.
//!
//! The engine owns no storage. It depends on a durable, ordered change
//! journal and a key-value table per entity type, exposed by the hosting
//! application. Ids always originate upstream; the engine only stamps
//! timestamps.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;
use vaultsync_protocol::{apply_mods, Change, EntityRecord, SyncContext};

/// Durable local storage: journal plus key-value tables.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Reads one record.
    async fn get(&self, table: &str, key: &str) -> SyncResult<Option<EntityRecord>>;

    /// Lists a table, optionally scoped to one vault.
    async fn list(&self, table: &str, vault_id: Option<&str>) -> SyncResult<Vec<EntityRecord>>;

    /// Reads several records by id, skipping missing ones.
    async fn list_by_ids(&self, table: &str, ids: &[String]) -> SyncResult<Vec<EntityRecord>>;

    /// Applies a change set atomically.
    ///
    /// Application is idempotent: creates and updates conflate onto the
    /// stored record, deleting a missing key is a no-op.
    async fn apply_changes(&self, changes: &[Change]) -> SyncResult<()>;

    /// Takes the journal backlog accumulated before the session started.
    /// Each backlog entry is handed out exactly once.
    async fn take_pending_changes(&self) -> SyncResult<Vec<Change>>;

    /// Subscribes to journal batches recorded after this call.
    fn subscribe_journal(&self) -> mpsc::Receiver<Vec<Change>>;
}

/// Persistence for [`SyncContext`] snapshots, keyed by session scope.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Loads the persisted context for a scope.
    async fn load(&self, scope: &str) -> SyncResult<Option<Value>>;

    /// Persists the context for a scope.
    async fn save(&self, scope: &str, context: &SyncContext) -> SyncResult<()>;
}

/// An in-memory store for tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, BTreeMap<String, EntityRecord>>>,
    pending: Mutex<Vec<Change>>,
    journal: Mutex<Vec<mpsc::Sender<Vec<Change>>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record directly, without touching the journal.
    pub fn seed(&self, table: &str, record: EntityRecord) {
        let key = record.id().unwrap_or_default().to_string();
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(key, record);
    }

    /// Records a local mutation: stores it and journals it.
    ///
    /// The change lands in the pre-session backlog until a journal
    /// subscriber exists, then flows through the subscription.
    pub async fn record_local_change(&self, change: Change) {
        self.apply_one(&change);
        let senders: Vec<_> = self.journal.lock().clone();
        if senders.is_empty() {
            self.pending.lock().push(change);
            return;
        }
        for sender in senders {
            let _ = sender.send(vec![change.clone()]).await;
        }
    }

    /// Returns the number of records in a table.
    pub fn table_len(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, BTreeMap::len)
    }

    fn apply_one(&self, change: &Change) {
        let mut tables = self.tables.write();
        let table = tables.entry(change.table().to_string()).or_default();
        match change {
            Change::Create { key, object, .. } => {
                table.insert(key.clone(), object.clone());
            }
            Change::Update { key, mods, .. } => {
                let mut record = table
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| {
                        let mut fresh = EntityRecord::new();
                        fresh.set("id", Value::from(key.clone()));
                        fresh
                    });
                apply_mods(&mut record, mods);
                table.insert(key.clone(), record);
            }
            Change::Delete { key, .. } => {
                table.remove(key);
            }
        }
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get(&self, table: &str, key: &str) -> SyncResult<Option<EntityRecord>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|t| t.get(key))
            .cloned())
    }

    async fn list(&self, table: &str, vault_id: Option<&str>) -> SyncResult<Vec<EntityRecord>> {
        let tables = self.tables.read();
        let Some(records) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(records
            .values()
            .filter(|record| match (vault_id, record.vault_id()) {
                (Some(vault), Some(record_vault)) => vault == record_vault,
                _ => true,
            })
            .cloned()
            .collect())
    }

    async fn list_by_ids(&self, table: &str, ids: &[String]) -> SyncResult<Vec<EntityRecord>> {
        let tables = self.tables.read();
        let Some(records) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| records.get(id).cloned()).collect())
    }

    async fn apply_changes(&self, changes: &[Change]) -> SyncResult<()> {
        for change in changes {
            self.apply_one(change);
        }
        Ok(())
    }

    async fn take_pending_changes(&self) -> SyncResult<Vec<Change>> {
        Ok(std::mem::take(&mut *self.pending.lock()))
    }

    fn subscribe_journal(&self) -> mpsc::Receiver<Vec<Change>> {
        let (tx, rx) = mpsc::channel(64);
        self.journal.lock().push(tx);
        rx
    }
}

/// In-memory [`ContextStore`] for tests.
#[derive(Default)]
pub struct MemoryContextStore {
    contexts: Mutex<HashMap<String, Value>>,
}

impl MemoryContextStore {
    /// Creates an empty context store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the last persisted context for a scope.
    pub fn saved(&self, scope: &str) -> Option<SyncContext> {
        self.contexts
            .lock()
            .get(scope)
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn load(&self, scope: &str) -> SyncResult<Option<Value>> {
        Ok(self.contexts.lock().get(scope).cloned())
    }

    async fn save(&self, scope: &str, context: &SyncContext) -> SyncResult<()> {
        let value = serde_json::to_value(context)
            .map_err(|e| SyncError::Store(e.to_string()))?;
        self.contexts.lock().insert(scope.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vaultsync_protocol::ChangeOrigin;

    fn record(value: Value) -> EntityRecord {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn apply_create_twice_is_idempotent() {
        let store = MemoryStore::new();
        let change = Change::create(
            "documents",
            record(json!({"id": "a", "content": "x"})),
            ChangeOrigin::Sync,
        );

        store.apply_changes(&[change.clone()]).await.unwrap();
        store.apply_changes(&[change]).await.unwrap();

        assert_eq!(store.table_len("documents"), 1);
        let stored = store.get("documents", "a").await.unwrap().unwrap();
        assert_eq!(stored.content(), Some("x"));
    }

    #[tokio::test]
    async fn update_conflates_onto_missing_record() {
        let store = MemoryStore::new();
        let mut mods = serde_json::Map::new();
        mods.insert("content".into(), json!("x"));
        let change = Change::update("documents", "a", mods, ChangeOrigin::Sync);

        store.apply_changes(&[change]).await.unwrap();

        let stored = store.get("documents", "a").await.unwrap().unwrap();
        assert_eq!(stored.id(), Some("a"));
        assert_eq!(stored.content(), Some("x"));
    }

    #[tokio::test]
    async fn delete_of_missing_key_is_noop() {
        let store = MemoryStore::new();
        let change = Change::delete("documents", "ghost", ChangeOrigin::Sync);
        store.apply_changes(&[change]).await.unwrap();
        assert_eq!(store.table_len("documents"), 0);
    }

    #[tokio::test]
    async fn pending_backlog_is_taken_once() {
        let store = MemoryStore::new();
        store
            .record_local_change(Change::create(
                "tasks",
                record(json!({"id": "t1"})),
                ChangeOrigin::Device,
            ))
            .await;

        let first = store.take_pending_changes().await.unwrap();
        assert_eq!(first.len(), 1);
        let second = store.take_pending_changes().await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn journal_subscription_receives_later_changes() {
        let store = MemoryStore::new();
        let mut journal = store.subscribe_journal();

        store
            .record_local_change(Change::delete("tasks", "t1", ChangeOrigin::Device))
            .await;

        let batch = journal.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].key(), "t1");
        // subscribed changes do not also land in the backlog
        assert!(store.take_pending_changes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_filters_by_vault_when_scoped() {
        let store = MemoryStore::new();
        store.seed("documents", record(json!({"id": "a", "vaultId": "v1"})));
        store.seed("documents", record(json!({"id": "b", "vaultId": "v2"})));
        store.seed("documents", record(json!({"id": "c"})));

        let v1 = store.list("documents", Some("v1")).await.unwrap();
        let ids: Vec<_> = v1.iter().filter_map(|r| r.id()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let all = store.list("documents", None).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn context_store_roundtrip() {
        let contexts = MemoryContextStore::new();
        let mut context = SyncContext::new();
        context.observe_sync_timestamp("documents", 42);

        contexts.save("vault-v1", &context).await.unwrap();
        let loaded = contexts.load("vault-v1").await.unwrap().unwrap();
        let restored: SyncContext = serde_json::from_value(loaded).unwrap();
        assert_eq!(restored.table_cursor("documents"), 42);
        assert_eq!(contexts.saved("vault-v1").unwrap(), restored);
    }
}
