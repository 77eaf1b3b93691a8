//! Resumable per-session sync state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Persisted cursor state for one sync session.
///
/// The hosting application persists this as opaque JSON whenever the
/// orchestrator requests a save; the orchestrator is the only writer.
///
/// # Invariants
///
/// - Every registered table has a `last_sync_timestamp` entry; absent
///   entries are migrated to `1` lazily.
/// - Per-table cursors never decrease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncContext {
    /// High-water mark per entity table, epoch milliseconds.
    pub last_sync_timestamp: BTreeMap<String, i64>,
    /// When the last full remote fetch started, epoch milliseconds.
    pub last_fetch_timestamp: i64,
    /// Tags of one-shot context migrations already applied.
    pub migrations: BTreeSet<String>,
    /// Tables registered with the session, in registration order.
    #[serde(rename = "services")]
    pub services_registered: Vec<String>,
}

impl Default for SyncContext {
    fn default() -> Self {
        Self {
            last_sync_timestamp: BTreeMap::new(),
            last_fetch_timestamp: 0,
            migrations: BTreeSet::new(),
            services_registered: Vec::new(),
        }
    }
}

impl SyncContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a context from persisted JSON.
    ///
    /// Earlier clients persisted `lastSyncTimestamp` as a single scalar;
    /// that shape is widened into a per-table map over the given tables.
    pub fn from_persisted(mut value: Value, tables: &[String]) -> Self {
        let scalar = value.get("lastSyncTimestamp").and_then(Value::as_i64);
        if scalar.is_some() {
            if let Some(fields) = value.as_object_mut() {
                fields.insert(
                    "lastSyncTimestamp".into(),
                    Value::Object(serde_json::Map::new()),
                );
            }
        }

        let mut context: SyncContext = serde_json::from_value(value).unwrap_or_default();
        if let Some(ts) = scalar {
            context.last_sync_timestamp =
                tables.iter().map(|t| (t.clone(), ts)).collect();
        }
        context.prepare(tables);
        context
    }

    /// Ensures every table has a cursor entry and applies pending
    /// one-shot migrations.
    pub fn prepare(&mut self, tables: &[String]) {
        for table in tables {
            self.last_sync_timestamp.entry(table.clone()).or_insert(1);
        }
        self.run_migrations();
    }

    /// Applies tagged one-shot migrations. Each tag runs at most once per
    /// persisted context.
    pub fn run_migrations(&mut self) {
        if !self.migrations.contains("1.2") {
            self.last_sync_timestamp.insert("integrations".into(), 1);
            self.migrations.insert("1.2".into());
        }
    }

    /// Returns the cursor for a table, defaulting to `1`.
    pub fn table_cursor(&self, table: &str) -> i64 {
        self.last_sync_timestamp.get(table).copied().unwrap_or(1)
    }

    /// Advances a table cursor. Never moves backwards.
    pub fn observe_sync_timestamp(&mut self, table: &str, ts: i64) {
        let entry = self.last_sync_timestamp.entry(table.to_string()).or_insert(1);
        *entry = (*entry).max(ts);
    }

    /// Advances the full-fetch cursor. Never moves backwards.
    pub fn advance_fetch_timestamp(&mut self, now: i64) {
        self.last_fetch_timestamp = self.last_fetch_timestamp.max(now);
    }

    /// Records the tables registered with this session.
    pub fn register_services(&mut self, tables: &[String]) {
        self.services_registered = tables.to_vec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tables(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn prepare_seeds_missing_cursors() {
        let mut ctx = SyncContext::new();
        ctx.prepare(&tables(&["documents", "tasks"]));

        assert_eq!(ctx.table_cursor("documents"), 1);
        assert_eq!(ctx.table_cursor("tasks"), 1);
        // unregistered table still reads as 1
        assert_eq!(ctx.table_cursor("events"), 1);
    }

    #[test]
    fn legacy_scalar_cursor_widens_to_map() {
        let persisted = json!({
            "lastSyncTimestamp": 5000,
            "lastFetchTimestamp": 4000,
            "migrations": [],
            "services": [],
        });
        let ctx = SyncContext::from_persisted(persisted, &tables(&["documents", "tasks"]));

        assert_eq!(ctx.table_cursor("documents"), 5000);
        assert_eq!(ctx.table_cursor("tasks"), 5000);
        assert_eq!(ctx.last_fetch_timestamp, 4000);
    }

    #[test]
    fn migration_1_2_resets_integrations_once() {
        let mut ctx = SyncContext::new();
        ctx.prepare(&tables(&["integrations"]));
        assert!(ctx.migrations.contains("1.2"));

        // a later observation is not undone by re-running migrations
        ctx.observe_sync_timestamp("integrations", 777);
        ctx.run_migrations();
        assert_eq!(ctx.table_cursor("integrations"), 777);
    }

    #[test]
    fn cursors_are_monotonic() {
        let mut ctx = SyncContext::new();
        ctx.observe_sync_timestamp("documents", 100);
        ctx.observe_sync_timestamp("documents", 50);
        assert_eq!(ctx.table_cursor("documents"), 100);

        ctx.advance_fetch_timestamp(200);
        ctx.advance_fetch_timestamp(150);
        assert_eq!(ctx.last_fetch_timestamp, 200);
    }

    #[test]
    fn persisted_roundtrip() {
        let mut ctx = SyncContext::new();
        ctx.prepare(&tables(&["documents"]));
        ctx.observe_sync_timestamp("documents", 42);
        ctx.register_services(&tables(&["documents"]));

        let value = serde_json::to_value(&ctx).unwrap();
        assert!(value.get("lastSyncTimestamp").is_some());
        assert!(value.get("services").is_some());

        let back = SyncContext::from_persisted(value, &tables(&["documents"]));
        assert_eq!(back.table_cursor("documents"), 42);
        assert_eq!(back.services_registered, tables(&["documents"]));
    }
}
