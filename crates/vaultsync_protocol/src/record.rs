//! Entity records and vaults as the engine sees them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A generic entity record.
///
/// The engine does not own the domain schema; it inspects a handful of
/// well-known fields (`id`, `updatedAt`, `createdAt`, `vaultId`,
/// `filepath`, `dailyDoc`, `content`) and passes everything else through
/// untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityRecord(Map<String, Value>);

impl EntityRecord {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wraps an existing JSON object.
    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Returns the underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consumes the record, returning the underlying JSON object.
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Returns the record id.
    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    /// Returns the `updatedAt` timestamp in epoch milliseconds.
    pub fn updated_at(&self) -> Option<i64> {
        self.0.get("updatedAt").and_then(Value::as_i64)
    }

    /// Sets the `updatedAt` timestamp.
    pub fn set_updated_at(&mut self, ts: i64) {
        self.0.insert("updatedAt".into(), Value::from(ts));
    }

    /// Returns the `createdAt` timestamp in epoch milliseconds.
    pub fn created_at(&self) -> Option<i64> {
        self.0.get("createdAt").and_then(Value::as_i64)
    }

    /// Returns the vault this record belongs to, if scoped.
    pub fn vault_id(&self) -> Option<&str> {
        self.0.get("vaultId").and_then(Value::as_str)
    }

    /// Returns the local-storage-location hint, if materialized.
    pub fn filepath(&self) -> Option<&str> {
        self.0.get("filepath").and_then(Value::as_str)
    }

    /// Sets the local-storage-location hint.
    pub fn set_filepath(&mut self, filepath: impl Into<String>) {
        self.0.insert("filepath".into(), Value::from(filepath.into()));
    }

    /// Returns the logical-day key of a daily doc, if this is one.
    pub fn daily_doc(&self) -> Option<&str> {
        self.0.get("dailyDoc").and_then(Value::as_str)
    }

    /// Returns the content string.
    pub fn content(&self) -> Option<&str> {
        self.0.get("content").and_then(Value::as_str)
    }

    /// Sets the content string.
    pub fn set_content(&mut self, content: impl Into<String>) {
        self.0.insert("content".into(), Value::from(content.into()));
    }

    /// Returns an arbitrary field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Sets an arbitrary field.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    /// Removes a field, returning its previous value.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Overlays this record's fields onto `base`, returning the merged
    /// record. Fields present in `self` win.
    pub fn overlaid_on(&self, base: &EntityRecord) -> EntityRecord {
        let mut merged = base.0.clone();
        for (k, v) in &self.0 {
            merged.insert(k.clone(), v.clone());
        }
        EntityRecord(merged)
    }

    /// Strips fields that must never leave this device.
    pub fn strip_local_fields(&self) -> EntityRecord {
        let mut out = self.clone();
        out.remove("filepath");
        out
    }
}

impl From<Map<String, Value>> for EntityRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// Whether a vault syncs with the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultKind {
    /// Device-only vault, invisible to the remote service.
    Local,
    /// Remotely synced vault.
    Remote,
}

/// A user's isolated data namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vault {
    /// Vault id.
    pub id: String,
    /// On-disk location, when the vault is materialized locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath: Option<String>,
    /// Local or remote.
    #[serde(rename = "type")]
    pub kind: VaultKind,
}

impl Vault {
    /// Creates a remote vault.
    pub fn remote(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            filepath: None,
            kind: VaultKind::Remote,
        }
    }

    /// Creates a local-only vault.
    pub fn local(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            filepath: None,
            kind: VaultKind::Local,
        }
    }

    /// Returns true if this vault participates in sync.
    pub fn is_remote(&self) -> bool {
        self.kind == VaultKind::Remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> EntityRecord {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn typed_accessors() {
        let rec = record(json!({
            "id": "doc-1",
            "updatedAt": 1000,
            "createdAt": 500,
            "vaultId": "v1",
            "dailyDoc": "2024-01-01",
            "content": "hello",
        }));

        assert_eq!(rec.id(), Some("doc-1"));
        assert_eq!(rec.updated_at(), Some(1000));
        assert_eq!(rec.created_at(), Some(500));
        assert_eq!(rec.vault_id(), Some("v1"));
        assert_eq!(rec.daily_doc(), Some("2024-01-01"));
        assert_eq!(rec.content(), Some("hello"));
        assert_eq!(rec.filepath(), None);
    }

    #[test]
    fn overlay_prefers_incoming_fields() {
        let local = record(json!({"id": "a", "content": "old", "filepath": "/tmp/a.md"}));
        let incoming = record(json!({"id": "a", "content": "new"}));

        let merged = incoming.overlaid_on(&local);
        assert_eq!(merged.content(), Some("new"));
        assert_eq!(merged.filepath(), Some("/tmp/a.md"));
    }

    #[test]
    fn strip_local_fields_removes_filepath() {
        let rec = record(json!({"id": "a", "filepath": "/tmp/a.md", "content": "x"}));
        let stripped = rec.strip_local_fields();
        assert_eq!(stripped.filepath(), None);
        assert_eq!(stripped.content(), Some("x"));
        // original untouched
        assert_eq!(rec.filepath(), Some("/tmp/a.md"));
    }

    #[test]
    fn vault_kind_serde() {
        let vault: Vault = serde_json::from_value(json!({"id": "v1", "type": "remote"})).unwrap();
        assert!(vault.is_remote());

        let vault: Vault =
            serde_json::from_value(json!({"id": "v2", "type": "local", "filepath": "/vaults/v2"}))
                .unwrap();
        assert!(!vault.is_remote());
        assert_eq!(vault.filepath.as_deref(), Some("/vaults/v2"));
    }
}
