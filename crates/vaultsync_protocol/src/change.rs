//! Change records: the unit of synchronization.

use crate::record::EntityRecord;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The action a change performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// A new record was created.
    Create,
    /// An existing record was partially modified.
    Update,
    /// A record was removed.
    Delete,
}

impl ChangeKind {
    /// Parses the action tag used on the wire (`create`/`update`/`delete`).
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "create" => Some(ChangeKind::Create),
            "update" => Some(ChangeKind::Update),
            "delete" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// Where a change originated.
///
/// The origin decides whether a change is eligible for upload: changes
/// written by this client, the device watcher, or the importer go out;
/// changes applied on behalf of the server (`Sync`) never echo back.
/// `Any` is the wildcard origin used by merge-produced changes that must
/// be applied unconditionally on every replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChangeOrigin {
    /// Originated from a specific client, identified by its client id.
    Client(String),
    /// Originated from the on-disk watcher of this device.
    Device,
    /// Originated from a bulk import.
    Importer,
    /// Originated from the remote authority.
    Sync,
    /// Wildcard: apply unconditionally, upload unconditionally.
    Any,
}

impl ChangeOrigin {
    /// Returns true for origins that are uploaded by the local session.
    pub fn is_local(&self, client_id: &str) -> bool {
        match self {
            ChangeOrigin::Client(id) => id == client_id,
            ChangeOrigin::Device | ChangeOrigin::Importer | ChangeOrigin::Any => true,
            ChangeOrigin::Sync => false,
        }
    }
}

impl From<String> for ChangeOrigin {
    fn from(s: String) -> Self {
        match s.as_str() {
            "sync" => ChangeOrigin::Sync,
            "*" => ChangeOrigin::Any,
            "device" => ChangeOrigin::Device,
            "importer" => ChangeOrigin::Importer,
            _ => ChangeOrigin::Client(s),
        }
    }
}

impl From<ChangeOrigin> for String {
    fn from(origin: ChangeOrigin) -> Self {
        match origin {
            ChangeOrigin::Client(id) => id,
            ChangeOrigin::Device => "device".into(),
            ChangeOrigin::Importer => "importer".into(),
            ChangeOrigin::Sync => "sync".into(),
            ChangeOrigin::Any => "*".into(),
        }
    }
}

/// A discrete create/update/delete mutation with an origin tag.
///
/// `key` is stable and globally unique within `table` for the lifetime of
/// the vault. Updates carry partial modifications whose keys may be dotted
/// paths into nested objects (see [`crate::apply_mods`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Change {
    /// A record creation carrying the full object.
    Create {
        /// Entity table the record belongs to.
        table: String,
        /// Primary key of the record.
        key: String,
        /// The full record.
        object: EntityRecord,
        /// Where the change originated.
        origin: ChangeOrigin,
    },
    /// A partial modification of an existing record.
    Update {
        /// Entity table the record belongs to.
        table: String,
        /// Primary key of the record.
        key: String,
        /// Partial modifications; keys may be dotted paths.
        mods: Map<String, Value>,
        /// Where the change originated.
        origin: ChangeOrigin,
    },
    /// A record removal.
    Delete {
        /// Entity table the record belongs to.
        table: String,
        /// Primary key of the record.
        key: String,
        /// Where the change originated.
        origin: ChangeOrigin,
    },
}

impl Change {
    /// Creates a Create change.
    pub fn create(table: impl Into<String>, object: EntityRecord, origin: ChangeOrigin) -> Self {
        let key = object.id().unwrap_or_default().to_string();
        Change::Create {
            table: table.into(),
            key,
            object,
            origin,
        }
    }

    /// Creates an Update change.
    pub fn update(
        table: impl Into<String>,
        key: impl Into<String>,
        mods: Map<String, Value>,
        origin: ChangeOrigin,
    ) -> Self {
        Change::Update {
            table: table.into(),
            key: key.into(),
            mods,
            origin,
        }
    }

    /// Creates a Delete change.
    pub fn delete(
        table: impl Into<String>,
        key: impl Into<String>,
        origin: ChangeOrigin,
    ) -> Self {
        Change::Delete {
            table: table.into(),
            key: key.into(),
            origin,
        }
    }

    /// Returns the change kind.
    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Create { .. } => ChangeKind::Create,
            Change::Update { .. } => ChangeKind::Update,
            Change::Delete { .. } => ChangeKind::Delete,
        }
    }

    /// Returns the table this change targets.
    pub fn table(&self) -> &str {
        match self {
            Change::Create { table, .. }
            | Change::Update { table, .. }
            | Change::Delete { table, .. } => table,
        }
    }

    /// Returns the record key this change targets.
    pub fn key(&self) -> &str {
        match self {
            Change::Create { key, .. }
            | Change::Update { key, .. }
            | Change::Delete { key, .. } => key,
        }
    }

    /// Returns the origin tag.
    pub fn origin(&self) -> &ChangeOrigin {
        match self {
            Change::Create { origin, .. }
            | Change::Update { origin, .. }
            | Change::Delete { origin, .. } => origin,
        }
    }

    /// Replaces the origin tag.
    pub fn with_origin(mut self, new_origin: ChangeOrigin) -> Self {
        match &mut self {
            Change::Create { origin, .. }
            | Change::Update { origin, .. }
            | Change::Delete { origin, .. } => *origin = new_origin,
        }
        self
    }

    /// Returns the `updatedAt` timestamp carried by the change payload,
    /// if any. Deletes carry none.
    pub fn updated_at(&self) -> Option<i64> {
        match self {
            Change::Create { object, .. } => object.updated_at(),
            Change::Update { mods, .. } => mods.get("updatedAt").and_then(Value::as_i64),
            Change::Delete { .. } => None,
        }
    }

    /// Returns the full object of a Create change.
    pub fn object(&self) -> Option<&EntityRecord> {
        match self {
            Change::Create { object, .. } => Some(object),
            _ => None,
        }
    }

    /// Returns the partial modifications of an Update change.
    pub fn mods(&self) -> Option<&Map<String, Value>> {
        match self {
            Change::Update { mods, .. } => Some(mods),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: Value) -> EntityRecord {
        serde_json::from_value(pairs).unwrap()
    }

    #[test]
    fn origin_string_roundtrip() {
        for (s, origin) in [
            ("sync", ChangeOrigin::Sync),
            ("*", ChangeOrigin::Any),
            ("device", ChangeOrigin::Device),
            ("importer", ChangeOrigin::Importer),
            ("client-7", ChangeOrigin::Client("client-7".into())),
        ] {
            assert_eq!(ChangeOrigin::from(s.to_string()), origin);
            assert_eq!(String::from(origin), s);
        }
    }

    #[test]
    fn origin_local_classification() {
        let mine = ChangeOrigin::Client("me".into());
        let theirs = ChangeOrigin::Client("them".into());

        assert!(mine.is_local("me"));
        assert!(!theirs.is_local("me"));
        assert!(ChangeOrigin::Device.is_local("me"));
        assert!(ChangeOrigin::Importer.is_local("me"));
        assert!(ChangeOrigin::Any.is_local("me"));
        assert!(!ChangeOrigin::Sync.is_local("me"));
    }

    #[test]
    fn create_change_derives_key_from_object() {
        let change = Change::create(
            "documents",
            record(json!({"id": "doc-1", "updatedAt": 10})),
            ChangeOrigin::Sync,
        );
        assert_eq!(change.key(), "doc-1");
        assert_eq!(change.kind(), ChangeKind::Create);
        assert_eq!(change.updated_at(), Some(10));
    }

    #[test]
    fn update_change_reads_updated_at_from_mods() {
        let mut mods = Map::new();
        mods.insert("updatedAt".into(), json!(99));
        let change = Change::update("tasks", "t-1", mods, ChangeOrigin::Device);
        assert_eq!(change.updated_at(), Some(99));
    }

    #[test]
    fn delete_change_has_no_timestamp() {
        let change = Change::delete("tasks", "t-1", ChangeOrigin::Sync);
        assert_eq!(change.updated_at(), None);
    }

    #[test]
    fn with_origin_retags() {
        let change = Change::delete("tasks", "t-1", ChangeOrigin::Sync).with_origin(ChangeOrigin::Any);
        assert_eq!(change.origin(), &ChangeOrigin::Any);
    }

    #[test]
    fn change_json_roundtrip() {
        let change = Change::create(
            "documents",
            record(json!({"id": "a", "content": "x"})),
            ChangeOrigin::Client("c1".into()),
        );
        let text = serde_json::to_string(&change).unwrap();
        let back: Change = serde_json::from_str(&text).unwrap();
        assert_eq!(back, change);
    }
}
