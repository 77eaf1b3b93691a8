//! Daily-doc merge policy.
//!
//! The domain never intends two documents to represent the same calendar
//! day. When replicas diverge and a `(vault, dailyDoc)` pair ends up with
//! more than one record, the merge heals the violation: the record with
//! the oldest `createdAt` survives, every other record's content is
//! concatenated onto it in ascending `createdAt` order, and the losers are
//! deleted on both sides. Lossy but safe.
//!
//! The merge is a pure function over immutable inputs so the policy can be
//! property-tested in isolation.

use crate::change::{Change, ChangeOrigin};
use crate::record::EntityRecord;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// Table the merge operates on.
const DOCUMENTS_TABLE: &str = "documents";

/// Result of one daily-doc merge pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DailyDocMerge {
    /// Changes to apply to the local store. The survivor arrives as an
    /// Update when its id was already known locally, as a Create
    /// otherwise; incoming records for untouched days arrive as Creates
    /// tagged [`ChangeOrigin::Sync`].
    pub to_apply: Vec<Change>,
    /// Changes to upload to the remote authority: the survivor as a
    /// Create plus one Delete per merged-away record. Accepted new-day
    /// records are not echoed back.
    pub to_send: Vec<Change>,
}

/// Remote change set partitioned for the daily-doc pass.
#[derive(Debug, Clone, Default)]
pub struct DailySplit {
    /// Incoming daily-doc records (objects of remote Create changes).
    pub daily_doc_records: Vec<EntityRecord>,
    /// Keys of documents the remote set also deletes.
    pub delete_keys: HashSet<String>,
    /// Every other remote change, in original order.
    pub others: Vec<Change>,
}

/// Partitions a remote change set for the daily-doc merge.
///
/// Document deletes stay in `others` (they still apply); their keys are
/// additionally collected so already-deleted local records are not offered
/// to the merge.
pub fn split_for_daily_merge(remote_changes: Vec<Change>) -> DailySplit {
    let mut split = DailySplit::default();
    for change in remote_changes {
        if change.table() == DOCUMENTS_TABLE {
            match &change {
                Change::Delete { key, .. } => {
                    split.delete_keys.insert(key.clone());
                    split.others.push(change);
                    continue;
                }
                Change::Create { object, .. } if object.daily_doc().is_some() => {
                    split.daily_doc_records.push(object.clone());
                    continue;
                }
                _ => {}
            }
        }
        split.others.push(change);
    }
    split
}

/// Merges incoming daily-doc records against the local records sharing
/// their day keys.
///
/// `existing` are the local records whose `dailyDoc` matches one of the
/// incoming records (minus any already deleted remotely); `incoming` are
/// the objects of remote Create changes carrying a `dailyDoc`. `now` is
/// stamped as the survivor's `updatedAt`.
pub fn merge_daily_docs(
    existing: &[EntityRecord],
    incoming: &[EntityRecord],
    now: i64,
) -> DailyDocMerge {
    let mut groups: BTreeMap<String, Vec<EntityRecord>> = BTreeMap::new();
    for record in existing {
        if let Some(day) = record.daily_doc() {
            groups.entry(day.to_string()).or_default().push(record.clone());
        }
    }

    let mut result = DailyDocMerge::default();

    for record in incoming {
        let Some(day) = record.daily_doc().map(str::to_string) else {
            continue;
        };
        match groups.get_mut(&day) {
            None => {
                result
                    .to_apply
                    .push(Change::create(DOCUMENTS_TABLE, record.clone(), ChangeOrigin::Sync));
            }
            Some(group) => {
                let slot = group.iter().position(|d| d.id() == record.id());
                match slot {
                    Some(index) => {
                        let current = &group[index];
                        if record.updated_at().unwrap_or(i64::MIN)
                            > current.updated_at().unwrap_or(i64::MIN)
                        {
                            group[index] = record.clone();
                        }
                    }
                    None => group.push(record.clone()),
                }
            }
        }
    }

    let known_ids: HashSet<String> = existing
        .iter()
        .filter_map(|r| r.id().map(str::to_string))
        .collect();

    for group in groups.values() {
        let oldest = group
            .iter()
            .skip(1)
            .fold(&group[0], |acc, doc| {
                if doc.created_at().unwrap_or(i64::MAX) < acc.created_at().unwrap_or(i64::MAX) {
                    doc
                } else {
                    acc
                }
            });

        let mut to_merge: Vec<&EntityRecord> =
            group.iter().filter(|d| d.id() != oldest.id()).collect();
        to_merge.sort_by_key(|d| d.created_at().unwrap_or(i64::MAX));

        let mut survivor = oldest.clone();
        for doc in &to_merge {
            let merged_content = if survivor.id() == doc.id() {
                // identical ids resolve by recency instead of concatenating
                if survivor.updated_at().unwrap_or(i64::MIN)
                    < doc.updated_at().unwrap_or(i64::MIN)
                {
                    doc.content().unwrap_or_default().to_string()
                } else {
                    survivor.content().unwrap_or_default().to_string()
                }
            } else {
                format!(
                    "{}{}",
                    survivor.content().unwrap_or_default(),
                    doc.content().unwrap_or_default()
                )
            };
            survivor.set_content(merged_content);
        }
        survivor.set_updated_at(now);

        let deletes: Vec<Change> = to_merge
            .iter()
            .filter_map(|d| d.id())
            .map(|id| Change::delete(DOCUMENTS_TABLE, id, ChangeOrigin::Any))
            .collect();

        let create = Change::create(DOCUMENTS_TABLE, survivor.clone(), ChangeOrigin::Any);
        let survivor_known = survivor.id().is_some_and(|id| known_ids.contains(id));
        let apply_change = if survivor_known {
            let key = survivor.id().unwrap_or_default().to_string();
            let mods = survivor
                .as_map()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<serde_json::Map<String, Value>>();
            Change::update(DOCUMENTS_TABLE, key, mods, ChangeOrigin::Any)
        } else {
            create.clone()
        };

        result.to_send.push(create);
        result.to_send.extend(deletes.clone());
        result.to_apply.push(apply_change);
        result.to_apply.extend(deletes);
    }

    result
}
