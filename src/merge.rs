use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::{TableConfig, SYSTEM_COLUMNS};
use crate::error::Result;
use crate::ops::Operation;
use crate::record::Record;

/// Which side's value survived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Local,
    Remote,
}

impl Winner {
    fn as_str(self) -> &'static str {
        match self {
            Winner::Local => "local",
            Winner::Remote => "remote",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "remote" => Winner::Remote,
            _ => Winner::Local,
        }
    }
}

/// Why that side won.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    LastWrite,
    NumericMerge,
    DeleteWins,
    LocalPending,
}

impl Strategy {
    fn as_str(self) -> &'static str {
        match self {
            Strategy::LastWrite => "last_write",
            Strategy::NumericMerge => "numeric_merge",
            Strategy::DeleteWins => "delete_wins",
            Strategy::LocalPending => "local_pending",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "numeric_merge" => Strategy::NumericMerge,
            "delete_wins" => Strategy::DeleteWins,
            "local_pending" => Strategy::LocalPending,
            _ => Strategy::LastWrite,
        }
    }
}

/// One field's resolution, persisted to the conflict-history table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictHistoryEntry {
    pub entity_id: String,
    pub table: String,
    pub field: String,
    pub local_value: Option<serde_json::Value>,
    pub remote_value: Option<serde_json::Value>,
    pub resolved_value: Option<serde_json::Value>,
    pub winner: Winner,
    pub strategy: Strategy,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of [`resolve`]: the merged record to apply locally, and the
/// per-field resolutions to append to conflict history (empty when the
/// merge found no actual conflicts, e.g. tier 1's whole-record accept).
pub struct Resolution {
    pub record: Record,
    pub entries: Vec<ConflictHistoryEntry>,
}

/// Three-tier, field-level conflict resolver. `local` is `None` when no
/// local record exists yet (tier 1). `pending` is every queued outbox
/// operation for this entity, consulted by tier 2 (a pending `delete`) and
/// tier 3 (the field has any pending local operation).
pub fn resolve(
    table: &TableConfig,
    entity_id: &str,
    local: Option<&Record>,
    remote: &Record,
    pending: &[Operation],
) -> Resolution {
    let local = match local {
        None => {
            return Resolution {
                record: remote.clone(),
                entries: Vec::new(),
            }
        }
        Some(l) => l,
    };

    let mut merged = local.clone();
    let mut entries = Vec::new();
    let mut touched = false;

    let has_pending_delete = pending.iter().any(|op| op.op_type == crate::ops::OpType::Delete);
    if has_pending_delete && !remote.deleted() {
        if !local.deleted() {
            entries.push(ConflictHistoryEntry {
                entity_id: entity_id.to_string(),
                table: table.name.clone(),
                field: "deleted".to_string(),
                local_value: Some(serde_json::Value::Bool(true)),
                remote_value: Some(serde_json::Value::Bool(remote.deleted())),
                resolved_value: Some(serde_json::Value::Bool(true)),
                winner: Winner::Local,
                strategy: Strategy::LocalPending,
                timestamp: Utc::now(),
            });
            touched = true;
        }
        merged.set_deleted(true);
    } else if remote.deleted() && !has_pending_delete {
        if !local.deleted() {
            entries.push(ConflictHistoryEntry {
                entity_id: entity_id.to_string(),
                table: table.name.clone(),
                field: "deleted".to_string(),
                local_value: Some(serde_json::Value::Bool(false)),
                remote_value: Some(serde_json::Value::Bool(true)),
                resolved_value: Some(serde_json::Value::Bool(true)),
                winner: Winner::Remote,
                strategy: Strategy::DeleteWins,
                timestamp: Utc::now(),
            });
            touched = true;
        }
        merged.set_deleted(true);
    } else if has_pending_delete && remote.deleted() {
        // Both sides already agree the record is gone -- no conflict to
        // record, just assert it explicitly rather than leaning on
        // `local.deleted()` already being set by the caller that enqueued
        // the pending delete.
        merged.set_deleted(true);
    }
    // else: neither side asserts a delete the other hasn't seen yet --
    // `deleted` is carried over from `local` untouched.

    let mut skip: HashSet<&str> = SYSTEM_COLUMNS.iter().copied().collect();
    for f in &table.exclude_from_conflict {
        skip.insert(f.as_str());
    }

    let pending_fields: HashSet<String> = pending.iter().flat_map(Operation::touched_fields).collect();

    let mut keys: Vec<&String> = local.0.keys().chain(remote.0.keys()).collect();
    keys.sort();
    keys.dedup();

    for field in keys {
        if skip.contains(field.as_str()) {
            continue;
        }
        let local_val = local.get(field);
        let remote_val = remote.get(field);
        if local_val == remote_val {
            continue;
        }

        let (winner, strategy, resolved) = if pending_fields.contains(field) {
            (Winner::Local, Strategy::LocalPending, local_val.cloned())
        } else if table.numeric_merge_fields.contains(field)
            && local_val.map(serde_json::Value::is_number).unwrap_or(false)
            && remote_val.map(serde_json::Value::is_number).unwrap_or(false)
        {
            // A true operation-inbox additive merge is future work; fall
            // back to last-write-wins.
            let (w, v) = last_write_wins(local, remote, local_val, remote_val);
            (w, Strategy::NumericMerge, v)
        } else {
            let (w, v) = last_write_wins(local, remote, local_val, remote_val);
            (w, Strategy::LastWrite, v)
        };

        match resolved.clone() {
            Some(v) => merged.set(field, v),
            None => {
                merged.0.remove(field.as_str());
            }
        }
        touched = true;
        entries.push(ConflictHistoryEntry {
            entity_id: entity_id.to_string(),
            table: table.name.clone(),
            field: field.clone(),
            local_value: local_val.cloned(),
            remote_value: remote_val.cloned(),
            resolved_value: resolved,
            winner,
            strategy,
            timestamp: Utc::now(),
        });
    }

    if touched {
        merged.set_updated_at(local.updated_at().max(remote.updated_at()));
        merged.set_version(local.version().max(remote.version()) + 1);
        if remote.updated_at() >= local.updated_at() {
            if let Some(dev) = remote.device_id() {
                merged.set_device_id(dev);
            }
        }
    }

    Resolution { record: merged, entries }
}

/// Last-write-wins by `updated_at`; on a tie, compare `device_id`
/// lexicographically; on an equal device id or a missing remote device,
/// local wins.
fn last_write_wins(
    local: &Record,
    remote: &Record,
    local_val: Option<&serde_json::Value>,
    remote_val: Option<&serde_json::Value>,
) -> (Winner, Option<serde_json::Value>) {
    let l_at = local.updated_at();
    let r_at = remote.updated_at();
    let remote_wins = if l_at != r_at {
        r_at > l_at
    } else {
        match (local.device_id(), remote.device_id()) {
            (Some(l), Some(r)) if l != r => r > l,
            _ => false,
        }
    };
    if remote_wins {
        (Winner::Remote, remote_val.cloned())
    } else {
        (Winner::Local, local_val.cloned())
    }
}

/// Durable audit trail of per-field resolutions. Retained up to 30 days,
/// independent of the per-table `tombstone_max_age_days` config knob.
pub struct ConflictHistoryStore<'c> {
    conn: &'c Connection,
}

const CONFLICT_HISTORY_RETENTION_DAYS: i64 = 30;

impl<'c> ConflictHistoryStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS conflict_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id TEXT NOT NULL,
    table_name TEXT NOT NULL,
    field TEXT NOT NULL,
    local_value TEXT,
    remote_value TEXT,
    resolved_value TEXT,
    winner TEXT NOT NULL,
    strategy TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conflict_history_timestamp ON conflict_history(timestamp);
"#,
        )?;
        Ok(())
    }

    pub fn insert_all(&self, entries: &[ConflictHistoryEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let tx = self.conn.unchecked_transaction()?;
        for e in entries {
            tx.execute(
                "INSERT INTO conflict_history
                    (entity_id, table_name, field, local_value, remote_value, resolved_value, winner, strategy, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    e.entity_id,
                    e.table,
                    e.field,
                    e.local_value.as_ref().map(|v| v.to_string()),
                    e.remote_value.as_ref().map(|v| v.to_string()),
                    e.resolved_value.as_ref().map(|v| v.to_string()),
                    e.winner.as_str(),
                    e.strategy.as_str(),
                    e.timestamp.timestamp_millis(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// All entries for one entity, newest first; used by applications
    /// surfacing an audit trail and by tests asserting resolution history.
    pub fn for_entity(&self, table: &str, entity_id: &str) -> Result<Vec<ConflictHistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_id, table_name, field, local_value, remote_value, resolved_value, winner, strategy, timestamp
             FROM conflict_history WHERE table_name = ?1 AND entity_id = ?2 ORDER BY timestamp DESC",
        )?;
        let rows = stmt.query_map(params![table, entity_id], row_to_entry)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Hard-delete entries older than the 30-day retention window.
    pub fn prune_expired(&self) -> Result<usize> {
        let cutoff = Utc::now().timestamp_millis()
            - CONFLICT_HISTORY_RETENTION_DAYS * 24 * 60 * 60 * 1_000;
        Ok(self
            .conn
            .execute("DELETE FROM conflict_history WHERE timestamp < ?1", params![cutoff])?)
    }
}

fn row_to_entry(r: &rusqlite::Row<'_>) -> rusqlite::Result<ConflictHistoryEntry> {
    let local_value: Option<String> = r.get(3)?;
    let remote_value: Option<String> = r.get(4)?;
    let resolved_value: Option<String> = r.get(5)?;
    let winner: String = r.get(6)?;
    let strategy: String = r.get(7)?;
    let timestamp_ms: i64 = r.get(8)?;
    Ok(ConflictHistoryEntry {
        entity_id: r.get(0)?,
        table: r.get(1)?,
        field: r.get(2)?,
        local_value: local_value.and_then(|s| serde_json::from_str(&s).ok()),
        remote_value: remote_value.and_then(|s| serde_json::from_str(&s).ok()),
        resolved_value: resolved_value.and_then(|s| serde_json::from_str(&s).ok()),
        winner: Winner::from_str(&winner),
        strategy: Strategy::from_str(&strategy),
        timestamp: Utc.timestamp_millis_opt(timestamp_ms).single().unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;
    use crate::ops::OpType;
    use chrono::Duration;

    fn table() -> TableConfig {
        TableConfig::new("widgets", vec!["id".into(), "title".into(), "v".into()])
            .numeric_merge_fields(["v"])
    }

    fn rec(id: &str, device: &str, at: DateTime<Utc>) -> Record {
        let mut r = Record::new(id, Some("u1"), device);
        r.set_updated_at(at);
        r
    }

    #[test]
    fn tier1_no_local_accepts_remote_whole() {
        let remote = rec("w1", "dev-b", Utc::now());
        let res = resolve(&table(), "w1", None, &remote, &[]);
        assert!(res.entries.is_empty());
        assert_eq!(res.record.id(), "w1");
    }

    #[test]
    fn tier2_pending_delete_beats_remote_edit() {
        let now = Utc::now();
        let mut local = rec("w1", "dev-a", now);
        local.set("title", serde_json::json!("local-edit"));
        let mut remote = rec("w1", "dev-b", now + Duration::seconds(1));
        remote.set("title", serde_json::json!("remote-edit"));

        let pending = vec![Operation {
            seq: 1,
            table: "widgets".into(),
            entity_id: "w1".into(),
            op_type: OpType::Delete,
            field: None,
            value: None,
            timestamp: now,
            retries: 0,
        }];
        let res = resolve(&table(), "w1", Some(&local), &remote, &pending);
        assert!(res.record.deleted());
        assert!(res
            .entries
            .iter()
            .any(|e| e.field == "deleted" && e.strategy == Strategy::LocalPending));
    }

    #[test]
    fn tier2_remote_delete_wins_regardless_of_pending_edits() {
        let now = Utc::now();
        let local = rec("w1", "dev-a", now);
        let mut remote = rec("w1", "dev-b", now + Duration::seconds(1));
        remote.set_deleted(true);

        let pending = vec![Operation {
            seq: 1,
            table: "widgets".into(),
            entity_id: "w1".into(),
            op_type: OpType::Set,
            field: Some("title".into()),
            value: Some(serde_json::json!("local-edit")),
            timestamp: now,
            retries: 0,
        }];
        let res = resolve(&table(), "w1", Some(&local), &remote, &pending);
        assert!(res.record.deleted());
        assert!(res
            .entries
            .iter()
            .any(|e| e.field == "deleted" && e.strategy == Strategy::DeleteWins && e.winner == Winner::Remote));
    }

    #[test]
    fn tier3_pending_field_wins_over_remote() {
        let now = Utc::now();
        let mut local = rec("w1", "dev-a", now);
        local.set("title", serde_json::json!("local"));
        let mut remote = rec("w1", "dev-b", now + Duration::seconds(10));
        remote.set("title", serde_json::json!("remote"));

        let pending = vec![Operation {
            seq: 1,
            table: "widgets".into(),
            entity_id: "w1".into(),
            op_type: OpType::Set,
            field: Some("title".into()),
            value: Some(serde_json::json!("local")),
            timestamp: now,
            retries: 0,
        }];
        let res = resolve(&table(), "w1", Some(&local), &remote, &pending);
        assert_eq!(res.record.get("title"), Some(&serde_json::json!("local")));
        let e = res.entries.iter().find(|e| e.field == "title").unwrap();
        assert_eq!(e.strategy, Strategy::LocalPending);
        assert_eq!(e.winner, Winner::Local);
    }

    #[test]
    fn tier3_lww_device_tiebreak_on_equal_timestamp() {
        let now = Utc::now();
        let mut local = rec("w1", "aaaa", now);
        local.set("title", serde_json::json!("local"));
        let mut remote = rec("w1", "zzzz", now);
        remote.set("title", serde_json::json!("remote"));

        let res = resolve(&table(), "w1", Some(&local), &remote, &[]);
        // remote device "zzzz" > local device "aaaa" lexicographically -> remote wins
        assert_eq!(res.record.get("title"), Some(&serde_json::json!("remote")));
    }

    #[test]
    fn tier3_numeric_merge_field_falls_back_to_lww() {
        let now = Utc::now();
        let mut local = rec("w1", "dev-a", now);
        local.set("v", serde_json::json!(3));
        let mut remote = rec("w1", "dev-b", now + Duration::seconds(5));
        remote.set("v", serde_json::json!(7));

        let res = resolve(&table(), "w1", Some(&local), &remote, &[]);
        assert_eq!(res.record.get("v"), Some(&serde_json::json!(7)));
        let e = res.entries.iter().find(|e| e.field == "v").unwrap();
        assert_eq!(e.strategy, Strategy::NumericMerge);
        assert_eq!(e.winner, Winner::Remote);
    }

    #[test]
    fn no_conflict_when_nothing_touched() {
        let now = Utc::now();
        let local = rec("w1", "dev-a", now);
        let remote = rec("w1", "dev-a", now);
        let res = resolve(&table(), "w1", Some(&local), &remote, &[]);
        assert!(res.entries.is_empty());
        assert_eq!(res.record.version(), local.version());
    }

    #[test]
    fn conflict_history_round_trips_and_prunes_expired() {
        let conn = Connection::open_in_memory().unwrap();
        let history = ConflictHistoryStore::new(&conn);
        history.init_schema().unwrap();

        let entry = ConflictHistoryEntry {
            entity_id: "w1".into(),
            table: "widgets".into(),
            field: "title".into(),
            local_value: Some(serde_json::json!("local")),
            remote_value: Some(serde_json::json!("remote")),
            resolved_value: Some(serde_json::json!("remote")),
            winner: Winner::Remote,
            strategy: Strategy::LastWrite,
            timestamp: Utc::now(),
        };
        history.insert_all(std::slice::from_ref(&entry)).unwrap();

        let fetched = history.for_entity("widgets", "w1").unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].winner, Winner::Remote);
        assert_eq!(fetched[0].strategy, Strategy::LastWrite);

        let mut stale = entry;
        stale.timestamp = Utc::now() - Duration::days(31);
        history.insert_all(&[stale]).unwrap();
        assert_eq!(history.for_entity("widgets", "w1").unwrap().len(), 2);

        let pruned = history.prune_expired().unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(history.for_entity("widgets", "w1").unwrap().len(), 1);
    }
}
