use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::error::Result;
use crate::ops::{OpType, Operation};

/// Ordered, durable log of intended operations awaiting push.
///
/// Keyed by `seq` (SQLite `AUTOINCREMENT`, a per-process monotonic
/// integer). Writers only ever append through
/// [`Outbox::enqueue_create`] / `enqueue_set` / `enqueue_increment` /
/// `enqueue_delete`, and only inside the same transaction as the
/// corresponding local-store mutation -- this is what guarantees "readers
/// of the local store never observe a write without its queue entry".
pub struct Outbox<'c> {
    conn: &'c Connection,
}

const BASE_BACKOFF_MS: i64 = 1_000;
const MAX_BACKOFF_MS: i64 = 5 * 60 * 1_000;

impl<'c> Outbox<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS sync_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    op_type TEXT NOT NULL CHECK(op_type IN ('create','set','increment','delete')),
    field TEXT,
    value TEXT,
    created_at INTEGER NOT NULL,
    retries INTEGER NOT NULL DEFAULT 0,
    backoff_until INTEGER
);
CREATE INDEX IF NOT EXISTS idx_sync_queue_entity
    ON sync_queue(table_name, entity_id, seq);
"#,
        )?;
        Ok(())
    }

    fn insert(
        tx: &Transaction<'_>,
        table: &str,
        entity_id: &str,
        op_type: OpType,
        field: Option<&str>,
        value: Option<&serde_json::Value>,
    ) -> Result<i64> {
        let now = Utc::now();
        tx.execute(
            "INSERT INTO sync_queue (table_name, entity_id, op_type, field, value, created_at, retries)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![
                table,
                entity_id,
                op_type.as_str(),
                field,
                value.map(|v| v.to_string()),
                now.timestamp_millis(),
            ],
        )?;
        Ok(tx.last_insert_rowid())
    }

    /// Queue a `create`. Must run in the same transaction as the insert
    /// into the domain table.
    pub fn enqueue_create(
        tx: &Transaction<'_>,
        table: &str,
        entity_id: &str,
        record: &serde_json::Value,
    ) -> Result<i64> {
        Self::insert(tx, table, entity_id, OpType::Create, None, Some(record))
    }

    /// Queue a `set`. `field` is `Some` for a single-field write (kept for
    /// coalescing bookkeeping); `fields` is always the JSON object the
    /// conflict resolver and coalescer operate on.
    pub fn enqueue_set(
        tx: &Transaction<'_>,
        table: &str,
        entity_id: &str,
        field: Option<&str>,
        fields: &serde_json::Value,
    ) -> Result<i64> {
        Self::insert(tx, table, entity_id, OpType::Set, field, Some(fields))
    }

    pub fn enqueue_increment(
        tx: &Transaction<'_>,
        table: &str,
        entity_id: &str,
        field: &str,
        delta: f64,
    ) -> Result<i64> {
        let value = serde_json::json!(delta);
        Self::insert(tx, table, entity_id, OpType::Increment, Some(field), Some(&value))
    }

    pub fn enqueue_delete(tx: &Transaction<'_>, table: &str, entity_id: &str) -> Result<i64> {
        Self::insert(tx, table, entity_id, OpType::Delete, None, None)
    }

    /// Pending operations in FIFO `seq` order, skipping entries still in
    /// their backoff window.
    pub fn get_pending(&self, limit: i64) -> Result<Vec<Operation>> {
        let now_ms = Utc::now().timestamp_millis();
        let mut stmt = self.conn.prepare(
            "SELECT seq, table_name, entity_id, op_type, field, value, created_at, retries
             FROM sync_queue
             WHERE backoff_until IS NULL OR backoff_until <= ?1
             ORDER BY seq ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now_ms, limit], row_to_operation)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// All pending operations touching one entity, in `seq` order -- used
    /// by the conflict resolver and the pull pipeline's "local has no
    /// pending operations" check.
    pub fn get_pending_for_entity(&self, table: &str, entity_id: &str) -> Result<Vec<Operation>> {
        let now_ms = Utc::now().timestamp_millis();
        let mut stmt = self.conn.prepare(
            "SELECT seq, table_name, entity_id, op_type, field, value, created_at, retries
             FROM sync_queue
             WHERE table_name = ?1 AND entity_id = ?2
               AND (backoff_until IS NULL OR backoff_until <= ?3)
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![table, entity_id, now_ms], row_to_operation)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn remove(&self, seq: i64) -> Result<()> {
        self.conn.execute("DELETE FROM sync_queue WHERE seq = ?1", params![seq])?;
        Ok(())
    }

    /// Purge every queued op bound to a stale local id, used when a
    /// singleton `create`/`set` is reconciled onto the remote's id.
    pub fn purge_entity(&self, table: &str, entity_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM sync_queue WHERE table_name = ?1 AND entity_id = ?2",
            params![table, entity_id],
        )?;
        Ok(())
    }

    /// Bump `retries` and advance the exponential backoff deadline.
    pub fn increment_retry(&self, seq: i64) -> Result<i32> {
        let tx = self.conn.unchecked_transaction()?;
        let retries: i32 = tx.query_row(
            "SELECT retries FROM sync_queue WHERE seq = ?1",
            params![seq],
            |r| r.get(0),
        )?;
        let next = retries + 1;
        let backoff_ms = (BASE_BACKOFF_MS * (1i64 << next.min(12))).min(MAX_BACKOFF_MS);
        let deadline = Utc::now().timestamp_millis() + backoff_ms;
        tx.execute(
            "UPDATE sync_queue SET retries = ?1, backoff_until = ?2 WHERE seq = ?3",
            params![next, deadline, seq],
        )?;
        tx.commit()?;
        Ok(next)
    }

    pub fn retries(&self, seq: i64) -> Result<i32> {
        Ok(self
            .conn
            .query_row("SELECT retries FROM sync_queue WHERE seq = ?1", params![seq], |r| r.get(0))
            .optional()?
            .unwrap_or(0))
    }

    pub fn pending_count(&self) -> Result<i64> {
        Ok(self.conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |r| r.get(0))?)
    }

    /// Collapse adjacent mergeable operations before a push cycle.
    /// Runs the pure [`coalesce_ops`] algorithm per-entity and rewrites
    /// the table to match.
    pub fn coalesce(&self) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, table_name, entity_id, op_type, field, value, created_at, retries
             FROM sync_queue
             ORDER BY table_name, entity_id, seq",
        )?;
        let rows = stmt.query_map([], row_to_operation)?;
        let mut all = Vec::new();
        for r in rows {
            all.push(r?);
        }
        drop(stmt);

        // group by (table, entity_id) preserving order
        let mut groups: Vec<(String, String, Vec<Operation>)> = Vec::new();
        for op in all {
            match groups.last_mut() {
                Some((t, e, ops)) if *t == op.table && *e == op.entity_id => ops.push(op),
                _ => groups.push((op.table.clone(), op.entity_id.clone(), vec![op])),
            }
        }

        let tx = self.conn.unchecked_transaction()?;
        for (_, _, ops) in groups {
            let original_seqs: Vec<i64> = ops.iter().map(|o| o.seq).collect();
            let coalesced = coalesce_ops(ops);
            let surviving: std::collections::HashSet<i64> =
                coalesced.iter().map(|o| o.seq).collect();
            for seq in &original_seqs {
                if !surviving.contains(seq) {
                    tx.execute("DELETE FROM sync_queue WHERE seq = ?1", params![seq])?;
                }
            }
            for op in &coalesced {
                tx.execute(
                    "UPDATE sync_queue SET field = ?1, value = ?2, created_at = ?3 WHERE seq = ?4",
                    params![
                        op.field,
                        op.value.as_ref().map(|v| v.to_string()),
                        op.timestamp.timestamp_millis(),
                        op.seq,
                    ],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

fn row_to_operation(r: &rusqlite::Row<'_>) -> rusqlite::Result<Operation> {
    let op_str: String = r.get(3)?;
    let value_str: Option<String> = r.get(5)?;
    let created_at_ms: i64 = r.get(6)?;
    Ok(Operation {
        seq: r.get(0)?,
        table: r.get(1)?,
        entity_id: r.get(2)?,
        op_type: OpType::from_str(&op_str).unwrap_or(OpType::Set),
        field: r.get(4)?,
        value: value_str.and_then(|s| serde_json::from_str(&s).ok()),
        timestamp: ms_to_utc(created_at_ms),
        retries: r.get(7)?,
    })
}

fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Pure coalescing algorithm, separated from storage so it is trivially
/// unit-testable:
/// - `increment(f)` + `increment(f)` -> `increment(f, delta1+delta2)`.
/// - `set` + `set` on the same entity: newer value wins per field, keep
///   the oldest `seq`/timestamp for backoff accounting.
/// - `create` and `delete` never coalesce with anything.
/// - Input must already be grouped by entity and sorted by `seq`.
pub fn coalesce_ops(ops: Vec<Operation>) -> Vec<Operation> {
    let mut out: Vec<Operation> = Vec::with_capacity(ops.len());
    for op in ops {
        let merged = match (out.last_mut(), op.op_type) {
            (Some(prev), OpType::Increment) if prev.op_type == OpType::Increment && prev.field == op.field => {
                let prev_delta = prev.increment_delta().unwrap_or(0.0);
                let this_delta = op.increment_delta().unwrap_or(0.0);
                prev.value = Some(serde_json::json!(prev_delta + this_delta));
                true
            }
            (Some(prev), OpType::Set) if prev.op_type == OpType::Set => {
                merge_set_into(prev, &op);
                true
            }
            _ => false,
        };
        if !merged {
            out.push(op);
        }
    }
    out
}

fn merge_set_into(prev: &mut Operation, newer: &Operation) {
    // Normalize both into a field->value map, newer overwrites per field,
    // oldest seq/timestamp is retained on `prev` (no-op, we mutate in place).
    let mut map = match &prev.value {
        Some(serde_json::Value::Object(m)) => m.clone(),
        Some(v) => {
            let mut m = serde_json::Map::new();
            if let Some(f) = &prev.field {
                m.insert(f.clone(), v.clone());
            }
            m
        }
        None => serde_json::Map::new(),
    };
    match &newer.value {
        Some(serde_json::Value::Object(m)) => {
            for (k, v) in m {
                map.insert(k.clone(), v.clone());
            }
        }
        Some(v) => {
            if let Some(f) = &newer.field {
                map.insert(f.clone(), v.clone());
            }
        }
        None => {}
    }
    prev.field = None;
    prev.value = Some(serde_json::Value::Object(map));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn op(seq: i64, entity: &str, op_type: OpType, field: Option<&str>, value: Option<serde_json::Value>) -> Operation {
        Operation {
            seq,
            table: "widgets".into(),
            entity_id: entity.into(),
            op_type,
            field: field.map(String::from),
            value,
            timestamp: Utc::now() + Duration::seconds(seq),
            retries: 0,
        }
    }

    #[test]
    fn coalesces_adjacent_increments() {
        let ops = vec![
            op(1, "e1", OpType::Increment, Some("v"), Some(serde_json::json!(1))),
            op(2, "e1", OpType::Increment, Some("v"), Some(serde_json::json!(1))),
        ];
        let out = coalesce_ops(ops);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].seq, 1);
        assert_eq!(out[0].increment_delta(), Some(2.0));
    }

    #[test]
    fn newer_set_field_wins_oldest_seq_kept() {
        let ops = vec![
            op(1, "e1", OpType::Set, Some("name"), Some(serde_json::json!("a"))),
            op(2, "e1", OpType::Set, Some("name"), Some(serde_json::json!("b"))),
        ];
        let out = coalesce_ops(ops);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].seq, 1);
        assert_eq!(out[0].field_value("name"), Some(&serde_json::json!("b")));
    }

    #[test]
    fn create_and_delete_never_coalesce() {
        let ops = vec![
            op(1, "e1", OpType::Create, None, Some(serde_json::json!({"name": "a"}))),
            op(2, "e1", OpType::Delete, None, None),
        ];
        let out = coalesce_ops(ops);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn different_entities_never_coalesce() {
        let a = op(1, "e1", OpType::Increment, Some("v"), Some(serde_json::json!(1)));
        let b = op(2, "e2", OpType::Increment, Some("v"), Some(serde_json::json!(1)));
        // coalesce_ops assumes pre-grouping by entity; the Outbox groups
        // before calling it, so simulate that contract directly here.
        assert_eq!(coalesce_ops(vec![a.clone()]).len(), 1);
        assert_eq!(coalesce_ops(vec![b.clone()]).len(), 1);
    }
}
