use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::record::Record;

/// Structured key-value tables with secondary indexes, transactional
/// batches, and schema versioning. Every synced table is a single SQLite
/// table storing one JSON document per row (see [`Record`]) plus a handful
/// of projected columns used for indexing: `user_id`, `updated_at`,
/// `deleted`, and whatever columns the [`Config`] declares as needing a
/// secondary index.
///
/// `rusqlite::Connection` is `Send` but not `Sync`, and the engine shares
/// a single store behind `Arc<LocalStore>` across `tokio::spawn`ed tasks
/// (the watchdog, periodic tick, maintenance sweep, realtime-apply loop).
/// A plain `Connection` field would make `Arc<LocalStore>: !Send`; the
/// `Mutex` wrapper is the same fix `mozilla-application-services`' places
/// crate uses for its own shared `rusqlite::Connection`.
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Open (creating if needed) the local database and reconcile its
    /// on-disk shape against `config`'s declared shape hash.
    ///
    /// If the stored hash differs from `config.shape_hash()`, a new schema
    /// version is declared above the previously observed one and the
    /// store is rebuilt from scratch -- the engine rehydrates from remote
    /// afterward.
    pub fn open(path: &str, config: &Config) -> Result<Self> {
        config.validate()?;
        let conn = match Connection::open(path) {
            Ok(c) => c,
            Err(e) => return Err(EngineError::LocalStore(format!("open failed: {e}"))),
        };
        let store = Self { conn: Mutex::new(conn) };
        if let Err(e) = store.init(config) {
            // open/upgrade failure -> delete and rebuild.
            drop(store);
            if path != ":memory:" {
                let _ = std::fs::remove_file(path);
            }
            let conn = Connection::open(path)
                .map_err(|e| EngineError::LocalStore(format!("rebuild open failed: {e}")))?;
            let rebuilt = Self { conn: Mutex::new(conn) };
            rebuilt.init(config).map_err(|e| {
                EngineError::LocalStore(format!("rebuild failed after {e}: giving up"))
            })?;
            return Ok(rebuilt);
        }
        Ok(store)
    }

    pub fn open_in_memory(config: &Config) -> Result<Self> {
        Self::open(":memory:", config)
    }

    fn init(&self, config: &Config) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
PRAGMA journal_mode=WAL;
PRAGMA foreign_keys=ON;
CREATE TABLE IF NOT EXISTS _engine_meta (k TEXT PRIMARY KEY, v TEXT NOT NULL);
"#,
        )?;
        let declared_hash = config.shape_hash();
        let stored_hash: Option<String> = conn
            .query_row(
                "SELECT v FROM _engine_meta WHERE k='shape_hash'",
                [],
                |r| r.get(0),
            )
            .optional()?;

        let needs_rebuild = match &stored_hash {
            Some(h) if h == &declared_hash => false,
            Some(_) => true,
            None => false,
        };

        if needs_rebuild {
            for t in &config.tables {
                conn.execute(&format!("DROP TABLE IF EXISTS \"{}\"", t.name), [])?;
            }
        }

        for t in &config.tables {
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS \"{}\" (
                        id TEXT PRIMARY KEY,
                        user_id TEXT,
                        created_at INTEGER NOT NULL,
                        updated_at INTEGER NOT NULL,
                        deleted INTEGER NOT NULL DEFAULT 0,
                        data TEXT NOT NULL
                    )",
                    t.name
                ),
                [],
            )?;
            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS \"idx_{0}_user_id\" ON \"{0}\"(user_id)",
                    t.name
                ),
                [],
            )?;
            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS \"idx_{0}_updated_at\" ON \"{0}\"(updated_at)",
                    t.name
                ),
                [],
            )?;
            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS \"idx_{0}_deleted\" ON \"{0}\"(deleted)",
                    t.name
                ),
                [],
            )?;
            for col in &t.columns {
                if col == "id" || col == "user_id" || col == "updated_at" || col == "deleted" {
                    continue;
                }
                conn.execute(
                    &format!(
                        "CREATE INDEX IF NOT EXISTS \"idx_{0}_{1}\" ON \"{0}\"(json_extract(data,'$.{1}'))",
                        t.name, col
                    ),
                    [],
                )?;
            }
        }

        conn.execute(
            "INSERT INTO _engine_meta(k,v) VALUES('shape_hash',?1)
             ON CONFLICT(k) DO UPDATE SET v=excluded.v",
            params![declared_hash],
        )?;
        Ok(())
    }

    /// Lock and hand back the underlying connection. Callers that need
    /// it to outlive a single statement (e.g. constructing an
    /// [`crate::outbox::Outbox`] and then calling a method on it on the
    /// next line) must bind the guard to a local variable themselves --
    /// never call this again while already holding the guard it returns
    /// (or while inside a [`Self::with_batch`] closure), since
    /// `std::sync::Mutex` is not reentrant and a second lock attempt on
    /// the same thread deadlocks.
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Run a closure in a single transaction that may span multiple
    /// tables plus the outbox table.
    pub fn with_batch<R>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<R>) -> Result<R> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let r = f(&tx)?;
        tx.commit()?;
        Ok(r)
    }

    pub fn get(&self, table: &str, id: &str) -> Result<Option<Record>> {
        let conn = self.conn.lock().unwrap();
        get_via(&conn, table, id)
    }

    /// Same lookup as [`Self::get`], against an already-open transaction.
    /// Callers composing a read-modify-write inside [`Self::with_batch`]
    /// must use this instead of `get` -- `get` locks the connection's
    /// mutex itself, and `with_batch` already holds it on the same
    /// thread, so a second call deadlocks.
    pub fn get_tx(tx: &Transaction<'_>, table: &str, id: &str) -> Result<Option<Record>> {
        get_via(tx, table, id)
    }

    pub fn get_all(&self, table: &str) -> Result<Vec<Record>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("SELECT data FROM \"{table}\""))?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(Record::from_value(serde_json::from_str(&r?)?)?);
        }
        Ok(out)
    }

    /// Equality lookup on a declared secondary index.
    pub fn query(&self, table: &str, index: &str, value: &serde_json::Value) -> Result<Vec<Record>> {
        let col_expr = index_expr(index);
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("SELECT data FROM \"{table}\" WHERE {col_expr} = ?1"))?;
        let rows = stmt.query_map(params![scalar_param(value)], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(Record::from_value(serde_json::from_str(&r?)?)?);
        }
        Ok(out)
    }

    /// Range lookup (inclusive) on a declared secondary index.
    pub fn query_range(
        &self,
        table: &str,
        index: &str,
        lo: &serde_json::Value,
        hi: &serde_json::Value,
    ) -> Result<Vec<Record>> {
        let col_expr = index_expr(index);
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT data FROM \"{table}\" WHERE {col_expr} BETWEEN ?1 AND ?2"
        ))?;
        let rows = stmt.query_map(params![scalar_param(lo), scalar_param(hi)], |r| {
            r.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(Record::from_value(serde_json::from_str(&r?)?)?);
        }
        Ok(out)
    }

    /// Write a full record, inside an already-open transaction (callers
    /// combine this with an [`crate::outbox::Outbox`] enqueue in the same
    /// transaction for local writes).
    pub fn put(tx: &Transaction<'_>, table: &str, record: &Record) -> Result<()> {
        let data = record.as_value().to_string();
        tx.execute(
            &format!(
                "INSERT INTO \"{table}\" (id, user_id, created_at, updated_at, deleted, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    user_id=excluded.user_id,
                    updated_at=excluded.updated_at,
                    deleted=excluded.deleted,
                    data=excluded.data"
            ),
            params![
                record.id(),
                record.user_id(),
                record
                    .get("created_at")
                    .and_then(serde_json::Value::as_i64)
                    .unwrap_or_else(|| record.updated_at().timestamp_millis()),
                record.updated_at().timestamp_millis(),
                record.deleted() as i32,
                data,
            ],
        )?;
        Ok(())
    }

    pub fn delete_row(tx: &Transaction<'_>, table: &str, id: &str) -> Result<()> {
        tx.execute(&format!("DELETE FROM \"{table}\" WHERE id = ?1"), params![id])?;
        Ok(())
    }

    /// Hard-delete tombstones older than `config.tombstone_max_age_days`
    /// from every declared table. Safe to call repeatedly; returns the
    /// total rows removed.
    pub fn prune_tombstones(&self, config: &Config) -> Result<usize> {
        let cutoff = chrono::Utc::now().timestamp_millis()
            - config.tombstone_max_age_days as i64 * 24 * 60 * 60 * 1_000;
        let conn = self.conn.lock().unwrap();
        let mut removed = 0;
        for t in &config.tables {
            removed += conn.execute(
                &format!("DELETE FROM \"{}\" WHERE deleted = 1 AND updated_at < ?1", t.name),
                params![cutoff],
            )?;
        }
        Ok(removed)
    }
}

/// Shared by [`LocalStore::get`] and [`LocalStore::get_tx`] -- both a bare
/// `&Connection` and a `&Transaction<'_>` (which derefs to `Connection`)
/// satisfy this bound.
fn get_via(conn: &Connection, table: &str, id: &str) -> Result<Option<Record>> {
    let data: Option<String> = conn
        .query_row(&format!("SELECT data FROM \"{table}\" WHERE id = ?1"), params![id], |r| r.get(0))
        .optional()?;
    data.map(|s| Record::from_value(serde_json::from_str(&s)?)).transpose()
}

fn index_expr(index: &str) -> String {
    match index {
        "id" | "user_id" | "updated_at" | "deleted" => index.to_string(),
        other => format!("json_extract(data,'$.{other}')"),
    }
}

fn scalar_param(v: &serde_json::Value) -> rusqlite::types::Value {
    match v {
        serde_json::Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(rusqlite::types::Value::Integer)
            .unwrap_or_else(|| rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0))),
        serde_json::Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        serde_json::Value::Null => rusqlite::types::Value::Null,
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;

    fn test_config() -> Config {
        let mut c = Config::default();
        c.tables.push(TableConfig::new("widgets", vec!["id".into(), "name".into(), "count".into()]));
        c
    }

    #[test]
    fn put_and_get_round_trips() {
        let store = LocalStore::open_in_memory(&test_config()).unwrap();
        let mut rec = Record::new("w1", Some("u1"), "dev-a");
        rec.set("name", serde_json::json!("widget"));
        store.with_batch(|tx| LocalStore::put(tx, "widgets", &rec)).unwrap();
        let got = store.get("widgets", "w1").unwrap().unwrap();
        assert_eq!(got.get("name"), Some(&serde_json::json!("widget")));
    }

    #[test]
    fn query_by_declared_index() {
        let store = LocalStore::open_in_memory(&test_config()).unwrap();
        let mut rec = Record::new("w1", Some("u1"), "dev-a");
        rec.set("name", serde_json::json!("widget"));
        store.with_batch(|tx| LocalStore::put(tx, "widgets", &rec)).unwrap();
        let found = store.query("widgets", "name", &serde_json::json!("widget")).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), "w1");
    }

    #[test]
    fn shape_hash_rebuild_drops_tables() {
        let mut c = test_config();
        let path_dir = tempfile::tempdir().unwrap();
        let path = path_dir.path().join("db.sqlite3");
        let path_str = path.to_str().unwrap();
        {
            let store = LocalStore::open(path_str, &c).unwrap();
            let rec = Record::new("w1", Some("u1"), "dev-a");
            store.with_batch(|tx| LocalStore::put(tx, "widgets", &rec)).unwrap();
        }
        // change the declared shape
        c.tables[0].columns.push("extra".into());
        let store2 = LocalStore::open(path_str, &c).unwrap();
        assert!(store2.get("widgets", "w1").unwrap().is_none());
    }

    #[test]
    fn prune_tombstones_removes_only_expired_deletes() {
        let mut config = test_config();
        config.tombstone_max_age_days = 30;
        let store = LocalStore::open_in_memory(&config).unwrap();

        let mut fresh_tombstone = Record::new("w1", Some("u1"), "dev-a");
        fresh_tombstone.set_deleted(true);
        store.with_batch(|tx| LocalStore::put(tx, "widgets", &fresh_tombstone)).unwrap();

        let mut stale_tombstone = Record::new("w2", Some("u1"), "dev-a");
        stale_tombstone.set_deleted(true);
        stale_tombstone.set_updated_at(chrono::Utc::now() - chrono::Duration::days(31));
        store.with_batch(|tx| LocalStore::put(tx, "widgets", &stale_tombstone)).unwrap();

        let mut live_record = Record::new("w3", Some("u1"), "dev-a");
        live_record.set_updated_at(chrono::Utc::now() - chrono::Duration::days(60));
        store.with_batch(|tx| LocalStore::put(tx, "widgets", &live_record)).unwrap();

        let removed = store.prune_tombstones(&config).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("widgets", "w1").unwrap().is_some());
        assert!(store.get("widgets", "w2").unwrap().is_none());
        assert!(store.get("widgets", "w3").unwrap().is_some());
    }
}
