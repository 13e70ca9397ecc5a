use std::time::Duration as StdDuration;

use rusqlite::{params, OptionalExtension};
use tracing::instrument;

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::merge::{self, ConflictHistoryEntry, ConflictHistoryStore};
use crate::outbox::Outbox;
use crate::realtime::EchoCache;
use crate::record::Record;
use crate::remote::RemoteService;
use crate::store::LocalStore;

const PULL_WALL_CLOCK_CAP: StdDuration = StdDuration::from_secs(30);

/// Outcome of one pull cycle.
#[derive(Debug, Default)]
pub struct PullReport {
    pub accepted: i64,
    pub skipped: i64,
    pub conflicts: Vec<ConflictHistoryEntry>,
}

/// Per-user, per-table sync cursor, stored durably.
pub struct CursorStore<'c> {
    conn: &'c rusqlite::Connection,
}

impl<'c> CursorStore<'c> {
    pub fn new(conn: &'c rusqlite::Connection) -> Self {
        Self { conn }
    }

    pub fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _sync_cursor (table_name TEXT PRIMARY KEY, updated_at INTEGER NOT NULL);",
        )?;
        Ok(())
    }

    pub fn get(&self, table: &str) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT updated_at FROM _sync_cursor WHERE table_name = ?1",
                params![table],
                |r| r.get(0),
            )
            .optional()?)
    }

    /// Invariant: the persisted cursor equals the max `updated_at` applied
    /// this cycle and never decreases.
    pub fn set_if_greater(&self, table: &str, updated_at_ms: i64) -> Result<()> {
        let current = self.get(table)?.unwrap_or(i64::MIN);
        if updated_at_ms > current {
            self.conn.execute(
                "INSERT INTO _sync_cursor(table_name, updated_at) VALUES (?1, ?2)
                 ON CONFLICT(table_name) DO UPDATE SET updated_at = excluded.updated_at",
                params![table, updated_at_ms],
            )?;
        }
        Ok(())
    }
}

/// Recently-locally-modified guard: protects in-flight local writes from
/// being clobbered by a pull that observes the pre-write remote state.
pub fn recently_modified_ttl() -> chrono::Duration {
    chrono::Duration::seconds(2)
}

/// Run one pull cycle across every configured table in parallel, capped
/// at a 30s wall clock, honoring the floor cursor and the per-row
/// decision sequence.
///
/// `floor`, when given, is a caller-supplied lower bound on the cursor --
/// the effective cursor per table is the *later* of the stored cursor
/// and `floor` (e.g. a cold-start caller re-hydrating from a known
/// checkpoint rather than from scratch).
#[instrument(skip(store, remote, echo, recently_modified, config))]
pub async fn run_pull_cycle(
    store: &LocalStore,
    remote: &dyn RemoteService,
    owner_id: &str,
    echo: &EchoCache,
    recently_modified: &EchoCache,
    config: &Config,
    floor: Option<i64>,
) -> Result<PullReport> {
    {
        let conn = store.connection();
        CursorStore::new(&conn).init_schema()?;
    }

    let fetches = config.tables.iter().map(|t| {
        let table_name = t.name.clone();
        async move {
            let stored = {
                let conn = store.connection();
                CursorStore::new(&conn).get(&table_name)?
            };
            let cursor = match (stored, floor) {
                (Some(s), Some(f)) => Some(s.max(f)),
                (Some(s), None) => Some(s),
                (None, f) => f,
            };
            let rows = remote.fetch_since(&table_name, owner_id, cursor).await?;
            Ok::<_, EngineError>((table_name, rows))
        }
    });

    let results = tokio::time::timeout(PULL_WALL_CLOCK_CAP, futures_util::future::join_all(fetches))
        .await
        .map_err(|_| EngineError::Timeout)?;

    let mut report = PullReport::default();
    let mut table_maxima: Vec<(String, i64)> = Vec::new();

    for result in results {
        let (table_name, rows) = result?;
        let mut max_seen: Option<i64> = None;
        for row in rows {
            let table_cfg = config
                .table(&table_name)
                .ok_or_else(|| EngineError::Schema(format!("undeclared table {table_name}")))?;

            max_seen = Some(max_seen.map_or(row.updated_at_ms, |m| m.max(row.updated_at_ms)));

            // step 1: realtime already delivered this row recently.
            if echo.recently_seen(&table_name, &row.id) {
                report.skipped += 1;
                continue;
            }
            // step 2: protect in-flight local changes.
            if recently_modified.recently_seen(&table_name, &row.id) {
                report.skipped += 1;
                continue;
            }

            let local = store.get(&table_name, &row.id)?;
            let remote_record = Record::from_value(row.data.clone())?;

            let outcome = match &local {
                // step 3: no local record -> accept remote.
                None => AcceptDecision::AcceptRemote,
                Some(local_rec) => {
                    // step 4: local is at least as fresh -> skip.
                    if local_rec.updated_at() >= remote_record.updated_at() {
                        AcceptDecision::Skip
                    } else {
                        let pending = Outbox::new(&store.connection())
                            .get_pending_for_entity(&table_name, &row.id)?;
                        if pending.is_empty() {
                            // step 5: no pending ops -> accept remote.
                            AcceptDecision::AcceptRemote
                        } else {
                            // step 6: resolve via the conflict resolver.
                            AcceptDecision::Resolve(pending)
                        }
                    }
                }
            };

            match outcome {
                AcceptDecision::Skip => {
                    report.skipped += 1;
                }
                AcceptDecision::AcceptRemote => {
                    store.with_batch(|tx| LocalStore::put(tx, &table_name, &remote_record))?;
                    report.accepted += 1;
                }
                AcceptDecision::Resolve(pending) => {
                    let resolution = merge::resolve(table_cfg, &row.id, local.as_ref(), &remote_record, &pending);
                    store.with_batch(|tx| LocalStore::put(tx, &table_name, &resolution.record))?;
                    report.accepted += 1;
                    report.conflicts.extend(resolution.entries);
                }
            }
        }
        if let Some(max_ms) = max_seen {
            table_maxima.push((table_name, max_ms));
        }
    }

    if !report.conflicts.is_empty() {
        let conn = store.connection();
        let history = ConflictHistoryStore::new(&conn);
        history.init_schema()?;
        history.insert_all(&report.conflicts)?;
    }

    // Cursor is advanced only after all tables succeed (we only reach
    // here once every fetch above returned Ok).
    let conn = store.connection();
    let cursors = CursorStore::new(&conn);
    for (table_name, max_ms) in table_maxima {
        cursors.set_if_greater(&table_name, max_ms)?;
    }

    Ok(report)
}

enum AcceptDecision {
    Skip,
    AcceptRemote,
    Resolve(Vec<crate::ops::Operation>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;
    use crate::remote::MutationResult;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct FakeRemote {
        rows: StdMutex<Vec<crate::remote::RemoteRow>>,
    }

    #[async_trait]
    impl RemoteService for FakeRemote {
        async fn mutate(
            &self,
            _table: &str,
            _entity_id: &str,
            _op_type: crate::ops::OpType,
            _field: Option<&str>,
            _value: Option<&serde_json::Value>,
            _record: Option<&serde_json::Value>,
        ) -> Result<MutationResult> {
            unimplemented!("pull tests never push")
        }

        async fn fetch_since(
            &self,
            _table: &str,
            _owner_id: &str,
            _cursor_ms: Option<i64>,
        ) -> Result<Vec<crate::remote::RemoteRow>> {
            Ok(std::mem::take(&mut self.rows.lock().unwrap()))
        }
    }

    fn config() -> Config {
        let mut c = Config::default();
        c.tables.push(TableConfig::new("widgets", vec!["id".into(), "title".into()]));
        c
    }

    #[tokio::test]
    async fn cold_start_accepts_all_remote_rows() {
        let cfg = config();
        let store = LocalStore::open_in_memory(&cfg).unwrap();
        let mut rec = Record::new("w1", Some("u1"), "dev-b");
        rec.set("title", serde_json::json!("hello"));
        let remote = FakeRemote {
            rows: StdMutex::new(vec![crate::remote::RemoteRow {
                id: "w1".into(),
                updated_at_ms: rec.updated_at().timestamp_millis(),
                deleted: false,
                data: rec.as_value(),
            }]),
        };
        let echo = EchoCache::new(chrono::Duration::seconds(10));
        let recently_modified = EchoCache::new(recently_modified_ttl());

        let report = run_pull_cycle(&store, &remote, "u1", &echo, &recently_modified, &cfg, None)
            .await
            .unwrap();
        assert_eq!(report.accepted, 1);
        assert!(store.get("widgets", "w1").unwrap().is_some());
    }

    #[tokio::test]
    async fn fresher_local_record_is_skipped() {
        let cfg = config();
        let store = LocalStore::open_in_memory(&cfg).unwrap();
        let mut local = Record::new("w1", Some("u1"), "dev-a");
        local.set("title", serde_json::json!("local"));
        store.with_batch(|tx| LocalStore::put(tx, "widgets", &local)).unwrap();

        let mut remote_rec = local.clone();
        remote_rec.set_updated_at(local.updated_at() - chrono::Duration::seconds(30));
        remote_rec.set("title", serde_json::json!("stale-remote"));

        let remote = FakeRemote {
            rows: StdMutex::new(vec![crate::remote::RemoteRow {
                id: "w1".into(),
                updated_at_ms: remote_rec.updated_at().timestamp_millis(),
                deleted: false,
                data: remote_rec.as_value(),
            }]),
        };
        let echo = EchoCache::new(chrono::Duration::seconds(10));
        let recently_modified = EchoCache::new(recently_modified_ttl());

        let report = run_pull_cycle(&store, &remote, "u1", &echo, &recently_modified, &cfg, None)
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(store.get("widgets", "w1").unwrap().unwrap().get("title"), Some(&serde_json::json!("local")));
    }
}
