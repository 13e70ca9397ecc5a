use std::sync::Arc;

use tracing::{instrument, warn};

use crate::auth::{AuthProvider, SessionCache};
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::ops::{OpType, Operation};
use crate::outbox::Outbox;
use crate::remote::RemoteService;
use crate::store::LocalStore;

/// A queue item abandoned beyond the retry ceiling. Reported once by the
/// caller, then dropped.
#[derive(Debug, Clone)]
pub struct AbandonedOperation {
    pub seq: i64,
    pub table: String,
    pub entity_id: String,
    pub detail: String,
}

/// Outcome of one push drain.
#[derive(Debug, Default)]
pub struct PushReport {
    pub pushed: i64,
    pub abandoned: Vec<AbandonedOperation>,
    /// Set when a realtime-healthy session means the pull phase can be
    /// skipped this cycle.
    pub realtime_healthy: bool,
}

/// A queue item fails beyond this many retries and is abandoned.
pub const RETRY_CEILING: i32 = 10;

/// Drain the bounded loop of push cycles. Preconditions ("owner is
/// identified and the remote session is valid") are enforced here via
/// `session_cache`/`auth` before touching the network at all.
#[instrument(skip(store, remote, auth, session_cache, config))]
pub async fn run_push_cycle(
    store: &LocalStore,
    remote: &dyn RemoteService,
    auth: &dyn AuthProvider,
    session_cache: &SessionCache,
    config: &Config,
) -> Result<PushReport> {
    let session = session_cache.ensure_valid(auth).await?;

    {
        let conn = store.connection();
        Outbox::new(&conn).coalesce()?;
    }

    let mut report = PushReport::default();
    const MAX_DRAIN_PASSES: usize = 10;

    for _ in 0..MAX_DRAIN_PASSES {
        let pending = {
            let conn = store.connection();
            Outbox::new(&conn).get_pending(100)?
        };
        if pending.is_empty() {
            break;
        }
        for op in pending {
            match push_one(store, remote, config, &session.user_id, &op).await {
                Ok(()) => {
                    Outbox::new(&store.connection()).remove(op.seq)?;
                    report.pushed += 1;
                }
                Err(e) if e.is_transient() => {
                    let retries = Outbox::new(&store.connection()).increment_retry(op.seq)?;
                    if retries >= RETRY_CEILING {
                        warn!(seq = op.seq, table = %op.table, "abandoning item past retry ceiling");
                        Outbox::new(&store.connection()).remove(op.seq)?;
                        report.abandoned.push(AbandonedOperation {
                            seq: op.seq,
                            table: op.table.clone(),
                            entity_id: op.entity_id.clone(),
                            detail: e.detail(),
                        });
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    Ok(report)
}

async fn push_one(
    store: &LocalStore,
    remote: &dyn RemoteService,
    config: &Config,
    owner_id: &str,
    op: &Operation,
) -> Result<()> {
    let record_payload = match op.op_type {
        OpType::Create => store.get(&op.table, &op.entity_id)?.map(|r| r.as_value()),
        _ => None,
    };

    let result = remote
        .mutate(
            &op.table,
            &op.entity_id,
            op.op_type,
            op.field.as_deref(),
            op.value.as_ref(),
            record_payload.as_ref(),
        )
        .await;

    match result {
        Ok(res) if !res.ids.is_empty() => Ok(()),
        Ok(_zero_rows) => handle_zero_rows(store, remote, config, owner_id, op).await,
        Err(e) => handle_mutation_error(store, remote, config, owner_id, op, e).await,
    }
}

/// A successful HTTP response with zero affected rows: either a
/// not-found on `delete` (fine), a singleton whose row belongs to a
/// different id (reconcile), or a genuine RLS rejection (fail).
async fn handle_zero_rows(
    store: &LocalStore,
    remote: &dyn RemoteService,
    config: &Config,
    owner_id: &str,
    op: &Operation,
) -> Result<()> {
    if op.op_type == OpType::Delete {
        // Not-found on delete: success, already gone.
        return Ok(());
    }

    let table_cfg = config.table(&op.table);
    let is_singleton = table_cfg.map(|t| t.is_singleton).unwrap_or(false);
    if is_singleton && matches!(op.op_type, OpType::Set | OpType::Increment) {
        return reconcile_singleton(store, remote, owner_id, op).await;
    }

    Err(EngineError::Authorization(format!(
        "update blocked on {}/{}",
        op.table, op.entity_id
    )))
}

/// Zero-row `set`/`increment` on a singleton table: our local id doesn't
/// match the remote row for this owner. Look it up, merge our update onto
/// the real id, and rewrite local state.
async fn reconcile_singleton(
    store: &LocalStore,
    remote: &dyn RemoteService,
    owner_id: &str,
    op: &Operation,
) -> Result<()> {
    let rows = remote.fetch_since(&op.table, owner_id, None).await?;
    let remote_row = rows
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::Authorization(format!("no remote row for singleton {}", op.table)))?;

    rewrite_local_id(store, &op.table, &op.entity_id, &remote_row.id)?;

    let retried = Operation {
        seq: op.seq,
        table: op.table.clone(),
        entity_id: remote_row.id,
        op_type: op.op_type,
        field: op.field.clone(),
        value: op.value.clone(),
        timestamp: op.timestamp,
        retries: op.retries,
    };
    let result = remote
        .mutate(
            &retried.table,
            &retried.entity_id,
            retried.op_type,
            retried.field.as_deref(),
            retried.value.as_ref(),
            None,
        )
        .await?;
    if result.ids.is_empty() {
        return Err(EngineError::Authorization(format!(
            "update blocked on reconciled singleton {}/{}",
            retried.table, retried.entity_id
        )));
    }
    Ok(())
}

/// Rewrite a local id everywhere it appears: the domain row and any
/// queued operations bound to it.
fn rewrite_local_id(store: &LocalStore, table: &str, old_id: &str, new_id: &str) -> Result<()> {
    store.with_batch(|tx| {
        if let Some(mut rec) = LocalStore::get_tx(tx, table, old_id)? {
            rec.set("id", serde_json::Value::String(new_id.to_string()));
            LocalStore::delete_row(tx, table, old_id)?;
            LocalStore::put(tx, table, &rec)?;
        }
        Outbox::new(tx).purge_entity(table, old_id)?;
        Ok(())
    })
}

async fn handle_mutation_error(
    store: &LocalStore,
    remote: &dyn RemoteService,
    config: &Config,
    owner_id: &str,
    op: &Operation,
    err: EngineError,
) -> Result<()> {
    if op.op_type == OpType::Create && is_duplicate_key(&err) {
        // Treat as success; for singleton tables reconcile the local id
        // with whatever remote row already exists for this owner.
        let table_cfg = config.table(&op.table);
        if table_cfg.map(|t| t.is_singleton).unwrap_or(false) {
            return reconcile_duplicate_create(store, remote, owner_id, op).await;
        }
        return Ok(());
    }
    Err(err)
}

/// Duplicate-key on `create` for a singleton table: the remote row
/// already exists under a different id. Fetch it, rewrite our local id
/// to match, and purge the stale queue entries -- the same id-adoption
/// path `reconcile_singleton` uses for zero-row `set`/`increment`.
async fn reconcile_duplicate_create(
    store: &LocalStore,
    remote: &dyn RemoteService,
    owner_id: &str,
    op: &Operation,
) -> Result<()> {
    let rows = remote.fetch_since(&op.table, owner_id, None).await?;
    let remote_row = rows
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::Authorization(format!("no remote row for singleton {}", op.table)))?;
    rewrite_local_id(store, &op.table, &op.entity_id, &remote_row.id)
}

fn is_duplicate_key(err: &EngineError) -> bool {
    matches!(err, EngineError::Transient(msg) if msg.contains("duplicate") || msg.contains("23505"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;
    use crate::record::Record;
    use crate::testkit::{FakeAuthProvider, SharedFakeRemote};

    fn config() -> Config {
        let mut c = Config::default();
        c.tables.push(TableConfig::new("widgets", vec!["id".into(), "title".into()]));
        c
    }

    /// Boundary scenario: a `set` that the remote silently rejects (zero
    /// rows, e.g. row-level security) surfaces as an authorization error,
    /// and the queue item is neither removed nor retried.
    #[tokio::test]
    async fn rls_silent_block_surfaces_authorization_and_keeps_queue_item() {
        let cfg = config();
        let store = LocalStore::open_in_memory(&cfg).unwrap();
        let remote = SharedFakeRemote::new();
        let auth = FakeAuthProvider::new("u1");
        let session_cache = SessionCache::new();

        // No row exists for "w1" on the remote, so a `set` against it comes
        // back with zero affected rows -- "widgets" isn't a singleton table
        // so `handle_zero_rows` treats this as a genuine rejection.
        store
            .with_batch(|tx| Outbox::enqueue_set(tx, "widgets", "w1", Some("title"), &serde_json::json!("x")))
            .unwrap();

        let err = run_push_cycle(&store, &remote, &auth, &session_cache, &cfg)
            .await
            .expect_err("a silently rejected set must surface as an error, not a report");
        assert!(err.is_authorization());

        let pending = Outbox::new(&store.connection()).get_pending(10).unwrap();
        assert_eq!(pending.len(), 1, "queue item must survive an authorization rejection");
    }

    #[tokio::test]
    async fn duplicate_key_create_on_singleton_rewrites_local_id() {
        let mut cfg = Config::default();
        cfg.tables.push(TableConfig::new("counters", vec!["id".into(), "v".into()]).singleton());
        let remote = SharedFakeRemote::new();
        let auth = FakeAuthProvider::new("u1");
        let session_cache = SessionCache::new();

        // Seed the remote with an existing singleton row under "real-id".
        let mut seeded = Record::new("real-id", Some("u1"), "dev-a");
        seeded.set("v", serde_json::json!(1));
        remote
            .mutate(
                "counters",
                "real-id",
                crate::ops::OpType::Create,
                None,
                None,
                Some(&seeded.as_value()),
            )
            .await
            .unwrap();

        // This device creates under its own tentative local id, unaware
        // a singleton row already exists remotely.
        let store = LocalStore::open_in_memory(&cfg).unwrap();
        let mut tentative = Record::new("tentative-id", Some("u1"), "dev-b");
        tentative.set("v", serde_json::json!(2));
        store.with_batch(|tx| LocalStore::put(tx, "counters", &tentative)).unwrap();
        store
            .with_batch(|tx| Outbox::enqueue_create(tx, "counters", "tentative-id", &tentative.as_value()))
            .unwrap();

        run_push_cycle(&store, &remote, &auth, &session_cache, &cfg).await.unwrap();

        assert!(store.get("counters", "tentative-id").unwrap().is_none());
        assert!(store.get("counters", "real-id").unwrap().is_some());
        assert!(Outbox::new(&store.connection())
            .get_pending_for_entity("counters", "tentative-id")
            .unwrap()
            .is_empty());
    }
}
