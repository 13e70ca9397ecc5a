//! In-memory two-device harness used to exercise cross-device convergence
//! scenarios end to end. Not part of the public API.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;

use crate::auth::{AuthProvider, Session};
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::ops::OpType;
use crate::outbox::Outbox;
use crate::remote::{MutationResult, RemoteRow, RemoteService};
use crate::store::LocalStore;

/// A row keyed the way a real PostgREST table would be: `(table,
/// entity_id)`. Single global owner for simplicity (`u1`).
pub struct SharedFakeRemote {
    rows: StdMutex<HashMap<(String, String), serde_json::Value>>,
    singleton_ids: StdMutex<HashMap<String, String>>,
}

impl SharedFakeRemote {
    pub fn new() -> Self {
        Self {
            rows: StdMutex::new(HashMap::new()),
            singleton_ids: StdMutex::new(HashMap::new()),
        }
    }

    fn row_value(&self, table: &str, id: &str) -> Option<serde_json::Value> {
        self.rows.lock().unwrap().get(&(table.to_string(), id.to_string())).cloned()
    }

    fn put_row(&self, table: &str, id: &str, value: serde_json::Value) {
        self.rows.lock().unwrap().insert((table.to_string(), id.to_string()), value);
    }
}

impl Default for SharedFakeRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteService for SharedFakeRemote {
    async fn mutate(
        &self,
        table: &str,
        entity_id: &str,
        op_type: OpType,
        field: Option<&str>,
        value: Option<&serde_json::Value>,
        record: Option<&serde_json::Value>,
    ) -> Result<MutationResult> {
        match op_type {
            OpType::Create => {
                if let Some(existing_id) = self.singleton_ids.lock().unwrap().get(table).cloned() {
                    if existing_id != entity_id {
                        // Simulate a unique-owner-constraint violation
                        // .
                        return Err(EngineError::Transient(format!(
                            "http 409: duplicate key value violates unique constraint (23505), existing id {existing_id}"
                        )));
                    }
                }
                self.singleton_ids
                    .lock()
                    .unwrap()
                    .entry(table.to_string())
                    .or_insert_with(|| entity_id.to_string());
                let payload = record.cloned().unwrap_or(serde_json::Value::Null);
                self.put_row(table, entity_id, payload);
                Ok(MutationResult { ids: vec![entity_id.to_string()] })
            }
            OpType::Set => {
                let Some(mut existing) = self.row_value(table, entity_id) else {
                    return Ok(MutationResult { ids: vec![] });
                };
                if let serde_json::Value::Object(map) = &mut existing {
                    if let (Some(f), Some(v)) = (field, value) {
                        map.insert(f.to_string(), v.clone());
                    } else if let Some(serde_json::Value::Object(patch)) = value {
                        for (k, v) in patch {
                            map.insert(k.clone(), v.clone());
                        }
                    }
                    map.insert("updated_at".to_string(), serde_json::json!(now_ms()));
                }
                self.put_row(table, entity_id, existing);
                Ok(MutationResult { ids: vec![entity_id.to_string()] })
            }
            OpType::Increment => {
                let Some(mut existing) = self.row_value(table, entity_id) else {
                    return Ok(MutationResult { ids: vec![] });
                };
                if let serde_json::Value::Object(map) = &mut existing {
                    let f = field.unwrap_or_default();
                    let delta = value.and_then(serde_json::Value::as_f64).unwrap_or(0.0);
                    let current = map.get(f).and_then(serde_json::Value::as_f64).unwrap_or(0.0);
                    map.insert(f.to_string(), serde_json::json!(current + delta));
                    map.insert("updated_at".to_string(), serde_json::json!(now_ms()));
                }
                self.put_row(table, entity_id, existing);
                Ok(MutationResult { ids: vec![entity_id.to_string()] })
            }
            OpType::Delete => {
                let Some(mut existing) = self.row_value(table, entity_id) else {
                    // Not-found on delete: success.
                    return Ok(MutationResult { ids: vec![entity_id.to_string()] });
                };
                if let serde_json::Value::Object(map) = &mut existing {
                    map.insert("deleted".to_string(), serde_json::Value::Bool(true));
                    map.insert("updated_at".to_string(), serde_json::json!(now_ms()));
                }
                self.put_row(table, entity_id, existing);
                Ok(MutationResult { ids: vec![entity_id.to_string()] })
            }
        }
    }

    async fn fetch_since(&self, table: &str, _owner_id: &str, cursor_ms: Option<i64>) -> Result<Vec<RemoteRow>> {
        let rows = self.rows.lock().unwrap();
        let mut out: Vec<RemoteRow> = rows
            .iter()
            .filter(|((t, _), _)| t == table)
            .filter_map(|((_, id), v)| {
                let updated_at_ms = v.get("updated_at").and_then(serde_json::Value::as_i64)?;
                let deleted = v.get("deleted").and_then(serde_json::Value::as_bool).unwrap_or(false);
                match cursor_ms {
                    Some(c) if updated_at_ms <= c => None,
                    _ => Some(RemoteRow { id: id.clone(), updated_at_ms, deleted, data: v.clone() }),
                }
            })
            .collect();
        out.sort_by(|a, b| a.updated_at_ms.cmp(&b.updated_at_ms).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Always-valid session, never refreshes (good enough for the harness).
pub struct FakeAuthProvider {
    session: Session,
}

impl FakeAuthProvider {
    pub fn new(user_id: &str) -> Self {
        Self {
            session: Session { user_id: user_id.to_string(), access_token: "fake".into(), expires_at: None },
        }
    }
}

#[async_trait]
impl AuthProvider for FakeAuthProvider {
    fn current_session(&self) -> Option<Session> {
        Some(self.session.clone())
    }

    async fn refresh_session(&self) -> Result<Session> {
        Ok(self.session.clone())
    }

    async fn sign_out(&self) -> Result<()> {
        Ok(())
    }

    fn subscribe(&self) -> tokio::sync::watch::Receiver<Option<crate::auth::AuthEvent>> {
        let (_tx, rx) = tokio::sync::watch::channel(None);
        rx
    }
}

/// Run one push-then-pull cycle for a device against the shared fake,
/// mirroring [`crate::supervisor::Supervisor::run_full_sync`]'s ordering
/// without the lock/watchdog/debounce machinery the harness doesn't need.
pub async fn sync_device(
    store: &LocalStore,
    remote: &SharedFakeRemote,
    auth: &FakeAuthProvider,
    config: &Config,
    owner_id: &str,
) -> Result<()> {
    let session_cache = crate::auth::SessionCache::new();
    crate::push::run_push_cycle(store, remote, auth, &session_cache, config).await?;
    let echo = crate::realtime::EchoCache::new(chrono::Duration::seconds(10));
    let recently_modified = crate::realtime::EchoCache::new(crate::pull::recently_modified_ttl());
    crate::pull::run_pull_cycle(store, remote, owner_id, &echo, &recently_modified, config, None).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;
    use crate::record::Record;

    fn config() -> Config {
        let mut c = Config::default();
        c.tables.push(
            TableConfig::new("counters", vec!["id".into(), "v".into()])
                .singleton()
                .numeric_merge_fields(["v"]),
        );
        c
    }

    #[tokio::test]
    async fn numeric_race_converges_to_sum_of_both_increments() {
        let cfg = config();
        let remote = SharedFakeRemote::new();
        let auth = FakeAuthProvider::new("u1");

        let device_a = LocalStore::open_in_memory(&cfg).unwrap();
        let device_b = LocalStore::open_in_memory(&cfg).unwrap();

        let mut seed = Record::new("c1", Some("u1"), "dev-a");
        seed.set("v", serde_json::json!(0));
        device_a.with_batch(|tx| LocalStore::put(tx, "counters", &seed)).unwrap();
        device_a
            .with_batch(|tx| Outbox::enqueue_create(tx, "counters", "c1", &seed.as_value()))
            .unwrap();
        sync_device(&device_a, &remote, &auth, &cfg, "u1").await.unwrap();

        device_b.with_batch(|tx| LocalStore::put(tx, "counters", &seed)).unwrap();
        sync_device(&device_b, &remote, &auth, &cfg, "u1").await.unwrap();

        device_a
            .with_batch(|tx| Outbox::enqueue_increment(tx, "counters", "c1", "v", 1.0))
            .unwrap();
        device_b
            .with_batch(|tx| Outbox::enqueue_increment(tx, "counters", "c1", "v", 1.0))
            .unwrap();

        sync_device(&device_a, &remote, &auth, &cfg, "u1").await.unwrap();
        sync_device(&device_b, &remote, &auth, &cfg, "u1").await.unwrap();
        sync_device(&device_a, &remote, &auth, &cfg, "u1").await.unwrap();

        let a = device_a.get("counters", "c1").unwrap().unwrap();
        let b = device_b.get("counters", "c1").unwrap().unwrap();
        assert_eq!(a.get("v"), Some(&serde_json::json!(2.0)));
        assert_eq!(b.get("v"), Some(&serde_json::json!(2.0)));
    }

    #[tokio::test]
    async fn singleton_id_reconciliation_adopts_remote_id() {
        let cfg = config();
        let remote = SharedFakeRemote::new();
        let auth = FakeAuthProvider::new("u1");

        let device_a = LocalStore::open_in_memory(&cfg).unwrap();
        let mut seed_a = Record::new("local-tmp-id", Some("u1"), "dev-a");
        seed_a.set("v", serde_json::json!(1));
        device_a.with_batch(|tx| LocalStore::put(tx, "counters", &seed_a)).unwrap();
        device_a
            .with_batch(|tx| Outbox::enqueue_create(tx, "counters", "local-tmp-id", &seed_a.as_value()))
            .unwrap();
        sync_device(&device_a, &remote, &auth, &cfg, "u1").await.unwrap();

        // Device B creates under a different tentative id before its first sync.
        let device_b = LocalStore::open_in_memory(&cfg).unwrap();
        let mut seed_b = Record::new("other-tmp-id", Some("u1"), "dev-b");
        seed_b.set("v", serde_json::json!(5));
        device_b.with_batch(|tx| LocalStore::put(tx, "counters", &seed_b)).unwrap();
        device_b
            .with_batch(|tx| Outbox::enqueue_create(tx, "counters", "other-tmp-id", &seed_b.as_value()))
            .unwrap();
        sync_device(&device_b, &remote, &auth, &cfg, "u1").await.unwrap();

        // device_a's row remains the single remote row under "local-tmp-id";
        // device_b's duplicate-key create is reconciled synchronously during
        // its own push cycle, rewriting "other-tmp-id" to "local-tmp-id".
        let reconciled_b = device_b.get("counters", "local-tmp-id").unwrap();
        assert!(reconciled_b.is_some());
        assert!(device_b.get("counters", "other-tmp-id").unwrap().is_none());
    }
}
