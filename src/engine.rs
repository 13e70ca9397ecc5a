use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::auth::AuthProvider;
use crate::config::Config;
use crate::crdt::CrdtManager;
use crate::error::Result;
use crate::outbox::Outbox;
use crate::realtime::{EchoCache, RealtimeSubscriber, RealtimeTransport};
use crate::record::Record;
use crate::remote::RemoteService;
use crate::status::{StatusObservable, SyncStatus};
use crate::store::LocalStore;
use crate::supervisor::{CycleReport, Supervisor};

/// Construction arguments for [`Engine::open`].
pub struct EngineOptions {
    pub db_path: String,
    pub config: Config,
    pub device_id: String,
    pub remote: Arc<dyn RemoteService>,
    pub auth: Arc<dyn AuthProvider>,
    pub realtime_transport: Arc<dyn RealtimeTransport>,
}

/// Wires together the local store (A), outbox (B), conflict resolver (D),
/// push/pull pipelines (E/F), realtime subscriber (G's reconnect loop),
/// supervisor (G), status observable (H), and CRDT layer (I) into the
/// single entry point application code depends on.
pub struct Engine {
    store: Arc<LocalStore>,
    config: Config,
    device_id: String,
    supervisor: Arc<Supervisor>,
    status: Arc<StatusObservable>,
    realtime: Arc<RealtimeSubscriber>,
    crdt: CrdtManager,
    remote_change_tx: broadcast::Sender<crate::realtime::ChangeEvent>,
}

impl Engine {
    /// Open the engine: validate config, open/rebuild the local store,
    /// and wire every component together. No network I/O happens until
    /// the caller identifies an owner and the supervisor runs its first
    /// cycle.
    pub async fn open(opts: EngineOptions) -> Result<Self> {
        let store = Arc::new(LocalStore::open(&opts.db_path, &opts.config)?);
        {
            let conn = store.connection();
            Outbox::new(&conn).init_schema()?;
        }
        let crdt = CrdtManager::new(Arc::clone(&store));
        crdt.init_schema()?;
        crate::merge::ConflictHistoryStore::new(&store.connection()).init_schema()?;

        let status = Arc::new(StatusObservable::new());
        let echo = Arc::new(EchoCache::default());
        let realtime = Arc::new(RealtimeSubscriber::new(opts.realtime_transport, Arc::clone(&echo)));

        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&store),
            opts.remote,
            opts.auth,
            opts.config.clone(),
            Arc::clone(&status),
            Arc::clone(&realtime),
            echo,
        ));

        {
            let watchdog_owner = Arc::clone(&supervisor);
            tokio::spawn(watchdog_owner.run_watchdog());
        }
        {
            let periodic_owner = Arc::clone(&supervisor);
            let interval_ms = opts.config.sync_interval_ms;
            tokio::spawn(async move {
                run_periodic_tick(periodic_owner, interval_ms).await;
            });
        }
        {
            let maintenance_store = Arc::clone(&store);
            let maintenance_config = opts.config.clone();
            tokio::spawn(async move {
                run_maintenance_sweep(maintenance_store, maintenance_config).await;
            });
        }

        let (remote_change_tx, _) = broadcast::channel(256);

        Ok(Self {
            store,
            config: opts.config,
            device_id: opts.device_id,
            supervisor,
            status,
            realtime,
            crdt,
            remote_change_tx,
        })
    }

    /// Identify the current owner and (re)start the realtime subscriber
    /// for them -- called once sign-in completes.
    pub fn set_owner(&self, owner_id: Option<String>) {
        self.supervisor.set_owner(owner_id.clone());
        if let Some(owner) = owner_id {
            let realtime = Arc::clone(&self.realtime);
            let run_owner = owner.clone();
            tokio::spawn(async move { realtime.run(&run_owner).await });

            let realtime = Arc::clone(&self.realtime);
            let store = Arc::clone(&self.store);
            let config = self.config.clone();
            let change_tx = self.remote_change_tx.clone();
            tokio::spawn(async move {
                apply_realtime_changes(realtime, store, config, change_tx).await;
            });
        }
    }

    pub fn status(&self) -> tokio::sync::watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn on_sync_complete(&self) -> broadcast::Receiver<CycleReport> {
        self.supervisor.on_sync_complete()
    }

    pub fn remote_changes(&self) -> broadcast::Receiver<crate::realtime::ChangeEvent> {
        self.remote_change_tx.subscribe()
    }

    pub async fn run_full_sync(&self, quiet: bool, skip_pull: bool) -> Result<CycleReport> {
        self.supervisor.run_full_sync(quiet, skip_pull).await
    }

    pub fn on_offline(&self) {
        self.status.set_offline(true);
        self.supervisor.on_offline();
    }

    pub async fn on_online(self: &Arc<Self>) -> Result<()> {
        let sup = Arc::clone(&self.supervisor);
        sup.trigger_online_reconnect().await?;
        Ok(())
    }

    pub fn on_auth_event(&self) {
        self.supervisor.trigger_auth_event();
    }

    /// Dedicated `onAuthKicked` registration: fires whenever a cycle halts
    /// on an authorization rejection.
    pub fn on_auth_kicked(&self) -> broadcast::Receiver<()> {
        self.supervisor.on_auth_kicked()
    }

    /// `onVisibilityChange(false)` handler: the tab was hidden.
    pub fn on_tab_hidden(&self) {
        self.status.set_tab_visible(false);
    }

    /// `onVisibilityChange(true)` handler: the application reports how
    /// long the tab was hidden.
    pub async fn on_visibility_return(&self, away_ms: u64) -> Result<()> {
        self.status.set_tab_visible(true);
        self.supervisor.trigger_visibility_return(away_ms).await?;
        Ok(())
    }

    pub fn get(&self, table: &str, id: &str) -> Result<Option<Record>> {
        self.store.get(table, id)
    }

    pub fn get_all(&self, table: &str) -> Result<Vec<Record>> {
        self.store.get_all(table)
    }

    pub fn query(&self, table: &str, index: &str, value: &serde_json::Value) -> Result<Vec<Record>> {
        self.store.query(table, index, value)
    }

    /// Application write: insert a new row locally, atomically batched
    /// with its outbox entry.
    pub fn create(&self, table: &str, user_id: Option<&str>, fields: serde_json::Value) -> Result<Record> {
        let mut record = Record::new(Uuid::new_v4().to_string(), user_id, &self.device_id);
        if let serde_json::Value::Object(map) = fields {
            for (k, v) in map {
                record.set(&k, v);
            }
        }
        self.store.with_batch(|tx| {
            LocalStore::put(tx, table, &record)?;
            Outbox::enqueue_create(tx, table, record.id(), &record.as_value())?;
            Ok(())
        })?;
        self.mark_modified(table, record.id());
        self.schedule_debounced_push();
        Ok(record)
    }

    pub fn set(&self, table: &str, id: &str, fields: serde_json::Value) -> Result<()> {
        self.store.with_batch(|tx| {
            if let Some(mut record) = LocalStore::get_tx(tx, table, id)? {
                if let serde_json::Value::Object(map) = &fields {
                    for (k, v) in map {
                        record.set(k, v.clone());
                    }
                }
                record.set_updated_at(chrono::Utc::now());
                LocalStore::put(tx, table, &record)?;
            }
            Outbox::enqueue_set(tx, table, id, None, &fields)?;
            Ok(())
        })?;
        self.mark_modified(table, id);
        self.schedule_debounced_push();
        Ok(())
    }

    pub fn increment(&self, table: &str, id: &str, field: &str, delta: f64) -> Result<()> {
        self.store.with_batch(|tx| {
            if let Some(mut record) = LocalStore::get_tx(tx, table, id)? {
                let current = record.get(field).and_then(serde_json::Value::as_f64).unwrap_or(0.0);
                record.set(field, serde_json::json!(current + delta));
                record.set_updated_at(chrono::Utc::now());
                LocalStore::put(tx, table, &record)?;
            }
            Outbox::enqueue_increment(tx, table, id, field, delta)?;
            Ok(())
        })?;
        self.mark_modified(table, id);
        self.schedule_debounced_push();
        Ok(())
    }

    pub fn delete(&self, table: &str, id: &str) -> Result<()> {
        self.store.with_batch(|tx| {
            if let Some(mut record) = LocalStore::get_tx(tx, table, id)? {
                record.set_deleted(true);
                record.set_updated_at(chrono::Utc::now());
                LocalStore::put(tx, table, &record)?;
            }
            Outbox::enqueue_delete(tx, table, id)?;
            Ok(())
        })?;
        self.mark_modified(table, id);
        self.schedule_debounced_push();
        Ok(())
    }

    pub async fn open_document(&self, doc_id: &str, page_id: &str, owner_id: &str) -> Result<Arc<crate::crdt::CrdtDocument>> {
        self.crdt.open(doc_id, page_id, owner_id, &self.device_id).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn mark_modified(&self, table: &str, id: &str) {
        self.supervisor.mark_locally_modified(table, id);
    }

    fn schedule_debounced_push(&self) {
        let supervisor = Arc::clone(&self.supervisor);
        tokio::spawn(async move {
            supervisor.trigger_debounced_push().await;
        });
    }
}

/// Applies the realtime path: per delivered [`ChangeEvent`], merge it into
/// the local store the same way the pull pipeline would -- skip if the
/// entity has no conflicting local state, otherwise invoke the conflict
/// resolver -- then forward it to application subscribers.
async fn apply_realtime_changes(
    realtime: Arc<RealtimeSubscriber>,
    store: Arc<LocalStore>,
    config: Config,
    change_tx: broadcast::Sender<crate::realtime::ChangeEvent>,
) {
    let mut events = realtime.subscribe_events();
    loop {
        match events.recv().await {
            Ok(ev) => {
                if let Err(e) = apply_one_change(&store, &config, &ev) {
                    tracing::warn!(error = %e, table = %ev.table, "failed applying realtime change");
                    continue;
                }
                let _ = change_tx.send(ev);
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn apply_one_change(store: &LocalStore, config: &Config, ev: &crate::realtime::ChangeEvent) -> Result<()> {
    let Some(table_cfg) = config.table(&ev.table) else {
        return Ok(());
    };
    let local = store.get(&ev.table, &ev.entity_id)?;
    let remote_record = Record::from_value(ev.data.clone())?;

    if let Some(local_rec) = &local {
        if local_rec.updated_at() >= remote_record.updated_at() {
            return Ok(());
        }
        let pending = Outbox::new(&store.connection()).get_pending_for_entity(&ev.table, &ev.entity_id)?;
        if !pending.is_empty() {
            let resolution = crate::merge::resolve(table_cfg, &ev.entity_id, local.as_ref(), &remote_record, &pending);
            if !resolution.entries.is_empty() {
                crate::merge::ConflictHistoryStore::new(&store.connection()).insert_all(&resolution.entries)?;
            }
            return store.with_batch(|tx| LocalStore::put(tx, &ev.table, &resolution.record));
        }
    }
    store.with_batch(|tx| LocalStore::put(tx, &ev.table, &remote_record))
}

async fn run_periodic_tick(supervisor: Arc<Supervisor>, interval_ms: u64) {
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
    loop {
        interval.tick().await;
        if let Err(e) = supervisor.trigger_periodic_tick().await {
            tracing::warn!(error = %e, "periodic tick failed");
        }
    }
}

/// Hard-deletes expired tombstones and conflict-history entries past their
/// 30-day retention, on the same cadence as the periodic sync tick -- this
/// is bookkeeping, not a sync trigger, so it runs unconditionally
/// regardless of visibility or realtime health.
async fn run_maintenance_sweep(store: Arc<LocalStore>, config: Config) {
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(config.sync_interval_ms));
    loop {
        interval.tick().await;
        if let Err(e) = store.prune_tombstones(&config) {
            tracing::warn!(error = %e, "tombstone prune failed");
        }
        let conn = store.connection();
        let history = crate::merge::ConflictHistoryStore::new(&conn);
        if let Err(e) = history.prune_expired() {
            tracing::warn!(error = %e, "conflict history prune failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;
    use crate::realtime::RealtimeTransport;
    use crate::testkit::{FakeAuthProvider, SharedFakeRemote};
    use async_trait::async_trait;
    use futures_util::stream::BoxStream;

    struct NeverConnects;

    #[async_trait]
    impl RealtimeTransport for NeverConnects {
        async fn connect(&self, _owner_id: &str) -> Result<BoxStream<'static, Result<crate::realtime::ChangeEvent>>> {
            Err(crate::error::EngineError::Transient("not used in this test".into()))
        }
    }

    fn config() -> Config {
        let mut c = Config::default();
        c.tables.push(TableConfig::new("widgets", vec!["id".into(), "title".into()]));
        c
    }

    #[tokio::test]
    async fn create_then_full_sync_pushes_the_row_to_the_remote() {
        let remote = Arc::new(SharedFakeRemote::new());
        let remote_handle: Arc<dyn RemoteService> = remote.clone();
        let opts = EngineOptions {
            db_path: ":memory:".to_string(),
            config: config(),
            device_id: "dev-a".to_string(),
            remote: remote_handle,
            auth: Arc::new(FakeAuthProvider::new("u1")),
            realtime_transport: Arc::new(NeverConnects),
        };
        let engine = Engine::open(opts).await.unwrap();
        engine.set_owner(Some("u1".to_string()));

        let created = engine.create("widgets", Some("u1"), serde_json::json!({"title": "hello"})).unwrap();
        engine.run_full_sync(true, true).await.unwrap();

        let remote_rows = remote.fetch_since("widgets", "u1", None).await.unwrap();
        assert_eq!(remote_rows.len(), 1);
        assert_eq!(remote_rows[0].id, created.id());
        assert_eq!(remote_rows[0].data.get("title"), Some(&serde_json::json!("hello")));
    }
}
