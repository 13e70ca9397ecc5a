use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::auth::{AuthProvider, SessionCache};
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::merge::ConflictHistoryEntry;
use crate::pull::{self, recently_modified_ttl};
use crate::push::{self, PushReport};
use crate::realtime::{EchoCache, RealtimeSubscriber};
use crate::remote::RemoteService;
use crate::status::{LastError, StatusObservable};
use crate::store::LocalStore;

const PER_PHASE_TIMEOUT: StdDuration = StdDuration::from_secs(45);
const WATCHDOG_INTERVAL: StdDuration = StdDuration::from_secs(15);
const WATCHDOG_STALE_AFTER: StdDuration = StdDuration::from_secs(60);

/// The full outcome of one `runFullSync`.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub push: Option<PushReport>,
    pub pull_accepted: i64,
    pub pull_skipped: i64,
    pub conflicts: Vec<ConflictHistoryEntry>,
}

/// Coordinates every trigger (debounce, periodic tick, visibility,
/// online/offline, auth state) into a single serialized `runFullSync`.
pub struct Supervisor {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteService>,
    auth: Arc<dyn AuthProvider>,
    session_cache: SessionCache,
    config: Config,
    status: Arc<StatusObservable>,
    realtime: Arc<RealtimeSubscriber>,
    echo: Arc<EchoCache>,
    recently_modified: Arc<EchoCache>,
    owner_id: Arc<std::sync::Mutex<Option<String>>>,

    /// A full cycle is running. Not a `tokio::sync::Mutex`: the spec
    /// requires contending triggers to be *dropped*, not queued, and the
    /// watchdog to be able to *force*-release a stale holder -- neither
    /// is possible with a real mutex guard owned by a different task.
    locked: AtomicBool,
    lock_acquired_at: Arc<std::sync::Mutex<Option<Instant>>>,
    last_successful_sync_ms: AtomicI64,
    running: AtomicBool,
    online: AtomicBool,

    sync_complete_tx: broadcast::Sender<CycleReport>,
    /// Fires when a cycle halts on an authorization rejection.
    auth_kicked_tx: broadcast::Sender<()>,
}

impl Supervisor {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteService>,
        auth: Arc<dyn AuthProvider>,
        config: Config,
        status: Arc<StatusObservable>,
        realtime: Arc<RealtimeSubscriber>,
        echo: Arc<EchoCache>,
    ) -> Self {
        let (sync_complete_tx, _) = broadcast::channel(32);
        let (auth_kicked_tx, _) = broadcast::channel(8);
        Self {
            store,
            remote,
            auth,
            session_cache: SessionCache::new(),
            config,
            status,
            realtime,
            echo,
            recently_modified: Arc::new(EchoCache::new(recently_modified_ttl())),
            owner_id: Arc::new(std::sync::Mutex::new(None)),
            locked: AtomicBool::new(false),
            lock_acquired_at: Arc::new(std::sync::Mutex::new(None)),
            last_successful_sync_ms: AtomicI64::new(0),
            running: AtomicBool::new(false),
            online: AtomicBool::new(true),
            sync_complete_tx,
            auth_kicked_tx,
        }
    }

    pub fn on_sync_complete(&self) -> broadcast::Receiver<CycleReport> {
        self.sync_complete_tx.subscribe()
    }

    /// Subscribe to `onAuthKicked` notifications.
    pub fn on_auth_kicked(&self) -> broadcast::Receiver<()> {
        self.auth_kicked_tx.subscribe()
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// `touch()` for [`EchoCache`]-style "recently modified locally"
    /// bookkeeping, called by application code right after a local write.
    pub fn mark_locally_modified(&self, table: &str, entity_id: &str) {
        self.recently_modified.record(table, entity_id);
    }

    pub fn set_owner(&self, owner_id: Option<String>) {
        *self.owner_id.lock().unwrap() = owner_id;
    }

    /// Coordinates all triggers into the single `runFullSync(quiet,
    /// skipPull)` entry point. A cycle already in flight causes this
    /// trigger to be dropped -- returned as an empty, side-effect-free
    /// report -- rather than queued behind it; the next tick absorbs
    /// whatever this one would have done.
    #[instrument(skip(self))]
    pub async fn run_full_sync(&self, quiet: bool, skip_pull: bool) -> Result<CycleReport> {
        if self.locked.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            debug!("sync cycle already in flight, dropping this trigger");
            return Ok(CycleReport::default());
        }
        *self.lock_acquired_at.lock().unwrap() = Some(Instant::now());
        self.running.store(true, Ordering::SeqCst);

        if !quiet {
            self.status.begin_cycle(Some("Syncing...".into()));
        }

        let result = self.run_full_sync_inner(skip_pull).await;

        self.running.store(false, Ordering::SeqCst);
        *self.lock_acquired_at.lock().unwrap() = None;
        self.locked.store(false, Ordering::SeqCst);

        if let Err(e) = &result {
            if e.is_authorization() {
                let _ = self.auth_kicked_tx.send(());
            }
        }

        if !quiet {
            let err = result.as_ref().err().map(|e| LastError {
                friendly: e.user_message().to_string(),
                detail: e.detail(),
            });
            let last_sync_time = if result.is_ok() { Some(chrono::Utc::now()) } else { None };
            self.status.finish_cycle(err, last_sync_time).await;
        }

        if let Ok(report) = &result {
            self.last_successful_sync_ms
                .store(chrono::Utc::now().timestamp_millis(), Ordering::SeqCst);
            let _ = self.sync_complete_tx.send(CycleReport {
                push: report.push.as_ref().map(|p| PushReport {
                    pushed: p.pushed,
                    abandoned: p.abandoned.clone(),
                    realtime_healthy: p.realtime_healthy,
                }),
                pull_accepted: report.pull_accepted,
                pull_skipped: report.pull_skipped,
                conflicts: report.conflicts.clone(),
            });
        }

        result
    }

    async fn run_full_sync_inner(&self, mut skip_pull: bool) -> Result<CycleReport> {
        let owner_id = self
            .owner_id
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| EngineError::Authorization("no owner identified".into()))?;

        let mut report = CycleReport::default();

        let push_result = tokio::time::timeout(
            PER_PHASE_TIMEOUT,
            push::run_push_cycle(&self.store, self.remote.as_ref(), self.auth.as_ref(), &self.session_cache, &self.config),
        )
        .await
        .map_err(|_| EngineError::Timeout)??;

        if self.realtime.is_healthy() {
            skip_pull = true;
        }
        report.push = Some(push_result);

        if !skip_pull {
            let pull_result = tokio::time::timeout(
                PER_PHASE_TIMEOUT,
                pull::run_pull_cycle(
                    &self.store,
                    self.remote.as_ref(),
                    &owner_id,
                    &self.echo,
                    &self.recently_modified,
                    &self.config,
                    None,
                ),
            )
            .await
            .map_err(|_| EngineError::Timeout)??;
            report.pull_accepted = pull_result.accepted;
            report.pull_skipped = pull_result.skipped;
            report.conflicts = pull_result.conflicts;
        }

        Ok(report)
    }

    /// **Debounced push** trigger. If realtime is healthy the cycle skips
    /// the pull phase.
    pub async fn trigger_debounced_push(self: &Arc<Self>) {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(me.config.sync_debounce_ms)).await;
            let skip_pull = me.realtime.is_healthy();
            if let Err(e) = me.run_full_sync(false, skip_pull).await {
                warn!(error = %e, "debounced push cycle failed");
            }
        });
    }

    /// **Periodic tick** -- only runs while tab visible, online, and
    /// realtime unhealthy; a no-op cycle report is returned otherwise so
    /// callers on a bare interval timer don't need to duplicate the gating
    /// logic.
    pub async fn trigger_periodic_tick(&self) -> Result<CycleReport> {
        let gated = !self.status.current().tab_visible
            || !self.online.load(Ordering::SeqCst)
            || self.realtime.is_healthy();
        if gated {
            return Ok(CycleReport::default());
        }
        self.run_full_sync(true, false).await
    }

    /// **Visibility return**: only if away for at least
    /// `visibility_sync_min_away_ms` and realtime is unhealthy.
    pub async fn trigger_visibility_return(&self, away_ms: u64) -> Result<Option<CycleReport>> {
        if self.realtime.is_healthy() || away_ms < self.config.visibility_sync_min_away_ms {
            return Ok(None);
        }
        tokio::time::sleep(StdDuration::from_millis(1_000)).await;
        self.run_full_sync(false, false).await.map(Some)
    }

    /// **Online reconnect**: only if the last successful sync predates the
    /// cooldown; always restarts realtime.
    pub async fn trigger_online_reconnect(self: &Arc<Self>) -> Result<Option<CycleReport>> {
        let last = self.last_successful_sync_ms.load(Ordering::SeqCst);
        let stale = chrono::Utc::now().timestamp_millis() - last > self.config.online_reconnect_cooldown_ms as i64;

        self.online.store(true, Ordering::SeqCst);
        self.status.set_offline(false);
        self.realtime.resume();
        if let Some(owner) = self.owner_id.lock().unwrap().clone() {
            let realtime = Arc::clone(&self.realtime);
            tokio::spawn(async move { realtime.run(&owner).await });
        }

        if stale {
            self.run_full_sync(false, false).await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// **Auth state event**: sign-in / token refresh resumes sync and
    /// clears any error state.
    pub fn trigger_auth_event(&self) {
        self.session_cache.invalidate();
        self.realtime.resume();
        self.online.store(true, Ordering::SeqCst);
        self.status.set_offline(false);
    }

    pub fn on_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
        self.status.set_offline(true);
        self.realtime.pause();
    }

    /// Watchdog: force-release a lock held past the stale threshold and
    /// re-dispatch.
    pub async fn run_watchdog(self: Arc<Self>) {
        let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
        loop {
            interval.tick().await;
            let stuck = match *self.lock_acquired_at.lock().unwrap() {
                Some(acquired) => acquired.elapsed() > WATCHDOG_STALE_AFTER,
                None => false,
            };
            if stuck {
                warn!("sync lock held past watchdog floor, force-releasing");
                // The wedged task's own per-phase timeout (45s) already
                // bounds how long it can hold `locked` before returning an
                // error and clearing it itself; this is a backstop for the
                // case where it is wedged on something that timeout doesn't
                // cover (e.g. a suspended task that never polls again). We
                // clear the flag directly -- there is no guard to release,
                // only a boolean the wedged task will also clear, harmlessly,
                // whenever it eventually does resume.
                self.locked.store(false, Ordering::SeqCst);
                *self.lock_acquired_at.lock().unwrap() = None;
                let stuck_err = EngineError::LockStuck;
                self.status
                    .finish_cycle(
                        Some(crate::status::LastError {
                            friendly: stuck_err.user_message().to_string(),
                            detail: stuck_err.detail(),
                        }),
                        None,
                    )
                    .await;
                let me = Arc::clone(&self);
                tokio::spawn(async move {
                    if let Err(e) = me.run_full_sync(true, false).await {
                        warn!(error = %e, "watchdog re-dispatch failed");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;
    use crate::realtime::{ChangeEvent, RealtimeTransport};
    use crate::testkit::{FakeAuthProvider, SharedFakeRemote};
    use async_trait::async_trait;
    use futures_util::stream::BoxStream;

    /// A transport whose `connect()` is never expected to be driven by
    /// these tests -- `RealtimeSubscriber::run()` is never spawned, so the
    /// subscriber just sits at its default `Disconnected` (unhealthy) state.
    struct NeverConnects;

    #[async_trait]
    impl RealtimeTransport for NeverConnects {
        async fn connect(&self, _owner_id: &str) -> Result<BoxStream<'static, Result<ChangeEvent>>> {
            Err(EngineError::Transient("not used in this test".into()))
        }
    }

    fn config() -> Config {
        let mut c = Config::default();
        c.tables.push(TableConfig::new("widgets", vec!["id".into(), "title".into()]));
        c
    }

    fn new_supervisor(cfg: Config) -> Arc<Supervisor> {
        let store = Arc::new(LocalStore::open_in_memory(&cfg).unwrap());
        let remote: Arc<dyn RemoteService> = Arc::new(SharedFakeRemote::new());
        let auth: Arc<dyn AuthProvider> = Arc::new(FakeAuthProvider::new("u1"));
        let status = Arc::new(StatusObservable::new());
        let echo = Arc::new(EchoCache::default());
        let realtime = Arc::new(RealtimeSubscriber::new(Arc::new(NeverConnects), Arc::clone(&echo)));
        let sup = Arc::new(Supervisor::new(store, remote, auth, cfg, status, realtime, echo));
        sup.set_owner(Some("u1".to_string()));
        sup
    }

    #[tokio::test]
    async fn concurrent_trigger_is_dropped_not_queued() {
        let sup = new_supervisor(config());

        // Hold the lock open manually the way `run_full_sync_inner` would
        // mid-cycle, then fire a second trigger concurrently and confirm it
        // returns immediately with an empty report instead of blocking
        // until the first one "finishes".
        sup.locked.store(true, Ordering::SeqCst);
        *sup.lock_acquired_at.lock().unwrap() = Some(Instant::now());

        let report = tokio::time::timeout(StdDuration::from_millis(200), sup.run_full_sync(true, false))
            .await
            .expect("dropped trigger must return immediately, not queue")
            .unwrap();
        assert_eq!(report.pull_accepted, 0);
        assert_eq!(report.pull_skipped, 0);
        assert!(report.push.is_none());

        sup.locked.store(false, Ordering::SeqCst);
        *sup.lock_acquired_at.lock().unwrap() = None;
    }

    #[tokio::test]
    async fn sequential_cycles_each_acquire_and_release_the_lock() {
        let sup = new_supervisor(config());
        sup.run_full_sync(true, false).await.unwrap();
        assert!(!sup.locked.load(Ordering::SeqCst));
        sup.run_full_sync(true, false).await.unwrap();
        assert!(!sup.locked.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_force_releases_a_stale_lock() {
        let sup = new_supervisor(config());
        sup.locked.store(true, Ordering::SeqCst);
        *sup.lock_acquired_at.lock().unwrap() =
            Some(Instant::now() - (WATCHDOG_STALE_AFTER + StdDuration::from_secs(1)));

        let watchdog_sup = Arc::clone(&sup);
        let handle = tokio::spawn(watchdog_sup.run_watchdog());

        tokio::time::advance(WATCHDOG_INTERVAL + StdDuration::from_millis(1)).await;
        tokio::task::yield_now().await;

        // The force-release and its LockStuck notification happen
        // synchronously inside the watchdog tick, before it spawns the
        // re-dispatched cycle -- assert on that rather than racing the
        // re-dispatch's own (timing-dependent) completion.
        assert_eq!(
            sup.status.current().last_error.as_ref().unwrap().detail,
            "sync lock stuck, force-released"
        );

        handle.abort();
    }

    #[tokio::test]
    async fn periodic_tick_is_gated_by_visibility_online_and_realtime_health() {
        let sup = new_supervisor(config());
        sup.set_online(false);
        let report = sup.trigger_periodic_tick().await.unwrap();
        assert!(report.push.is_none(), "offline must gate the periodic tick entirely");
    }
}
