use tokio::sync::watch;
use tokio::time::{Duration, Instant};

use crate::realtime::RealtimeState;

/// Sync lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Syncing,
    Error,
    Offline,
}

#[derive(Debug, Clone)]
pub struct LastError {
    pub friendly: String,
    pub detail: String,
}

/// The full reactive status snapshot.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub phase: Phase,
    pub pending_count: i64,
    pub last_error: Option<LastError>,
    pub sync_errors: Vec<String>,
    pub last_sync_time: Option<chrono::DateTime<chrono::Utc>>,
    pub sync_message: Option<String>,
    pub realtime_state: RealtimeState,
    pub tab_visible: bool,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            pending_count: 0,
            last_error: None,
            sync_errors: Vec::new(),
            last_sync_time: None,
            sync_message: None,
            realtime_state: RealtimeState::Disconnected,
            tab_visible: true,
        }
    }
}

impl PartialEq for SyncStatus {
    fn eq(&self, other: &Self) -> bool {
        self.phase == other.phase
            && self.pending_count == other.pending_count
            && self.last_sync_time == other.last_sync_time
            && self.sync_message == other.sync_message
            && self.realtime_state == other.realtime_state
            && self.tab_visible == other.tab_visible
            && self.last_error.as_ref().map(|e| &e.detail) == other.last_error.as_ref().map(|e| &e.detail)
            && self.sync_errors == other.sync_errors
    }
}

const MAX_SYNC_ERRORS: usize = 10;
const MIN_SYNCING_DWELL: Duration = Duration::from_millis(500);

/// Push-based last-value broadcaster with a minimum `syncing` dwell and
/// idempotent (redundant-transition-suppressing) emissions.
pub struct StatusObservable {
    tx: watch::Sender<SyncStatus>,
    entered_syncing_at: std::sync::Mutex<Option<Instant>>,
}

impl StatusObservable {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SyncStatus::default());
        Self { tx, entered_syncing_at: std::sync::Mutex::new(None) }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    fn emit(&self, next: SyncStatus) {
        self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    pub fn set_offline(&self, offline: bool) {
        let mut next = self.current();
        next.phase = if offline { Phase::Offline } else { Phase::Idle };
        self.emit(next);
    }

    pub fn set_tab_visible(&self, visible: bool) {
        let mut next = self.current();
        next.tab_visible = visible;
        self.emit(next);
    }

    pub fn set_realtime_state(&self, state: RealtimeState) {
        let mut next = self.current();
        next.realtime_state = state;
        self.emit(next);
    }

    pub fn set_pending_count(&self, count: i64) {
        let mut next = self.current();
        next.pending_count = count;
        self.emit(next);
    }

    /// Enter `syncing`, recording the entry time so [`Self::finish_cycle`]
    /// can enforce the 500ms minimum dwell.
    pub fn begin_cycle(&self, message: Option<String>) {
        *self.entered_syncing_at.lock().unwrap() = Some(Instant::now());
        let mut next = self.current();
        next.phase = Phase::Syncing;
        next.sync_message = message;
        self.emit(next);
    }

    /// Wait out any remaining minimum dwell, then transition to `idle` or
    /// `error` and update the derived fields.
    pub async fn finish_cycle(&self, error: Option<LastError>, last_sync_time: Option<chrono::DateTime<chrono::Utc>>) {
        if let Some(entered) = *self.entered_syncing_at.lock().unwrap() {
            let elapsed = entered.elapsed();
            if elapsed < MIN_SYNCING_DWELL {
                tokio::time::sleep(MIN_SYNCING_DWELL - elapsed).await;
            }
        }
        *self.entered_syncing_at.lock().unwrap() = None;

        let mut next = self.current();
        next.sync_message = None;
        match error {
            Some(e) => {
                next.phase = Phase::Error;
                next.sync_errors.push(e.detail.clone());
                if next.sync_errors.len() > MAX_SYNC_ERRORS {
                    let excess = next.sync_errors.len() - MAX_SYNC_ERRORS;
                    next.sync_errors.drain(0..excess);
                }
                next.last_error = Some(e);
            }
            None => {
                next.phase = Phase::Idle;
                next.last_error = None;
                if let Some(t) = last_sync_time {
                    next.last_sync_time = Some(t);
                }
            }
        }
        self.emit(next);
    }
}

impl Default for StatusObservable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn redundant_emissions_are_suppressed() {
        let status = StatusObservable::new();
        let mut rx = status.subscribe();
        rx.mark_changed();
        assert!(!rx.has_changed().unwrap());

        status.set_tab_visible(true); // already true by default, no-op
        assert!(!rx.has_changed().unwrap());

        status.set_tab_visible(false);
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn finish_cycle_enforces_minimum_dwell() {
        let status = StatusObservable::new();
        status.begin_cycle(None);
        let started = Instant::now();
        status.finish_cycle(None, None).await;
        assert!(started.elapsed() >= MIN_SYNCING_DWELL);
        assert_eq!(status.current().phase, Phase::Idle);
    }

    #[tokio::test]
    async fn error_caps_sync_errors_at_ten() {
        let status = StatusObservable::new();
        for i in 0..15 {
            status.begin_cycle(None);
            status
                .finish_cycle(
                    Some(LastError { friendly: "oops".into(), detail: format!("e{i}") }),
                    None,
                )
                .await;
        }
        assert_eq!(status.current().sync_errors.len(), 10);
        assert_eq!(status.current().sync_errors.last().unwrap(), "e14");
    }
}
