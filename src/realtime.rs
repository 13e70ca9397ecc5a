use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, instrument, warn};

use crate::error::{EngineError, Result};

/// Connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// One inbound change event delivered over the realtime feed.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub entity_id: String,
    pub updated_at_ms: i64,
    pub deleted: bool,
    pub data: serde_json::Value,
}

/// The transport seam the subscriber drives: a stream of [`ChangeEvent`]s
/// for one owner. The shipped adapter speaks to a PostgREST-style realtime
/// channel over `tokio-tungstenite`; tests substitute an in-memory fake.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self, owner_id: &str) -> Result<BoxStream<'static, Result<ChangeEvent>>>;
}

/// Concrete WebSocket adapter.
pub struct WebSocketRealtimeTransport {
    url: String,
    api_key: String,
}

impl WebSocketRealtimeTransport {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self { url: url.into(), api_key: api_key.into() }
    }
}

#[async_trait]
impl RealtimeTransport for WebSocketRealtimeTransport {
    async fn connect(&self, owner_id: &str) -> Result<BoxStream<'static, Result<ChangeEvent>>> {
        let url = format!("{}?apikey={}&owner_id={}", self.url, self.api_key, owner_id);
        let (ws, _resp) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| EngineError::Transient(format!("realtime connect: {e}")))?;
        let (_write, read) = ws.split();
        let stream = read.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<ChangeEvent>(&text) {
                    Ok(ev) => Some(Ok(ev)),
                    Err(e) => Some(Err(EngineError::Serde(e))),
                },
                Ok(Message::Close(_)) => None,
                Ok(_) => None,
                Err(e) => Some(Err(EngineError::Transient(format!("realtime read: {e}")))),
            }
        });
        Ok(stream.boxed())
    }
}

/// TTL-bounded "have we just seen this row" cache, shared between the
/// realtime path (marks rows it applies) and the pull pipeline (skips
/// rows the realtime path already delivered) -- echo suppression.
pub struct EchoCache {
    ttl: chrono::Duration,
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl EchoCache {
    pub fn new(ttl: chrono::Duration) -> Self {
        Self { ttl, seen: Mutex::new(HashMap::new()) }
    }

    fn key(table: &str, entity_id: &str) -> String {
        format!("{table}:{entity_id}")
    }

    pub fn record(&self, table: &str, entity_id: &str) {
        self.seen.lock().unwrap().insert(Self::key(table, entity_id), Utc::now());
    }

    pub fn recently_seen(&self, table: &str, entity_id: &str) -> bool {
        match self.seen.lock().unwrap().get(&Self::key(table, entity_id)) {
            Some(t) => Utc::now() - *t < self.ttl,
            None => false,
        }
    }
}

impl Default for EchoCache {
    fn default() -> Self {
        // A few seconds comfortably covers the gap between a realtime
        // delivery and the next pull cycle observing the same row.
        Self::new(chrono::Duration::seconds(10))
    }
}

/// Bounded reconnect backoff budget before the subscriber gives up and
/// falls back to the polling path.
const RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_BASE_MS: u64 = 500;
const RECONNECT_MAX_MS: u64 = 30_000;

/// Drives one subscription per owner, reconnecting with bounded backoff
/// and republishing every delivered [`ChangeEvent`] on a broadcast
/// channel for downstream consumers (the pull/merge path) to apply.
pub struct RealtimeSubscriber {
    transport: std::sync::Arc<dyn RealtimeTransport>,
    state_tx: watch::Sender<RealtimeState>,
    events_tx: broadcast::Sender<ChangeEvent>,
    echo: std::sync::Arc<EchoCache>,
    paused: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl RealtimeSubscriber {
    pub fn new(transport: std::sync::Arc<dyn RealtimeTransport>, echo: std::sync::Arc<EchoCache>) -> Self {
        let (state_tx, _) = watch::channel(RealtimeState::Disconnected);
        let (events_tx, _) = broadcast::channel(256);
        Self {
            transport,
            state_tx,
            events_tx,
            echo,
            paused: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> watch::Receiver<RealtimeState> {
        self.state_tx.subscribe()
    }

    pub fn is_healthy(&self) -> bool {
        *self.state_tx.borrow() == RealtimeState::Connected
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events_tx.subscribe()
    }

    /// `pauseRealtime()`, called when the engine goes offline.
    pub fn pause(&self) {
        self.paused.store(true, std::sync::atomic::Ordering::SeqCst);
        let _ = self.state_tx.send(RealtimeState::Disconnected);
    }

    /// `resume()`, called on reconnect; the caller is expected to spawn
    /// [`Self::run`] again after calling this.
    pub fn resume(&self) {
        self.paused.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Connect-and-read loop with bounded exponential backoff. Intended to
    /// be spawned as a background task by the supervisor; returns once the
    /// reconnect budget is exhausted (state left at `Error`) or the
    /// subscriber is paused.
    #[instrument(skip(self))]
    pub async fn run(&self, owner_id: &str) {
        let mut attempt = 0u32;
        loop {
            if self.paused.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }
            let _ = self.state_tx.send(RealtimeState::Connecting);
            match self.transport.connect(owner_id).await {
                Ok(mut stream) => {
                    let _ = self.state_tx.send(RealtimeState::Connected);
                    attempt = 0;
                    while let Some(item) = stream.next().await {
                        if self.paused.load(std::sync::atomic::Ordering::SeqCst) {
                            return;
                        }
                        match item {
                            Ok(ev) => {
                                self.echo.record(&ev.table, &ev.entity_id);
                                let _ = self.events_tx.send(ev);
                            }
                            Err(e) => {
                                warn!(error = %e, "realtime stream error");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "realtime connect failed");
                }
            }

            attempt += 1;
            if attempt > RECONNECT_ATTEMPTS {
                let _ = self.state_tx.send(RealtimeState::Error);
                return;
            }
            let backoff = (RECONNECT_BASE_MS * 2u64.pow(attempt.min(8))).min(RECONNECT_MAX_MS);
            tokio::time::sleep(StdDuration::from_millis(backoff)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_cache_expires() {
        let cache = EchoCache::new(chrono::Duration::milliseconds(0));
        cache.record("widgets", "w1");
        // zero TTL: immediately stale (strictly less-than comparison means
        // any elapsed time, even sub-millisecond, already exceeds it in practice)
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(!cache.recently_seen("widgets", "w1"));
    }

    #[test]
    fn echo_cache_hits_within_ttl() {
        let cache = EchoCache::new(chrono::Duration::seconds(10));
        cache.record("widgets", "w1");
        assert!(cache.recently_seen("widgets", "w1"));
        assert!(!cache.recently_seen("widgets", "w2"));
    }
}
