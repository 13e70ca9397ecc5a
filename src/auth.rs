use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::error::Result;

/// A validated remote session, as handed back by [`AuthProvider`].
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// State-change events an [`AuthProvider`] publishes on its watch
/// channel, consumed by the sync supervisor's "auth state event" trigger.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    SignedIn(Session),
    TokenRefreshed(Session),
    SignedOut,
}

/// The minimal seam the engine depends on for authentication.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Current session, if any, without forcing a network round trip.
    fn current_session(&self) -> Option<Session>;

    /// Force a refresh against the remote identity provider.
    async fn refresh_session(&self) -> Result<Session>;

    async fn sign_out(&self) -> Result<()>;

    /// Subscribe to sign-in / refresh / sign-out events.
    fn subscribe(&self) -> watch::Receiver<Option<AuthEvent>>;
}

/// Caches session validity for up to an hour so the push pipeline's
/// "remote session is valid" precondition doesn't force a network call on
/// every drain.
pub struct SessionCache {
    ttl: chrono::Duration,
    last_validated: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self {
            ttl: chrono::Duration::hours(1),
            last_validated: std::sync::Mutex::new(None),
        }
    }

    pub fn is_fresh(&self) -> bool {
        match *self.last_validated.lock().unwrap() {
            Some(t) => Utc::now() - t < self.ttl,
            None => false,
        }
    }

    pub fn mark_validated(&self) {
        *self.last_validated.lock().unwrap() = Some(Utc::now());
    }

    pub fn invalidate(&self) {
        *self.last_validated.lock().unwrap() = None;
    }

    /// Ensure the session is either known-fresh or freshly re-validated
    /// through `provider`, per the hourly cache policy.
    pub async fn ensure_valid(&self, provider: &dyn AuthProvider) -> Result<Session> {
        if self.is_fresh() {
            if let Some(s) = provider.current_session() {
                return Ok(s);
            }
        }
        let s = provider.refresh_session().await?;
        self.mark_validated();
        Ok(s)
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_cache_starts_invalid() {
        let cache = SessionCache::new();
        assert!(!cache.is_fresh());
        cache.mark_validated();
        assert!(cache.is_fresh());
        cache.invalidate();
        assert!(!cache.is_fresh());
    }
}
