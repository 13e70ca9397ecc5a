use thiserror::Error;

/// Unified error taxonomy for the reconciliation engine. Every public
/// boundary returns `Result<T, EngineError>`. Conversions from the
/// collaborators we talk to (sqlite, serde, http) classify into the right
/// variant at the `From` boundary so callers never have to re-derive "was
/// this transient" from a string.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Network/timeout/5xx/429 — retry with backoff, surface after retries >= 3.
    #[error("transient: {0}")]
    Transient(String),

    /// No valid session, owner mismatch, or a zero-row response where one
    /// was expected (RLS-silent rejection). Sync halts.
    #[error("authorization: {0}")]
    Authorization(String),

    /// Missing remote table or insufficient access, detected at startup
    /// validation.
    #[error("schema: {0}")]
    Schema(String),

    /// Local store open/upgrade failure, or a post-open shape mismatch.
    #[error("local store: {0}")]
    LocalStore(String),

    /// A queue item that failed beyond the retry ceiling.
    #[error("permanent failure on item {seq}: {detail}")]
    Permanent { seq: i64, detail: String },

    /// The sync lock was held past the watchdog floor and was force-released.
    #[error("sync lock stuck, force-released")]
    LockStuck,

    /// A per-cycle-phase operation exceeded its timeout. Treated as transient.
    #[error("operation timed out")]
    Timeout,

    /// The caller was interrupted (e.g. engine shutting down) mid-cycle.
    #[error("interrupted")]
    Interrupted,

    /// A config was rejected at `Engine::open` validation time.
    #[error("invalid config: {0}")]
    Config(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
}

impl EngineError {
    /// True for errors that should be retried with backoff rather than
    /// surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_) | EngineError::Timeout)
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, EngineError::Authorization(_))
    }

    /// The user-friendly half of "a user-friendly message and a raw detail
    /// for diagnostics".
    pub fn user_message(&self) -> &'static str {
        match self {
            EngineError::Transient(_) | EngineError::Timeout => {
                "Sync is having trouble reaching the server. We'll keep retrying."
            }
            EngineError::Authorization(_) => {
                "Your session is no longer valid. Please sign in again."
            }
            EngineError::Schema(_) => "The app's data format is out of date.",
            EngineError::LocalStore(_) => "Local data needed to be reset and will re-download.",
            EngineError::Permanent { .. } => "A change couldn't be saved and was discarded.",
            EngineError::LockStuck => "Sync got stuck and is restarting.",
            EngineError::Interrupted => "Sync was interrupted.",
            EngineError::Config(_) => "The app is misconfigured.",
            EngineError::Sqlite(_) | EngineError::Serde(_) => "An unexpected error occurred.",
        }
    }

    /// The raw diagnostic detail, for logs/telemetry, never shown to the user.
    pub fn detail(&self) -> String {
        self.to_string()
    }
}

/// Classify an HTTP status code the way the push/pull pipelines need to:
/// retryable transport trouble vs an authorization rejection vs "other".
pub fn classify_http_status(status: u16, body_hint: &str) -> EngineError {
    match status {
        401 | 403 => EngineError::Authorization(format!("http {status}: {body_hint}")),
        408 | 429 | 500..=599 => EngineError::Transient(format!("http {status}: {body_hint}")),
        _ => EngineError::Transient(format!("http {status}: {body_hint}")),
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return EngineError::Timeout;
        }
        if let Some(status) = e.status() {
            return classify_http_status(status.as_u16(), &e.to_string());
        }
        EngineError::Transient(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
