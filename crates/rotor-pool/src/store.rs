use std::sync::Arc;

use async_trait::async_trait;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The eligible projection of one upstream API key, as handed to the
/// dispatch path. The authoritative record (active/valid flags, usage
/// counter, last-used stamp) stays behind the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub id: i64,
    pub secret: Arc<str>,
}

impl Credential {
    pub fn new(id: i64, secret: impl Into<Arc<str>>) -> Self {
        Self {
            id,
            secret: secret.into(),
        }
    }
}

/// A caller-facing access key resolved during authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKey {
    pub id: i64,
}

/// Process-wide streaming toggles, read fresh at the start of each request.
/// Documented as mutually exclusive, but all four combinations are
/// tolerated downstream (both off degrades to buffered, both on prefers
/// real streaming).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSettings {
    pub real_stream: bool,
    pub fake_stream: bool,
}

/// Durable credential records. Runtime lookups go through the pool's
/// snapshot; only reloads, health writes, and usage counters reach here.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Credentials with `active && valid`, in no particular order.
    async fn list_eligible(&self) -> StoreResult<Vec<Credential>>;

    /// Clear the valid flag. The record is kept; deletion is an
    /// administrative action that never happens on the dispatch path.
    async fn set_invalid(&self, credential_id: i64) -> StoreResult<()>;

    /// Atomic usage-counter increment plus last-used stamp. Called
    /// concurrently from simultaneous requests.
    async fn increment_usage(&self, credential_id: i64) -> StoreResult<()>;
}

#[async_trait]
pub trait AccessKeyStore: Send + Sync {
    async fn lookup(&self, secret: &str) -> StoreResult<Option<AccessKey>>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn stream_settings(&self) -> StoreResult<StreamSettings>;
}
