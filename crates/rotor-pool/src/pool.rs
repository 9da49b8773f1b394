use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tracing::warn;

use crate::store::{Credential, CredentialStore};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No usable snapshot exists and the store could not be reached.
    #[error("credential pool unavailable: {0}")]
    Unavailable(String),
}

/// Why a credential is being removed from rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    /// The upstream rejected the key itself (malformed, revoked, expired).
    InvalidApiKey,
    /// The upstream denied the key access with a key-related hint.
    PermissionDenied,
}

impl InvalidReason {
    fn as_str(self) -> &'static str {
        match self {
            InvalidReason::InvalidApiKey => "invalid_api_key",
            InvalidReason::PermissionDenied => "permission_denied",
        }
    }
}

struct PoolSnapshot {
    credentials: Vec<Credential>,
    loaded_at: Instant,
}

/// TTL-cached view over the eligible credentials.
///
/// Readers take a lock-free snapshot; a reload hits the store only when the
/// snapshot is older than the TTL. When a reload fails but a stale snapshot
/// exists, the stale set is served and a warning is emitted, so a store
/// outage degrades freshness rather than availability.
pub struct CredentialPool {
    store: Arc<dyn CredentialStore>,
    ttl: Duration,
    snapshot: Arc<ArcSwapOption<PoolSnapshot>>,
}

impl CredentialPool {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self::with_ttl(store, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(store: Arc<dyn CredentialStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            snapshot: Arc::new(ArcSwapOption::const_empty()),
        }
    }

    /// Current set of eligible credentials, refreshed from the store when
    /// the cached snapshot has expired.
    pub async fn candidates(&self) -> Result<Vec<Credential>, PoolError> {
        if let Some(snapshot) = self.snapshot.load_full() {
            if snapshot.loaded_at.elapsed() < self.ttl {
                return Ok(snapshot.credentials.clone());
            }
        }
        match self.store.list_eligible().await {
            Ok(credentials) => {
                self.snapshot.store(Some(Arc::new(PoolSnapshot {
                    credentials: credentials.clone(),
                    loaded_at: Instant::now(),
                })));
                Ok(credentials)
            }
            Err(err) => match self.snapshot.load_full() {
                Some(stale) => {
                    warn!(
                        event = "pool.reload_failed",
                        error = %err,
                        stale_age_secs = stale.loaded_at.elapsed().as_secs(),
                        "serving stale credential snapshot"
                    );
                    Ok(stale.credentials.clone())
                }
                None => Err(PoolError::Unavailable(err.to_string())),
            },
        }
    }

    /// Drop a credential from rotation immediately and persist the
    /// invalidation off the request path. The snapshot is filtered right
    /// away so the key cannot be handed out again, then evicted once the
    /// durable write lands so the next read reloads from the store.
    pub fn invalidate(&self, credential_id: i64, reason: InvalidReason) {
        warn!(
            event = "pool.invalidate",
            credential_id,
            reason = reason.as_str(),
            "removing credential from rotation"
        );
        if let Some(snapshot) = self.snapshot.load_full() {
            let credentials: Vec<Credential> = snapshot
                .credentials
                .iter()
                .filter(|credential| credential.id != credential_id)
                .cloned()
                .collect();
            self.snapshot.store(Some(Arc::new(PoolSnapshot {
                credentials,
                loaded_at: snapshot.loaded_at,
            })));
        }
        let store = Arc::clone(&self.store);
        let snapshot = Arc::clone(&self.snapshot);
        tokio::spawn(async move {
            match store.set_invalid(credential_id).await {
                Ok(()) => snapshot.store(None),
                Err(err) => {
                    warn!(
                        event = "pool.invalidate_write_failed",
                        credential_id,
                        error = %err,
                    );
                }
            }
        });
    }

    /// Bump the usage counter for a credential without blocking the caller.
    pub fn record_usage(&self, credential_id: i64) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(err) = store.increment_usage(credential_id).await {
                warn!(
                    event = "pool.usage_write_failed",
                    credential_id,
                    error = %err,
                );
            }
        });
    }
}
