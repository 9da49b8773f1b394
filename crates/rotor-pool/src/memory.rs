use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::store::{
    AccessKey, AccessKeyStore, Credential, CredentialStore, SettingsStore, StoreError,
    StoreResult, StreamSettings,
};

#[derive(Debug, Clone)]
struct KeyRecord {
    id: i64,
    secret: String,
    active: bool,
    valid: bool,
    usage: u64,
    last_used: Option<OffsetDateTime>,
}

/// In-memory implementation of all three store seams. Backs the binary
/// (keys seeded from the CLI) and the test suites; a durable store slots in
/// behind the same traits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keys: RwLock<Vec<KeyRecord>>,
    access_keys: RwLock<HashMap<String, i64>>,
    real_stream: AtomicBool,
    fake_stream: AtomicBool,
    unreachable: AtomicBool,
    list_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch-insert upstream keys; ids are assigned in insertion order.
    pub fn insert_keys<I, S>(&self, secrets: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut guard = self.keys.write().expect("key store lock poisoned");
        for secret in secrets {
            let id = guard.len() as i64 + 1;
            guard.push(KeyRecord {
                id,
                secret: secret.into(),
                active: true,
                valid: true,
                usage: 0,
                last_used: None,
            });
        }
    }

    pub fn insert_access_keys<I, S>(&self, secrets: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut guard = self
            .access_keys
            .write()
            .expect("access key store lock poisoned");
        for secret in secrets {
            let id = guard.len() as i64 + 1;
            guard.insert(secret.into(), id);
        }
    }

    pub fn set_stream_settings(&self, settings: StreamSettings) {
        self.real_stream.store(settings.real_stream, Ordering::Relaxed);
        self.fake_stream.store(settings.fake_stream, Ordering::Relaxed);
    }

    pub fn set_active(&self, credential_id: i64, active: bool) {
        let mut guard = self.keys.write().expect("key store lock poisoned");
        if let Some(record) = guard.iter_mut().find(|record| record.id == credential_id) {
            record.active = active;
        }
    }

    /// Fault injection for tests: while set, every store call fails.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Relaxed);
    }

    /// Number of `list_eligible` calls that reached the store (as opposed
    /// to being absorbed by the pool cache).
    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::Relaxed)
    }

    pub fn usage(&self, credential_id: i64) -> u64 {
        let guard = self.keys.read().expect("key store lock poisoned");
        guard
            .iter()
            .find(|record| record.id == credential_id)
            .map(|record| record.usage)
            .unwrap_or(0)
    }

    pub fn is_valid(&self, credential_id: i64) -> bool {
        let guard = self.keys.read().expect("key store lock poisoned");
        guard
            .iter()
            .find(|record| record.id == credential_id)
            .map(|record| record.valid)
            .unwrap_or(false)
    }

    fn check_reachable(&self) -> StoreResult<()> {
        if self.unreachable.load(Ordering::Relaxed) {
            Err(StoreError::Unavailable("injected outage".to_string()))
        } else {
            Ok(())
        }
    }
}

fn poisoned(_: impl std::fmt::Debug) -> StoreError {
    StoreError::Unavailable("store lock poisoned".to_string())
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn list_eligible(&self) -> StoreResult<Vec<Credential>> {
        self.check_reachable()?;
        self.list_calls.fetch_add(1, Ordering::Relaxed);
        let guard = self.keys.read().map_err(poisoned)?;
        Ok(guard
            .iter()
            .filter(|record| record.active && record.valid)
            .map(|record| Credential::new(record.id, record.secret.as_str()))
            .collect())
    }

    async fn set_invalid(&self, credential_id: i64) -> StoreResult<()> {
        self.check_reachable()?;
        let mut guard = self.keys.write().map_err(poisoned)?;
        if let Some(record) = guard.iter_mut().find(|record| record.id == credential_id) {
            record.valid = false;
        }
        Ok(())
    }

    async fn increment_usage(&self, credential_id: i64) -> StoreResult<()> {
        self.check_reachable()?;
        let mut guard = self.keys.write().map_err(poisoned)?;
        if let Some(record) = guard.iter_mut().find(|record| record.id == credential_id) {
            record.usage += 1;
            record.last_used = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }
}

#[async_trait]
impl AccessKeyStore for MemoryStore {
    async fn lookup(&self, secret: &str) -> StoreResult<Option<AccessKey>> {
        self.check_reachable()?;
        let guard = self.access_keys.read().map_err(poisoned)?;
        Ok(guard.get(secret).map(|id| AccessKey { id: *id }))
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn stream_settings(&self) -> StoreResult<StreamSettings> {
        self.check_reachable()?;
        Ok(StreamSettings {
            real_stream: self.real_stream.load(Ordering::Relaxed),
            fake_stream: self.fake_stream.load(Ordering::Relaxed),
        })
    }
}
