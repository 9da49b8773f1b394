//! Credential pool and the store seams it sits on.
//!
//! The pool owns an in-process snapshot of the eligible upstream
//! credentials, refreshed from a [`CredentialStore`] on a fixed TTL.
//! Runtime reads never hit the store while the snapshot is fresh; health
//! updates evict the snapshot eagerly and write back off the request path.

pub mod memory;
pub mod pool;
pub mod store;

pub use memory::MemoryStore;
pub use pool::{CredentialPool, InvalidReason, PoolError};
pub use store::{
    AccessKey, AccessKeyStore, Credential, CredentialStore, SettingsStore, StoreError,
    StoreResult, StreamSettings,
};
