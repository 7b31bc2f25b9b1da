//! Key-value store seam.
//!
//! The production deployment fronts Redis; the core only depends on this
//! trait. [`MemoryKvStore`] is a TTL-aware in-process implementation used by
//! tests and by embedders that do not run a shared store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors from the key-value store.
///
/// Callers in the orchestration path treat every variant as non-fatal: abort
/// flags degrade to "not aborted" and state writes are dropped with a log
/// line.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),
    #[error("key-value operation failed: {0}")]
    Operation(String),
}

/// Minimal async key-value interface with per-key TTL.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Sets `key` to `value`, expiring after `ttl` when one is given.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;
}

/// In-process [`KvStore`] with lazy TTL expiry.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, StoredValue>>,
}

struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, v| v.expires_at.is_none_or(|at| at > now));
        entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(stored) => {
                if stored.expires_at.is_some_and(|at| at <= Instant::now()) {
                    entries.remove(key);
                    Ok(None)
                } else {
                    Ok(Some(stored.value.clone()))
                }
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}
