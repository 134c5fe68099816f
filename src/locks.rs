//! Per-key async mutual exclusion.
//!
//! Entries are created on first use and kept for the life of the process.
//! Waiters on one key are served in arrival order (tokio's mutex is fair);
//! waiting never blocks tasks working on other keys.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::LockError;

/// Held lock on one document key. Dropping it releases the key, whichever
/// way the critical section exits.
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Default)]
pub struct LockRegistry {
    entries: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Wait until `key` is free and take it.
    pub async fn acquire(&self, key: &str) -> KeyGuard {
        let guard = self.entry(key).lock_owned().await;
        debug!(key, "lock acquired");
        KeyGuard {
            key: key.to_string(),
            _guard: guard,
        }
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`. A timed
    /// out waiter leaves the queue without ever holding the key.
    pub async fn acquire_timeout(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<KeyGuard, LockError> {
        match tokio::time::timeout(timeout, self.acquire(key)).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                warn!(key, ?timeout, "lock wait timed out");
                Err(LockError::Timeout {
                    key: key.to_string(),
                    waited: timeout,
                })
            }
        }
    }

    /// Acquire unless `cancel` fires first.
    pub async fn acquire_cancellable(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<KeyGuard, LockError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LockError::Cancelled(key.to_string())),
            guard = self.acquire(key) => Ok(guard),
        }
    }

    /// Acquire with an optional deadline and optional cancellation.
    pub async fn acquire_with(
        &self,
        key: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<KeyGuard, LockError> {
        match timeout {
            Some(timeout) => {
                let wait = self.acquire_cancellable(key, cancel);
                match tokio::time::timeout(timeout, wait).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(key, ?timeout, "lock wait timed out");
                        Err(LockError::Timeout {
                            key: key.to_string(),
                            waited: timeout,
                        })
                    }
                }
            }
            None => self.acquire_cancellable(key, cancel).await,
        }
    }

    /// Number of keys ever locked.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
