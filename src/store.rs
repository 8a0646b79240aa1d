//! Durable state: watermarks, cooldowns, attempt locks and retry counters.
//!
//! The core only needs a small key-value contract ([`StateStore`]); every
//! backend must make [`try_acquire_lock`](StateStore::try_acquire_lock),
//! [`release`](StateStore::release), [`increment`](StateStore::increment) and
//! [`advance`](StateStore::advance) atomic. [`AccountState`] layers the
//! per-account key scheme on top.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Key-value operations the core depends on.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reads a live (non-expired) value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Writes a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Atomically adds one to an integer value (missing counts as 0) and returns
    /// the new value. `ttl`, when given, is refreshed on every call.
    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64>;

    /// Atomically stores `max(current, value)` and returns the stored value.
    async fn advance(&self, key: &str, value: u64) -> Result<u64>;

    /// Removes a key.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Takes the lock `key` for `owner` unless a live lock exists.
    async fn try_acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Releases the lock if `owner` still holds it.
    async fn release(&self, key: &str, owner: &str) -> Result<()>;
}

#[async_trait]
impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        (**self).set(key, value, ttl).await
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64> {
        (**self).increment(key, ttl).await
    }

    async fn advance(&self, key: &str, value: u64) -> Result<u64> {
        (**self).advance(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    async fn try_acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        (**self).try_acquire_lock(key, owner, ttl).await
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        (**self).release(key, owner).await
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process store.
///
/// Expiry follows tokio's clock, so paused-time tests can fast-forward TTLs.
/// State does not survive a restart; use [`SqliteStore`](crate::SqliteStore) for that.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(
        &self,
        operation: &str,
        f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> T,
    ) -> Result<T> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::state(operation, "memory store mutex poisoned"))?;
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(f(&mut entries, now))
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_entries("get", |entries, _| {
            entries.get(key).map(|entry| entry.value.clone())
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.with_entries("set", |entries, now| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: ttl.map(|ttl| now + ttl),
                },
            );
        })
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64> {
        let outcome = self.with_entries("increment", |entries, now| {
            let current = match entries.get(key) {
                Some(entry) => entry.value.parse::<i64>().map_err(|_| entry.value.clone())?,
                None => 0,
            };
            let next = current + 1;
            let expires_at = match ttl {
                Some(ttl) => Some(now + ttl),
                None => entries.get(key).and_then(|entry| entry.expires_at),
            };
            entries.insert(
                key.to_string(),
                Entry {
                    value: next.to_string(),
                    expires_at,
                },
            );
            Ok(next)
        })?;
        outcome.map_err(|value| Error::CorruptState {
            key: key.to_string(),
            value,
        })
    }

    async fn advance(&self, key: &str, value: u64) -> Result<u64> {
        let outcome = self.with_entries("advance", |entries, _| {
            let current = match entries.get(key) {
                Some(entry) => entry.value.parse::<u64>().map_err(|_| entry.value.clone())?,
                None => 0,
            };
            let stored = current.max(value);
            entries.insert(
                key.to_string(),
                Entry {
                    value: stored.to_string(),
                    expires_at: None,
                },
            );
            Ok(stored)
        })?;
        outcome.map_err(|value| Error::CorruptState {
            key: key.to_string(),
            value,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.with_entries("delete", |entries, _| {
            entries.remove(key);
        })
    }

    async fn try_acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        self.with_entries("try_acquire_lock", |entries, now| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: owner.to_string(),
                    expires_at: Some(now + ttl),
                },
            );
            true
        })
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        self.with_entries("release", |entries, _| {
            if entries.get(key).is_some_and(|entry| entry.value == owner) {
                entries.remove(key);
            }
        })
    }
}

/// Per-account view over a [`StateStore`].
///
/// Keys are `{account}.watermark`, `{account}.cooldown_until`, `{account}.lock`,
/// `{account}.retries` and `{account}.receipt_after`.
pub struct AccountState<'a> {
    store: &'a dyn StateStore,
    account: &'a str,
}

impl<'a> AccountState<'a> {
    /// Binds the key scheme to one account.
    #[must_use]
    pub fn new(store: &'a dyn StateStore, account: &'a str) -> Self {
        Self { store, account }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}.{suffix}", self.account)
    }

    /// Last fully handled message UID, `None` before the first cycle.
    ///
    /// # Errors
    ///
    /// Propagates store failures; an unparsable value is [`Error::CorruptState`].
    pub async fn watermark(&self) -> Result<Option<u32>> {
        let key = self.key("watermark");
        self.store
            .get(&key)
            .await?
            .map(|raw| raw.parse::<u32>().map_err(|_| corrupt(&key, raw)))
            .transpose()
    }

    /// Moves the watermark forward to `uid`; never moves it back.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn advance_watermark(&self, uid: u32) -> Result<u32> {
        let key = self.key("watermark");
        let stored = self.store.advance(&key, u64::from(uid)).await?;
        u32::try_from(stored).map_err(|_| corrupt(&key, stored.to_string()))
    }

    /// Instant before which no new reset may start.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn cooldown_until(&self) -> Result<Option<DateTime<Utc>>> {
        self.timestamp("cooldown_until").await
    }

    /// Records the cooldown deadline.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn set_cooldown_until(&self, until: DateTime<Utc>) -> Result<()> {
        self.store
            .set(&self.key("cooldown_until"), &until.to_rfc3339(), None)
            .await
    }

    /// Takes the attempt lock.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn try_lock(&self, owner: &str, ttl: Duration) -> Result<bool> {
        self.store.try_acquire_lock(&self.key("lock"), owner, ttl).await
    }

    /// Releases the attempt lock held by `owner`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn unlock(&self, owner: &str) -> Result<()> {
        self.store.release(&self.key("lock"), owner).await
    }

    /// Transient failures spent by the current reset (survives restarts).
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn retries(&self) -> Result<u32> {
        let key = self.key("retries");
        match self.store.get(&key).await? {
            Some(raw) => raw.parse::<u32>().map_err(|_| corrupt(&key, raw)),
            None => Ok(0),
        }
    }

    /// Counts one more transient failure; the counter expires after `ttl`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn record_retry(&self, ttl: Duration) -> Result<u32> {
        let value = self.store.increment(&self.key("retries"), Some(ttl)).await?;
        Ok(u32::try_from(value).unwrap_or(u32::MAX))
    }

    /// Resets the failure counter.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn clear_retries(&self) -> Result<()> {
        self.store.delete(&self.key("retries")).await
    }

    /// Instant after which our own "password changed" receipt is expected.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn receipt_after(&self) -> Result<Option<DateTime<Utc>>> {
        self.timestamp("receipt_after").await
    }

    /// Expects a receipt notice for a change made at `at`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn expect_receipt(&self, at: DateTime<Utc>) -> Result<()> {
        self.store
            .set(&self.key("receipt_after"), &at.to_rfc3339(), None)
            .await
    }

    /// Forgets the expected receipt.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn clear_receipt(&self) -> Result<()> {
        self.store.delete(&self.key("receipt_after")).await
    }

    async fn timestamp(&self, suffix: &str) -> Result<Option<DateTime<Utc>>> {
        let key = self.key(suffix);
        self.store
            .get(&key)
            .await?
            .map(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .map(|at| at.with_timezone(&Utc))
                    .map_err(|_| corrupt(&key, raw))
            })
            .transpose()
    }
}

fn corrupt(key: &str, value: String) -> Error {
    Error::CorruptState {
        key: key.to_string(),
        value,
    }
}
