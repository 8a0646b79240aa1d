//! SQLite-backed [`StateStore`].
//!
//! One table, `sentinel_state(key, value, expires_at)`, with expiry in unix
//! milliseconds taken from the configured [`Clock`]. Expired rows are purged at
//! the start of every operation. All statements run on the blocking pool
//! behind a single connection mutex, so the compound operations are atomic
//! within the process; locks use a single `INSERT .. ON CONFLICT DO NOTHING`,
//! which also keeps them exclusive across processes sharing the file.

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::store::StateStore;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sentinel_state (
    key        TEXT PRIMARY KEY NOT NULL,
    value      TEXT NOT NULL,
    expires_at INTEGER
);
";

const UPSERT: &str = "
INSERT INTO sentinel_state (key, value, expires_at) VALUES (?1, ?2, ?3)
ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
";

/// Durable store in a SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateStore`] if the file cannot be opened or initialized.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!(path = %path.display(), "Opening state database");

        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let conn = Connection::open(&path)?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| Error::state("open", e.to_string()))?
        .map_err(|e| Error::state("open", e))?;

        Ok(Self::from_connection(conn))
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateStore`] if SQLite fails to initialize.
    pub async fn in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(|| -> rusqlite::Result<Connection> {
            let conn = Connection::open_in_memory()?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| Error::state("open", e.to_string()))?
        .map_err(|e| Error::state("open", e))?;

        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
        }
    }

    /// Uses `clock` to stamp and check expiry.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs `f` on the blocking pool after purging expired rows.
    ///
    /// `f` receives the current time in unix milliseconds.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection, i64) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let now = self.clock.now().timestamp_millis();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            conn.execute(
                "DELETE FROM sentinel_state WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )?;
            f(&mut conn, now)
        })
        .await
        .map_err(|e| Error::state(operation, e.to_string()))?
        .map_err(|e| Error::state(operation, e))
    }
}

fn expiry(now: i64, ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)))
}

fn read_row(conn: &Connection, key: &str) -> rusqlite::Result<Option<(String, Option<i64>)>> {
    conn.query_row(
        "SELECT value, expires_at FROM sentinel_state WHERE key = ?1",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_conn("get", move |conn, _| {
            Ok(read_row(conn, &key)?.map(|(value, _)| value))
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn("set", move |conn, now| {
            conn.execute(UPSERT, params![key, value, expiry(now, ttl)])?;
            Ok(())
        })
        .await
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64> {
        let owned = key.to_string();
        let outcome = self
            .with_conn("increment", move |conn, now| {
                let tx = conn.transaction()?;
                let (current, kept) = match read_row(&tx, &owned)? {
                    Some((value, expires_at)) => match value.parse::<i64>() {
                        Ok(current) => (current, expires_at),
                        Err(_) => return Ok(Err(value)),
                    },
                    None => (0, None),
                };
                let next = current + 1;
                let expires_at = expiry(now, ttl).or(kept);
                tx.execute(UPSERT, params![owned, next.to_string(), expires_at])?;
                tx.commit()?;
                Ok(Ok(next))
            })
            .await?;

        outcome.map_err(|value| Error::CorruptState {
            key: key.to_string(),
            value,
        })
    }

    async fn advance(&self, key: &str, value: u64) -> Result<u64> {
        let owned = key.to_string();
        let outcome = self
            .with_conn("advance", move |conn, _| {
                let tx = conn.transaction()?;
                let current = match read_row(&tx, &owned)? {
                    Some((raw, _)) => match raw.parse::<u64>() {
                        Ok(current) => current,
                        Err(_) => return Ok(Err(raw)),
                    },
                    None => 0,
                };
                let stored = current.max(value);
                if stored != current || current == 0 {
                    tx.execute(UPSERT, params![owned, stored.to_string(), None::<i64>])?;
                }
                tx.commit()?;
                Ok(Ok(stored))
            })
            .await?;

        outcome.map_err(|raw| Error::CorruptState {
            key: key.to_string(),
            value: raw,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn("delete", move |conn, _| {
            conn.execute("DELETE FROM sentinel_state WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn try_acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let (key, owner) = (key.to_string(), owner.to_string());
        self.with_conn("try_acquire_lock", move |conn, now| {
            let inserted = conn.execute(
                "INSERT INTO sentinel_state (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO NOTHING",
                params![key, owner, expiry(now, Some(ttl))],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        let (key, owner) = (key.to_string(), owner.to_string());
        self.with_conn("release", move |conn, _| {
            conn.execute(
                "DELETE FROM sentinel_state WHERE key = ?1 AND value = ?2",
                params![key, owner],
            )?;
            Ok(())
        })
        .await
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::AccountState;
    use chrono::{TimeZone, Utc};

    async fn store() -> (SqliteStore, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let store = SqliteStore::in_memory()
            .await
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        (store, clock)
    }

    #[tokio::test]
    async fn test_set_get_expiry() {
        let (store, clock) = store().await;
        store
            .set("k", "v", Some(Duration::from_secs(30)))
            .await
            .unwrap();
        store.set("forever", "1", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.get("forever").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_lock_owner_and_expiry() {
        let (store, clock) = store().await;
        let ttl = Duration::from_secs(900);

        assert!(store.try_acquire_lock("a.lock", "one", ttl).await.unwrap());
        assert!(!store.try_acquire_lock("a.lock", "two", ttl).await.unwrap());

        store.release("a.lock", "two").await.unwrap();
        assert!(!store.try_acquire_lock("a.lock", "two", ttl).await.unwrap());

        clock.advance(chrono::Duration::seconds(901));
        assert!(store.try_acquire_lock("a.lock", "two", ttl).await.unwrap());
        store.release("a.lock", "two").await.unwrap();
        assert_eq!(store.get("a.lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_increment_keeps_or_refreshes_ttl() {
        let (store, clock) = store().await;
        let ttl = Some(Duration::from_secs(60));

        assert_eq!(store.increment("r", ttl).await.unwrap(), 1);
        clock.advance(chrono::Duration::seconds(40));
        assert_eq!(store.increment("r", ttl).await.unwrap(), 2);
        clock.advance(chrono::Duration::seconds(40));
        assert_eq!(store.get("r").await.unwrap().as_deref(), Some("2"));
        clock.advance(chrono::Duration::seconds(21));
        assert_eq!(store.get("r").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_advance_and_corrupt_values() {
        let (store, _) = store().await;
        assert_eq!(store.advance("w", 10).await.unwrap(), 10);
        assert_eq!(store.advance("w", 7).await.unwrap(), 10);
        assert_eq!(store.advance("w", 11).await.unwrap(), 11);

        store.set("w", "eleven", None).await.unwrap();
        assert!(matches!(
            store.advance("w", 12).await,
            Err(Error::CorruptState { .. })
        ));
        let state = AccountState::new(&store, "x");
        store.set("x.watermark", "-1", None).await.unwrap();
        assert!(state.watermark().await.is_err());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let path = std::env::temp_dir().join(format!(
            "sentinel-{}.db",
            uuid::Uuid::new_v4().simple()
        ));
        {
            let store = SqliteStore::open(&path).await.unwrap();
            AccountState::new(&store, "acct")
                .advance_watermark(42)
                .await
                .unwrap();
        }
        let store = SqliteStore::open(&path).await.unwrap();
        assert_eq!(
            AccountState::new(&store, "acct").watermark().await.unwrap(),
            Some(42)
        );
        drop(store);
        let _ = std::fs::remove_file(&path);
    }
}
