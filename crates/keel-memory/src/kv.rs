use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::time::Instant;
use tracing::debug;

use keel_core::error::{KeelError, Result};
use keel_core::traits::KvStore;

/// Translate a `*` / `?` glob into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| KeelError::Store(format!("Invalid key pattern {}: {}", pattern, e)))
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process key-value store with TTL. Expired keys are dropped lazily.
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries.lock().map_err(|e| KeelError::Store(e.to_string()))
    }

    /// Drop every key. Test harnesses use this to reset shared stores.
    pub fn clear(&self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>>> {
        let key = key.to_string();
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.lock()?;
            match entries.get(&key) {
                Some(e) if e.is_live(now) => Ok(Some(e.value.clone())),
                Some(_) => {
                    entries.remove(&key);
                    Ok(None)
                }
                None => Ok(None),
            }
        })
    }

    fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            let expires_at = ttl.map(|d| Instant::now() + d);
            self.lock()?.insert(key, Entry { value, expires_at });
            Ok(())
        })
    }

    fn del(&self, key: &str) -> BoxFuture<'_, Result<bool>> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.lock()?.remove(&key).is_some()) })
    }

    fn keys(&self, pattern: &str) -> BoxFuture<'_, Result<Vec<String>>> {
        let re = glob_to_regex(pattern);
        Box::pin(async move {
            let re = re?;
            let now = Instant::now();
            let entries = self.lock()?;
            let mut keys: Vec<String> = entries
                .iter()
                .filter(|(k, e)| e.is_live(now) && re.is_match(k))
                .map(|(k, _)| k.clone())
                .collect();
            keys.sort();
            Ok(keys)
        })
    }
}

/// SQLite-backed key-value store. Durable across process restarts.
pub struct SqliteKv {
    conn: Mutex<Connection>,
}

const KV_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        expires_at INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv(expires_at);";

impl SqliteKv {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                KeelError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| KeelError::Database(e.to_string()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| KeelError::Database(e.to_string()))?;
        conn.execute_batch(KV_SCHEMA)
            .map_err(|e| KeelError::Database(e.to_string()))?;

        debug!(path = %path.display(), "SQLite kv store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| KeelError::Database(e.to_string()))?;
        conn.execute_batch(KV_SCHEMA)
            .map_err(|e| KeelError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| KeelError::Database(e.to_string()))
    }

    /// Physically remove expired rows. Returns the number removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![Utc::now().timestamp_millis()],
        )
        .map_err(|e| KeelError::Database(e.to_string()))
    }
}

impl KvStore for SqliteKv {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>>> {
        let key = key.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT value FROM kv
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, Utc::now().timestamp_millis()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|e| KeelError::Database(e.to_string()))
        })
    }

    fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            let expires_at = ttl.map(|d| Utc::now().timestamp_millis() + d.as_millis() as i64);
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, value, expires_at],
            )
            .map_err(|e| KeelError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn del(&self, key: &str) -> BoxFuture<'_, Result<bool>> {
        let key = key.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let n = conn
                .execute("DELETE FROM kv WHERE key = ?1", params![key])
                .map_err(|e| KeelError::Database(e.to_string()))?;
            Ok(n > 0)
        })
    }

    fn keys(&self, pattern: &str) -> BoxFuture<'_, Result<Vec<String>>> {
        let pattern = pattern.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT key FROM kv
                     WHERE key GLOB ?1 AND (expires_at IS NULL OR expires_at > ?2)
                     ORDER BY key",
                )
                .map_err(|e| KeelError::Database(e.to_string()))?;
            let rows = stmt
                .query_map(params![pattern, Utc::now().timestamp_millis()], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(|e| KeelError::Database(e.to_string()))?;

            let mut keys = Vec::new();
            for row in rows {
                keys.push(row.map_err(|e| KeelError::Database(e.to_string()))?);
            }
            Ok(keys)
        })
    }
}
