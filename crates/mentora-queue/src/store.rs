use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;

/// Atomic key-value primitives backing the distributed queue: hashes,
/// score-ordered sets, plain sets, and capped lists. Mirrors the
/// substrate keys `task:{id}`, `pending_tasks`, `nodes:{id}`,
/// `active_nodes`, `metrics:{name}`. A Redis-backed implementation
/// would slot behind this same trait.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn hash_put(&self, key: &str, value: &str) -> Result<()>;
    async fn hash_get(&self, key: &str) -> Result<Option<String>>;
    async fn hash_delete(&self, key: &str) -> Result<()>;
    /// All hash keys starting with `prefix`.
    async fn hash_keys(&self, prefix: &str) -> Result<Vec<String>>;

    async fn zadd(&self, set: &str, member: &str, score: i64) -> Result<()>;
    async fn zrem(&self, set: &str, member: &str) -> Result<()>;
    /// Top `n` members, highest score first; ties order by member for
    /// determinism.
    async fn ztop(&self, set: &str, n: usize) -> Result<Vec<(String, i64)>>;

    async fn sadd(&self, set: &str, member: &str) -> Result<()>;
    async fn srem(&self, set: &str, member: &str) -> Result<()>;
    async fn smembers(&self, set: &str) -> Result<Vec<String>>;

    /// Append to a list, trimming the oldest entries past `cap`.
    async fn list_push_capped(&self, key: &str, value: &str, cap: usize) -> Result<()>;
    /// Last `n` entries, newest first.
    async fn list_range(&self, key: &str, n: usize) -> Result<Vec<String>>;
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// SQLite-backed queue substrate.
#[derive(Clone)]
pub struct SqliteQueueStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteQueueStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock queue store connection"))?;
            f(&conn)
        })
        .await?
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS kv_hashes (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS kv_zsets (
            set_name TEXT NOT NULL,
            member TEXT NOT NULL,
            score INTEGER NOT NULL,
            PRIMARY KEY (set_name, member)
        );

        CREATE INDEX IF NOT EXISTS idx_zsets_score ON kv_zsets(set_name, score DESC);

        CREATE TABLE IF NOT EXISTS kv_sets (
            set_name TEXT NOT NULL,
            member TEXT NOT NULL,
            PRIMARY KEY (set_name, member)
        );

        CREATE TABLE IF NOT EXISTS kv_lists (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key TEXT NOT NULL,
            value TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_lists_key ON kv_lists(key, id DESC);
        "#,
    )?;
    Ok(())
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn hash_put(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_owned();
        let value = value.to_owned();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO kv_hashes(key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn hash_get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_owned();
        self.call(move |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM kv_hashes WHERE key = ?1",
                    params![key],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn hash_delete(&self, key: &str) -> Result<()> {
        let key = key.to_owned();
        self.call(move |conn| {
            conn.execute("DELETE FROM kv_hashes WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn hash_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}%", prefix.replace('%', "\\%"));
        self.call(move |conn| {
            let mut stmt =
                conn.prepare("SELECT key FROM kv_hashes WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key")?;
            let rows = stmt.query_map(params![pattern], |r| r.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn zadd(&self, set: &str, member: &str, score: i64) -> Result<()> {
        let set = set.to_owned();
        let member = member.to_owned();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO kv_zsets(set_name, member, score) VALUES (?1, ?2, ?3)
                 ON CONFLICT(set_name, member) DO UPDATE SET score = excluded.score",
                params![set, member, score],
            )?;
            Ok(())
        })
        .await
    }

    async fn zrem(&self, set: &str, member: &str) -> Result<()> {
        let set = set.to_owned();
        let member = member.to_owned();
        self.call(move |conn| {
            conn.execute(
                "DELETE FROM kv_zsets WHERE set_name = ?1 AND member = ?2",
                params![set, member],
            )?;
            Ok(())
        })
        .await
    }

    async fn ztop(&self, set: &str, n: usize) -> Result<Vec<(String, i64)>> {
        let set = set.to_owned();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT member, score FROM kv_zsets WHERE set_name = ?1
                 ORDER BY score DESC, member ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![set, n as i64], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn sadd(&self, set: &str, member: &str) -> Result<()> {
        let set = set.to_owned();
        let member = member.to_owned();
        self.call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO kv_sets(set_name, member) VALUES (?1, ?2)",
                params![set, member],
            )?;
            Ok(())
        })
        .await
    }

    async fn srem(&self, set: &str, member: &str) -> Result<()> {
        let set = set.to_owned();
        let member = member.to_owned();
        self.call(move |conn| {
            conn.execute(
                "DELETE FROM kv_sets WHERE set_name = ?1 AND member = ?2",
                params![set, member],
            )?;
            Ok(())
        })
        .await
    }

    async fn smembers(&self, set: &str) -> Result<Vec<String>> {
        let set = set.to_owned();
        self.call(move |conn| {
            let mut stmt =
                conn.prepare("SELECT member FROM kv_sets WHERE set_name = ?1 ORDER BY member")?;
            let rows = stmt.query_map(params![set], |r| r.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn list_push_capped(&self, key: &str, value: &str, cap: usize) -> Result<()> {
        let key = key.to_owned();
        let value = value.to_owned();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO kv_lists(key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            conn.execute(
                "DELETE FROM kv_lists WHERE key = ?1 AND id NOT IN
                     (SELECT id FROM kv_lists WHERE key = ?1 ORDER BY id DESC LIMIT ?2)",
                params![key, cap as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_range(&self, key: &str, n: usize) -> Result<Vec<String>> {
        let key = key.to_owned();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT value FROM kv_lists WHERE key = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![key, n as i64], |r| r.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}%", prefix.replace('%', "\\%"));
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT key FROM kv_lists WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key",
            )?;
            let rows = stmt.query_map(params![pattern], |r| r.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }
}
