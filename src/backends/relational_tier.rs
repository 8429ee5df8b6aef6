//! Relational Tier - Embedded SQLite Cache
//!
//! The tier of record: every cached value lands here. Entries live in
//! `cache_entries`, their tags in `cache_tags` (cascade-deleted with the
//! entry), which makes tag and glob invalidation single statements.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction, params, params_from_iter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::RelationalTierConfig;
use crate::entry::{CacheEntry, CachePriority, Envelope, TierKind};
use crate::pattern::KeyFilter;
use crate::traits::TierStore;

const CACHE_SCHEMA: &str = r"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed_at INTEGER NOT NULL,
    size_bytes INTEGER NOT NULL,
    priority TEXT NOT NULL DEFAULT 'medium'
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_expires
    ON cache_entries(expires_at);

CREATE INDEX IF NOT EXISTS idx_cache_entries_accessed
    ON cache_entries(last_accessed_at);

CREATE TABLE IF NOT EXISTS cache_tags (
    key TEXT NOT NULL,
    tag TEXT NOT NULL,
    PRIMARY KEY (key, tag),
    FOREIGN KEY (key) REFERENCES cache_entries(key) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_tags_tag ON cache_tags(tag);
";

fn to_sql(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

struct Row {
    payload: String,
    created_at: i64,
    expires_at: i64,
    access_count: i64,
    last_accessed_at: i64,
    size_bytes: i64,
    priority: String,
}

/// SQLite-backed tier
///
/// Providing:
/// - Primary-key lookup with lazy expiry
/// - Range delete for the TTL sweep
/// - Tag-membership and `GLOB` deletes
/// - Aggregate size/count queries
/// - `VACUUM`/`ANALYZE` maintenance
pub struct RelationalTier {
    conn: Mutex<Connection>,
    config: RelationalTierConfig,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl RelationalTier {
    /// Open the database at `config.path`, or an in-memory one when unset.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(config: RelationalTierConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = match &config.path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create cache directory {}", parent.display())
                    })?;
                }
                Connection::open(path).with_context(|| {
                    format!("Failed to open cache database at {}", path.display())
                })?
            }
            None => Connection::open_in_memory().context("Failed to open in-memory cache database")?,
        };

        conn.execute_batch(CACHE_SCHEMA)
            .context("Failed to run cache migrations")?;

        info!(
            path = ?config.path,
            max_entries = config.max_entries,
            max_bytes = config.max_bytes,
            "Relational tier opened"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            config,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    fn read_tags(conn: &Connection, key: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare_cached("SELECT tag FROM cache_tags WHERE key = ?1")?;
        let tags = stmt
            .query_map(params![key], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tags)
    }

    fn aggregates(conn: &Connection) -> Result<(usize, u64)> {
        let (count, bytes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM cache_entries",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((usize::try_from(count).unwrap_or(0), from_sql(bytes)))
    }

    /// Delete least-recently-accessed rows until both bounds hold
    fn evict_within(tx: &Transaction<'_>, max_entries: usize, max_bytes: u64) -> Result<usize> {
        let mut evicted = 0;
        loop {
            let (count, bytes) = Self::aggregates(tx)?;
            if count <= max_entries && bytes <= max_bytes {
                break;
            }
            let oldest: Option<String> = tx
                .query_row(
                    "SELECT key FROM cache_entries ORDER BY last_accessed_at ASC, rowid ASC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(key) = oldest else { break };
            tx.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
            debug!(key = %key, "[Relational] Evicted least-recently-used entry");
            evicted += 1;
        }
        Ok(evicted)
    }

    /// Delete every entry carrying any of `tags`
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub fn delete_by_tags(&self, tags: &[String]) -> Result<usize> {
        if tags.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; tags.len()].join(", ");
        let sql = format!(
            "DELETE FROM cache_entries WHERE key IN \
             (SELECT DISTINCT key FROM cache_tags WHERE tag IN ({placeholders}))"
        );
        let conn = self.conn.lock();
        Ok(conn.execute(&sql, params_from_iter(tags.iter()))?)
    }

    /// Delete every entry whose key matches the glob
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub fn delete_by_pattern(&self, glob: &str) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM cache_entries WHERE key GLOB ?1", params![glob])?)
    }
}

#[async_trait]
impl TierStore for RelationalTier {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let now = self.clock.now_millis();
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                "SELECT payload, created_at, expires_at, access_count, last_accessed_at, \
                 size_bytes, priority FROM cache_entries WHERE key = ?1",
                params![key],
                |row| {
                    Ok(Row {
                        payload: row.get(0)?,
                        created_at: row.get(1)?,
                        expires_at: row.get(2)?,
                        access_count: row.get(3)?,
                        last_accessed_at: row.get(4)?,
                        size_bytes: row.get(5)?,
                        priority: row.get(6)?,
                    })
                },
            )
            .optional()?;

        let Some(row) = row else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        if from_sql(row.expires_at) <= now {
            conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "[Relational] Dropped expired entry on read");
            return Ok(None);
        }

        conn.execute(
            "UPDATE cache_entries SET access_count = access_count + 1, last_accessed_at = ?2 \
             WHERE key = ?1",
            params![key, to_sql(now)],
        )?;

        let envelope: Envelope =
            serde_json::from_str(&row.payload).context("Corrupt payload in relational tier")?;
        let tags = Self::read_tags(&conn, key)?;
        self.hits.fetch_add(1, Ordering::Relaxed);

        Ok(Some(CacheEntry {
            key: key.to_string(),
            envelope,
            created_at: from_sql(row.created_at),
            expires_at: from_sql(row.expires_at),
            access_count: from_sql(row.access_count) + 1,
            last_accessed_at: now.max(from_sql(row.last_accessed_at)),
            size_bytes: from_sql(row.size_bytes),
            tags: tags.into_iter().collect(),
            priority: CachePriority::parse(&row.priority),
        }))
    }

    async fn set(&self, entry: CacheEntry) -> Result<()> {
        if entry.size_bytes > self.config.max_bytes {
            bail!(
                "entry '{}' ({} bytes) exceeds relational tier capacity of {} bytes",
                entry.key,
                entry.size_bytes,
                self.config.max_bytes
            );
        }
        let payload = serde_json::to_string(&entry.envelope)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM cache_tags WHERE key = ?1", params![entry.key])?;
        tx.execute(
            "INSERT INTO cache_entries \
             (key, payload, created_at, expires_at, access_count, last_accessed_at, size_bytes, priority) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, \
             created_at = excluded.created_at, expires_at = excluded.expires_at, \
             access_count = excluded.access_count, last_accessed_at = excluded.last_accessed_at, \
             size_bytes = excluded.size_bytes, priority = excluded.priority",
            params![
                entry.key,
                payload,
                to_sql(entry.created_at),
                to_sql(entry.expires_at),
                to_sql(entry.access_count),
                to_sql(entry.last_accessed_at),
                to_sql(entry.size_bytes),
                entry.priority.as_str(),
            ],
        )?;
        {
            let mut stmt = tx.prepare_cached("INSERT OR IGNORE INTO cache_tags (key, tag) VALUES (?1, ?2)")?;
            for tag in &entry.tags {
                stmt.execute(params![entry.key, tag])?;
            }
        }
        let evicted = Self::evict_within(&tx, self.config.max_entries, self.config.max_bytes)?;
        tx.commit()?;

        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        debug!(key = %entry.key, size_bytes = entry.size_bytes, "[Relational] Stored entry");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch("DELETE FROM cache_tags; DELETE FROM cache_entries;")?;
        Ok(())
    }

    async fn current_size(&self) -> Result<u64> {
        Ok(Self::aggregates(&self.conn.lock())?.1)
    }

    async fn entry_count(&self) -> Result<usize> {
        Ok(Self::aggregates(&self.conn.lock())?.0)
    }

    async fn find_by_tag_or_pattern(&self, filter: &KeyFilter) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let keys = match filter {
            KeyFilter::Tags(tags) if tags.is_empty() => Vec::new(),
            KeyFilter::Tags(tags) => {
                let placeholders = vec!["?"; tags.len()].join(", ");
                let sql = format!("SELECT DISTINCT key FROM cache_tags WHERE tag IN ({placeholders})");
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(params_from_iter(tags.iter()), |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            KeyFilter::Pattern(pattern) => {
                let mut stmt = conn.prepare_cached("SELECT key FROM cache_entries WHERE key GLOB ?1")?;
                stmt.query_map(params![pattern.as_glob()], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(keys)
    }

    async fn delete_matching(&self, filter: &KeyFilter) -> Result<usize> {
        match filter {
            KeyFilter::Tags(tags) => self.delete_by_tags(tags),
            KeyFilter::Pattern(pattern) => self.delete_by_pattern(pattern.as_glob()),
        }
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM cache_entries WHERE expires_at <= ?1", params![to_sql(now)])?;
        if removed > 0 {
            debug!(count = removed, "[Relational] Swept expired entries");
        }
        Ok(removed)
    }

    async fn evict_to(&self, target_bytes: u64) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let evicted = Self::evict_within(&tx, usize::MAX, target_bytes)?;
        tx.commit()?;
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        Ok(evicted)
    }

    async fn maintenance(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch("VACUUM; ANALYZE;")
            .context("Relational tier maintenance failed")?;
        debug!("[Relational] Vacuumed and refreshed statistics");
        Ok(())
    }

    fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    async fn health_check(&self) -> bool {
        self.conn
            .lock()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }

    fn kind(&self) -> TierKind {
        TierKind::Relational
    }

    fn name(&self) -> &'static str {
        "SQLite"
    }
}
