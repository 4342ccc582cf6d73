//! SQLite-backed disk tier for the cache store
//!
//! Holds only entries whose category policy elects disk persistence, so a
//! restart does not force a cold-cache burst of remote calls. All access is
//! synchronous; the tiered store routes writes through a blocking worker.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::CacheError;

/// Schema version - increment to trigger nuke-and-rebuild
const SCHEMA_VERSION: i32 = 2;

type Result<T> = std::result::Result<T, CacheError>;

/// One row read back from the disk tier at startup
#[derive(Debug, Clone)]
pub struct DiskEntry {
    pub key: String,
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
    pub tags: Vec<String>,
    pub seq: u64,
}

/// SQLite disk tier
pub struct DiskTier {
    conn: Connection,
}

impl DiskTier {
    /// Open or create the disk tier at a specific directory
    pub fn open_at(cache_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(cache_dir)
            .map_err(|e| CacheError::Io(format!("Failed to create cache dir: {}", e)))?;

        let db_path = cache_dir.join("cache.db");
        let conn = Connection::open(&db_path)?;

        // Check schema version - nuke if mismatched
        let version: i32 = conn
            .pragma_query_value(None, "user_version", |r| r.get(0))
            .unwrap_or(0);

        if version != 0 && version != SCHEMA_VERSION {
            log::info!(
                "Cache schema version mismatch ({} != {}), rebuilding",
                version,
                SCHEMA_VERSION
            );
            drop(conn);
            Self::nuke(&db_path)?;
            return Self::open_at(cache_dir);
        }

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                cache_key TEXT PRIMARY KEY NOT NULL,
                data BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                ttl_secs INTEGER NOT NULL,
                seq INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cache_tags (
                cache_key TEXT NOT NULL,
                tag TEXT NOT NULL,
                PRIMARY KEY (cache_key, tag)
            );

            CREATE INDEX IF NOT EXISTS idx_tag ON cache_tags(tag);
            "#,
        )?;

        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

        Ok(Self { conn })
    }

    /// Store or replace an entry, but never clobber a newer write.
    ///
    /// The seq guard mirrors the memory tier: a delayed disk write from an
    /// older logical write must not overwrite a newer entry for the same key.
    pub fn put(
        &self,
        key: &str,
        data: &[u8],
        created_at: DateTime<Utc>,
        ttl: Duration,
        tags: &[String],
        seq: u64,
    ) -> Result<()> {
        let existing_seq: Option<i64> = self
            .conn
            .query_row(
                "SELECT seq FROM cache_entries WHERE cache_key = ?1",
                [key],
                |r| r.get(0),
            )
            .ok();

        if let Some(existing) = existing_seq
            && existing as u64 > seq
        {
            return Ok(());
        }

        self.conn.execute(
            "INSERT OR REPLACE INTO cache_entries (cache_key, data, created_at, ttl_secs, seq)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key,
                data,
                created_at.timestamp(),
                ttl.as_secs() as i64,
                seq as i64
            ],
        )?;

        self.conn
            .execute("DELETE FROM cache_tags WHERE cache_key = ?1", [key])?;
        for tag in tags {
            self.conn.execute(
                "INSERT OR IGNORE INTO cache_tags (cache_key, tag) VALUES (?1, ?2)",
                params![key, tag],
            )?;
        }

        Ok(())
    }

    /// Delete one entry by key
    pub fn delete(&self, key: &str) -> Result<bool> {
        self.conn
            .execute("DELETE FROM cache_tags WHERE cache_key = ?1", [key])?;
        let deleted = self
            .conn
            .execute("DELETE FROM cache_entries WHERE cache_key = ?1", [key])?;
        Ok(deleted > 0)
    }

    /// Delete every entry carrying a tag
    pub fn delete_by_tag(&self, tag: &str) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM cache_entries WHERE cache_key IN
             (SELECT cache_key FROM cache_tags WHERE tag = ?1)",
            [tag],
        )?;
        self.conn.execute(
            "DELETE FROM cache_tags WHERE cache_key NOT IN
             (SELECT cache_key FROM cache_entries)",
            [],
        )?;
        Ok(deleted)
    }

    /// Delete entries whose age exceeds ttl plus the grace window
    pub fn purge_expired(&self, grace: Duration) -> Result<usize> {
        let now = Utc::now().timestamp();
        let deleted = self.conn.execute(
            "DELETE FROM cache_entries
             WHERE created_at + ttl_secs + ?1 < ?2",
            params![grace.as_secs() as i64, now],
        )?;
        self.conn.execute(
            "DELETE FROM cache_tags WHERE cache_key NOT IN
             (SELECT cache_key FROM cache_entries)",
            [],
        )?;
        Ok(deleted)
    }

    /// Scan the tier once at startup: purge entries past their grace window
    /// and return the survivors for promotion into the memory tier.
    pub fn load_surviving(&self, grace: Duration) -> Result<Vec<DiskEntry>> {
        let purged = self.purge_expired(grace)?;
        if purged > 0 {
            log::debug!("Purged {} expired disk cache entries on startup", purged);
        }

        let mut stmt = self.conn.prepare(
            "SELECT cache_key, data, created_at, ttl_secs, seq FROM cache_entries",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, data, created_at, ttl_secs, seq) = row?;
            let created_at = match Utc.timestamp_opt(created_at, 0).single() {
                Some(ts) => ts,
                None => continue,
            };
            let tags = self.tags_for(&key)?;
            entries.push(DiskEntry {
                key,
                data,
                created_at,
                ttl: Duration::from_secs(ttl_secs.max(0) as u64),
                tags,
                seq: seq.max(0) as u64,
            });
        }

        Ok(entries)
    }

    /// Remove every entry
    pub fn clear_all(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |r| r.get(0))?;
        self.conn.execute("DELETE FROM cache_entries", [])?;
        self.conn.execute("DELETE FROM cache_tags", [])?;
        Ok(count as usize)
    }

    fn tags_for(&self, key: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT tag FROM cache_tags WHERE cache_key = ?1")?;
        let tags = stmt
            .query_map([key], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tags)
    }

    fn nuke(db_path: &PathBuf) -> Result<()> {
        if db_path.exists() {
            std::fs::remove_file(db_path)
                .map_err(|e| CacheError::Io(format!("Failed to remove cache DB: {}", e)))?;
        }
        Ok(())
    }
}
