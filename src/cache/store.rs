use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::disk::{classify_tiers, disk_usage};
use super::types::{CacheEntry, CacheSettings, CacheStats, DiskInfo, SizeTier};
use super::CacheError;
use crate::backend::ObjectRef;
use crate::constants::{CACHE_BLOB_DIR, CACHE_INDEX_FILE, PARTIAL_SUFFIX};

type Result<T> = std::result::Result<T, CacheError>;

/// Row fields needed to evict an entry
struct Victim {
    file_id: String,
    local_path: PathBuf,
    size_bytes: u64,
}

/// Disk-backed cache of fully downloaded objects with LRU eviction.
///
/// The SQLite index lives next to the blob directory under `root`. Every
/// public operation holds the connection lock for its whole duration, so a
/// lookup never observes an entry halfway through deletion.
#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    conn: Mutex<Connection>,
    settings: RwLock<CacheSettings>,
}

impl CacheStore {
    /// Open (or create) the cache rooted at `root`
    pub fn open(root: PathBuf, settings: CacheSettings) -> Result<Self> {
        fs::create_dir_all(root.join(CACHE_BLOB_DIR))?;

        let conn = Connection::open(root.join(CACHE_INDEX_FILE))?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                file_id TEXT PRIMARY KEY,
                chat_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                local_path TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                last_access INTEGER NOT NULL,
                download_time INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_last_access
                ON cache_entries(last_access);
            "#,
        )?;

        debug!(root = %root.display(), "cache index opened");

        Ok(Self {
            root,
            conn: Mutex::new(conn),
            settings: RwLock::new(settings),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final location of the blob for `file_id`
    pub fn blob_path(&self, file_id: &str) -> PathBuf {
        let sanitized = file_id.replace(['/', '\\', ':', '.'], "_");
        self.root.join(CACHE_BLOB_DIR).join(sanitized)
    }

    /// Location a download is written to before it is admitted
    pub fn partial_path(&self, file_id: &str) -> PathBuf {
        self.blob_path(file_id).with_extension(PARTIAL_SUFFIX)
    }

    pub fn settings(&self) -> CacheSettings {
        *self.settings.read()
    }

    /// Replace the settings. A larger size limit must fit on disk; shrinking
    /// is always allowed. Runs a cleanup pass when auto cleanup is on.
    pub fn update_settings(&self, settings: CacheSettings) -> Result<u64> {
        if settings.retention_seconds < -1 {
            return Err(CacheError::InvalidSettings(format!(
                "retention must be -1 or a non-negative number of seconds, got {}",
                settings.retention_seconds
            )));
        }

        let current = self.settings();
        if settings.size_limit_bytes > current.size_limit_bytes {
            let available = self.get_disk_info()?.available_for_cache();
            if settings.size_limit_bytes > available {
                return Err(CacheError::InsufficientDiskSpace {
                    requested: settings.size_limit_bytes,
                    available,
                });
            }
        }

        *self.settings.write() = settings;
        info!(
            size_limit = settings.size_limit_bytes,
            retention = settings.retention_seconds,
            auto_cleanup = settings.auto_cleanup_enabled,
            "cache settings updated"
        );

        if settings.auto_cleanup_enabled {
            self.cleanup()
        } else {
            Ok(0)
        }
    }

    /// Path of the cached file for `file_id`, touching its access time.
    /// A row whose file vanished or changed size is removed and reported absent.
    pub fn lookup(&self, file_id: &str) -> Result<Option<PathBuf>> {
        self.lookup_at(file_id, Utc::now())
    }

    pub(crate) fn lookup_at(&self, file_id: &str, now: DateTime<Utc>) -> Result<Option<PathBuf>> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                "SELECT local_path, size_bytes FROM cache_entries WHERE file_id = ?1",
                params![file_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)),
            )
            .optional()?;

        let Some((local_path, size_bytes)) = row else {
            return Ok(None);
        };
        let local_path = PathBuf::from(local_path);

        match fs::metadata(&local_path) {
            Ok(meta) if meta.is_file() && meta.len() == size_bytes => {
                conn.execute(
                    "UPDATE cache_entries SET last_access = ?1 WHERE file_id = ?2",
                    params![now.timestamp_millis(), file_id],
                )?;
                Ok(Some(local_path))
            }
            _ => {
                warn!(file_id, path = %local_path.display(), "cached file missing, dropping stale entry");
                delete_entry(
                    &conn,
                    &Victim {
                        file_id: file_id.to_string(),
                        local_path,
                        size_bytes,
                    },
                )?;
                Ok(None)
            }
        }
    }

    /// Fetch an entry without touching it
    pub fn get(&self, file_id: &str) -> Result<Option<CacheEntry>> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                "SELECT file_id, chat_id, message_id, local_path, size_bytes, last_access, download_time
                 FROM cache_entries WHERE file_id = ?1",
                params![file_id],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// All entries, least recently used first
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT file_id, chat_id, message_id, local_path, size_bytes, last_access, download_time
             FROM cache_entries ORDER BY last_access ASC, download_time ASC, file_id ASC",
        )?;
        let entries = stmt
            .query_map([], row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Insert or replace an entry, then evict if auto cleanup is on.
    /// Returns the bytes freed by that eviction.
    pub fn add(&self, entry: CacheEntry) -> Result<u64> {
        let settings = self.settings();
        let conn = self.conn.lock();

        let previous = conn
            .query_row(
                "SELECT file_id, local_path, size_bytes FROM cache_entries WHERE file_id = ?1",
                params![entry.file_id],
                row_to_victim,
            )
            .optional()?;
        if let Some(previous) = previous.filter(|p| p.local_path != entry.local_path) {
            debug!(file_id = %entry.file_id, old = %previous.local_path.display(), "replacing cached file");
            delete_entry(&conn, &previous)?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO cache_entries
                (file_id, chat_id, message_id, local_path, size_bytes, last_access, download_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.file_id,
                entry.object.chat_id,
                entry.object.message_id,
                entry.local_path.to_string_lossy(),
                entry.size_bytes as i64,
                entry.last_access.timestamp_millis(),
                entry.download_time.timestamp_millis(),
            ],
        )?;
        debug!(file_id = %entry.file_id, size = entry.size_bytes, "cache entry added");

        if settings.auto_cleanup_enabled {
            cleanup_locked(&conn, &settings, Utc::now())
        } else {
            Ok(0)
        }
    }

    /// Remove one entry and its file. Returns the nominal size freed.
    pub fn remove(&self, file_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let victim = conn
            .query_row(
                "SELECT file_id, local_path, size_bytes FROM cache_entries WHERE file_id = ?1",
                params![file_id],
                row_to_victim,
            )
            .optional()?;

        match victim {
            Some(victim) => delete_entry(&conn, &victim),
            None => Ok(0),
        }
    }

    /// Evict by age, then by size (strict LRU). Returns bytes freed.
    pub fn cleanup(&self) -> Result<u64> {
        self.cleanup_at(Utc::now())
    }

    pub(crate) fn cleanup_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let settings = self.settings();
        let conn = self.conn.lock();
        cleanup_locked(&conn, &settings, now)
    }

    /// Delete every entry. Returns bytes freed.
    pub fn clear_all(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let victims = select_victims(&conn, "SELECT file_id, local_path, size_bytes FROM cache_entries", [])?;

        let mut freed = 0;
        for victim in &victims {
            freed += delete_entry(&conn, victim)?;
        }
        info!(entries = victims.len(), freed, "cache cleared");
        Ok(freed)
    }

    /// Sum of `size_bytes` over all entries
    pub fn current_size(&self) -> Result<u64> {
        let conn = self.conn.lock();
        total_size(&conn)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let size_limit = self.settings().size_limit_bytes;
        let conn = self.conn.lock();
        let (file_count, total_size) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM cache_entries",
            [],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
        )?;

        Ok(CacheStats {
            file_count,
            total_size,
            size_limit,
            usage_percent: if size_limit > 0 {
                total_size as f64 / size_limit as f64 * 100.0
            } else {
                0.0
            },
        })
    }

    /// Live usage of the disk holding the cache
    pub fn get_disk_info(&self) -> Result<DiskInfo> {
        let usage = disk_usage(&self.root)?;
        Ok(DiskInfo {
            total: usage.total,
            used: usage.total.saturating_sub(usage.free),
            free: usage.free,
            cache_used: self.current_size()?,
        })
    }

    /// Predefined size tiers, enabled when they fit on disk
    pub fn get_available_size_limits(&self) -> Result<Vec<SizeTier>> {
        let disk = self.get_disk_info()?;
        Ok(classify_tiers(disk.available_for_cache()))
    }
}

fn timestamp(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheEntry> {
    Ok(CacheEntry {
        file_id: row.get(0)?,
        object: ObjectRef::new(row.get(1)?, row.get(2)?),
        local_path: PathBuf::from(row.get::<_, String>(3)?),
        size_bytes: row.get::<_, i64>(4)? as u64,
        last_access: timestamp(row.get(5)?),
        download_time: timestamp(row.get(6)?),
    })
}

fn row_to_victim(row: &rusqlite::Row<'_>) -> rusqlite::Result<Victim> {
    Ok(Victim {
        file_id: row.get(0)?,
        local_path: PathBuf::from(row.get::<_, String>(1)?),
        size_bytes: row.get::<_, i64>(2)? as u64,
    })
}

fn select_victims<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Victim>> {
    let mut stmt = conn.prepare(sql)?;
    let victims = stmt
        .query_map(params, row_to_victim)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(victims)
}

fn total_size(conn: &Connection) -> Result<u64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(size_bytes), 0) FROM cache_entries",
        [],
        |row| row.get(0),
    )?;
    Ok(total as u64)
}

/// Remove the file, then the row. A file that is already gone still counts
/// its nominal size; a file that cannot be removed is left orphaned so the
/// index stays within budget.
fn delete_entry(conn: &Connection, victim: &Victim) -> Result<u64> {
    match fs::remove_file(&victim.local_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            file_id = %victim.file_id,
            path = %victim.local_path.display(),
            error = %e,
            "failed to remove cached file"
        ),
    }
    conn.execute(
        "DELETE FROM cache_entries WHERE file_id = ?1",
        params![victim.file_id],
    )?;
    Ok(victim.size_bytes)
}

fn cleanup_locked(conn: &Connection, settings: &CacheSettings, now: DateTime<Utc>) -> Result<u64> {
    let mut freed = 0;

    // Age pass
    if let Some(retention) = settings.retention() {
        let cutoff = (now - retention).timestamp_millis();
        let expired = select_victims(
            conn,
            "SELECT file_id, local_path, size_bytes FROM cache_entries WHERE last_access < ?1",
            params![cutoff],
        )?;
        for victim in &expired {
            freed += delete_entry(conn, victim)?;
        }
        if !expired.is_empty() {
            debug!(evicted = expired.len(), "expired cache entries removed");
        }
    }

    // Size pass
    let mut total = total_size(conn)?;
    if total > settings.size_limit_bytes {
        let oldest_first = select_victims(
            conn,
            "SELECT file_id, local_path, size_bytes FROM cache_entries
             ORDER BY last_access ASC, download_time ASC, file_id ASC",
            [],
        )?;
        for victim in &oldest_first {
            if total <= settings.size_limit_bytes {
                break;
            }
            freed += delete_entry(conn, victim)?;
            total = total.saturating_sub(victim.size_bytes);
        }
    }

    if freed > 0 {
        info!(freed, remaining = total, "cache cleanup finished");
    }
    Ok(freed)
}
