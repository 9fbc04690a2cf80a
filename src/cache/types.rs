use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::backend::ObjectRef;
use crate::constants::{DEFAULT_SIZE_LIMIT_BYTES, DISK_RESERVE_BYTES, RETENTION_1_WEEK};

/// One row of the cache index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub file_id: String,
    pub object: ObjectRef,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub last_access: DateTime<Utc>,
    pub download_time: DateTime<Utc>,
}

impl CacheEntry {
    /// Entry for a download that just completed
    pub fn new(file_id: String, object: ObjectRef, local_path: PathBuf, size_bytes: u64) -> Self {
        let now = Utc::now();
        Self {
            file_id,
            object,
            local_path,
            size_bytes,
            last_access: now,
            download_time: now,
        }
    }
}

/// User cache configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    pub size_limit_bytes: u64,
    /// Seconds an entry may go unaccessed; -1 keeps entries forever
    pub retention_seconds: i64,
    pub auto_cleanup_enabled: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            size_limit_bytes: DEFAULT_SIZE_LIMIT_BYTES,
            retention_seconds: RETENTION_1_WEEK,
            auto_cleanup_enabled: true,
        }
    }
}

impl CacheSettings {
    /// Retention window, or `None` when unlimited
    pub fn retention(&self) -> Option<Duration> {
        (self.retention_seconds >= 0).then(|| Duration::seconds(self.retention_seconds))
    }
}

/// Cache statistics for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub file_count: u64,
    pub total_size: u64,
    pub size_limit: u64,
    pub usage_percent: f64,
}

/// Information about the disk holding the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub cache_used: u64,
}

impl DiskInfo {
    pub fn free_percent(&self) -> f64 {
        if self.total > 0 {
            self.free as f64 / self.total as f64 * 100.0
        } else {
            0.0
        }
    }

    /// Free space minus the fixed safety reserve
    pub fn available_for_cache(&self) -> u64 {
        self.free.saturating_sub(DISK_RESERVE_BYTES)
    }
}

/// A predefined size limit and whether it currently fits on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeTier {
    pub label: String,
    pub bytes: u64,
    pub enabled: bool,
}

/// Snapshot returned by the status operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStatus {
    pub settings: CacheSettings,
    pub stats: CacheStats,
    pub disk: Option<DiskInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::GIB;

    #[test]
    fn test_available_for_cache_keeps_reserve() {
        let disk = DiskInfo {
            total: 100 * GIB,
            used: 97 * GIB,
            free: 3 * GIB,
            cache_used: 0,
        };
        assert_eq!(disk.available_for_cache(), 0);

        let roomy = DiskInfo {
            free: 12 * GIB,
            ..disk
        };
        assert_eq!(roomy.available_for_cache(), 7 * GIB);
        assert!((roomy.free_percent() - 12.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_retention_window() {
        let mut settings = CacheSettings::default();
        assert_eq!(settings.retention(), Some(Duration::weeks(1)));

        settings.retention_seconds = -1;
        assert_eq!(settings.retention(), None);

        settings.retention_seconds = 0;
        assert_eq!(settings.retention(), Some(Duration::zero()));
    }
}
