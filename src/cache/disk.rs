use std::path::Path;
use sysinfo::Disks;

use super::types::SizeTier;
use super::CacheError;
use crate::constants::SIZE_TIERS;

/// Raw filesystem usage for the volume holding `path`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DiskUsage {
    pub total: u64,
    pub free: u64,
}

/// Read live usage of the disk whose mount point is the longest prefix of `path`
pub(crate) fn disk_usage(path: &Path) -> Result<DiskUsage, CacheError> {
    let path = path.canonicalize()?;
    let disks = Disks::new_with_refreshed_list();

    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| DiskUsage {
            total: disk.total_space(),
            free: disk.available_space(),
        })
        .ok_or_else(|| CacheError::DiskNotFound(path.clone()))
}

/// Mark each predefined tier as selectable if it fits in `available`
pub(crate) fn classify_tiers(available: u64) -> Vec<SizeTier> {
    SIZE_TIERS
        .iter()
        .map(|(label, bytes)| SizeTier {
            label: label.to_string(),
            bytes: *bytes,
            enabled: *bytes <= available,
        })
        .collect()
}
