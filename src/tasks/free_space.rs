//! Disk usage check for the storage volume

use std::path::Path;

use sysinfo::Disks;
use tracing::{error, info, warn};

use super::TaskContext;
use crate::error::Result;

/// Total and available bytes of the disk holding `path`.
///
/// The disk with the longest mount point containing `path` wins.
pub fn disk_usage(path: &Path) -> Option<(u64, u64)> {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().components().count())
        .map(|disk| (disk.total_space(), disk.available_space()))
}

pub fn used_percent(total: u64, available: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    total.saturating_sub(available) as f64 * 100.0 / total as f64
}

/// Log an error when the storage volume is fuller than the configured
/// threshold. Returns the used percentage when it could be measured.
pub fn check_free_space(ctx: &TaskContext) -> Result<Option<f64>> {
    let Some(threshold) = ctx.config.free_space_threshold_percent else {
        info!("Free space checking is disabled as no threshold is configured");
        return Ok(None);
    };

    let Some((total, available)) = disk_usage(ctx.storage.root()) else {
        warn!(
            "Could not determine disk for {}",
            ctx.storage.root().display()
        );
        return Ok(None);
    };

    let percent = used_percent(total, available);
    if percent >= threshold {
        error!("Used space is {:.1}%", percent);
    } else {
        info!("Used space is {:.1}%", percent);
    }
    Ok(Some(percent))
}
