//! Filesystem formatting

use crate::config::RootfsType;
use crate::utils::command::CommandRunner;
use crate::utils::error::{ImageError, Result};
use tracing::{info, warn};

/// FAT32 cluster size in bytes
const FAT32_CLUSTER_BYTES: u32 = 1024;

/// Sectors per FAT32 cluster for a sector size, never below one
pub fn fat32_sectors_per_cluster(sector_size: u32) -> u32 {
    (FAT32_CLUSTER_BYTES / sector_size).max(1)
}

/// Compatibility warning for rootfs filesystems embedded kernels may lack
pub fn rootfs_advisory(filesystem: RootfsType) -> Option<String> {
    match filesystem {
        RootfsType::Ext4 => Some(
            "ext4 uses huge files by default; 32-bit kernels must be built with CONFIG_LBDAF"
                .to_string(),
        ),
        fs if !fs.is_ext() => Some(format!(
            "{} is often not enabled in embedded kernels; make sure yours supports it",
            fs
        )),
        _ => None,
    }
}

/// Format the FAT32 partition
pub fn format_fat32(cmd: &CommandRunner, partition: &str, sector_size: u32) -> Result<()> {
    info!("Formatting {} as FAT32", partition);

    let cluster = fat32_sectors_per_cluster(sector_size).to_string();
    let sector = sector_size.to_string();
    cmd.run(
        "mkfs.fat",
        &["-F", "32", "-s", &cluster, "-S", &sector, partition],
    )
    .map(|_| ())
    .map_err(|e| ImageError::FilesystemError(format!("Failed to format {} as FAT32: {}", partition, e)))
}

/// Format the rootfs partition with the configured filesystem
pub fn format_rootfs(cmd: &CommandRunner, partition: &str, filesystem: RootfsType) -> Result<()> {
    info!("Formatting {} as {}", partition, filesystem);

    if let Some(advisory) = rootfs_advisory(filesystem) {
        warn!("{}", advisory);
    }

    let force = if filesystem.is_ext() { "-F" } else { "-f" };
    let program = format!("mkfs.{}", filesystem.mkfs_name());

    cmd.run(&program, &[force, partition])
        .map(|_| ())
        .map_err(|e| {
            ImageError::FilesystemError(format!(
                "Failed to format {} as {}: {}",
                partition, filesystem, e
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_size_scales_with_sector_size() {
        assert_eq!(fat32_sectors_per_cluster(512), 2);
        assert_eq!(fat32_sectors_per_cluster(1024), 1);
        assert_eq!(fat32_sectors_per_cluster(4096), 1);
        assert_eq!(fat32_sectors_per_cluster(8192), 1);
    }

    #[test]
    fn advisories() {
        assert!(rootfs_advisory(RootfsType::Ext2).is_none());
        assert!(rootfs_advisory(RootfsType::Ext3).is_none());
        assert!(rootfs_advisory(RootfsType::Ext4).unwrap().contains("CONFIG_LBDAF"));
        assert!(rootfs_advisory(RootfsType::Btrfs).unwrap().starts_with("btrfs"));
        assert!(rootfs_advisory(RootfsType::Xfs).unwrap().starts_with("xfs"));
    }
}
