//! Host tool dependency checking

use crate::config::{BuildConfig, RootfsType};
use crate::utils::command::command_exists;
use crate::utils::error::{ImageError, Result};
use std::collections::HashMap;
use tracing::info;

/// Binary to package mapping
fn binary_to_package() -> HashMap<&'static str, &'static str> {
    let mut map = HashMap::new();
    // Loop devices, partitioning and mounting
    map.insert("losetup", "util-linux");
    map.insert("sfdisk", "util-linux");
    map.insert("mount", "util-linux");
    map.insert("umount", "util-linux");

    // Filesystems
    map.insert("mkfs.fat", "dosfstools");
    map.insert("mkfs.ext2", "e2fsprogs");
    map.insert("mkfs.ext3", "e2fsprogs");
    map.insert("mkfs.ext4", "e2fsprogs");
    map.insert("mkfs.btrfs", "btrfs-progs");
    map.insert("mkfs.xfs", "xfsprogs");

    // Image and content
    map.insert("dd", "coreutils");
    map.insert("sync", "coreutils");
    map.insert("tar", "tar");

    map
}

/// Determine required binaries based on configuration
pub fn required_binaries(config: &BuildConfig) -> Vec<&'static str> {
    let mut bins = vec!["losetup", "mount", "umount", "sync", "mkfs.fat"];

    if config.image.mode.is_full_build() {
        bins.push("sfdisk");
    }

    bins.push(match config.partitions.rootfs.filesystem {
        RootfsType::Ext2 => "mkfs.ext2",
        RootfsType::Ext3 => "mkfs.ext3",
        RootfsType::Ext4 => "mkfs.ext4",
        RootfsType::Btrfs => "mkfs.btrfs",
        RootfsType::Xfs => "mkfs.xfs",
    });

    // Image allocation and raw loader writes
    if config.image.mode.is_full_build()
        || config.content.preloader.is_some()
        || config.content.bootloader.is_some()
    {
        bins.push("dd");
    }

    if config.content.rootfs_archive.is_some() {
        bins.push("tar");
    }

    bins
}

/// Check for missing dependencies and return list of missing packages
pub fn check_dependencies(config: &BuildConfig) -> Vec<String> {
    let bin_to_pkg = binary_to_package();
    let mut missing_packages: Vec<String> = Vec::new();

    for bin in required_binaries(config) {
        if !command_exists(bin) {
            let pkg = match bin_to_pkg.get(bin) {
                Some(&pkg) => format!("{} (provides {})", pkg, bin),
                None => format!("(provides {})", bin),
            };
            if !missing_packages.contains(&pkg) {
                missing_packages.push(pkg);
            }
        }
    }

    missing_packages
}

/// Fail with [`ImageError::MissingDependencies`] unless every required tool is present
pub fn ensure_dependencies(config: &BuildConfig) -> Result<()> {
    let missing = check_dependencies(config);

    if missing.is_empty() {
        info!("All required host tools are installed");
        return Ok(());
    }

    println!("\n⚠ Missing host system packages:");
    for pkg in &missing {
        println!("  - {}", pkg);
    }
    println!();

    Err(ImageError::MissingDependencies(missing.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildMode;
    use std::path::PathBuf;

    #[test]
    fn default_build_tools() {
        let bins = required_binaries(&BuildConfig::default());
        for bin in ["losetup", "sfdisk", "mkfs.fat", "mkfs.ext3", "dd", "mount"] {
            assert!(bins.contains(&bin), "missing {}", bin);
        }
        assert!(!bins.contains(&"tar"));
    }

    #[test]
    fn replace_mode_skips_partitioner() {
        let mut config = BuildConfig::default();
        config.image.mode = BuildMode::Replace;
        config.partitions.rootfs.filesystem = RootfsType::Btrfs;
        config.content.rootfs_archive = Some(PathBuf::from("rootfs.tar.gz"));

        let bins = required_binaries(&config);
        assert!(!bins.contains(&"sfdisk"));
        assert!(!bins.contains(&"dd"));
        assert!(bins.contains(&"mkfs.btrfs"));
        assert!(bins.contains(&"tar"));
    }

    #[test]
    fn every_binary_has_a_package() {
        let map = binary_to_package();
        let mut config = BuildConfig::default();
        config.content.rootfs_archive = Some(PathBuf::from("rootfs.tar"));
        for fs in [RootfsType::Ext2, RootfsType::Ext4, RootfsType::Btrfs, RootfsType::Xfs] {
            config.partitions.rootfs.filesystem = fs;
            for bin in required_binaries(&config) {
                assert!(map.contains_key(bin), "{} has no package", bin);
            }
        }
    }
}
