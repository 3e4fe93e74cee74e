//! The host operations a build is made of
//!
//! [`ImageBuilder`](super::ImageBuilder) never runs a tool itself; it asks an
//! [`ImageHost`]. [`SystemHost`] does the real work through a
//! [`CommandRunner`], tests substitute a recording fake.

use crate::config::RootfsType;
use crate::disk::image::{self, RawSlot};
use crate::disk::layouts::PartitionPlan;
use crate::disk::{formatting, loopback, partitioning};
use crate::install::{content, mounts};
use crate::utils::command::CommandRunner;
use crate::utils::error::Result;
use std::path::Path;

pub trait ImageHost {
    /// Zero-filled image file of exactly `size_mib` MiB
    fn create_image(&self, path: &Path, size_mib: u64) -> Result<()>;

    /// Free `/dev/loopN` of leftovers from an earlier build of `image`
    fn reclaim_loop(&self, image: &Path, index: u32) -> Result<()>;

    fn detach_all_loops(&self) -> Result<()>;

    /// Attach with partition scanning; returns the device path
    fn attach_loop(&self, image: &Path, index: u32) -> Result<String>;

    fn detach_loop(&self, device: &str) -> Result<()>;

    fn write_partition_table(&self, device: &str, plan: &PartitionPlan) -> Result<()>;

    fn format_fat32(&self, partition: &str, sector_size: u32) -> Result<()>;

    fn format_rootfs(&self, partition: &str, filesystem: RootfsType) -> Result<()>;

    fn write_raw(&self, source: &Path, device: &str, slot: RawSlot) -> Result<()>;

    /// Create an empty directory; fails if it already exists
    fn create_mount_point(&self, path: &Path) -> Result<()>;

    fn remove_mount_point(&self, path: &Path) -> Result<()>;

    fn mount(&self, device: &str, target: &Path) -> Result<()>;

    fn unmount(&self, target: &Path) -> Result<()>;

    /// Flush pending writes to the image
    fn sync(&self) -> Result<()>;

    fn copy_file(&self, source: &Path, dest_dir: &Path) -> Result<()>;

    fn extract_archive(&self, archive: &Path, dest_dir: &Path) -> Result<()>;
}

/// Runs every operation on the local machine
pub struct SystemHost {
    cmd: CommandRunner,
}

impl SystemHost {
    pub fn new(dry_run: bool) -> Self {
        Self {
            cmd: CommandRunner::new(dry_run),
        }
    }
}

impl ImageHost for SystemHost {
    fn create_image(&self, path: &Path, size_mib: u64) -> Result<()> {
        image::create_image_file(&self.cmd, path, size_mib)
    }

    fn reclaim_loop(&self, image: &Path, index: u32) -> Result<()> {
        loopback::reclaim(&self.cmd, image, index)
    }

    fn detach_all_loops(&self) -> Result<()> {
        loopback::detach_all(&self.cmd)
    }

    fn attach_loop(&self, image: &Path, index: u32) -> Result<String> {
        loopback::attach(&self.cmd, image, index)
    }

    fn detach_loop(&self, device: &str) -> Result<()> {
        loopback::detach(&self.cmd, device)
    }

    fn write_partition_table(&self, device: &str, plan: &PartitionPlan) -> Result<()> {
        partitioning::apply_partitions(&self.cmd, device, plan)
    }

    fn format_fat32(&self, partition: &str, sector_size: u32) -> Result<()> {
        formatting::format_fat32(&self.cmd, partition, sector_size)
    }

    fn format_rootfs(&self, partition: &str, filesystem: RootfsType) -> Result<()> {
        formatting::format_rootfs(&self.cmd, partition, filesystem)
    }

    fn write_raw(&self, source: &Path, device: &str, slot: RawSlot) -> Result<()> {
        image::install_raw(&self.cmd, source, device, slot)
    }

    fn create_mount_point(&self, path: &Path) -> Result<()> {
        mounts::create_mount_point(&self.cmd, path)
    }

    fn remove_mount_point(&self, path: &Path) -> Result<()> {
        mounts::remove_mount_point(&self.cmd, path)
    }

    fn mount(&self, device: &str, target: &Path) -> Result<()> {
        mounts::mount(&self.cmd, device, target)
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        mounts::unmount(&self.cmd, target)
    }

    fn sync(&self) -> Result<()> {
        mounts::sync(&self.cmd)
    }

    fn copy_file(&self, source: &Path, dest_dir: &Path) -> Result<()> {
        content::copy_into(&self.cmd, source, dest_dir)
    }

    fn extract_archive(&self, archive: &Path, dest_dir: &Path) -> Result<()> {
        content::extract_archive(&self.cmd, archive, dest_dir)
    }
}
