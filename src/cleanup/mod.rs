//! Recovery from interrupted builds
//!
//! A build killed hard (SIGKILL, power loss) leaves its loop device attached
//! and its session mount points mounted. `Cleaner` releases them.

use crate::disk::loopback::{self, backing_file, loop_device_path};
use crate::install::mounts::{is_session_mount_point, unmount};
use crate::utils::command::CommandRunner;
use crate::utils::error::{ImageError, Result};
use crate::utils::prompt::warn_confirm;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Cleanup utility
pub struct Cleaner {
    cmd: CommandRunner,
}

impl Cleaner {
    pub fn new(dry_run: bool) -> Self {
        Self {
            cmd: CommandRunner::new(dry_run),
        }
    }

    /// Unmount and remove leftover session mount points under `work_dir`,
    /// then detach `/dev/loop<index>` (or every loop device with `all`).
    pub fn cleanup(&self, index: u32, work_dir: &Path, all: bool, yes: bool) -> Result<()> {
        let work_dir = fs::canonicalize(work_dir).unwrap_or_else(|_| work_dir.to_path_buf());
        info!("Starting cleanup in {}", work_dir.display());

        self.unmount_sessions(&work_dir);
        self.remove_session_dirs(&work_dir)?;

        if all {
            if !yes
                && !warn_confirm("This detaches EVERY loop device on this host, including ones not created by mkdiskimage.")?
            {
                return Err(ImageError::UserCancelled);
            }
            loopback::detach_all(&self.cmd)?;
        } else {
            self.detach_one(index)?;
        }

        info!("Cleanup complete");
        Ok(())
    }

    fn unmount_sessions(&self, work_dir: &Path) {
        let mounts = fs::read_to_string("/proc/mounts").unwrap_or_default();
        for target in session_mounts(&mounts, work_dir) {
            if let Err(e) = unmount(&self.cmd, &target) {
                warn!("Could not unmount {}: {}", target.display(), e);
            }
        }
    }

    fn remove_session_dirs(&self, work_dir: &Path) -> Result<()> {
        let entries = match fs::read_dir(work_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
            if !path.is_dir() || !is_session_mount_point(&path) {
                continue;
            }
            info!("Removing {}", path.display());
            if self.cmd.is_dry_run() {
                println!("  [dry-run] rmdir {}", path.display());
                continue;
            }
            // Only empty directories; a non-empty one is still mounted or holds data
            if let Err(e) = fs::remove_dir(&path) {
                warn!("Could not remove {}: {}", path.display(), e);
            }
        }
        Ok(())
    }

    fn detach_one(&self, index: u32) -> Result<()> {
        let device = loop_device_path(index);
        match backing_file(index) {
            Some(file) => {
                info!("{} is bound to {}", device, file.display());
                loopback::detach(&self.cmd, &device)
            }
            None => {
                info!("{} is not attached", device);
                Ok(())
            }
        }
    }
}

/// Session mount points directly under `work_dir` listed in a `/proc/mounts` dump,
/// deepest first
fn session_mounts(mounts: &str, work_dir: &Path) -> Vec<PathBuf> {
    let mut targets: Vec<PathBuf> = mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|target| PathBuf::from(target.replace("\\040", " ")))
        .filter(|target| target.parent() == Some(work_dir) && is_session_mount_point(target))
        .collect();

    targets.sort_by_key(|t| std::cmp::Reverse(t.components().count()));
    targets.dedup();
    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
/dev/loop0p1 /work/.mkdiskimage-1a2b-fat32 vfat rw,relatime 0 0
/dev/loop0p2 /work/.mkdiskimage-1a2b-rootfs ext3 rw,relatime 0 0
/dev/sda1 /work/data ext4 rw 0 0
/dev/loop1p2 /elsewhere/.mkdiskimage-ffff-rootfs ext3 rw 0 0
/dev/loop2p1 /my\\040work/.mkdiskimage-9-fat32 vfat rw 0 0
";

    #[test]
    fn finds_only_session_mounts_in_work_dir() {
        let found = session_mounts(MOUNTS, Path::new("/work"));
        assert_eq!(
            found,
            vec![
                PathBuf::from("/work/.mkdiskimage-1a2b-fat32"),
                PathBuf::from("/work/.mkdiskimage-1a2b-rootfs"),
            ]
        );
    }

    #[test]
    fn unescapes_spaces() {
        let found = session_mounts(MOUNTS, Path::new("/my work"));
        assert_eq!(found, vec![PathBuf::from("/my work/.mkdiskimage-9-fat32")]);
    }

    #[test]
    fn removes_only_empty_session_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join(".mkdiskimage-abc-fat32");
        let busy = dir.path().join(".mkdiskimage-abc-rootfs");
        let foreign = dir.path().join("keep-me");
        fs::create_dir(&stale).unwrap();
        fs::create_dir(&busy).unwrap();
        fs::write(busy.join("file"), b"x").unwrap();
        fs::create_dir(&foreign).unwrap();

        Cleaner::new(false).remove_session_dirs(dir.path()).unwrap();

        assert!(!stale.exists());
        assert!(busy.exists());
        assert!(foreign.exists());
    }

    #[test]
    fn dry_run_removes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join(".mkdiskimage-abc-fat32");
        fs::create_dir(&stale).unwrap();

        Cleaner::new(true).remove_session_dirs(dir.path()).unwrap();
        assert!(stale.exists());
    }

    #[test]
    fn missing_work_dir_is_fine() {
        Cleaner::new(false)
            .remove_session_dirs(Path::new("/nonexistent/mkdiskimage/work"))
            .unwrap();
    }
}
