//! Mount point handling for a build session

use crate::utils::command::CommandRunner;
use crate::utils::error::{ImageError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// Prefix shared by every mount point a build creates
pub const MOUNT_POINT_PREFIX: &str = ".mkdiskimage-";

/// The two working directories of one build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoints {
    pub fat32: PathBuf,
    pub rootfs: PathBuf,
}

impl MountPoints {
    /// Fresh, session-unique mount points under `work_dir`
    pub fn new(work_dir: &Path) -> Self {
        let session = Uuid::new_v4().simple().to_string();
        Self::for_session(work_dir, &session[..12])
    }

    pub fn for_session(work_dir: &Path, session: &str) -> Self {
        Self {
            fat32: work_dir.join(format!("{}{}-fat32", MOUNT_POINT_PREFIX, session)),
            rootfs: work_dir.join(format!("{}{}-rootfs", MOUNT_POINT_PREFIX, session)),
        }
    }
}

/// Whether `path` looks like a mount point created by a build
pub fn is_session_mount_point(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with(MOUNT_POINT_PREFIX))
        .unwrap_or(false)
}

/// Create an empty mount point directory. An existing one is never reused.
pub fn create_mount_point(cmd: &CommandRunner, path: &Path) -> Result<()> {
    if path.exists() {
        return Err(ImageError::StaleMountPoint(path.display().to_string()));
    }

    info!("Creating mount point {}", path.display());
    if cmd.is_dry_run() {
        println!("  [dry-run] mkdir {}", path.display());
        return Ok(());
    }
    fs::create_dir(path)?;
    Ok(())
}

/// Remove an (empty) mount point directory
pub fn remove_mount_point(cmd: &CommandRunner, path: &Path) -> Result<()> {
    info!("Removing mount point {}", path.display());
    if cmd.is_dry_run() {
        println!("  [dry-run] rmdir {}", path.display());
        return Ok(());
    }
    fs::remove_dir(path)?;
    Ok(())
}

pub fn mount(cmd: &CommandRunner, device: &str, target: &Path) -> Result<()> {
    let target_str = target.to_string_lossy();
    cmd.run("mount", &[device, &target_str])
        .map_err(|e| ImageError::MountError(format!("Failed to mount {}: {}", device, e)))?;
    info!("Mounted {} to {}", device, target.display());
    Ok(())
}

pub fn unmount(cmd: &CommandRunner, target: &Path) -> Result<()> {
    let target_str = target.to_string_lossy();
    cmd.force_run("umount", &[&target_str])
        .map_err(|e| ImageError::MountError(format!("Failed to unmount {}: {}", target.display(), e)))?;
    info!("Unmounted {}", target.display());
    Ok(())
}

/// Flush dirty pages before unmounting
pub fn sync(cmd: &CommandRunner) -> Result<()> {
    cmd.force_run("sync", &[]).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_paths_are_unique() {
        let a = MountPoints::new(Path::new("/work"));
        let b = MountPoints::new(Path::new("/work"));
        assert_ne!(a, b);
        assert!(is_session_mount_point(&a.fat32));
        assert!(is_session_mount_point(&a.rootfs));
        assert!(!is_session_mount_point(Path::new("/work/img-fat32")));
    }

    #[test]
    fn fixed_session_names() {
        let mp = MountPoints::for_session(Path::new("/work"), "abc");
        assert_eq!(mp.fat32, PathBuf::from("/work/.mkdiskimage-abc-fat32"));
        assert_eq!(mp.rootfs, PathBuf::from("/work/.mkdiskimage-abc-rootfs"));
    }

    #[test]
    fn existing_directory_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = CommandRunner::new(false);
        let path = dir.path().join(".mkdiskimage-x-fat32");

        create_mount_point(&cmd, &path).unwrap();
        assert!(path.is_dir());
        assert!(matches!(
            create_mount_point(&cmd, &path),
            Err(ImageError::StaleMountPoint(_))
        ));

        remove_mount_point(&cmd, &path).unwrap();
        assert!(!path.exists());
    }
}
