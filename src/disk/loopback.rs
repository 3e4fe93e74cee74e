//! Loop device management

use crate::utils::command::CommandRunner;
use crate::utils::error::{ImageError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// `/dev/loopN`
pub fn loop_device_path(index: u32) -> String {
    format!("/dev/loop{}", index)
}

/// Partition sub-device of a partitioned loop device (`/dev/loop0p2`)
pub fn partition_path(device: &str, number: u8) -> String {
    format!("{}p{}", device, number)
}

/// File currently backing `/dev/loopN`, if it is bound
pub fn backing_file(index: u32) -> Option<PathBuf> {
    let attr = format!("/sys/block/loop{}/loop/backing_file", index);
    fs::read_to_string(attr)
        .ok()
        .map(|s| PathBuf::from(s.trim()))
        .filter(|p| !p.as_os_str().is_empty())
}

/// Attach `image` to `/dev/loopN` with partition scanning, returning the device path
pub fn attach(cmd: &CommandRunner, image: &Path, index: u32) -> Result<String> {
    let device = loop_device_path(index);
    let image_str = image.to_string_lossy();
    info!("Attaching {} to {}", image.display(), device);

    cmd.run("losetup", &["-P", &device, &image_str])
        .map_err(|e| ImageError::LoopError(format!("Failed to attach {}: {}", device, e)))?;

    // Partition sub-devices show up asynchronously
    let _ = cmd.run("udevadm", &["settle"]);
    Ok(device)
}

/// Detach a single loop device
pub fn detach(cmd: &CommandRunner, device: &str) -> Result<()> {
    info!("Detaching {}", device);
    cmd.force_run("losetup", &["-d", device])
        .map(|_| ())
        .map_err(|e| ImageError::LoopError(format!("Failed to detach {}: {}", device, e)))
}

/// Detach every loop device on the host
pub fn detach_all(cmd: &CommandRunner) -> Result<()> {
    info!("Detaching all loop devices on the host");
    cmd.force_run("losetup", &["-D"])
        .map(|_| ())
        .map_err(|e| ImageError::LoopError(format!("Failed to detach loop devices: {}", e)))
}

/// Make `/dev/loopN` available for `image`.
///
/// A device still bound to the same image is left over from an earlier run
/// of this build and is detached. A device bound to anything else belongs to
/// someone else and is refused.
pub fn reclaim(cmd: &CommandRunner, image: &Path, index: u32) -> Result<()> {
    let Some(bound) = backing_file(index) else {
        debug!("{} is free", loop_device_path(index));
        return Ok(());
    };

    let ours = match (fs::canonicalize(image), fs::canonicalize(&bound)) {
        (Ok(a), Ok(b)) => a == b,
        _ => bound == image,
    };

    if ours {
        info!(
            "{} is still bound to {} from a previous run",
            loop_device_path(index),
            bound.display()
        );
        detach(cmd, &loop_device_path(index))
    } else {
        Err(ImageError::StaleLoopDevice {
            device: loop_device_path(index),
            backing_file: bound.display().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_paths() {
        assert_eq!(loop_device_path(0), "/dev/loop0");
        assert_eq!(loop_device_path(12), "/dev/loop12");
        assert_eq!(partition_path("/dev/loop0", 3), "/dev/loop0p3");
    }

    #[test]
    fn unbound_index_has_no_backing_file() {
        assert!(backing_file(u32::MAX).is_none());
    }

    #[test]
    fn reclaim_unbound_device_is_noop() {
        let cmd = CommandRunner::new(true);
        reclaim(&cmd, Path::new("/tmp/none.img"), u32::MAX).unwrap();
    }
}
