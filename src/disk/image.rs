//! Raw image file allocation and raw binary writes

use crate::utils::command::CommandRunner;
use crate::utils::error::{ImageError, Result};
use std::path::Path;
use tracing::info;

/// Where a raw loader binary lands inside the loader partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSlot {
    pub name: &'static str,
    pub offset_kib: u64,
    pub max_kib: u64,
}

/// First-stage preloader: the first 256 KiB of the loader partition
pub const PRELOADER_SLOT: RawSlot = RawSlot {
    name: "preloader",
    offset_kib: 0,
    max_kib: 256,
};

/// Bootloader: 768 KiB following the preloader
pub const BOOTLOADER_SLOT: RawSlot = RawSlot {
    name: "bootloader",
    offset_kib: 256,
    max_kib: 768,
};

/// Allocate a zero-filled image of exactly `size_mib` MiB, replacing any existing file
pub fn create_image_file(cmd: &CommandRunner, path: &Path, size_mib: u64) -> Result<()> {
    info!("Creating {} MiB image file {}", size_mib, path.display());

    let of = format!("of={}", path.display());
    let count = format!("count={}", size_mib);
    cmd.run("dd", &["if=/dev/zero", &of, "bs=1M", &count, "status=none"])
        .map(|_| ())
        .map_err(|e| ImageError::FilesystemError(format!("Failed to create {}: {}", path.display(), e)))
}

/// Copy `source` raw into `device` at the slot's offset.
///
/// Anything past the slot's size is silently cut off; the source is not
/// otherwise checked.
pub fn install_raw(cmd: &CommandRunner, source: &Path, device: &str, slot: RawSlot) -> Result<()> {
    info!("Installing {} {} to {}", slot.name, source.display(), device);

    let input = format!("if={}", source.display());
    let output = format!("of={}", device);
    let count = format!("count={}", slot.max_kib);
    let seek = format!("seek={}", slot.offset_kib);
    let mut args = vec![input.as_str(), output.as_str(), "bs=1k", count.as_str()];
    if slot.offset_kib > 0 {
        args.push(seek.as_str());
    }
    args.push("conv=notrunc");

    cmd.run("dd", &args).map(|_| ()).map_err(|e| {
        ImageError::ContentError(format!("Failed to write {} to {}: {}", slot.name, device, e))
    })
}
