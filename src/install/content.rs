//! Installing files into the mounted partitions

use crate::utils::command::CommandRunner;
use crate::utils::error::{ImageError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Expand a leading `~` to the user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Copy a file into `dest_dir`, keeping its file name
pub fn copy_into(cmd: &CommandRunner, source: &Path, dest_dir: &Path) -> Result<()> {
    let name = source.file_name().ok_or_else(|| {
        ImageError::ContentError(format!("Not a file path: {}", source.display()))
    })?;
    let dest = dest_dir.join(name);

    info!("Copying {} to {}", source.display(), dest.display());
    if cmd.is_dry_run() {
        println!("  [dry-run] cp {} {}", source.display(), dest.display());
        return Ok(());
    }

    fs::copy(source, &dest).map_err(|e| {
        ImageError::ContentError(format!("Failed to copy {}: {}", source.display(), e))
    })?;
    Ok(())
}

/// Extract a (compressed) tarball into `dest_dir`, keeping ownership and modes
pub fn extract_archive(cmd: &CommandRunner, archive: &Path, dest_dir: &Path) -> Result<()> {
    info!("Extracting {} to {}", archive.display(), dest_dir.display());

    let directory = format!("--directory={}", dest_dir.display());
    let file = format!("--file={}", archive.display());
    cmd.run(
        "tar",
        &[
            "--extract",
            "--preserve-permissions",
            "--same-owner",
            "--numeric-owner",
            &directory,
            &file,
        ],
    )
    .map(|_| ())
    .map_err(|e| ImageError::ContentError(format!("Failed to extract {}: {}", archive.display(), e)))
}
