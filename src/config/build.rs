//! Build configuration structure

use crate::disk::layouts::{LayoutRequest, PartitionRequest, Region, SECTOR_SIZES};
use crate::utils::error::{ImageError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything one image build needs, loaded from TOML or assembled from flags
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildConfig {
    /// Directory under which the per-build mount points are created
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub loopback: LoopbackConfig,
    #[serde(default)]
    pub partitions: PartitionsConfig,
    #[serde(default)]
    pub content: ContentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageConfig {
    /// Path of the resulting disk image
    #[serde(default = "default_output")]
    pub output: PathBuf,
    /// Total image size in MiB
    #[serde(default = "default_image_mib")]
    pub size_mib: u64,
    /// Sector size of the target device in bytes
    #[serde(default = "default_sector_size")]
    pub sector_size: u32,
    #[serde(default)]
    pub mode: BuildMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoopbackConfig {
    /// Loop device index (`/dev/loopN`)
    #[serde(default)]
    pub index: u32,
    /// Detach every loop device on the host before and after the build
    /// instead of only `/dev/loopN`. Unsafe if anything else on the host
    /// uses loop devices.
    #[serde(default)]
    pub detach_all: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartitionsConfig {
    #[serde(default = "default_loader")]
    pub loader: PartitionConfig,
    #[serde(default = "default_fat32")]
    pub fat32: PartitionConfig,
    #[serde(default)]
    pub rootfs: RootfsConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PartitionConfig {
    /// Partition number on the disk (1-4)
    pub number: u8,
    /// Size in MiB
    pub size_mib: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RootfsConfig {
    #[serde(default = "default_rootfs_number")]
    pub number: u8,
    /// Size in MiB (0 = fill the rest of the image)
    #[serde(default)]
    pub size_mib: u64,
    #[serde(default)]
    pub filesystem: RootfsType,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContentConfig {
    /// Raw preloader written to the start of the loader partition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preloader: Option<PathBuf>,
    /// Raw bootloader written 256 KiB into the loader partition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootloader: Option<PathBuf>,
    /// Files copied into the root of the FAT32 partition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<PathBuf>,
    /// Tarball extracted into the rootfs partition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs_archive: Option<PathBuf>,
}

// Enums for configuration options

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// Full build; the output file must not exist yet
    #[default]
    Create,
    /// Full build, replacing an existing output file
    Overwrite,
    /// Reformat and repopulate an already partitioned image
    Replace,
}

impl BuildMode {
    /// Whether this mode writes a fresh image file and partition table
    pub fn is_full_build(&self) -> bool {
        !matches!(self, Self::Replace)
    }
}

impl std::fmt::Display for BuildMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Overwrite => write!(f, "overwrite"),
            Self::Replace => write!(f, "replace"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RootfsType {
    Ext2,
    #[default]
    Ext3,
    Ext4,
    Btrfs,
    Xfs,
}

impl RootfsType {
    /// The `mkfs.<name>` suffix
    pub fn mkfs_name(&self) -> &'static str {
        match self {
            Self::Ext2 => "ext2",
            Self::Ext3 => "ext3",
            Self::Ext4 => "ext4",
            Self::Btrfs => "btrfs",
            Self::Xfs => "xfs",
        }
    }

    pub fn is_ext(&self) -> bool {
        matches!(self, Self::Ext2 | Self::Ext3 | Self::Ext4)
    }
}

impl std::fmt::Display for RootfsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.mkfs_name())
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            size_mib: default_image_mib(),
            sector_size: default_sector_size(),
            mode: BuildMode::default(),
        }
    }
}

impl Default for PartitionsConfig {
    fn default() -> Self {
        Self {
            loader: default_loader(),
            fat32: default_fat32(),
            rootfs: RootfsConfig::default(),
        }
    }
}

impl Default for RootfsConfig {
    fn default() -> Self {
        Self {
            number: default_rootfs_number(),
            size_mib: 0,
            filesystem: RootfsType::default(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            image: ImageConfig::default(),
            loopback: LoopbackConfig::default(),
            partitions: PartitionsConfig::default(),
            content: ContentConfig::default(),
            work_dir: default_work_dir(),
        }
    }
}

// Default value functions

fn default_output() -> PathBuf {
    PathBuf::from("./diskimage.img")
}

fn default_image_mib() -> u64 {
    2048
}

fn default_sector_size() -> u32 {
    512
}

fn default_loader() -> PartitionConfig {
    PartitionConfig {
        number: 3,
        size_mib: 16,
    }
}

fn default_fat32() -> PartitionConfig {
    PartitionConfig {
        number: 1,
        size_mib: 100,
    }
}

fn default_rootfs_number() -> u8 {
    2
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

impl BuildConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ImageError::ConfigError(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config: BuildConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Generate a sample configuration
    pub fn sample() -> Self {
        BuildConfig {
            image: ImageConfig {
                output: PathBuf::from("./sdcard.img"),
                size_mib: 4096,
                sector_size: 512,
                mode: BuildMode::Overwrite,
            },
            loopback: LoopbackConfig::default(),
            partitions: PartitionsConfig {
                loader: default_loader(),
                fat32: PartitionConfig {
                    number: 1,
                    size_mib: 256,
                },
                rootfs: RootfsConfig {
                    number: 2,
                    size_mib: 0,
                    filesystem: RootfsType::Ext3,
                },
            },
            content: ContentConfig {
                preloader: Some(PathBuf::from("preloader-mkpimage.bin")),
                bootloader: Some(PathBuf::from("u-boot.img")),
                images: vec![PathBuf::from("zImage"), PathBuf::from("socfpga.dtb")],
                rootfs_archive: Some(PathBuf::from("rootfs.tar.gz")),
            },
            work_dir: default_work_dir(),
        }
    }

    /// Project the user inputs onto the partition planner's request
    pub fn layout_request(&self) -> LayoutRequest {
        let p = &self.partitions;
        LayoutRequest {
            loader: PartitionRequest::new(Region::Loader, p.loader.number, p.loader.size_mib),
            fat32: PartitionRequest::new(Region::Fat32, p.fat32.number, p.fat32.size_mib),
            rootfs: PartitionRequest::new(Region::Rootfs, p.rootfs.number, p.rootfs.size_mib),
            image_size_mib: self.image.size_mib,
            sector_size: self.image.sector_size,
        }
    }

    /// Validate the configuration without touching the output file
    pub fn validate(&self) -> Result<()> {
        if self.image.size_mib == 0 {
            return Err(ImageError::ValidationError(
                "Image size cannot be 0".to_string(),
            ));
        }

        if !SECTOR_SIZES.contains(&self.image.sector_size) {
            return Err(ImageError::InvalidSectorSize(self.image.sector_size));
        }

        if self.image.output.as_os_str().is_empty() {
            return Err(ImageError::ValidationError(
                "Output path cannot be empty".to_string(),
            ));
        }

        self.layout_request().check_numbers()?;

        let c = &self.content;
        let inputs = c
            .preloader
            .iter()
            .chain(c.bootloader.iter())
            .chain(c.images.iter())
            .chain(c.rootfs_archive.iter());
        for input in inputs {
            let path = crate::install::expand_home(input);
            if !path.is_file() {
                return Err(ImageError::ValidationError(format!(
                    "Input file not found: {}",
                    input.display()
                )));
            }
        }

        if self.loopback.detach_all {
            tracing::warn!("detach_all also detaches loop devices this build does not own");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_classic_layout() {
        let config = BuildConfig::default();
        assert_eq!(config.image.size_mib, 2048);
        assert_eq!(config.image.sector_size, 512);
        assert_eq!(config.partitions.fat32.number, 1);
        assert_eq!(config.partitions.rootfs.number, 2);
        assert_eq!(config.partitions.loader.number, 3);
        assert_eq!(config.partitions.loader.size_mib, 16);
        assert_eq!(config.partitions.rootfs.filesystem, RootfsType::Ext3);
        assert_eq!(config.image.mode, BuildMode::Create);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: BuildConfig = toml::from_str(
            r#"
            [image]
            size_mib = 512
            mode = "replace"

            [partitions.rootfs]
            filesystem = "btrfs"
            "#,
        )
        .unwrap();

        assert_eq!(config.image.size_mib, 512);
        assert_eq!(config.image.mode, BuildMode::Replace);
        assert_eq!(config.partitions.rootfs.filesystem, RootfsType::Btrfs);
        assert_eq!(config.partitions.rootfs.number, 2);
        assert_eq!(config.partitions.fat32.size_mib, 100);
    }

    #[test]
    fn sample_survives_toml() {
        let sample = BuildConfig::sample();
        let text = toml::to_string_pretty(&sample).unwrap();
        let parsed: BuildConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, sample);
    }

    #[test]
    fn validate_rejects_bad_sector_size() {
        let mut config = BuildConfig::default();
        config.image.sector_size = 520;
        assert!(matches!(
            config.validate(),
            Err(ImageError::InvalidSectorSize(520))
        ));
    }

    #[test]
    fn validate_rejects_shared_partition_number() {
        let mut config = BuildConfig::default();
        config.partitions.loader.number = 1;
        assert!(matches!(
            config.validate(),
            Err(ImageError::DuplicatePartitionNumber { number: 1, .. })
        ));
    }

    #[test]
    fn validate_rejects_missing_inputs() {
        let mut config = BuildConfig::default();
        config.content.images = vec![PathBuf::from("/nonexistent/zImage")];
        assert!(matches!(
            config.validate(),
            Err(ImageError::ValidationError(_))
        ));
    }

    #[test]
    fn only_replace_skips_partitioning() {
        assert!(BuildMode::Create.is_full_build());
        assert!(BuildMode::Overwrite.is_full_build());
        assert!(!BuildMode::Replace.is_full_build());
    }
}
