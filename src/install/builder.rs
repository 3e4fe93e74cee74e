//! Image build orchestrator
//!
//! Runs one build as a fixed sequence of stages. Every loop attachment,
//! mount point and mount is held by a guard: the success path releases it
//! explicitly and reports failures, any early return drops it and the drop
//! releases it best-effort, newest first.

use crate::config::BuildConfig;
use crate::disk::image::{RawSlot, BOOTLOADER_SLOT, PRELOADER_SLOT};
use crate::disk::layouts::{plan_layout, PartitionPlan, Region, SizeBudget};
use crate::disk::loopback::partition_path;
use crate::install::content::expand_home;
use crate::install::host::ImageHost;
use crate::install::mounts::MountPoints;
use crate::utils::error::{ImageError, Result};
use indicatif::ProgressBar;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Stages of a build, in the order they are reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    SizeValidated,
    ImageFileReady,
    LoopbackAttached,
    PartitionTableWritten,
    LoopbackReattached,
    FilesystemsCreated,
    LoaderInstalled,
    BootloaderInstalled,
    MountPointsReady,
    Mounted,
    ContentInstalled,
    Unmounted,
    MountPointsRemoved,
    LoopbackDetached,
}

impl std::fmt::Display for BuildStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SizeValidated => "partition sizes validated",
            Self::ImageFileReady => "image file ready",
            Self::LoopbackAttached => "loop device attached",
            Self::PartitionTableWritten => "partition table written",
            Self::LoopbackReattached => "loop device re-attached",
            Self::FilesystemsCreated => "filesystems created",
            Self::LoaderInstalled => "preloader installed",
            Self::BootloaderInstalled => "bootloader installed",
            Self::MountPointsReady => "mount points created",
            Self::Mounted => "partitions mounted",
            Self::ContentInstalled => "content installed",
            Self::Unmounted => "partitions unmounted",
            Self::MountPointsRemoved => "mount points removed",
            Self::LoopbackDetached => "loop device detached",
        };
        write!(f, "{}", s)
    }
}

/// What a finished build did
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub budget: SizeBudget,
    pub plan: PartitionPlan,
    pub stages: Vec<BuildStage>,
}

// ==================== RESOURCE GUARDS ====================

/// An attached loop device
struct LoopAttachment<'h, H: ImageHost + ?Sized> {
    host: &'h H,
    device: String,
    detach_all: bool,
    armed: bool,
}

impl<'h, H: ImageHost + ?Sized> LoopAttachment<'h, H> {
    fn attach(host: &'h H, image: &Path, index: u32, detach_all: bool) -> Result<Self> {
        let device = host.attach_loop(image, index)?;
        Ok(Self {
            host,
            device,
            detach_all,
            armed: true,
        })
    }

    fn detach(&self) -> Result<()> {
        if self.detach_all {
            self.host.detach_all_loops()
        } else {
            self.host.detach_loop(&self.device)
        }
    }

    fn release(mut self) -> Result<()> {
        self.armed = false;
        self.detach()
    }
}

impl<H: ImageHost + ?Sized> Drop for LoopAttachment<'_, H> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Cleanup: detaching {}", self.device);
            if let Err(e) = self.detach() {
                warn!("Cleanup: could not detach {}: {}", self.device, e);
            }
        }
    }
}

/// A mount point directory this build created
struct MountPointDir<'h, H: ImageHost + ?Sized> {
    host: &'h H,
    path: PathBuf,
    armed: bool,
}

impl<'h, H: ImageHost + ?Sized> MountPointDir<'h, H> {
    fn create(host: &'h H, path: &Path) -> Result<Self> {
        host.create_mount_point(path)?;
        Ok(Self {
            host,
            path: path.to_path_buf(),
            armed: true,
        })
    }

    fn release(mut self) -> Result<()> {
        self.armed = false;
        self.host.remove_mount_point(&self.path)
    }
}

impl<H: ImageHost + ?Sized> Drop for MountPointDir<'_, H> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.host.remove_mount_point(&self.path) {
                warn!("Cleanup: could not remove {}: {}", self.path.display(), e);
            }
        }
    }
}

/// A mounted partition
struct MountedFs<'h, H: ImageHost + ?Sized> {
    host: &'h H,
    target: PathBuf,
    armed: bool,
}

impl<'h, H: ImageHost + ?Sized> MountedFs<'h, H> {
    fn mount(host: &'h H, device: &str, target: &Path) -> Result<Self> {
        host.mount(device, target)?;
        Ok(Self {
            host,
            target: target.to_path_buf(),
            armed: true,
        })
    }

    fn release(mut self) -> Result<()> {
        self.armed = false;
        self.host.unmount(&self.target)
    }
}

impl<H: ImageHost + ?Sized> Drop for MountedFs<'_, H> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Cleanup: unmounting {}", self.target.display());
            if let Err(e) = self.host.unmount(&self.target) {
                warn!("Cleanup: could not unmount {}: {}", self.target.display(), e);
            }
        }
    }
}

// ==================== ORCHESTRATOR ====================

/// Builds one disk image on an [`ImageHost`]
pub struct ImageBuilder<'h, H: ImageHost + ?Sized> {
    config: BuildConfig,
    host: &'h H,
    mount_points: MountPoints,
    progress: ProgressBar,
    stages: Vec<BuildStage>,
}

impl<'h, H: ImageHost + ?Sized> ImageBuilder<'h, H> {
    pub fn new(config: BuildConfig, host: &'h H) -> Self {
        let mount_points = MountPoints::new(&config.work_dir);
        Self {
            config,
            host,
            mount_points,
            progress: ProgressBar::hidden(),
            stages: Vec::new(),
        }
    }

    /// Use these mount points instead of fresh session ones
    pub fn with_mount_points(mut self, mount_points: MountPoints) -> Self {
        self.mount_points = mount_points;
        self
    }

    /// Report stage progress on `progress`
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn mount_points(&self) -> &MountPoints {
        &self.mount_points
    }

    /// Stages this configuration will pass through
    pub fn planned_stages(&self) -> Vec<BuildStage> {
        use BuildStage::*;

        let mut stages = vec![SizeValidated, ImageFileReady, LoopbackAttached];
        if self.config.image.mode.is_full_build() {
            stages.extend([PartitionTableWritten, LoopbackReattached]);
        }
        stages.push(FilesystemsCreated);
        if self.config.content.preloader.is_some() {
            stages.push(LoaderInstalled);
        }
        if self.config.content.bootloader.is_some() {
            stages.push(BootloaderInstalled);
        }
        stages.extend([MountPointsReady, Mounted]);
        if self.has_content() {
            stages.push(ContentInstalled);
        }
        stages.extend([Unmounted, MountPointsRemoved, LoopbackDetached]);
        stages
    }

    fn has_content(&self) -> bool {
        !self.config.content.images.is_empty() || self.config.content.rootfs_archive.is_some()
    }

    fn reached(&mut self, stage: BuildStage) {
        self.stages.push(stage);
        info!(
            "[Stage {}/{}] {}",
            self.stages.len(),
            self.progress.length().unwrap_or(0),
            stage
        );
        self.progress.set_message(stage.to_string());
        self.progress.inc(1);
    }

    /// Run the whole build
    pub fn run(mut self) -> Result<BuildReport> {
        let host = self.host;
        let image = self.config.image.output.clone();
        let index = self.config.loopback.index;
        let detach_all = self.config.loopback.detach_all;

        self.progress.set_length(self.planned_stages().len() as u64);
        info!(
            "Building {} ({} MiB, {} mode)",
            image.display(),
            self.config.image.size_mib,
            self.config.image.mode
        );

        // Nothing is touched until both of these have passed
        let (budget, plan) = plan_layout(&self.config.layout_request())?;
        self.reached(BuildStage::SizeValidated);

        self.prepare_image_file(&image)?;
        self.reached(BuildStage::ImageFileReady);

        if detach_all {
            host.detach_all_loops()?;
        } else {
            host.reclaim_loop(&image, index)?;
        }
        let mut lo = LoopAttachment::attach(host, &image, index, detach_all)?;
        self.reached(BuildStage::LoopbackAttached);

        if self.config.image.mode.is_full_build() {
            host.write_partition_table(&lo.device, &plan)?;
            self.reached(BuildStage::PartitionTableWritten);

            // The partition sub-devices only reflect the new table after a fresh attach
            lo.release()?;
            lo = LoopAttachment::attach(host, &image, index, detach_all)?;
            self.reached(BuildStage::LoopbackReattached);
        }

        let part = |region: Region| -> Result<String> {
            plan.region(region)
                .map(|r| partition_path(&lo.device, r.number))
                .ok_or_else(|| ImageError::PartitionError(format!("No {} partition in plan", region)))
        };
        let fat32_dev = part(Region::Fat32)?;
        let rootfs_dev = part(Region::Rootfs)?;
        let loader_dev = part(Region::Loader)?;

        host.format_fat32(&fat32_dev, self.config.image.sector_size)?;
        host.format_rootfs(&rootfs_dev, self.config.partitions.rootfs.filesystem)?;
        self.reached(BuildStage::FilesystemsCreated);

        if let Some(preloader) = self.config.content.preloader.clone() {
            self.install_loader(&preloader, &loader_dev, PRELOADER_SLOT)?;
            self.reached(BuildStage::LoaderInstalled);
        }
        if let Some(bootloader) = self.config.content.bootloader.clone() {
            self.install_loader(&bootloader, &loader_dev, BOOTLOADER_SLOT)?;
            self.reached(BuildStage::BootloaderInstalled);
        }

        let mount_points = self.mount_points.clone();
        let fat32_dir = MountPointDir::create(host, &mount_points.fat32)?;
        let rootfs_dir = MountPointDir::create(host, &mount_points.rootfs)?;
        self.reached(BuildStage::MountPointsReady);

        let fat32_mnt = MountedFs::mount(host, &fat32_dev, &mount_points.fat32)?;
        let rootfs_mnt = MountedFs::mount(host, &rootfs_dev, &mount_points.rootfs)?;
        self.reached(BuildStage::Mounted);

        if self.has_content() {
            self.install_content(&mount_points)?;
            self.reached(BuildStage::ContentInstalled);
        }

        host.sync()?;
        rootfs_mnt.release()?;
        fat32_mnt.release()?;
        self.reached(BuildStage::Unmounted);

        rootfs_dir.release()?;
        fat32_dir.release()?;
        self.reached(BuildStage::MountPointsRemoved);

        lo.release()?;
        self.reached(BuildStage::LoopbackDetached);

        self.progress.finish_with_message("image complete");
        info!("Image {} built successfully", image.display());

        Ok(BuildReport {
            budget,
            plan,
            stages: self.stages,
        })
    }

    /// Create, recreate or reuse the output file according to the build mode
    fn prepare_image_file(&self, image: &Path) -> Result<()> {
        use crate::config::BuildMode;

        let exists = image.exists();
        match self.config.image.mode {
            BuildMode::Create if exists => {
                Err(ImageError::OutputExists(image.display().to_string()))
            }
            BuildMode::Replace if !exists => {
                Err(ImageError::OutputMissing(image.display().to_string()))
            }
            BuildMode::Replace => {
                info!("Reusing existing image {}", image.display());
                Ok(())
            }
            BuildMode::Create | BuildMode::Overwrite => {
                self.host.create_image(image, self.config.image.size_mib)
            }
        }
    }

    fn install_loader(&self, source: &Path, device: &str, slot: RawSlot) -> Result<()> {
        self.host.write_raw(&expand_home(source), device, slot)
    }

    fn install_content(&self, mount_points: &MountPoints) -> Result<()> {
        for image in &self.config.content.images {
            self.host.copy_file(&expand_home(image), &mount_points.fat32)?;
        }
        if let Some(archive) = &self.config.content.rootfs_archive {
            self.host.extract_archive(&expand_home(archive), &mount_points.rootfs)?;
        }
        Ok(())
    }
}
