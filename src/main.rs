//! mkdiskimage - partitioned SD-card image builder
//!
//! Plans an MBR layout of a loader, a FAT32 and a rootfs partition, then
//! builds the image through a loop device.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mkdiskimage::cleanup::Cleaner;
use mkdiskimage::config::{BuildConfig, BuildMode, RootfsType};
use mkdiskimage::disk::layouts::{plan_layout, print_layout_summary};
use mkdiskimage::install::{ImageBuilder, SystemHost};
use mkdiskimage::utils::{deps, signal};
use mkdiskimage::ImageError;

#[derive(Parser)]
#[command(name = "mkdiskimage")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Dry run mode - show what would be done without making changes
    #[arg(short = 'n', long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a disk image
    Build(ImageArgs),

    /// Print the partition layout without building anything
    Plan {
        #[command(flatten)]
        image: ImageArgs,

        /// Print the layout as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: PathBuf,
    },

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "mkdiskimage.toml")]
        output: PathBuf,
    },

    /// Release mounts and loop devices left behind by an interrupted build
    Cleanup {
        /// Loop device index used by the build
        #[arg(long, default_value_t = 0)]
        loopdevice: u32,

        /// Directory the build created its mount points in
        #[arg(long, default_value = ".")]
        work_dir: PathBuf,

        /// Detach every loop device on the host
        #[arg(long)]
        all: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

/// Image options; each one given overrides the configuration file
#[derive(Args, Debug, Default)]
struct ImageArgs {
    /// Configuration file to start from
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Preloader binary written to the start of the loader partition
    #[arg(long)]
    preloader: Option<PathBuf>,

    /// Bootloader binary written 256 KiB into the loader partition
    #[arg(long)]
    bootloader: Option<PathBuf>,

    /// Loader partition size in MiB
    #[arg(long, value_name = "MIB")]
    loadersize: Option<u64>,

    /// Loader partition number
    #[arg(long)]
    loadernumber: Option<u8>,

    /// FAT32 partition size in MiB
    #[arg(long, value_name = "MIB")]
    fat32size: Option<u64>,

    /// FAT32 partition number
    #[arg(long)]
    fat32number: Option<u8>,

    /// Rootfs partition size in MiB (0 fills the rest of the image)
    #[arg(long, value_name = "MIB")]
    rootfssize: Option<u64>,

    /// Rootfs partition number
    #[arg(long)]
    rootfsnumber: Option<u8>,

    /// Total image size in MiB
    #[arg(long, value_name = "MIB")]
    imagesize: Option<u64>,

    /// Comma separated files copied into the FAT32 partition
    #[arg(long, value_delimiter = ',')]
    images: Vec<PathBuf>,

    /// Tarball extracted into the rootfs partition
    #[arg(long)]
    rootfsimage: Option<PathBuf>,

    /// Rootfs filesystem
    #[arg(long, value_enum)]
    rootfstype: Option<RootfsType>,

    /// Loop device index (/dev/loopN)
    #[arg(long)]
    loopdevice: Option<u32>,

    /// Output image file
    #[arg(short, long)]
    outfile: Option<PathBuf>,

    /// Sector size of the target device in bytes
    #[arg(long)]
    sector_size: Option<u32>,

    /// Recreate the output file if it exists
    #[arg(long, conflicts_with = "replace")]
    overwrite: bool,

    /// Reformat and repopulate an existing image, keeping its partition table
    #[arg(long)]
    replace: bool,

    /// Directory for the temporary mount points
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Detach every loop device on the host before and after the build
    #[arg(long)]
    detach_all_loops: bool,
}

impl ImageArgs {
    fn into_config(self) -> Result<BuildConfig> {
        let mut config = match &self.config {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                BuildConfig::from_file(path)
                    .with_context(|| format!("Failed to load {}", path.display()))?
            }
            None => BuildConfig::default(),
        };

        let image = &mut config.image;
        if let Some(v) = self.outfile {
            image.output = v;
        }
        if let Some(v) = self.imagesize {
            image.size_mib = v;
        }
        if let Some(v) = self.sector_size {
            image.sector_size = v;
        }
        if self.overwrite {
            image.mode = BuildMode::Overwrite;
        } else if self.replace {
            image.mode = BuildMode::Replace;
        }

        let parts = &mut config.partitions;
        if let Some(v) = self.loadersize {
            parts.loader.size_mib = v;
        }
        if let Some(v) = self.loadernumber {
            parts.loader.number = v;
        }
        if let Some(v) = self.fat32size {
            parts.fat32.size_mib = v;
        }
        if let Some(v) = self.fat32number {
            parts.fat32.number = v;
        }
        if let Some(v) = self.rootfssize {
            parts.rootfs.size_mib = v;
        }
        if let Some(v) = self.rootfsnumber {
            parts.rootfs.number = v;
        }
        if let Some(v) = self.rootfstype {
            parts.rootfs.filesystem = v;
        }

        let content = &mut config.content;
        if self.preloader.is_some() {
            content.preloader = self.preloader;
        }
        if self.bootloader.is_some() {
            content.bootloader = self.bootloader;
        }
        if !self.images.is_empty() {
            content.images = self.images;
        }
        if self.rootfsimage.is_some() {
            content.rootfs_archive = self.rootfsimage;
        }

        if let Some(v) = self.loopdevice {
            config.loopback.index = v;
        }
        if self.detach_all_loops {
            config.loopback.detach_all = true;
        }
        if let Some(v) = self.work_dir {
            config.work_dir = v;
        }

        Ok(config)
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else if quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn require_root(dry_run: bool) -> Result<()> {
    if !dry_run && !nix::unistd::geteuid().is_root() {
        return Err(ImageError::NotRoot.into());
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let dry_run = cli.dry_run;
    if dry_run {
        info!("Running in dry-run mode - no changes will be made");
    }

    let result = match cli.command {
        Commands::Build(args) => cmd_build(args, dry_run, cli.quiet),
        Commands::Plan { image, json } => cmd_plan(image, json),
        Commands::Validate { config } => cmd_validate(&config),
        Commands::GenerateConfig { output } => cmd_generate_config(&output),
        Commands::Cleanup {
            loopdevice,
            work_dir,
            all,
            yes,
        } => cmd_cleanup(loopdevice, &work_dir, all, yes, dry_run),
    };

    // Resources are released by now; let the shell see the signal
    signal::reraise();
    result
}

fn cmd_build(args: ImageArgs, dry_run: bool, quiet: bool) -> Result<()> {
    require_root(dry_run)?;

    let config = args.into_config()?;
    config.validate()?;
    if !dry_run {
        deps::ensure_dependencies(&config)?;
    }

    let request = config.layout_request();
    let (budget, plan) = plan_layout(&request)?;
    if !quiet {
        print_layout_summary(&request, &budget, &plan);
    }

    signal::install_signal_handlers()?;

    let output = config.image.output.clone();
    let host = SystemHost::new(dry_run);
    let mut builder = ImageBuilder::new(config, &host);
    if !quiet && !dry_run {
        let style = ProgressStyle::with_template("{bar:30.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        builder = builder.with_progress(ProgressBar::new(0).with_style(style));
    }

    match builder.run() {
        Ok(report) => {
            if !quiet {
                println!(
                    "{} {} ({} stages, {} MiB slack)",
                    "✓ Image written to".green().bold(),
                    output.display(),
                    report.stages.len(),
                    report.budget.slack_mib
                );
            }
            Ok(())
        }
        Err(e) => {
            if !e.is_pre_destructive() {
                error!(
                    "{} is incomplete and should not be used; run `mkdiskimage cleanup` if anything is left attached",
                    output.display()
                );
            }
            Err(e.into())
        }
    }
}

fn cmd_plan(args: ImageArgs, json: bool) -> Result<()> {
    let config = args.into_config()?;
    let request = config.layout_request();
    let (budget, plan) = plan_layout(&request)?;

    if json {
        let doc = serde_json::json!({ "budget": budget, "plan": plan });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        print_layout_summary(&request, &budget, &plan);
    }
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    let config = BuildConfig::from_file(config_path)?;
    config.validate()?;
    plan_layout(&config.layout_request())?;
    println!("{}", "✓ Configuration is valid".green());
    Ok(())
}

fn cmd_generate_config(output: &Path) -> Result<()> {
    let sample = BuildConfig::sample();
    let content = toml::to_string_pretty(&sample)?;
    std::fs::write(output, content)?;
    println!(
        "{} {}",
        "✓ Sample configuration written to".green(),
        output.display()
    );
    Ok(())
}

fn cmd_cleanup(index: u32, work_dir: &Path, all: bool, yes: bool, dry_run: bool) -> Result<()> {
    require_root(dry_run)?;

    let cleaner = Cleaner::new(dry_run);
    cleaner.cleanup(index, work_dir, all, yes)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_mirror_classic_options() {
        let cli = Cli::try_parse_from([
            "mkdiskimage",
            "build",
            "--imagesize",
            "512",
            "--images",
            "zImage,socfpga.dtb",
            "--rootfstype",
            "ext4",
            "--loopdevice",
            "7",
            "--replace",
        ])
        .unwrap();

        let Commands::Build(args) = cli.command else {
            panic!("expected build");
        };
        let config = args.into_config().unwrap();
        assert_eq!(config.image.size_mib, 512);
        assert_eq!(config.image.mode, BuildMode::Replace);
        assert_eq!(config.partitions.rootfs.filesystem, RootfsType::Ext4);
        assert_eq!(config.loopback.index, 7);
        assert_eq!(
            config.content.images,
            vec![PathBuf::from("zImage"), PathBuf::from("socfpga.dtb")]
        );
    }

    #[test]
    fn overwrite_and_replace_conflict() {
        assert!(Cli::try_parse_from(["mkdiskimage", "build", "--overwrite", "--replace"]).is_err());
        assert!(Cli::try_parse_from(["mkdiskimage", "-v", "-q", "plan"]).is_err());
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("board.toml");
        std::fs::write(&path, "[image]\nsize_mib = 1024\n[partitions.fat32]\nnumber = 1\nsize_mib = 64\n").unwrap();

        let args = ImageArgs {
            config: Some(path),
            fat32size: Some(32),
            ..Default::default()
        };
        let config = args.into_config().unwrap();
        assert_eq!(config.image.size_mib, 1024);
        assert_eq!(config.partitions.fat32.size_mib, 32);
    }
}
