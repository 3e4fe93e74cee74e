//! Error types for mkdiskimage

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Must be run as root")]
    NotRoot,

    #[error(
        "Insufficient space: image is {image_mib}MiB but partitions need {requested_mib}MiB \
         plus {reserved_mib}MiB reserved (slack {slack_mib}MiB)"
    )]
    InsufficientSpace {
        image_mib: u64,
        requested_mib: u64,
        reserved_mib: u64,
        slack_mib: i64,
    },

    #[error("Output file already exists: {0} (use --overwrite or --replace)")]
    OutputExists(String),

    #[error("Output file does not exist: {0} (--replace needs an existing image)")]
    OutputMissing(String),

    #[error("Invalid partition number {number} for {region} partition (must be 1-4)")]
    InvalidPartitionNumber { region: String, number: u8 },

    #[error("Partition number {number} assigned to both {first} and {second}")]
    DuplicatePartitionNumber {
        number: u8,
        first: String,
        second: String,
    },

    #[error("{0} partition has a size of 0MiB")]
    EmptyPartition(String),

    #[error("Invalid sector size {0} (must be 512, 1024, 2048, 4096 or 8192)")]
    InvalidSectorSize(u32),

    #[error("Mount point already exists: {0} (left over from a previous run?)")]
    StaleMountPoint(String),

    #[error("Loop device {device} is already bound to {backing_file}")]
    StaleLoopDevice {
        device: String,
        backing_file: String,
    },

    #[error("Loop device error: {0}")]
    LoopError(String),

    #[error("Partition error: {0}")]
    PartitionError(String),

    #[error("Filesystem error: {0}")]
    FilesystemError(String),

    #[error("Mount error: {0}")]
    MountError(String),

    #[error("Content error: {0}")]
    ContentError(String),

    #[error("Command failed: {command}\n{stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Missing host tools: {0}")]
    MissingDependencies(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("User cancelled operation")]
    UserCancelled,

    #[error("Interrupted by signal")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Nix error: {0}")]
    Nix(#[from] nix::Error),
}

impl ImageError {
    /// Errors raised before any file or device has been touched.
    pub fn is_pre_destructive(&self) -> bool {
        matches!(
            self,
            Self::InsufficientSpace { .. }
                | Self::OutputExists(_)
                | Self::OutputMissing(_)
                | Self::InvalidPartitionNumber { .. }
                | Self::DuplicatePartitionNumber { .. }
                | Self::EmptyPartition(_)
                | Self::InvalidSectorSize(_)
                | Self::ValidationError(_)
                | Self::ConfigError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ImageError>;
