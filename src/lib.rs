//! mkdiskimage library - partitioned SD-card image assembly

pub mod cleanup;
pub mod config;
pub mod disk;
pub mod install;
pub mod utils;

pub use config::BuildConfig;
pub use utils::error::ImageError;
