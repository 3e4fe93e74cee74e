//! Image assembly orchestration

mod builder;
pub mod content;
mod host;
pub mod mounts;

pub use builder::*;
pub use content::expand_home;
pub use host::{ImageHost, SystemHost};
