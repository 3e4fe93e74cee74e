//! Build configuration

mod build;

pub use build::*;
