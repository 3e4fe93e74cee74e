//! Disk image modules

pub mod formatting;
pub mod image;
pub mod layouts;
pub mod loopback;
pub mod partitioning;
