//! Read-only FAT16 filesystem module

pub mod fat16;
pub mod files;
