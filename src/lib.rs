//! system-builder library exports.
//!
//! The binary and the integration tests under `tests/` both build on these
//! modules.

pub mod artifact;
pub mod boot;
pub mod chroot;
pub mod commands;
pub mod config;
pub mod error;
pub mod image;
pub mod initramfs;
pub mod mount;
pub mod preflight;
pub mod process;
pub mod project;
pub mod provision;
pub mod release;
pub mod target;
pub mod timing;
