//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `build` - Build artifacts from the box root
//! - `configure` - Configure and clean an existing root
//! - `release` - Upgrade bundle and dist collection
//! - `convert` - Export a raw disk with qemu-img
//! - `clean` - Workspace setup and cleanup
//! - `show` - Display information
//! - `preflight` - Run preflight checks

pub mod build;
pub mod clean;
mod configure;
mod convert;
mod preflight;
mod release;
pub mod show;

pub use build::cmd_build;
pub use clean::{cmd_clean, cmd_setup};
pub use configure::{cmd_cleanup, cmd_configure};
pub use convert::cmd_convert;
pub use preflight::cmd_preflight;
pub use release::{cmd_dist, cmd_upgrade};
pub use show::cmd_show;
