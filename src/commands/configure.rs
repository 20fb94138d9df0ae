//! Configure and cleanup commands - rerun phases on an existing root.

use anyhow::{bail, Result};

use crate::project::BoxProject;

/// Run the configure and clean phases on an already bootstrapped root.
pub fn cmd_configure(project: &BoxProject) -> Result<()> {
    let mut boot = project.boot();
    if !boot.is_bootstrapped() {
        bail!(
            "{} is not bootstrapped. Run 'system-builder build' first.",
            boot.root().display()
        );
    }
    boot.configure()?;
    boot.clean()
}

/// Run the clean phase only.
pub fn cmd_cleanup(project: &BoxProject) -> Result<()> {
    let mut boot = project.boot();
    if !boot.is_bootstrapped() {
        bail!("{} is not bootstrapped", boot.root().display());
    }
    boot.clean()
}
