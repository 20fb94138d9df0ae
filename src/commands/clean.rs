//! Clean and setup commands - manage the build workspace.

use anyhow::Result;

use crate::project::BoxProject;

/// Remove the root, build files and dist content.
pub fn cmd_clean(project: &BoxProject) -> Result<()> {
    println!("Cleaning {}...", project.name());
    project.clean()?;
    println!("Clean complete.");
    Ok(())
}

/// Link build/ and dist/ into WORKING_DIR.
pub fn cmd_setup(project: &BoxProject) -> Result<()> {
    project.setup()
}
