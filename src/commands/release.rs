//! Upgrade and dist commands.

use anyhow::Result;
use std::path::PathBuf;

use crate::project::BoxProject;

pub fn cmd_upgrade(project: &BoxProject) -> Result<()> {
    let metadata = project.create_upgrade()?;
    println!("Upgrade bundle: {}", project.upgrade_file().display());
    println!("Release:        {}", metadata.name);
    println!("Checksum:       {}", metadata.checksum);
    println!("Metadata:       {}", project.latest_file().display());
    Ok(())
}

/// Collect the release artifacts into `target` (default: DIST).
pub fn cmd_dist(project: &BoxProject, target: Option<PathBuf>) -> Result<()> {
    let target = match target {
        Some(target) => target,
        None => project.dist_target()?,
    };
    let collected = project.collect_dist(&target)?;
    println!("Collected into {}:", target.display());
    for file in collected {
        println!("  {}", file.display());
    }
    Ok(())
}
