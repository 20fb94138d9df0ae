//! Build command - assembles artifacts from the box root.

use anyhow::Result;
use std::time::Instant;

use crate::process::check_interrupted;
use crate::project::{ArtifactKind, BoxProject};
use crate::timing::format_duration;

/// What `build` produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildSelection {
    Artifact(ArtifactKind),
    /// Squashfs disk and ISO, then the upgrade bundle.
    All,
}

/// Artifacts of a full build, in build order.
pub const ALL_ARTIFACTS: [ArtifactKind; 2] =
    [ArtifactKind::DiskSquashfs, ArtifactKind::IsoSquashfs];

/// Execute the build command.
pub fn cmd_build(project: &BoxProject, selection: BuildSelection) -> Result<()> {
    let build_start = Instant::now();
    // One root for every artifact of this run
    let mut boot = project.boot();

    match selection {
        BuildSelection::Artifact(kind) => {
            let file = project.build(kind, &mut boot)?;
            println!("{} ready: {}", kind, file.display());
        }
        BuildSelection::All => {
            println!("=== Full {} Build ===\n", project.release_name());
            for kind in ALL_ARTIFACTS {
                check_interrupted()?;
                let file = project.build(kind, &mut boot)?;
                println!("{} ready: {}", kind, file.display());
            }
            check_interrupted()?;
            let metadata = project.create_upgrade()?;
            println!(
                "upgrade ready: {} ({})",
                project.upgrade_file().display(),
                metadata.name
            );
        }
    }

    println!("\nBuild finished in {}", format_duration(build_start.elapsed()));
    Ok(())
}
