//! Show command - displays information.

use anyhow::Result;

use crate::project::{ArtifactKind, BoxProject};
use crate::release::ReleaseMetadata;

/// Show target for the show command.
pub enum ShowTarget {
    /// Show configuration
    Config,
    /// Show root, artifacts and last release
    Status,
}

/// Execute the show command.
pub fn cmd_show(project: &BoxProject, target: ShowTarget) -> Result<()> {
    match target {
        ShowTarget::Config => {
            project.config().print();
            println!();
            let target = project.target();
            println!("Box:          {}", project.name());
            println!("Release:      {} ({})", target.release, target.architecture);
            println!("Mirror:       {}", target.debootstrap_url());
            println!("Manifest:     {}", project.manifest().display());
        }
        ShowTarget::Status => {
            let boot = project.boot();
            println!("Root:         {}", project.root_dir().display());
            println!(
                "              {}",
                if boot.is_bootstrapped() {
                    "bootstrapped"
                } else {
                    "not bootstrapped"
                }
            );
            println!();
            for kind in ArtifactKind::ALL {
                let file = project.artifact_file(kind);
                let mark = if file.exists() { "✓" } else { "-" };
                println!("  {} {:<14} {}", mark, kind.name(), file.display());
            }
            println!();
            match ReleaseMetadata::read(&project.latest_file()) {
                Ok(latest) => {
                    println!("Latest release: {} ({})", latest.name, latest.status_updated_at)
                }
                Err(_) => println!("Latest release: none"),
            }
        }
    }
    Ok(())
}
