//! Preflight command - runs preflight checks.

use anyhow::Result;

use crate::preflight;
use crate::project::BoxProject;

/// Execute the preflight command.
pub fn cmd_preflight(project: &BoxProject, strict: bool) -> Result<()> {
    let manifest = project.manifest();
    if strict {
        preflight::run_preflight_or_fail(&manifest)?;
    } else {
        let report = preflight::run_preflight(&manifest);
        report.print();
        if !report.all_passed() {
            println!("Some checks failed. Use --strict to fail the build.");
        }
    }
    Ok(())
}
