//! Convert command - exports a raw disk with qemu-img.

use anyhow::{bail, Result};
use std::path::PathBuf;

use crate::artifact::convert;
use crate::process::ensure_exists;
use crate::project::{ArtifactKind, BoxProject};

/// Convert the raw `kind` disk to `format`, next to it unless `output` is
/// given.
pub fn cmd_convert(
    project: &BoxProject,
    kind: ArtifactKind,
    format: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    if !kind.is_disk() {
        bail!("{} is not a raw disk", kind);
    }
    let file = project.artifact_file(kind);
    ensure_exists(&file, &format!("{} image", kind))?;
    let export = output.unwrap_or_else(|| file.with_extension(format));
    convert(project.executor().as_ref(), &file, &export, Some(format))?;
    println!("{} exported to {}", kind, export.display());
    Ok(())
}
