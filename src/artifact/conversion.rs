//! Raw disk export to other formats.

use anyhow::Result;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::process::{Cmd, Executor};

/// True when `export` exists and is not older than `source`.
pub fn is_up_to_date(export: &Path, source: &Path) -> bool {
    let modified = |p: &Path| fs::metadata(p).and_then(|m| m.modified()).ok();
    match (modified(export), modified(source)) {
        (Some(export), Some(source)) => export >= source,
        _ => false,
    }
}

/// Convert the raw disk `file` to `export` with qemu-img, unless `export`
/// is already up to date. Without `format` qemu-img writes raw.
pub fn convert(
    exec: &dyn Executor,
    file: &Path,
    export: &Path,
    format: Option<&str>,
) -> Result<()> {
    if is_up_to_date(export, file) {
        info!("{} is up to date", export.display());
        return Ok(());
    }

    let mut cmd = Cmd::new("qemu-img").args(["convert", "-f", "raw"]).arg_path(file);
    if let Some(format) = format {
        cmd = cmd.args(["-O", format]);
    }
    exec.execute(
        &cmd.arg_path(export)
            .error_msg(format!("Failed to convert {}", file.display())),
    )?;
    Ok(())
}
