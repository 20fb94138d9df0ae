//! Squashfs blob of the configured root.

use anyhow::Result;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::process::{Cmd, Executor};
use crate::target::Release;

/// Compress `root` into `output`.
///
/// The content of `/boot` is left out but the directory itself is kept, as
/// the running system mounts its boot partition there.
pub fn make_squashfs(
    exec: &dyn Executor,
    root: &Path,
    output: &Path,
    release: Release,
) -> Result<()> {
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    info!("Compressing {} into {}", root.display(), output.display());

    let mut cmd = Cmd::new("mksquashfs")
        .arg(format!("{}/", root.display()))
        .arg_path(output)
        .args(["-noappend", "-no-progress"]);
    if let Some(compression) = release.squashfs_compression() {
        cmd = cmd.args(["-comp", compression]);
    }
    cmd = cmd
        .args(["-wildcards", "-e", "boot/*"])
        .privileged()
        .error_msg("mksquashfs failed");
    exec.execute(&cmd)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::RecordingExecutor;

    #[test]
    fn excludes_boot_content() {
        let exec = RecordingExecutor::new();
        make_squashfs(
            &exec,
            Path::new("build/root"),
            Path::new("build/filesystem.squashfs"),
            Release::Bookworm,
        )
        .unwrap();
        assert_eq!(
            exec.commands(),
            vec![
                "mksquashfs build/root/ build/filesystem.squashfs -noappend -no-progress \
                 -comp xz -wildcards -e boot/*"
            ]
        );
    }

    #[test]
    fn old_releases_keep_default_compression() {
        let exec = RecordingExecutor::new();
        make_squashfs(
            &exec,
            Path::new("build/root"),
            Path::new("build/filesystem.squashfs"),
            Release::Lenny,
        )
        .unwrap();
        assert!(!exec.commands()[0].contains("-comp"));
    }
}
