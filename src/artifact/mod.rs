//! Bootable artifacts assembled from a configured root.
//!
//! - `disk_squashfs` - raw disk, one ext3 boot partition holding the kernel
//!   and a squashfs of the root (extlinux)
//! - `disk` - raw disk, FAT32 boot partition and ext3 root partition (syslinux)
//! - `live` - raw disk, FAT32 partition with a live-boot squashfs
//! - `iso` - ISO images, plain or with the squashfs root
//! - `conversion` - qemu-img export of raw disks
//!
//! Every assembler first runs `BootProcess::create()`, so building an
//! artifact always starts from a bootstrapped, configured and cleaned root.

pub mod conversion;
pub mod disk;
pub mod disk_squashfs;
pub mod iso;
pub mod layout;
pub mod live;
pub mod squashfs;

pub use conversion::convert;
pub use disk::DiskImage;
pub use disk_squashfs::DiskSquashfsImage;
pub use iso::{IsoImage, IsoSquashfsImage};
pub use layout::{DiskLayout, PartitionTable};
pub use live::LiveImage;
pub use squashfs::make_squashfs;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::boot::BootProcess;
use crate::process::{find_first_existing, Cmd, Executor};

/// Default size of raw disk artifacts.
pub const DEFAULT_SIZE_MB: u64 = 512;

/// Name of the checksum file written into boot filesystems.
pub const CHECKSUMS_FILE: &str = "SHA256SUMS";

/// Produces one artifact file from a boot process.
pub trait Assembler {
    /// Artifact written by [`create`](Self::create).
    fn file(&self) -> &Path;

    fn create(&mut self, boot: &mut BootProcess) -> Result<()>;
}

/// Settings shared by all assemblers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyOptions {
    /// Scratch directory: mount points and the squashfs blob.
    pub build_dir: PathBuf,
    pub size_mb: u64,
    /// Owner given to generated files (sudo-created files belong to root).
    pub owner: Option<String>,
    /// Shown by the bootloader.
    pub version: String,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            build_dir: PathBuf::from("build"),
            size_mb: DEFAULT_SIZE_MB,
            owner: None,
            version: chrono::Local::now().format("%Y%m%d%H%M").to_string(),
        }
    }
}

impl AssemblyOptions {
    pub fn squashfs_file(&self) -> PathBuf {
        self.build_dir.join("filesystem.squashfs")
    }

    pub fn boot_mount_dir(&self) -> PathBuf {
        self.build_dir.join("mount_boot_fs")
    }

    pub fn root_mount_dir(&self) -> PathBuf {
        self.build_dir.join("mount_root_fs")
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_mb * 1024 * 1024
    }
}

/// File name the root's `name` symlink (`vmlinuz`, `initrd.img`) points to.
///
/// Only the basename is kept, whether the link is relative
/// (`boot/vmlinuz-6.1.0-18-amd64`) or absolute inside the chroot
/// (`/boot/vmlinuz-6.1.0-18-amd64`). Falls back to `name` when it is not a
/// symlink.
pub fn boot_link_target(root: &Path, name: &str) -> String {
    fs::read_link(root.join(name))
        .ok()
        .and_then(|target| target.file_name().map(|f| f.to_string_lossy().into_owned()))
        .unwrap_or_else(|| name.to_string())
}

/// Create `file` as a sparse file of `size` bytes.
pub fn create_sparse_file(file: &Path, size: u64) -> Result<()> {
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent)?;
    }
    let handle = fs::File::create(file)
        .with_context(|| format!("Failed to create {}", file.display()))?;
    handle.set_len(size)?;
    Ok(())
}

/// Bump the modification time of `file`, so conversions see it changed.
pub fn touch(file: &Path) -> Result<()> {
    let handle = fs::OpenOptions::new()
        .write(true)
        .open(file)
        .with_context(|| format!("Failed to open {}", file.display()))?;
    handle.set_modified(SystemTime::now())?;
    Ok(())
}

/// Give a file created through sudo back to `owner` and make it readable.
pub fn hand_over(exec: &dyn Executor, file: &Path, owner: Option<&str>) -> Result<()> {
    if let Some(owner) = owner {
        exec.execute(&Cmd::new("chown").arg(owner).arg_path(file).privileged())?;
    }
    exec.execute(&Cmd::new("chmod").arg("+r").arg_path(file).privileged())?;
    Ok(())
}

/// Write `SHA256SUMS` for every file below `dir`.
pub fn write_checksums(exec: &dyn Executor, dir: &Path) -> Result<()> {
    let script = format!(
        "cd {} && find . -type f ! -name {name} -exec sha256sum {{}} + > {name}",
        dir.display(),
        name = CHECKSUMS_FILE
    );
    exec.execute(&Cmd::shell(script).privileged())?;
    Ok(())
}

/// Locate a syslinux file, in the root first and then on the host.
pub fn find_syslinux_file(root: &Path, relative_candidates: &[&str]) -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = relative_candidates
        .iter()
        .map(|c| root.join(c.trim_start_matches('/')))
        .collect();
    candidates.extend(relative_candidates.iter().map(PathBuf::from));
    find_first_existing(&candidates).cloned().with_context(|| {
        format!(
            "None of {} found in {} or on the host. Install syslinux.",
            relative_candidates.join(", "),
            root.display()
        )
    })
}

/// Master boot record locations across syslinux versions.
pub const MBR_CANDIDATES: [&str; 3] = [
    "/usr/lib/syslinux/mbr/mbr.bin",
    "/usr/lib/syslinux/mbr.bin",
    "/usr/share/syslinux/mbr.bin",
];

/// Copy the syslinux master boot record into the first sector of `file`.
pub fn install_mbr(exec: &dyn Executor, root: &Path, file: &Path) -> Result<()> {
    let mbr = find_syslinux_file(root, &MBR_CANDIDATES)?;
    exec.execute(
        &Cmd::new("dd")
            .arg(format!("if={}", mbr.display()))
            .arg(format!("of={}", file.display()))
            .args(["conv=notrunc", "bs=440", "count=1"]),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::RecordingExecutor;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn relative_boot_link() {
        let dir = TempDir::new().unwrap();
        symlink("boot/vmlinuz-6.1.0-18-amd64", dir.path().join("vmlinuz")).unwrap();
        assert_eq!(boot_link_target(dir.path(), "vmlinuz"), "vmlinuz-6.1.0-18-amd64");
    }

    #[test]
    fn absolute_boot_link_is_resolved_to_basename() {
        let dir = TempDir::new().unwrap();
        symlink("/boot/initrd.img-2.6.26-2-686", dir.path().join("initrd.img")).unwrap();
        assert_eq!(
            boot_link_target(dir.path(), "initrd.img"),
            "initrd.img-2.6.26-2-686"
        );
    }

    #[test]
    fn missing_boot_link_falls_back_to_name() {
        let dir = TempDir::new().unwrap();
        assert_eq!(boot_link_target(dir.path(), "vmlinuz"), "vmlinuz");
    }

    #[test]
    fn sparse_file_has_requested_size() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("dist/disk");
        create_sparse_file(&file, 4 * 1024 * 1024).unwrap();
        assert_eq!(fs::metadata(&file).unwrap().len(), 4 * 1024 * 1024);
    }

    #[test]
    fn mbr_is_looked_up_in_root_first() {
        let dir = TempDir::new().unwrap();
        let mbr = dir.path().join("usr/lib/syslinux/mbr/mbr.bin");
        fs::create_dir_all(mbr.parent().unwrap()).unwrap();
        fs::write(&mbr, [0u8; 440]).unwrap();

        let exec = RecordingExecutor::new();
        install_mbr(&exec, dir.path(), Path::new("dist/disk")).unwrap();
        assert_eq!(
            exec.commands(),
            vec![format!(
                "dd if={} of=dist/disk conv=notrunc bs=440 count=1",
                mbr.display()
            )]
        );
    }

    #[test]
    fn checksums_skip_their_own_file() {
        let exec = RecordingExecutor::new();
        write_checksums(&exec, Path::new("/tmp/boot")).unwrap();
        assert_eq!(
            exec.commands(),
            vec![
                "sh -c cd /tmp/boot && find . -type f ! -name SHA256SUMS \
                 -exec sha256sum {} + > SHA256SUMS"
            ]
        );
    }
}
