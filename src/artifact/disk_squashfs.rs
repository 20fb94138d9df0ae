//! Raw disk with a single ext3 boot partition.
//!
//! # Layout
//!
//! ```text
//! sector 0         MBR (syslinux mbr.bin)
//! sector 64..end   ext3 "boot", bootable
//!                  ├── extlinux.conf, ldlinux.sys
//!                  ├── vmlinuz -> vmlinuz-<version>
//!                  ├── initrd.img -> initrd.img-<version>
//!                  ├── filesystem.squashfs   (the root, without /boot content)
//!                  └── SHA256SUMS
//! ```
//!
//! Partitioning and formatting only happen when the artifact file does not
//! exist yet. Every other step runs on each invocation.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::layout::{write_partition_table, DiskLayout, PartitionTable, LINUX};
use super::{
    boot_link_target, create_sparse_file, hand_over, install_mbr, make_squashfs, touch,
    write_checksums, Assembler, AssemblyOptions,
};
use crate::boot::BootProcess;
use crate::image::{RootImage, RsyncOptions};
use crate::initramfs::InitRamFsConfigurator;
use crate::mount::{with_loop_device, Mount};
use crate::process::{Cmd, Executor};
use crate::timing::Timer;

/// Label of the boot filesystem, looked up by the initramfs and fstab.
pub const FS_LABEL: &str = "boot";

/// Block size the boot filesystem is formatted with.
const BLOCK_SIZE: u64 = 4096;

/// Kernel command line booting the squashfs on the boot partition.
pub const SQUASHFS_APPEND: &str = "ro initrd=/initrd.img boot=local \
root=/boot/filesystem.squashfs rootflags=loop rootfstype=squashfs";

pub struct DiskSquashfsImage {
    file: PathBuf,
    options: AssemblyOptions,
    layout: DiskLayout,
}

impl DiskSquashfsImage {
    pub fn new(file: impl Into<PathBuf>, options: AssemblyOptions) -> Self {
        Self {
            file: file.into(),
            options,
            layout: DiskLayout::default(),
        }
    }

    pub fn options(&self) -> &AssemblyOptions {
        &self.options
    }

    fn boot_fs(&self, dir: impl Into<PathBuf>) -> Mount {
        Mount::loop_offset(&self.file, self.layout.boot_fs_offset(), dir)
    }

    fn create_file(&self, exec: &dyn Executor) -> Result<()> {
        info!("Creating {} ({} MB)", self.file.display(), self.options.size_mb);
        create_sparse_file(&self.file, self.options.size_bytes())?;
        write_partition_table(
            exec,
            &self.file,
            &self.layout.single_partition_script(LINUX),
        )?;
        self.format_boot_fs(exec)
    }

    fn format_boot_fs(&self, exec: &dyn Executor) -> Result<()> {
        let table = PartitionTable::probe(exec, &self.file)?;
        let blocks = table.find(LINUX)?.blocks(BLOCK_SIZE);
        with_loop_device(exec, &self.file, self.layout.boot_fs_offset(), |device| {
            exec.execute(
                &Cmd::new("mke2fs")
                    .args(["-L", FS_LABEL, "-jqF", "-b"])
                    .arg(BLOCK_SIZE.to_string())
                    .arg(device)
                    .arg(blocks.to_string())
                    .privileged()
                    .error_msg("Failed to format boot filesystem"),
            )?;
            Ok(())
        })
    }

    fn sync_boot_fs(&self, boot: &BootProcess, exec: &Arc<dyn Executor>) -> Result<()> {
        let root = boot.root();
        let initrd = boot_link_target(root, "initrd.img");
        let vmlinuz = boot_link_target(root, "vmlinuz");
        let source = format!("{}/", root.join("boot").display());

        self.boot_fs(self.options.boot_mount_dir())
            .scoped(exec.as_ref(), boot.unmount_policy(), |dir| {
                let image = RootImage::new(dir, exec.clone());
                image.rsync("/", &[&source], &RsyncOptions::mirror())?;
                for (target, link) in [(&initrd, "initrd.img"), (&vmlinuz, "vmlinuz")] {
                    // Not a link in the root: the synced file already has its name
                    if target != link {
                        image.symlink(target, link)?;
                    }
                }
                Ok(())
            })
    }

    fn install_extlinux_files(&self, boot: &BootProcess, exec: &Arc<dyn Executor>) -> Result<()> {
        let config = extlinux_config(&self.options.version);
        self.boot_fs(self.options.boot_mount_dir())
            .scoped(exec.as_ref(), boot.unmount_policy(), |dir| {
                RootImage::new(dir, exec.clone()).write("/extlinux.conf", &config)
            })
    }

    fn compress_root_fs(&self, boot: &BootProcess, exec: &Arc<dyn Executor>) -> Result<()> {
        let squashfs = self.options.squashfs_file();
        make_squashfs(exec.as_ref(), boot.root(), &squashfs, boot.target().release)?;
        hand_over(exec.as_ref(), &squashfs, self.options.owner.as_deref())?;

        self.boot_fs(self.options.boot_mount_dir())
            .scoped(exec.as_ref(), boot.unmount_policy(), |dir| {
                RootImage::new(dir, exec.clone()).install("/filesystem.squashfs", &[&squashfs])
            })
    }

    /// extlinux installs from inside the root, with the boot filesystem
    /// mounted on its /boot.
    fn install_extlinux(&self, boot: &BootProcess, exec: &Arc<dyn Executor>) -> Result<()> {
        self.boot_fs(boot.root().join("boot"))
            .scoped(exec.as_ref(), boot.unmount_policy(), |_| {
                boot.chroot(|chroot| {
                    chroot.sh("extlinux --install /boot")?;
                    Ok(())
                })
            })?;
        install_mbr(exec.as_ref(), boot.root(), &self.file)
    }

    fn write_checksums(&self, boot: &BootProcess, exec: &Arc<dyn Executor>) -> Result<()> {
        self.boot_fs(self.options.boot_mount_dir())
            .scoped(exec.as_ref(), boot.unmount_policy(), |dir| {
                write_checksums(exec.as_ref(), dir)
            })
    }
}

/// extlinux.conf booting the squashfs root.
pub fn extlinux_config(version: &str) -> String {
    format!(
        "DEFAULT linux\n\
         LABEL linux\n\
         SAY Now booting {} from syslinux ...\n\
         KERNEL /vmlinuz\n\
         APPEND {}\n",
        version, SQUASHFS_APPEND
    )
}

impl Assembler for DiskSquashfsImage {
    fn file(&self) -> &Path {
        &self.file
    }

    fn create(&mut self, boot: &mut BootProcess) -> Result<()> {
        boot.ensure_configurator(InitRamFsConfigurator);
        boot.create(false)?;

        let timer = Timer::start("disk image");
        let exec = boot.image().executor().clone();

        if !self.file.exists() {
            if let Err(e) = self.create_file(exec.as_ref()) {
                // Leave no half-partitioned file behind: its existence
                // means the structural steps are done.
                if let Err(remove) = fs::remove_file(&self.file) {
                    warn!("Could not remove {}: {}", self.file.display(), remove);
                }
                return Err(e);
            }
        }

        self.sync_boot_fs(boot, &exec)?;
        self.install_extlinux_files(boot, &exec)?;
        self.compress_root_fs(boot, &exec)?;
        boot.record_squashfs(&self.options.squashfs_file());
        self.install_extlinux(boot, &exec)?;
        self.write_checksums(boot, &exec)?;
        touch(&self.file)?;

        timer.finish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extlinux_boots_squashfs_by_label() {
        let config = extlinux_config("202401010000");
        assert_eq!(
            config,
            "DEFAULT linux\nLABEL linux\nSAY Now booting 202401010000 from syslinux ...\n\
             KERNEL /vmlinuz\nAPPEND ro initrd=/initrd.img boot=local \
             root=/boot/filesystem.squashfs rootflags=loop rootfstype=squashfs\n"
        );
    }
}
