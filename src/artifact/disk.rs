//! Raw disk with a FAT32 boot partition and an ext3 root partition, booted
//! by syslinux.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::layout::{write_partition_table, DiskLayout, PartitionTable, FAT32_LBA, LINUX};
use super::{
    boot_link_target, create_sparse_file, install_mbr, touch, Assembler, AssemblyOptions,
};
use crate::boot::BootProcess;
use crate::image::{RootImage, RsyncOptions};
use crate::mount::{with_loop_device, Mount};
use crate::process::{Cmd, Executor};
use crate::timing::Timer;

pub const BOOT_FS_LABEL: &str = "boot";
pub const ROOT_FS_LABEL: &str = "root";

pub struct DiskImage {
    file: PathBuf,
    options: AssemblyOptions,
    layout: DiskLayout,
}

impl DiskImage {
    pub fn new(file: impl Into<PathBuf>, options: AssemblyOptions) -> Self {
        Self {
            file: file.into(),
            options,
            layout: DiskLayout::default(),
        }
    }

    fn create_file(&self, exec: &dyn Executor) -> Result<()> {
        info!("Creating {} ({} MB)", self.file.display(), self.options.size_mb);
        create_sparse_file(&self.file, self.options.size_bytes())?;
        write_partition_table(exec, &self.file, &self.layout.boot_and_root_script())?;

        let table = PartitionTable::probe(exec, &self.file)?;
        // mkdosfs counts 1k blocks
        let boot_blocks = table.find(FAT32_LBA)?.blocks(1024);
        let root_blocks = table.find(LINUX)?.blocks(4096);

        with_loop_device(exec, &self.file, self.layout.boot_fs_offset(), |device| {
            exec.execute(
                &Cmd::new("mkdosfs")
                    .args(["-v", "-F", "32", "-n", BOOT_FS_LABEL])
                    .arg(device)
                    .arg(boot_blocks.to_string())
                    .privileged()
                    .error_msg("Failed to format boot filesystem"),
            )?;
            Ok(())
        })?;
        with_loop_device(exec, &self.file, self.layout.root_fs_offset(), |device| {
            exec.execute(
                &Cmd::new("mke2fs")
                    .args(["-L", ROOT_FS_LABEL, "-jqF", "-b", "4096"])
                    .arg(device)
                    .arg(root_blocks.to_string())
                    .privileged()
                    .error_msg("Failed to format root filesystem"),
            )?;
            Ok(())
        })
    }

    /// syslinux.cfg in the root's /boot, synced to the boot partition with
    /// the kernel.
    fn install_syslinux_files(&self, boot: &BootProcess) -> Result<()> {
        let config = syslinux_config(
            &boot_link_target(boot.root(), "vmlinuz"),
            &boot_link_target(boot.root(), "initrd.img"),
            &format!("LABEL={}", ROOT_FS_LABEL),
        );
        boot.image().mkdir("/boot")?;
        boot.image().write("/boot/syslinux.cfg", &config)
    }

    fn sync_boot_fs(&self, boot: &BootProcess, exec: &Arc<dyn Executor>) -> Result<()> {
        let source = format!("{}/", boot.root().join("boot").display());
        Mount::loop_offset(&self.file, self.layout.boot_fs_offset(), self.options.boot_mount_dir())
            .scoped(exec.as_ref(), boot.unmount_policy(), |dir| {
                RootImage::new(dir, exec.clone()).rsync("/", &[&source], &RsyncOptions::mirror())
            })
    }

    fn sync_root_fs(&self, boot: &BootProcess, exec: &Arc<dyn Executor>) -> Result<()> {
        let source = format!("{}/", boot.root().display());
        Mount::loop_offset(&self.file, self.layout.root_fs_offset(), self.options.root_mount_dir())
            .scoped(exec.as_ref(), boot.unmount_policy(), |dir| {
                RootImage::new(dir, exec.clone()).rsync(
                    "/",
                    &[&source],
                    &RsyncOptions::mirror().exclude("boot/**"),
                )
            })
    }

    fn install_syslinux(&self, boot: &BootProcess, exec: &dyn Executor) -> Result<()> {
        exec.execute(
            &Cmd::new("syslinux")
                .arg("--offset")
                .arg(self.layout.boot_fs_offset().to_string())
                .arg("--install")
                .arg_path(&self.file)
                .error_msg("syslinux failed"),
        )?;
        install_mbr(exec, boot.root(), &self.file)
    }
}

/// syslinux.cfg booting a kernel from the boot partition with `root`.
pub fn syslinux_config(kernel: &str, initrd: &str, root: &str) -> String {
    format!(
        "default linux\nlabel linux\nkernel {}\nappend ro root={} initrd={}\n",
        kernel, root, initrd
    )
}

impl Assembler for DiskImage {
    fn file(&self) -> &Path {
        &self.file
    }

    fn create(&mut self, boot: &mut BootProcess) -> Result<()> {
        boot.create(false)?;

        let timer = Timer::start("disk image");
        let exec = boot.image().executor().clone();

        if !self.file.exists() {
            if let Err(e) = self.create_file(exec.as_ref()) {
                if let Err(remove) = fs::remove_file(&self.file) {
                    warn!("Could not remove {}: {}", self.file.display(), remove);
                }
                return Err(e);
            }
        }

        self.install_syslinux_files(boot)?;
        self.sync_boot_fs(boot, &exec)?;
        self.sync_root_fs(boot, &exec)?;
        self.install_syslinux(boot, exec.as_ref())?;
        touch(&self.file)?;

        timer.finish();
        Ok(())
    }
}
