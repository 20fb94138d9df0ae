//! Raw disk booting with live-boot: one FAT32 partition holding the kernel,
//! initrd and root squashfs under `/live`.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::layout::{write_partition_table, DiskLayout, PartitionTable, FAT32_LBA};
use super::{
    boot_link_target, create_sparse_file, install_mbr, make_squashfs, touch, Assembler,
    AssemblyOptions,
};
use crate::boot::{AdHocConfigurator, BootProcess};
use crate::chroot::AptInstallOptions;
use crate::image::{RootImage, RsyncOptions};
use crate::mount::{with_loop_device, Mount};
use crate::process::{Cmd, Executor};
use crate::timing::Timer;

pub const LIVE_BOOT_CONFIGURATOR: &str = "live-boot";

pub struct LiveImage {
    file: PathBuf,
    options: AssemblyOptions,
    layout: DiskLayout,
}

impl LiveImage {
    pub fn new(file: impl Into<PathBuf>, options: AssemblyOptions) -> Self {
        Self {
            file: file.into(),
            options,
            layout: DiskLayout::default(),
        }
    }

    fn boot_fs(&self) -> Mount {
        Mount::loop_offset(
            &self.file,
            self.layout.boot_fs_offset(),
            self.options.boot_mount_dir(),
        )
    }

    fn create_file(&self, exec: &dyn Executor) -> Result<()> {
        info!("Creating {} ({} MB)", self.file.display(), self.options.size_mb);
        create_sparse_file(&self.file, self.options.size_bytes())?;
        write_partition_table(
            exec,
            &self.file,
            &self.layout.single_partition_script(FAT32_LBA),
        )?;

        let blocks = PartitionTable::probe(exec, &self.file)?
            .find(FAT32_LBA)?
            .blocks(1024);
        with_loop_device(exec, &self.file, self.layout.boot_fs_offset(), |device| {
            exec.execute(
                &Cmd::new("mkdosfs")
                    .args(["-v", "-F", "32", "-n", "live"])
                    .arg(device)
                    .arg(blocks.to_string())
                    .privileged()
                    .error_msg("Failed to format live filesystem"),
            )?;
            Ok(())
        })
    }

    fn install_syslinux_files(&self, boot: &BootProcess, exec: &Arc<dyn Executor>) -> Result<()> {
        let config = live_syslinux_config(
            &boot_link_target(boot.root(), "vmlinuz"),
            &boot_link_target(boot.root(), "initrd.img"),
        );
        self.boot_fs()
            .scoped(exec.as_ref(), boot.unmount_policy(), |dir| {
                RootImage::new(dir, exec.clone()).write("/syslinux.cfg", &config)
            })
    }

    fn sync_boot_fs(&self, boot: &BootProcess, exec: &Arc<dyn Executor>) -> Result<()> {
        let source = format!("{}/", boot.root().join("boot").display());
        self.boot_fs()
            .scoped(exec.as_ref(), boot.unmount_policy(), |dir| {
                let image = RootImage::new(dir, exec.clone());
                image.mkdir("/live")?;
                image.rsync("/live", &[&source], &RsyncOptions::mirror())
            })
    }

    /// The squashfs is written straight into the mounted partition.
    fn compress_root_fs(&self, boot: &BootProcess, exec: &Arc<dyn Executor>) -> Result<()> {
        self.boot_fs()
            .scoped(exec.as_ref(), boot.unmount_policy(), |dir| {
                make_squashfs(
                    exec.as_ref(),
                    boot.root(),
                    &dir.join("live/filesystem.squashfs"),
                    boot.target().release,
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

pub fn live_syslinux_config(kernel: &str, initrd: &str) -> String {
    format!(
        "default linux\nlabel linux\nkernel /live/{}\n\
         append ro boot=live initrd=/live/{} persistent=nofiles\n",
        kernel, initrd
    )
}

impl Assembler for LiveImage {
    fn file(&self) -> &Path {
        &self.file
    }

    fn create(&mut self, boot: &mut BootProcess) -> Result<()> {
        boot.ensure_configurator(AdHocConfigurator::new(
            LIVE_BOOT_CONFIGURATOR,
            |chroot, options| {
                chroot.apt_install(
                    options.target.release.live_packages(),
                    &AptInstallOptions::default(),
                )
            },
        ));
        boot.create(false)?;

        let timer = Timer::start("live image");
        let exec = boot.image().executor().clone();

        if !self.file.exists() {
            if let Err(e) = self.create_file(exec.as_ref()) {
                if let Err(remove) = fs::remove_file(&self.file) {
                    warn!("Could not remove {}: {}", self.file.display(), remove);
                }
                return Err(e);
            }
        }

        self.install_syslinux_files(boot, &exec)?;
        self.sync_boot_fs(boot, &exec)?;
        self.compress_root_fs(boot, &exec)?;
        self.install_syslinux(boot, exec.as_ref())?;
        touch(&self.file)?;

        timer.finish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_and_initrd_live_under_live() {
        let config = live_syslinux_config("vmlinuz-6.1.0-18-amd64", "initrd.img-6.1.0-18-amd64");
        assert!(config.contains("kernel /live/vmlinuz-6.1.0-18-amd64\n"));
        assert!(config.contains(
            "append ro boot=live initrd=/live/initrd.img-6.1.0-18-amd64 persistent=nofiles\n"
        ));
    }
}
