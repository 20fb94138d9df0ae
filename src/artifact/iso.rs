//! ISO images built with genisoimage graft points.
//!
//! Nothing is mounted or partitioned: kernel, initrd and (for the squashfs
//! variant) the root blob are mapped into the image by name.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::info;

use super::disk_squashfs::SQUASHFS_APPEND;
use super::{
    boot_link_target, find_syslinux_file, hand_over, make_squashfs, Assembler, AssemblyOptions,
};
use crate::boot::BootProcess;
use crate::initramfs::InitRamFsConfigurator;
use crate::process::{Cmd, Executor};
use crate::target::Release;
use crate::timing::Timer;

const ISOLINUX_CANDIDATES: [&str; 3] = [
    "/usr/lib/ISOLINUX/isolinux.bin",
    "/usr/lib/syslinux/isolinux.bin",
    "/usr/share/syslinux/isolinux.bin",
];

/// isolinux.cfg booting `/vmlinuz` with `append`.
pub fn isolinux_config(append: &str) -> String {
    format!(
        "default linux\nlabel linux\nkernel /vmlinuz\nappend {}\n",
        append
    )
}

/// Write isolinux.cfg and isolinux.bin into the root's /boot/isolinux.
fn install_isolinux_files(boot: &BootProcess, append: &str) -> Result<()> {
    let image = boot.image();
    image.mkdir("/boot/isolinux")?;
    image.write("/boot/isolinux/isolinux.cfg", &isolinux_config(append))?;
    let isolinux = find_syslinux_file(boot.root(), &ISOLINUX_CANDIDATES)?;
    image.install("/boot/isolinux", &[isolinux])
}

/// `name=<root>/boot/<link target>` graft points for kernel and initrd.
fn kernel_graft_points(root: &Path) -> Vec<String> {
    ["vmlinuz", "initrd.img"]
        .iter()
        .map(|name| {
            format!(
                "{}={}",
                name,
                root.join("boot").join(boot_link_target(root, name)).display()
            )
        })
        .collect()
}

fn genisoimage(file: &Path, boot_dir: &str, volume: &str) -> Cmd {
    Cmd::new("genisoimage")
        .args(["-quiet", "-R", "-o"])
        .arg_path(file)
        .arg("-b")
        .arg(format!("{}isolinux/isolinux.bin", boot_dir))
        .arg("-c")
        .arg(format!("{}isolinux/boot.cat", boot_dir))
        .args(["-no-emul-boot", "-boot-load-size", "4", "-boot-info-table"])
        .args(["-A", volume, "-V", volume])
        .arg("-graft-points")
        .privileged()
        .error_msg("genisoimage failed")
}

/// ISO holding the whole root, booted read-only from the CD.
pub struct IsoImage {
    file: PathBuf,
    options: AssemblyOptions,
    /// Device the kernel mounts as root.
    root_device: Option<String>,
}

impl IsoImage {
    pub fn new(file: impl Into<PathBuf>, options: AssemblyOptions) -> Self {
        Self {
            file: file.into(),
            options,
            root_device: None,
        }
    }

    pub fn with_root_device(mut self, device: impl Into<String>) -> Self {
        self.root_device = Some(device.into());
        self
    }

    fn root_device(&self, release: Release) -> String {
        match &self.root_device {
            Some(device) => device.clone(),
            // IDE naming before the libata switch
            None if release == Release::Lenny => "/dev/hdc".to_string(),
            None => "/dev/sr0".to_string(),
        }
    }

    fn make_iso_fs(&self, boot: &BootProcess, exec: &dyn Executor) -> Result<()> {
        let root = boot.root();
        let cmd = genisoimage(&self.file, "boot/", "root")
            .arg("-hide")
            .arg_path(&root.join("initrd.img"))
            .arg("-hide")
            .arg_path(&root.join("vmlinuz"))
            .args(kernel_graft_points(root))
            .arg_path(root);
        exec.execute(&cmd)?;
        hand_over(exec, &self.file, self.options.owner.as_deref())
    }
}

impl Assembler for IsoImage {
    fn file(&self) -> &Path {
        &self.file
    }

    fn create(&mut self, boot: &mut BootProcess) -> Result<()> {
        boot.create(false)?;
        let timer = Timer::start("iso image");
        let append = format!(
            "ro root={} initrd=/initrd.img",
            self.root_device(boot.target().release)
        );
        install_isolinux_files(boot, &append)?;
        self.make_iso_fs(boot, boot.executor())?;
        timer.finish();
        Ok(())
    }
}

/// ISO holding kernel, initrd and the root squashfs, labelled "boot" so
/// the initramfs finds it like the boot partition of a disk.
pub struct IsoSquashfsImage {
    file: PathBuf,
    options: AssemblyOptions,
}

impl IsoSquashfsImage {
    pub fn new(file: impl Into<PathBuf>, options: AssemblyOptions) -> Self {
        Self {
            file: file.into(),
            options,
        }
    }

    /// A blob left by an earlier run is stale and gets recompressed. Only
    /// the one a disk build wrote from this same root is reused.
    fn compress_root_fs(&self, boot: &mut BootProcess) -> Result<()> {
        let squashfs = self.options.squashfs_file();
        if boot.has_current_squashfs(&squashfs) {
            info!("Reusing {}", squashfs.display());
            return Ok(());
        }
        let exec = boot.image().executor().clone();
        make_squashfs(exec.as_ref(), boot.root(), &squashfs, boot.target().release)?;
        hand_over(exec.as_ref(), &squashfs, self.options.owner.as_deref())?;
        boot.record_squashfs(&squashfs);
        Ok(())
    }

    fn make_iso_fs(&self, boot: &BootProcess, exec: &dyn Executor) -> Result<()> {
        let root = boot.root();
        let cmd = genisoimage(&self.file, "", "boot")
            .args(kernel_graft_points(root))
            .arg(format!(
                "filesystem.squashfs={}",
                self.options.squashfs_file().display()
            ))
            .arg_path(&root.join("boot"));
        exec.execute(&cmd)?;
        hand_over(exec, &self.file, self.options.owner.as_deref())
    }
}

impl Assembler for IsoSquashfsImage {
    fn file(&self) -> &Path {
        &self.file
    }

    fn create(&mut self, boot: &mut BootProcess) -> Result<()> {
        boot.ensure_configurator(InitRamFsConfigurator);
        boot.create(false)?;
        let timer = Timer::start("iso squashfs image");
        self.compress_root_fs(boot)?;
        install_isolinux_files(boot, SQUASHFS_APPEND)?;
        self.make_iso_fs(boot, boot.executor())?;
        timer.finish();
        Ok(())
    }
}
