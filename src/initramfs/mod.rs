//! Init-ramfs configurator for images booting a squashfs root from the boot
//! partition.
//!
//! # Boot Flow
//!
//! ```text
//! 1. syslinux/extlinux loads the kernel and initrd from the boot partition
//! 2. local-top/mount_boot: modprobe loop, run /lib/initrd/mount_boot,
//!    which mounts the partition labelled "boot" read-only on /boot
//! 3. initramfs-tools loop mounts root=/boot/filesystem.squashfs
//! 4. local-bottom/move_boot: moves /boot under the new root, so the
//!    running system still sees its boot partition
//! ```

use anyhow::Result;
use std::io::Write;
use std::path::Path;

use crate::boot::{ConfigureOptions, Configurator};
use crate::chroot::{AptInstallOptions, Chroot};

/// Helper run by the local-top script, installed into the initrd by the hook.
const MOUNT_BOOT: &str = include_str!("../../profile/initramfs/mount_boot.sh");

const MOUNT_BOOT_HELPER: &str = "/usr/local/share/initramfs-tools/mount_boot";

/// Preamble every initramfs-tools script and hook starts with.
pub const SCRIPT_HEADER: &str = "#!/bin/sh -x\n\
if [ \"$1\" = \"prereqs\" ]; then\n  \
echo \"\"; exit 0;\n\
fi\n";

/// Kind of initramfs-tools file, named after its directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    Script,
    Hook,
}

impl ScriptKind {
    fn directory(&self) -> &'static str {
        match self {
            ScriptKind::Script => "/usr/share/initramfs-tools/scripts",
            ScriptKind::Hook => "/usr/share/initramfs-tools/hooks",
        }
    }
}

/// Full content of an initramfs-tools file with `body` in between the
/// preamble and the trailing `exit 0`.
pub fn script_content(kind: ScriptKind, body: &[&str]) -> String {
    let mut content = String::from(SCRIPT_HEADER);
    if kind == ScriptKind::Hook {
        content.push_str(". /usr/share/initramfs-tools/hook-functions\n");
    }
    for line in body {
        content.push_str(line);
        content.push('\n');
    }
    content.push_str("exit 0\n");
    content
}

pub struct InitRamFsConfigurator;

impl InitRamFsConfigurator {
    pub const NAME: &'static str = "initramfs";

    fn install_file(
        &self,
        chroot: &Chroot,
        kind: ScriptKind,
        name: &str,
        body: &[&str],
    ) -> Result<()> {
        let file = format!("{}/{}", kind.directory(), name);
        if let Some(dir) = Path::new(&file).parent() {
            chroot.image().mkdir(dir)?;
        }
        chroot.image().write(&file, &script_content(kind, body))?;
        chroot.sh(format!("chmod +x {}", file))?;
        Ok(())
    }
}

impl Configurator for InitRamFsConfigurator {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn configure(&self, chroot: &Chroot, options: &ConfigureOptions) -> Result<()> {
        chroot.apt_install(
            options.target.release.initramfs_packages(),
            &AptInstallOptions::default(),
        )?;

        self.install_file(
            chroot,
            ScriptKind::Script,
            "local-top/mount_boot",
            &["modprobe loop", "/lib/initrd/mount_boot"],
        )?;
        self.install_file(
            chroot,
            ScriptKind::Script,
            "local-bottom/move_boot",
            &["mount -n -o move /boot /root/boot"],
        )?;
        self.install_file(
            chroot,
            ScriptKind::Hook,
            "mount_boot",
            &[
                "mkdir -p $DESTDIR/lib/initrd/",
                "install -m 755 /usr/local/share/initramfs-tools/mount_boot $DESTDIR/lib/initrd/",
            ],
        )?;

        chroot.image().open("/etc/initramfs-tools/modules", |f| {
            writeln!(f, "squashfs")?;
            Ok(())
        })?;

        chroot.image().mkdir("/usr/local/share/initramfs-tools")?;
        chroot.image().write(MOUNT_BOOT_HELPER, MOUNT_BOOT)?;

        chroot.sh("/usr/sbin/update-initramfs -u")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_short_circuit_prereqs_and_exit_cleanly() {
        let content = script_content(ScriptKind::Script, &["modprobe loop"]);
        assert!(content.starts_with("#!/bin/sh -x\nif [ \"$1\" = \"prereqs\" ]; then\n"));
        assert!(content.contains("  echo \"\"; exit 0;\nfi\nmodprobe loop\n"));
        assert!(content.ends_with("modprobe loop\nexit 0\n"));
    }

    #[test]
    fn hooks_source_hook_functions() {
        let content = script_content(ScriptKind::Hook, &["mkdir -p $DESTDIR/lib/initrd/"]);
        assert!(content.contains("fi\n. /usr/share/initramfs-tools/hook-functions\nmkdir"));
        assert!(content.ends_with("exit 0\n"));
    }

    #[test]
    fn helper_mounts_boot_label() {
        assert!(MOUNT_BOOT.starts_with("#!/bin/sh"));
        assert!(MOUNT_BOOT.contains("LABEL=boot"));
    }
}
