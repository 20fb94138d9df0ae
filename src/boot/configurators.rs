//! The standard configure steps every root goes through.

use anyhow::Result;
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

use super::{AdHocConfigurator, AptConfigurator, Configurator};
use crate::chroot::AptInstallOptions;

const POLICY_RC: &str = "/usr/sbin/policy-rc.d";

/// Standard configurators, in the order they run.
///
/// The kernel cannot be installed by debootstrap, hence its own step after
/// apt is set up.
pub fn standard_configurators() -> Vec<Box<dyn Configurator>> {
    vec![
        Box::new(localhost()),
        Box::new(AptConfigurator),
        Box::new(kernel()),
        Box::new(fstab()),
        Box::new(timezone()),
        Box::new(resolvconf()),
        Box::new(policyrc()),
    ]
}

/// `/etc/hosts` with the loopback names.
pub fn localhost() -> AdHocConfigurator {
    AdHocConfigurator::new("localhost", |chroot, _| {
        chroot.image().write(
            "/etc/hosts",
            "127.0.0.1\tlocalhost\n::1     localhost ip6-localhost ip6-loopback\n",
        )
    })
}

/// Kernel package for the release. Backported kernels are pulled from the
/// backports suite.
pub fn kernel() -> AdHocConfigurator {
    AdHocConfigurator::new("kernel", |chroot, options| {
        chroot.image().write("/etc/kernel-img.conf", "do_initrd = yes\n")?;

        let package = options.target.kernel_package_name();
        let install = AptInstallOptions {
            target_release: package
                .contains("bpo")
                .then(|| format!("{}-backports", options.target.release)),
        };
        chroot.apt_install(&[package], &install)
    })
}

/// Entries of the generated `/etc/fstab`.
pub fn fstab_lines() -> Vec<String> {
    let mut lines = vec!["LABEL=boot /boot auto defaults,noatime,ro 0 0".to_string()];
    for dir in ["/tmp", "/var/tmp"] {
        lines.push(format!("tmpfs {} tmpfs defaults,noatime 0 0", dir));
    }
    for dir in ["/run", "/var/log"] {
        lines.push(format!("tmpfs {} tmpfs defaults,noatime,mode=0755 0 0", dir));
    }
    lines
}

/// Read-only boot partition plus tmpfs for volatile directories. An
/// existing fstab is left alone.
pub fn fstab() -> AdHocConfigurator {
    AdHocConfigurator::new("fstab", |chroot, _| {
        if chroot.image().exists("/etc/fstab") {
            return Ok(());
        }
        chroot.image().open("/etc/fstab", |f| {
            for line in fstab_lines() {
                writeln!(f, "{}", line)?;
            }
            Ok(())
        })
    })
}

/// Same timezone as the build host.
pub fn timezone() -> AdHocConfigurator {
    AdHocConfigurator::new("timezone", |chroot, _| {
        let sources = existing(&["/etc/timezone", "/etc/localtime"]);
        if sources.is_empty() {
            warn!("Build host has no timezone configuration, keeping the default");
            return Ok(());
        }
        chroot.image().install("/etc/", &sources)
    })
}

/// Same resolver as the build host, unless the root has its own.
pub fn resolvconf() -> AdHocConfigurator {
    AdHocConfigurator::new("resolvconf", |chroot, _| {
        if chroot.image().exists("/etc/resolv.conf") {
            return Ok(());
        }
        chroot.image().install("/etc/", &["/etc/resolv.conf"])
    })
}

/// Keep package installs from starting services in the chroot.
pub fn policyrc() -> AdHocConfigurator {
    AdHocConfigurator::new("policyrc", |chroot, _| {
        chroot.image().write(POLICY_RC, "exit 101\n")?;
        chroot.sh(format!("chmod +x {}", POLICY_RC))?;
        Ok(())
    })
}

pub(super) fn policy_rc_path() -> &'static str {
    POLICY_RC
}

fn existing(paths: &[&str]) -> Vec<PathBuf> {
    paths
        .iter()
        .map(PathBuf::from)
        .filter(|p| p.exists())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::ConfigureOptions;
    use crate::chroot::ChrootSession;
    use crate::image::RootImage;
    use crate::mount::UnmountPolicy;
    use crate::process::RecordingExecutor;
    use crate::target::{Architecture, BuildTarget, Release};
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn run(configurator: &dyn Configurator, target: &BuildTarget, root: &Path) -> Vec<String> {
        let exec = Arc::new(RecordingExecutor::new());
        let image = RootImage::new(root, exec.clone());
        let options = ConfigureOptions {
            target,
            offline: false,
        };
        ChrootSession::execute(&image, None, &UnmountPolicy::immediate(), |chroot| {
            configurator.configure(chroot, &options)
        })
        .unwrap();
        exec.commands()
    }

    #[test]
    fn fstab_has_boot_and_tmpfs_entries() {
        let lines = fstab_lines();
        assert_eq!(lines[0], "LABEL=boot /boot auto defaults,noatime,ro 0 0");
        assert!(lines.contains(&"tmpfs /var/tmp tmpfs defaults,noatime 0 0".to_string()));
        assert!(lines.contains(&"tmpfs /run tmpfs defaults,noatime,mode=0755 0 0".to_string()));
        assert_eq!(lines.len(), 5);
    }

    #[test]
    fn existing_fstab_is_kept() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/fstab"), "# mine\n").unwrap();
        let target = BuildTarget::new(Release::Stable, Architecture::Amd64);
        let commands = run(&fstab(), &target, dir.path());
        assert!(!commands.iter().any(|c| c.contains("etc/fstab")));
    }

    #[test]
    fn backported_kernel_uses_backports_suite() {
        let dir = TempDir::new().unwrap();
        let target = BuildTarget::new(Release::Wheezy, Architecture::I386);
        let commands = run(&kernel(), &target, dir.path());
        let install = commands
            .iter()
            .find(|c| c.contains("apt-get install"))
            .unwrap();
        assert!(install.contains("--target-release=wheezy-backports"));
        assert!(install.ends_with("linux-image-3.12-0.bpo.1-686"));
    }

    #[test]
    fn regular_kernel_has_no_target_release() {
        let dir = TempDir::new().unwrap();
        let target = BuildTarget::new(Release::Stable, Architecture::Amd64);
        let commands = run(&kernel(), &target, dir.path());
        let install = commands
            .iter()
            .find(|c| c.contains("apt-get install"))
            .unwrap();
        assert!(!install.contains("--target-release"));
        assert!(install.ends_with("linux-image-amd64"));
    }

    #[test]
    fn policyrc_is_executable() {
        let dir = TempDir::new().unwrap();
        let target = BuildTarget::new(Release::Stable, Architecture::Amd64);
        let commands = run(&policyrc(), &target, dir.path());
        assert!(commands
            .iter()
            .any(|c| c.ends_with("LC_ALL=C chmod +x /usr/sbin/policy-rc.d")));
    }
}
