use anyhow::Result;
use std::io::Write;

use super::{ConfigureOptions, Configurator};
use crate::chroot::Chroot;
use crate::target::BuildTarget;

/// Proxy snippet written while the build runs, removed by the apt cleaner.
pub const APT_PROXY_FILE: &str = "/etc/apt/apt.conf.d/02proxy-systembuilder";

const SOURCES_LIST: &str = "/etc/apt/sources.list";

/// Points apt at the real mirror, adds backports and refreshes the indexes.
pub struct AptConfigurator;

impl AptConfigurator {
    /// debootstrap fetched through the proxy, so sources.list names the
    /// proxied URL. Put the real mirror back.
    fn rewrite_sources(&self, chroot: &Chroot, target: &BuildTarget) -> Result<()> {
        if target.proxy.is_none() || !chroot.image().exists(SOURCES_LIST) {
            return Ok(());
        }
        let fetched_from = format!("deb {}", target.debootstrap_url());
        let real = format!("deb {}", target.mirror());
        let lines = chroot.image().read_lines(SOURCES_LIST)?;

        chroot.image().open(SOURCES_LIST, |f| {
            for line in &lines {
                let line = line.trim();
                match line.strip_prefix(&fetched_from) {
                    Some(rest) => writeln!(f, "{}{}", real, rest)?,
                    None => writeln!(f, "{}", line)?,
                }
            }
            Ok(())
        })
    }

    fn backports_list(&self, chroot: &Chroot, target: &BuildTarget) -> Result<()> {
        let release = target.release;
        let list = format!("/etc/apt/sources.list.d/{}-backports.list", release);
        if chroot.image().exists(&list) {
            return Ok(());
        }
        chroot.image().write(&list, &backports_line(target))
    }

    fn update(&self, chroot: &Chroot, options: &ConfigureOptions) -> Result<()> {
        if options.offline {
            return Ok(());
        }
        let command = match options.target.apt_options() {
            Some(apt_options) => format!("apt-get {} update", apt_options),
            None => "apt-get update".to_string(),
        };
        chroot.sh(command)?;
        Ok(())
    }

    fn configure_proxy(&self, chroot: &Chroot, target: &BuildTarget) -> Result<()> {
        match &target.proxy {
            Some(proxy) => chroot.image().write(
                APT_PROXY_FILE,
                &format!("Acquire::http {{ Proxy \"{}\"; }};\n", proxy),
            ),
            None => Ok(()),
        }
    }
}

/// Source line of the backports suite for the target's release.
pub fn backports_line(target: &BuildTarget) -> String {
    let release = target.release;
    format!(
        "deb {} {}-backports main contrib non-free\n",
        release.backports_url(&target.mirror()),
        release
    )
}

impl Configurator for AptConfigurator {
    fn name(&self) -> &str {
        "apt"
    }

    fn configure(&self, chroot: &Chroot, options: &ConfigureOptions) -> Result<()> {
        self.rewrite_sources(chroot, options.target)?;
        self.backports_list(chroot, options.target)?;
        self.update(chroot, options)?;
        self.configure_proxy(chroot, options.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chroot::ChrootSession;
    use crate::image::RootImage;
    use crate::mount::UnmountPolicy;
    use crate::process::RecordingExecutor;
    use crate::target::{Architecture, Release};
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn run(target: &BuildTarget, offline: bool, root: &Path) -> Vec<String> {
        let exec = Arc::new(RecordingExecutor::new());
        let image = RootImage::new(root, exec.clone());
        let options = ConfigureOptions { target, offline };
        let apt_options = target.apt_options();
        ChrootSession::execute(
            &image,
            apt_options.as_deref(),
            &UnmountPolicy::immediate(),
            |chroot| AptConfigurator.configure(chroot, &options),
        )
        .unwrap();
        exec.commands()
    }

    #[test]
    fn backports_lines_per_era() {
        let lenny = BuildTarget::new(Release::Lenny, Architecture::I386);
        assert_eq!(
            backports_line(&lenny),
            "deb http://archive.debian.org/debian-backports lenny-backports main contrib non-free\n"
        );
        let stable = BuildTarget::new(Release::Bookworm, Architecture::Amd64);
        assert_eq!(
            backports_line(&stable),
            "deb http://deb.debian.org/debian bookworm-backports main contrib non-free\n"
        );
    }

    #[test]
    fn offline_skips_update() {
        let dir = TempDir::new().unwrap();
        let target = BuildTarget::new(Release::Stable, Architecture::Amd64);
        assert!(run(&target, true, dir.path())
            .iter()
            .all(|c| !c.contains("apt-get update")));
        assert_eq!(
            run(&target, false, dir.path())
                .iter()
                .filter(|c| c.contains("apt-get update"))
                .count(),
            1
        );
    }

    #[test]
    fn no_proxy_leaves_sources_alone() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("etc/apt")).unwrap();
        fs::write(
            dir.path().join("etc/apt/sources.list"),
            "deb http://deb.debian.org/debian stable main\n",
        )
        .unwrap();
        let target = BuildTarget::new(Release::Stable, Architecture::Amd64);
        let commands = run(&target, true, dir.path());
        let sources = dir.path().join("etc/apt/sources.list").display().to_string();
        assert!(!commands.iter().any(|c| c.ends_with(&sources)));
        assert!(!commands.iter().any(|c| c.contains("02proxy-systembuilder")));
    }

    #[test]
    fn proxy_rewrites_sources_and_configures_apt() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("etc/apt")).unwrap();
        fs::write(
            dir.path().join("etc/apt/sources.list"),
            "deb http://localhost:3142/deb.debian.org/debian stable main\n",
        )
        .unwrap();
        let target = BuildTarget::new(Release::Stable, Architecture::Amd64)
            .with_proxy(Some("http://localhost:3142".into()));
        let commands = run(&target, false, dir.path());

        let sources = dir.path().join("etc/apt/sources.list").display().to_string();
        assert!(commands.iter().any(|c| c.starts_with("cp ") && c.ends_with(&sources)));
        assert!(commands
            .iter()
            .any(|c| c.contains("apt-get -o Acquire::http::Proxy='http://localhost:3142' update")));
        assert!(commands.iter().any(|c| c.contains("02proxy-systembuilder")));
    }
}
