use anyhow::Result;
use std::fmt;
use tracing::info;

use super::configurators::policy_rc_path;
use super::APT_PROXY_FILE;
use crate::chroot::Chroot;

type CleanFn = dyn Fn(&Chroot) -> Result<()>;

/// One step of the clean phase.
pub struct Cleaner {
    name: String,
    action: Box<CleanFn>,
}

impl Cleaner {
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(&Chroot) -> Result<()> + 'static,
    {
        Self {
            name: name.into(),
            action: Box::new(action),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clean(&self, chroot: &Chroot) -> Result<()> {
        (self.action)(chroot)
    }
}

impl fmt::Debug for Cleaner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cleaner").field("name", &self.name).finish()
    }
}

/// Standard cleaners, in the order they run.
pub fn standard_cleaners() -> Vec<Cleaner> {
    vec![apt(), policyrc(), tmp()]
}

/// Drop the build-time proxy, caches, orphans and package indexes.
fn apt() -> Cleaner {
    Cleaner::new("apt", |chroot| {
        if chroot.image().exists(APT_PROXY_FILE) {
            info!("Removing apt proxy configuration");
            chroot.sh(format!("rm {}", APT_PROXY_FILE))?;
        }
        chroot.sh("apt-get clean")?;
        chroot.sh("apt-get autoremove --yes")?;
        chroot.sh("find /var/lib/apt/ /var/cache/apt -type f | xargs rm -f")?;
        Ok(())
    })
}

/// Let services start again once the image boots.
fn policyrc() -> Cleaner {
    Cleaner::new("policyrc", |chroot| {
        chroot.sh(format!("rm -f {}", policy_rc_path()))?;
        Ok(())
    })
}

fn tmp() -> Cleaner {
    Cleaner::new("tmp", |chroot| {
        chroot.sh("rm -rf /tmp/*")?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chroot::ChrootSession;
    use crate::image::RootImage;
    use crate::mount::UnmountPolicy;
    use crate::process::RecordingExecutor;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn clean_all(root: &std::path::Path) -> Vec<String> {
        let exec = Arc::new(RecordingExecutor::new());
        let image = RootImage::new(root, exec.clone());
        ChrootSession::execute(&image, None, &UnmountPolicy::immediate(), |chroot| {
            for cleaner in standard_cleaners() {
                cleaner.clean(chroot)?;
            }
            Ok(())
        })
        .unwrap();
        exec.commands()
    }

    #[test]
    fn cleaners_in_order() {
        let names: Vec<String> = standard_cleaners()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["apt", "policyrc", "tmp"]);
    }

    #[test]
    fn proxy_file_removed_only_when_present() {
        let dir = TempDir::new().unwrap();
        let commands = clean_all(dir.path());
        assert!(!commands.iter().any(|c| c.contains("02proxy-systembuilder")));

        fs::create_dir_all(dir.path().join("etc/apt/apt.conf.d")).unwrap();
        fs::write(dir.path().join("etc/apt/apt.conf.d/02proxy-systembuilder"), "").unwrap();
        let commands = clean_all(dir.path());
        let rm = commands
            .iter()
            .position(|c| c.ends_with("rm /etc/apt/apt.conf.d/02proxy-systembuilder"))
            .unwrap();
        let apt_clean = commands
            .iter()
            .position(|c| c.ends_with("apt-get clean"))
            .unwrap();
        assert!(rm < apt_clean);
    }

    #[test]
    fn tmp_purged_last() {
        let dir = TempDir::new().unwrap();
        let commands = clean_all(dir.path());
        let chrooted: Vec<&String> = commands.iter().filter(|c| c.starts_with("chroot")).collect();
        assert!(chrooted.last().unwrap().ends_with("rm -rf /tmp/*"));
    }
}
