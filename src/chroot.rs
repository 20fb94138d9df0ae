//! Running commands inside the bootstrapped root.

use anyhow::Result;
use std::path::Path;
use tracing::info;

use crate::image::RootImage;
use crate::mount::{Mount, UnmountPolicy};
use crate::process::{Cmd, CommandResult, Executor};

/// Options for [`Chroot::apt_install`].
#[derive(Debug, Clone, Default)]
pub struct AptInstallOptions {
    /// `--target-release`, e.g. "wheezy-backports".
    pub target_release: Option<String>,
}

/// Handle to a root with `/proc` mounted.
pub struct Chroot<'a> {
    image: &'a RootImage,
    apt_options: Option<&'a str>,
}

impl<'a> Chroot<'a> {
    pub fn image(&self) -> &RootImage {
        self.image
    }

    fn exec(&self) -> &dyn Executor {
        self.image.executor().as_ref()
    }

    /// Run a shell command inside the root, as root.
    pub fn sh(&self, command: impl AsRef<str>) -> Result<CommandResult> {
        self.exec().execute(&self.command(command.as_ref()))
    }

    fn command(&self, command: &str) -> Cmd {
        Cmd::new("chroot")
            .arg_path(self.image.root())
            .arg("sh")
            .arg("-c")
            .arg(format!("export HOME=/root; LC_ALL=C {}", command))
            .privileged()
    }

    /// Install packages non-interactively.
    pub fn apt_install<S: AsRef<str>>(
        &self,
        packages: &[S],
        options: &AptInstallOptions,
    ) -> Result<()> {
        let names: Vec<&str> = packages.iter().map(|p| p.as_ref()).collect();
        if names.is_empty() {
            return Ok(());
        }
        info!("Installing {}", names.join(" "));

        let mut command = String::from("apt-get install");
        if let Some(apt_options) = self.apt_options {
            command.push(' ');
            command.push_str(apt_options);
        }
        if let Some(release) = &options.target_release {
            command.push_str(&format!(" --target-release={}", release));
        }
        command.push_str(" --yes --force-yes ");
        command.push_str(&names.join(" "));
        self.sh(command)?;
        Ok(())
    }
}

/// Scoped chroot: `/proc` is mounted for the duration of the work.
pub struct ChrootSession;

impl ChrootSession {
    /// Mount `/proc` under the image root, run `f`, unmount it again on
    /// every exit path.
    pub fn execute<T, F>(
        image: &RootImage,
        apt_options: Option<&str>,
        policy: &UnmountPolicy,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&Chroot) -> Result<T>,
    {
        let proc_dir = image.file("/proc")?;
        let exec = image.executor().clone();
        Mount::proc(proc_dir).scoped(exec.as_ref(), policy, |_: &Path| {
            let chroot = Chroot { image, apt_options };
            f(&chroot)
        })
    }
}
