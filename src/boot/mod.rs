//! Bootstrapping and configuring the root filesystem.
//!
//! A [`BootProcess`] owns the root directory of one build. `create()` runs
//! three phases, each at most once:
//!
//! 1. bootstrap: debootstrap into the root unless it already holds a system
//! 2. configure: every [`Configurator`], in order, inside one chroot session
//! 3. clean: every [`Cleaner`], in order, inside one chroot session
//!
//! Configurators are the extension point: the provisioning and init-ramfs
//! configurators are appended to the standard list by the project and the
//! disk assemblers.

mod apt;
mod cleaners;
mod configurators;

pub use apt::{AptConfigurator, APT_PROXY_FILE};
pub use cleaners::{standard_cleaners, Cleaner};
pub use configurators::{
    fstab, kernel, localhost, policyrc, resolvconf, standard_configurators, timezone,
};

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::chroot::{Chroot, ChrootSession};
use crate::image::RootImage;
use crate::mount::UnmountPolicy;
use crate::process::{check_interrupted, Cmd, Executor};
use crate::target::BuildTarget;
use crate::timing::Timer;

/// What a configurator gets to know about the build.
#[derive(Debug, Clone, Copy)]
pub struct ConfigureOptions<'a> {
    pub target: &'a BuildTarget,
    /// Do not refresh package indexes.
    pub offline: bool,
}

/// One step of the configure phase.
pub trait Configurator {
    /// Name used in the step log, and to avoid registering a step twice.
    fn name(&self) -> &str;

    fn configure(&self, chroot: &Chroot, options: &ConfigureOptions) -> Result<()>;
}

type ConfigureFn = dyn Fn(&Chroot, &ConfigureOptions) -> Result<()>;

/// Configurator from a closure.
pub struct AdHocConfigurator {
    name: String,
    action: Box<ConfigureFn>,
}

impl AdHocConfigurator {
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(&Chroot, &ConfigureOptions) -> Result<()> + 'static,
    {
        Self {
            name: name.into(),
            action: Box::new(action),
        }
    }
}

impl Configurator for AdHocConfigurator {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&self, chroot: &Chroot, options: &ConfigureOptions) -> Result<()> {
        (self.action)(chroot, options)
    }
}

/// How far `create()` got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootState {
    Uninitialized,
    Bootstrapped,
    Configured,
    Cleaned,
}

pub struct BootProcess {
    target: BuildTarget,
    image: RootImage,
    configurators: Vec<Box<dyn Configurator>>,
    cleaners: Vec<Cleaner>,
    state: BootState,
    offline: bool,
    policy: UnmountPolicy,
    /// Squashfs compressed from the root since its last change.
    compressed: Option<PathBuf>,
}

impl BootProcess {
    /// Boot process with the standard configurators and cleaners.
    pub fn new(root: impl Into<PathBuf>, target: BuildTarget, exec: Arc<dyn Executor>) -> Self {
        Self {
            target,
            image: RootImage::new(root, exec),
            configurators: standard_configurators(),
            cleaners: standard_cleaners(),
            state: BootState::Uninitialized,
            offline: false,
            policy: UnmountPolicy::default(),
            compressed: None,
        }
    }

    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn with_unmount_policy(mut self, policy: UnmountPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn root(&self) -> &Path {
        self.image.root()
    }

    pub fn image(&self) -> &RootImage {
        &self.image
    }

    pub fn target(&self) -> &BuildTarget {
        &self.target
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    pub fn executor(&self) -> &dyn Executor {
        self.image.executor().as_ref()
    }

    pub fn unmount_policy(&self) -> &UnmountPolicy {
        &self.policy
    }

    /// Remember that `file` holds a squashfs of the root as it is now.
    pub fn record_squashfs(&mut self, file: &Path) {
        self.compressed = Some(file.to_path_buf());
    }

    /// True when `file` was compressed from the root during this build and
    /// no phase has touched the root since.
    pub fn has_current_squashfs(&self, file: &Path) -> bool {
        self.compressed.as_deref() == Some(file) && file.exists()
    }

    pub fn configurator_names(&self) -> Vec<&str> {
        self.configurators.iter().map(|c| c.name()).collect()
    }

    pub fn add_configurator(&mut self, configurator: impl Configurator + 'static) {
        self.configurators.push(Box::new(configurator));
    }

    /// Append `configurator` unless one with the same name is registered.
    pub fn ensure_configurator(&mut self, configurator: impl Configurator + 'static) {
        if !self.configurators.iter().any(|c| c.name() == configurator.name()) {
            self.add_configurator(configurator);
        }
    }

    pub fn clear_configurators(&mut self) {
        self.configurators.clear();
    }

    /// Bootstrap, configure and clean the root.
    ///
    /// Once the root has been cleaned, further calls do nothing unless
    /// `force` is set.
    pub fn create(&mut self, force: bool) -> Result<()> {
        if self.state == BootState::Cleaned && !force {
            debug!("{} already created", self.root().display());
            return Ok(());
        }
        self.bootstrap()?;
        self.configure()?;
        self.clean()?;
        Ok(())
    }

    /// A root holding a complete debootstrap run.
    pub fn is_bootstrapped(&self) -> bool {
        let root = self.root();
        root.join("etc/debian_version").exists() && !root.join("debootstrap").exists()
    }

    /// Run debootstrap unless the root already holds a system.
    pub fn bootstrap(&mut self) -> Result<()> {
        check_interrupted()?;
        if self.is_bootstrapped() {
            info!("{} already bootstrapped", self.root().display());
        } else {
            self.compressed = None;
            let timer = Timer::start("bootstrap");
            if let Some(parent) = self.root().parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            info!(
                "Bootstrapping {} {} into {}",
                self.target.release,
                self.target.architecture,
                self.root().display()
            );
            let cmd = Cmd::new("debootstrap")
                .args(self.target.debootstrap_options())
                .arg(self.target.release.name())
                .arg_path(self.root())
                .arg(self.target.debootstrap_url())
                .privileged()
                .error_msg("debootstrap failed");
            self.executor().execute(&cmd)?;
            timer.finish();
        }
        self.state = self.state.max(BootState::Bootstrapped);
        Ok(())
    }

    /// Run every configurator once, in order, in one chroot session.
    pub fn configure(&mut self) -> Result<()> {
        info!("{} configurators to run", self.configurators.len());
        self.compressed = None;
        if !self.configurators.is_empty() {
            let timer = Timer::start("configure");
            let options = ConfigureOptions {
                target: &self.target,
                offline: self.offline,
            };
            let configurators = &self.configurators;
            self.with_chroot(|chroot| {
                for configurator in configurators {
                    check_interrupted()?;
                    info!("* {}", configurator.name());
                    configurator
                        .configure(chroot, &options)
                        .with_context(|| format!("{} configurator failed", configurator.name()))?;
                }
                Ok(())
            })?;
            timer.finish();
        }
        self.state = self.state.max(BootState::Configured);
        Ok(())
    }

    /// Run every cleaner once, in order, in one chroot session.
    pub fn clean(&mut self) -> Result<()> {
        self.compressed = None;
        if !self.cleaners.is_empty() {
            let cleaners = &self.cleaners;
            self.with_chroot(|chroot| {
                for cleaner in cleaners {
                    check_interrupted()?;
                    info!("* {}", cleaner.name());
                    cleaner
                        .clean(chroot)
                        .with_context(|| format!("{} cleaner failed", cleaner.name()))?;
                }
                Ok(())
            })?;
        }
        self.state = BootState::Cleaned;
        Ok(())
    }

    /// Run `f` in a chroot session on the root.
    pub fn chroot<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Chroot) -> Result<T>,
    {
        self.with_chroot(f)
    }

    fn with_chroot<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Chroot) -> Result<T>,
    {
        let apt_options = self.target.apt_options();
        ChrootSession::execute(&self.image, apt_options.as_deref(), &self.policy, f)
    }
}
