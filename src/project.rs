//! A named box: one root, its artifacts and its releases.
//!
//! # Directory layout
//!
//! ```text
//! build/                     working_directory("build")
//! ├── root/                  bootstrapped root
//! ├── filesystem.squashfs    root blob shared by the squashfs artifacts
//! ├── upgrade/               links bundled into the upgrade tar
//! └── puppet.log             last provisioning log
//! dist/                      working_directory("dist")
//! ├── disk-squashfs, iso-squashfs, ...
//! ├── upgrade.tar
//! └── latest.yml
//! ```
//!
//! In named mode the box name is appended to both directories
//! (`build/<name>`), and the architecture too in multi-architecture mode
//! (`build/<name>/<arch>`), so several boxes can share one checkout.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::artifact::{
    boot_link_target, Assembler, AssemblyOptions, DiskImage, DiskSquashfsImage, IsoImage,
    IsoSquashfsImage, LiveImage,
};
use crate::boot::BootProcess;
use crate::config::Config;
use crate::process::{Cmd, Executor};
use crate::provision::ProvisioningConfigurator;
use crate::release::{release_name, release_number_of, ReleaseMetadata, ReleaseNumber};
use crate::target::BuildTarget;

/// Used for `description_url` when RELEASE_BASE_URL is unset.
pub const DEFAULT_RELEASE_BASE_URL: &str = "http://localhost/release";

/// Artifacts a box can be built into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Disk,
    DiskSquashfs,
    Iso,
    IsoSquashfs,
    Live,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::Disk,
        ArtifactKind::DiskSquashfs,
        ArtifactKind::Iso,
        ArtifactKind::IsoSquashfs,
        ArtifactKind::Live,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ArtifactKind::Disk => "disk",
            ArtifactKind::DiskSquashfs => "disk-squashfs",
            ArtifactKind::Iso => "iso",
            ArtifactKind::IsoSquashfs => "iso-squashfs",
            ArtifactKind::Live => "live",
        }
    }

    /// Raw disks can be converted with qemu-img.
    pub fn is_disk(&self) -> bool {
        !matches!(self, ArtifactKind::Iso | ArtifactKind::IsoSquashfs)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ArtifactKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match ArtifactKind::ALL.iter().find(|k| k.name() == s) {
            Some(kind) => Ok(*kind),
            None => bail!("Unknown artifact '{}'", s),
        }
    }
}

pub struct BoxProject {
    name: String,
    target: BuildTarget,
    config: Config,
    exec: Arc<dyn Executor>,
    base_dir: PathBuf,
    root: Option<PathBuf>,
    manifest: Option<PathBuf>,
    named_mode: bool,
    multi_architecture: bool,
    release_number: ReleaseNumber,
    size_mb: Option<u64>,
}

impl BoxProject {
    pub fn new(
        name: impl Into<String>,
        target: BuildTarget,
        config: Config,
        exec: Arc<dyn Executor>,
    ) -> Self {
        let release_number = config
            .release_number
            .clone()
            .unwrap_or_else(ReleaseNumber::now);
        Self {
            name: name.into(),
            target,
            config,
            exec,
            base_dir: PathBuf::from("."),
            root: None,
            manifest: None,
            named_mode: false,
            multi_architecture: false,
            release_number,
            size_mb: None,
        }
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    /// Root directory used instead of `build/root`.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Puppet manifest file or directory. Defaults to the base directory.
    pub fn with_manifest(mut self, manifest: impl Into<PathBuf>) -> Self {
        self.manifest = Some(manifest.into());
        self
    }

    pub fn with_named_mode(mut self, named: bool) -> Self {
        self.named_mode = named;
        self
    }

    pub fn with_multi_architecture(mut self, multi: bool) -> Self {
        self.multi_architecture = multi;
        self
    }

    pub fn with_size_mb(mut self, size_mb: Option<u64>) -> Self {
        self.size_mb = size_mb;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &BuildTarget {
        &self.target
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.exec
    }

    pub fn release_number(&self) -> &ReleaseNumber {
        &self.release_number
    }

    pub fn release_name(&self) -> String {
        release_name(&self.name, &self.release_number)
    }

    // =========================================================================
    // Paths
    // =========================================================================

    /// `kind`, then the box name in named mode, then the architecture in
    /// multi-architecture mode.
    pub fn working_directory(&self, kind: &str) -> PathBuf {
        let mut dir = self.base_dir.join(kind);
        if self.named_mode {
            dir.push(&self.name);
            if self.multi_architecture {
                dir.push(self.target.architecture.name());
            }
        }
        dir
    }

    pub fn build_dir(&self) -> PathBuf {
        self.working_directory("build")
    }

    pub fn dist_dir(&self) -> PathBuf {
        self.working_directory("dist")
    }

    pub fn root_dir(&self) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(|| self.build_dir().join("root"))
    }

    pub fn upgrade_directory(&self) -> PathBuf {
        self.build_dir().join("upgrade")
    }

    pub fn upgrade_file(&self) -> PathBuf {
        self.dist_dir().join("upgrade.tar")
    }

    pub fn latest_file(&self) -> PathBuf {
        self.dist_dir().join("latest.yml")
    }

    pub fn artifact_file(&self, kind: ArtifactKind) -> PathBuf {
        self.dist_dir().join(kind.name())
    }

    pub fn manifest(&self) -> PathBuf {
        self.manifest.clone().unwrap_or_else(|| self.base_dir.clone())
    }

    // =========================================================================
    // Boot and assembly
    // =========================================================================

    pub fn provisioning_configurator(&self) -> ProvisioningConfigurator {
        let mut configurator = ProvisioningConfigurator::new(self.manifest())
            .with_variable("release_name", self.release_name())
            .with_log_dir(self.build_dir())
            .with_debug(self.config.puppet_debug);
        if let Some(secret) = &self.config.secret {
            configurator = configurator.with_variable("system_builder_secret", secret.clone());
        }
        configurator
    }

    fn has_manifest(&self) -> bool {
        let manifest = self.manifest();
        manifest.is_file() || manifest.join("manifests/site.pp").is_file()
    }

    /// Boot process of the box root, provisioned when a manifest exists.
    pub fn boot(&self) -> BootProcess {
        let mut boot = BootProcess::new(self.root_dir(), self.target.clone(), self.exec.clone())
            .with_offline(self.config.offline);
        if self.has_manifest() {
            boot.add_configurator(self.provisioning_configurator());
        } else {
            debug!("No puppet manifest in {}", self.manifest().display());
        }
        boot
    }

    pub fn assembly_options(&self) -> AssemblyOptions {
        let mut options = AssemblyOptions {
            build_dir: self.build_dir(),
            owner: self.config.user.clone(),
            version: self.release_name(),
            ..AssemblyOptions::default()
        };
        if let Some(size_mb) = self.size_mb {
            options.size_mb = size_mb;
        }
        options
    }

    pub fn assembler(&self, kind: ArtifactKind) -> Box<dyn Assembler> {
        let file = self.artifact_file(kind);
        let options = self.assembly_options();
        match kind {
            ArtifactKind::Disk => Box::new(DiskImage::new(file, options)),
            ArtifactKind::DiskSquashfs => Box::new(DiskSquashfsImage::new(file, options)),
            ArtifactKind::Iso => Box::new(IsoImage::new(file, options)),
            ArtifactKind::IsoSquashfs => Box::new(IsoSquashfsImage::new(file, options)),
            ArtifactKind::Live => Box::new(LiveImage::new(file, options)),
        }
    }

    /// Build `kind` from `boot`. The root is created on first use.
    pub fn build(&self, kind: ArtifactKind, boot: &mut BootProcess) -> Result<PathBuf> {
        info!("Building {} for {}", kind, self.release_name());
        let mut assembler = self.assembler(kind);
        assembler
            .create(boot)
            .with_context(|| format!("Failed to build {}", kind))?;
        Ok(assembler.file().to_path_buf())
    }

    // =========================================================================
    // Releases
    // =========================================================================

    /// Bundle squashfs, kernel and initrd into the upgrade tar and write the
    /// release metadata next to it.
    pub fn create_upgrade(&self) -> Result<ReleaseMetadata> {
        let release = self.release_name();
        let root = absolute(&self.root_dir())?;
        let squashfs = absolute(&self.assembly_options().squashfs_file())?;
        if !squashfs.exists() {
            bail!(
                "{} not found. Build disk-squashfs or iso-squashfs first.",
                squashfs.display()
            );
        }

        let upgrade_dir = self.upgrade_directory();
        if upgrade_dir.exists() {
            fs::remove_dir_all(&upgrade_dir)?;
        }
        fs::create_dir_all(&upgrade_dir)?;
        fs::create_dir_all(self.dist_dir())?;

        let boot_file = |name: &str| root.join("boot").join(boot_link_target(&root, name));
        let links = [
            (squashfs.clone(), format!("filesystem-{}.squashfs", release)),
            (boot_file("vmlinuz"), format!("vmlinuz-{}", release)),
            (boot_file("initrd.img"), format!("initrd-{}.img", release)),
        ];
        for (target, link) in &links {
            symlink(target, upgrade_dir.join(link))
                .with_context(|| format!("Failed to link {}", link))?;
        }

        let upgrade_file = self.upgrade_file();
        self.exec.execute(
            &Cmd::new("tar")
                .arg("-cf")
                .arg_path(&upgrade_file)
                .arg("--dereference")
                .arg("-C")
                .arg_path(&upgrade_dir)
                .arg(".")
                .error_msg("Failed to create upgrade bundle"),
        )?;

        let base_url = self
            .config
            .release_base_url
            .as_deref()
            .unwrap_or(DEFAULT_RELEASE_BASE_URL);
        let metadata = ReleaseMetadata::for_upgrade(&release, &upgrade_file, base_url)?;
        metadata.write(&self.latest_file())?;
        info!("Release {} written to {}", release, self.latest_file().display());
        Ok(metadata)
    }

    /// Release number of the last upgrade, falling back to this build's.
    pub fn latest_release_number(&self) -> ReleaseNumber {
        ReleaseMetadata::read(&self.latest_file())
            .ok()
            .and_then(|latest| release_number_of(&self.name, &latest.name))
            .unwrap_or_else(|| self.release_number.clone())
    }

    /// Directory `dist` copies artifacts into: DIST, else `~/dist/<name>`.
    pub fn dist_target(&self) -> Result<PathBuf> {
        if let Some(dist) = &self.config.dist {
            return Ok(dist.clone());
        }
        let home = dirs::home_dir().context("Cannot determine home directory, set DIST")?;
        Ok(home.join("dist").join(&self.name))
    }

    /// Copy the release artifacts, named after the release, into `target`.
    pub fn collect_dist(&self, target: &Path) -> Result<Vec<PathBuf>> {
        let number = self.latest_release_number();
        let prefix = format!("{}-{}", self.name, number);
        fs::create_dir_all(target)
            .with_context(|| format!("Failed to create {}", target.display()))?;

        let mut collected = Vec::new();

        let disk = self.artifact_file(ArtifactKind::DiskSquashfs);
        if disk.exists() {
            let gzipped = target.join(format!("{}.disk.gz", prefix));
            self.exec.execute(&Cmd::shell(format!(
                "gzip --fast --stdout {} > {}",
                disk.display(),
                gzipped.display()
            )))?;
            collected.push(gzipped);
        } else {
            warn!("{} not built, skipped", disk.display());
        }

        let copies = [
            (self.artifact_file(ArtifactKind::IsoSquashfs), format!("{}.iso", prefix)),
            (self.upgrade_file(), format!("{}.tar", prefix)),
            (self.latest_file(), "latest.yml".to_string()),
        ];
        for (source, name) in copies {
            if !source.exists() {
                warn!("{} not built, skipped", source.display());
                continue;
            }
            let destination = target.join(name);
            fs::copy(&source, &destination).with_context(|| {
                format!("Failed to copy {} to {}", source.display(), destination.display())
            })?;
            collected.push(destination);
        }

        if collected.is_empty() {
            bail!("Nothing to collect in {}", self.dist_dir().display());
        }
        Ok(collected)
    }

    // =========================================================================
    // Workspace
    // =========================================================================

    /// Link `build` and `dist` to directories below WORKING_DIR.
    pub fn setup(&self) -> Result<()> {
        let Some(working_dir) = &self.config.working_dir else {
            info!("WORKING_DIR not set, nothing to set up");
            return Ok(());
        };
        for subdir in ["build", "dist"] {
            let working_subdir = working_dir.join(subdir);
            if !working_subdir.exists() {
                info!("Creating {}", working_subdir.display());
                fs::create_dir_all(&working_subdir)?;
            }
            let link = self.base_dir.join(subdir);
            if link.symlink_metadata().is_err() {
                symlink(&working_subdir, &link).with_context(|| {
                    format!("Failed to link {} to {}", link.display(), working_subdir.display())
                })?;
            }
        }
        Ok(())
    }

    /// Remove the root (unless something still uses it), the upgrade
    /// directory, the files in the build directory and the dist content.
    pub fn clean(&self) -> Result<()> {
        let root = self.root_dir();
        if root.exists() {
            let busy = self.exec.execute(
                &Cmd::new("fuser")
                    .arg("-s")
                    .arg_path(&root)
                    .privileged()
                    .allow_fail(),
            )?;
            if busy.success() {
                warn!("{} is in use, kept", root.display());
            } else {
                self.exec
                    .execute(&Cmd::new("rm").arg("-rf").arg_path(&root).privileged())?;
            }
        }

        let upgrade_dir = self.upgrade_directory();
        if upgrade_dir.exists() {
            fs::remove_dir_all(&upgrade_dir)?;
        }

        remove_entries(&self.build_dir(), false)?;
        remove_entries(&self.dist_dir(), true)?;
        Ok(())
    }
}

/// Remove the files of `dir`, and its subdirectories too if `recursive`.
fn remove_entries(dir: &Path, recursive: bool) -> Result<()> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Ok(());
    };
    for entry in entries {
        let path = entry?.path();
        let metadata = fs::symlink_metadata(&path)?;
        if metadata.is_dir() {
            if recursive {
                fs::remove_dir_all(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        } else {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
    }
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
