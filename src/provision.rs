//! Provisioning the root with puppet.
//!
//! The manifest is either a single `.pp` file or a directory holding
//! `manifests/site.pp` and the usual `files`, `modules`, `templates` and
//! `plugins` directories. Either way the puppet output is captured to a log,
//! the log is copied back to the host, and any error line in it fails the
//! build.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::boot::{ConfigureOptions, Configurator};
use crate::chroot::{AptInstallOptions, Chroot};
use crate::error::BuildError;
use crate::image::RsyncOptions;
use crate::target::Release;

/// Staging directory of a manifest directory, inside the root.
const CONTEXT_DIR: &str = "/tmp/puppet";

/// Subdirectories of a manifest directory that are staged.
const PUPPET_DIRECTORIES: [&str; 5] = ["manifests", "files", "modules", "templates", "plugins"];

/// Log line prefixes puppet uses for errors, old and new style.
const ERROR_MARKERS: [&str; 2] = ["err:", "Error:"];

pub struct ProvisioningConfigurator {
    manifest: PathBuf,
    variables: BTreeMap<String, String>,
    log_dir: PathBuf,
    debug: bool,
}

impl ProvisioningConfigurator {
    pub fn new(manifest: impl Into<PathBuf>) -> Self {
        Self {
            manifest: manifest.into(),
            variables: BTreeMap::new(),
            log_dir: PathBuf::from("."),
            debug: false,
        }
    }

    /// Variable exported to the manifests as `$key`.
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Host directory receiving `puppet.log`.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn manifest(&self) -> &Path {
        &self.manifest
    }

    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }

    /// Host copy of the last run's log.
    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join("puppet.log")
    }

    /// Staged subdirectories present in the manifest directory.
    pub fn puppet_directories(&self) -> Vec<PathBuf> {
        PUPPET_DIRECTORIES
            .iter()
            .map(|d| self.manifest.join(d))
            .filter(|d| d.is_dir())
            .collect()
    }

    fn flags(&self) -> String {
        if self.debug {
            "--color=false --debug --verbose".to_string()
        } else {
            "--color=false".to_string()
        }
    }

    fn prepare(&self, chroot: &Chroot, release: Release) -> Result<()> {
        chroot.apt_install(
            &["puppet", release.ruby_package()],
            &AptInstallOptions::default(),
        )?;
        chroot.image().write("/etc/default/puppet", "START=no\n")
    }

    fn apply_file(&self, chroot: &Chroot, release: Release) -> Result<()> {
        chroot.image().install("/tmp/puppet.pp", &[&self.manifest])?;
        chroot.sh(format!(
            "{} {} /tmp/puppet.pp 2>&1 | tee /tmp/puppet.log",
            release.puppet_apply(),
            self.flags()
        ))?;
        self.process_log(chroot, "/tmp/puppet.log")
    }

    fn apply_directory(&self, chroot: &Chroot, release: Release) -> Result<()> {
        let image = chroot.image();
        image.mkdir(CONTEXT_DIR)?;
        image.rsync(
            CONTEXT_DIR,
            &self.puppet_directories(),
            &RsyncOptions::mirror().exclude("*~"),
        )?;

        image.open(format!("{}/manifests/config.pp", CONTEXT_DIR), |f| {
            for (key, value) in &self.variables {
                writeln!(f, "${}=\"{}\"", key, value)?;
            }
            Ok(())
        })?;

        image.mkdir(format!("{}/config", CONTEXT_DIR))?;
        image.write(
            format!("{}/config/fileserver.conf", CONTEXT_DIR),
            &fileserver_config(CONTEXT_DIR),
        )?;

        image.mkdir(format!("{}/tmp", CONTEXT_DIR))?;

        let mut command = format!(
            "{} {} --modulepath '{dir}/modules' --confdir='{dir}/config' --vardir={dir}/tmp",
            release.puppet_apply(),
            self.flags(),
            dir = CONTEXT_DIR
        );
        // Removed in puppet 4
        if release <= Release::Jessie {
            command.push_str(&format!(
                " --templatedir='{dir}/templates' --manifestdir='{dir}/manifests'",
                dir = CONTEXT_DIR
            ));
        }
        command.push_str(&format!(
            " '{dir}/manifests/site.pp' 2>&1 | tee {dir}/puppet.log",
            dir = CONTEXT_DIR
        ));
        chroot.sh(command)?;

        self.process_log(chroot, &format!("{}/puppet.log", CONTEXT_DIR))
    }

    /// Copy the log out of the root, then fail if it reports errors.
    fn process_log(&self, chroot: &Chroot, log_in_root: &str) -> Result<()> {
        let source = chroot.image().file(log_in_root)?;
        let log = self.log_file();
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("Failed to create {}", self.log_dir.display()))?;
        fs::copy(&source, &log)
            .with_context(|| format!("Failed to copy {} to {}", source.display(), log.display()))?;

        let content = fs::read_to_string(&log)
            .with_context(|| format!("Failed to read {}", log.display()))?;
        let errors = error_lines(&content);
        if !errors.is_empty() {
            return Err(BuildError::Provisioning { log, errors }.into());
        }
        Ok(())
    }
}

impl Configurator for ProvisioningConfigurator {
    fn name(&self) -> &str {
        "provisioning"
    }

    fn configure(&self, chroot: &Chroot, options: &ConfigureOptions) -> Result<()> {
        let release = options.target.release;
        info!("Running puppet configuration from {}", self.manifest.display());
        self.prepare(chroot, release)?;
        if self.manifest.is_dir() {
            self.apply_directory(chroot, release)
        } else {
            self.apply_file(chroot, release)
        }
    }
}

/// Lines of a puppet log reporting an error.
pub fn error_lines(log: &str) -> Vec<String> {
    log.lines()
        .filter(|line| ERROR_MARKERS.iter().any(|m| line.starts_with(m)))
        .map(str::to_string)
        .collect()
}

/// `fileserver.conf` exposing the staged files and plugins.
pub fn fileserver_config(context_dir: &str) -> String {
    let mut config = String::new();
    for mount_point in ["files", "plugins"] {
        config.push_str(&format!(
            "[{mount}]\npath {dir}/{mount}\nallow *\n",
            mount = mount_point,
            dir = context_dir
        ));
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_error_markers_at_line_start() {
        let log = "info: Applying configuration version '1'\n\
                   err: /Stage[main]/Ntp/Package[ntp]: Could not find package\n\
                   notice: Finished catalog run\n\
                   Error: Could not parse for environment production\n\
                   warning: an err: in the middle does not count\n";
        let errors = error_lines(log);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("err: /Stage"));
        assert!(errors[1].starts_with("Error: Could not parse"));
    }

    #[test]
    fn clean_log_has_no_errors() {
        assert!(error_lines("notice: Finished catalog run in 3.2 seconds\n").is_empty());
    }

    #[test]
    fn fileserver_exposes_files_and_plugins() {
        assert_eq!(
            fileserver_config("/tmp/puppet"),
            "[files]\npath /tmp/puppet/files\nallow *\n\
             [plugins]\npath /tmp/puppet/plugins\nallow *\n"
        );
    }

    #[test]
    fn variables_are_sorted() {
        let configurator = ProvisioningConfigurator::new("manifests")
            .with_variable("secret", "s3cr3t")
            .with_variable("release_name", "demo-20240101-0000");
        let keys: Vec<&String> = configurator.variables().keys().collect();
        assert_eq!(keys, vec!["release_name", "secret"]);
    }
}
