//! Preflight checks for system-builder.
//!
//! Validates host tools and privileges before starting a build.
//! Run with `system-builder preflight` to check everything is ready.

use anyhow::{bail, Result};
use std::path::Path;

use crate::process::running_as_root;

/// Result of a single preflight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// Check passed.
    Pass,
    /// Check failed - build will fail.
    Fail,
    /// Check passed but with a warning.
    Warn,
}

impl CheckResult {
    fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            details: None,
        }
    }

    fn pass_with(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            details: Some(details.to_string()),
        }
    }

    fn fail(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Fail,
            details: Some(details.to_string()),
        }
    }

    fn warn(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Warn,
            details: Some(details.to_string()),
        }
    }
}

/// Results of all preflight checks.
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    /// Returns true if all checks passed (no failures).
    pub fn all_passed(&self) -> bool {
        !self.checks.iter().any(|c| c.status == CheckStatus::Fail)
    }

    pub fn fail_count(&self) -> usize {
        self.checks.iter().filter(|c| c.status == CheckStatus::Fail).count()
    }

    pub fn warn_count(&self) -> usize {
        self.checks.iter().filter(|c| c.status == CheckStatus::Warn).count()
    }

    /// Print the report to stdout.
    pub fn print(&self) {
        println!("=== Preflight Check Results ===\n");

        for check in &self.checks {
            let (icon, status_str) = match check.status {
                CheckStatus::Pass => ("✓", "PASS"),
                CheckStatus::Fail => ("✗", "FAIL"),
                CheckStatus::Warn => ("⚠", "WARN"),
            };

            print!("  {} [{}] {}", icon, status_str, check.name);
            if let Some(details) = &check.details {
                println!(": {}", details);
            } else {
                println!();
            }
        }

        println!();
        let total = self.checks.len();
        let passed = self.checks.iter().filter(|c| c.status == CheckStatus::Pass).count();
        let failed = self.fail_count();
        let warned = self.warn_count();

        println!("Summary: {}/{} passed", passed, total);
        if failed > 0 {
            println!("         {} FAILED - build will not succeed", failed);
        }
        if warned > 0 {
            println!("         {} warnings", warned);
        }
    }
}

/// Tools every build runs, with the Debian package providing them.
const REQUIRED_TOOLS: [(&str, &str, &str); 9] = [
    ("debootstrap", "debootstrap", "Required to bootstrap the root"),
    ("sfdisk", "fdisk", "Required to partition disk images"),
    ("losetup", "mount", "Required to format partitions"),
    ("mount", "mount", "Required to populate partitions"),
    ("rsync", "rsync", "Required to copy the root"),
    ("mke2fs", "e2fsprogs", "Required for ext3 partitions"),
    ("mksquashfs", "squashfs-tools", "Required to compress the root"),
    ("tar", "tar", "Required for upgrade bundles"),
    ("blkid", "util-linux", "Required to probe partitions"),
];

/// Tools only some artifacts need.
const OPTIONAL_TOOLS: [(&str, &str, &str); 5] = [
    ("mkdosfs", "dosfstools", "Required for disk and live images"),
    ("genisoimage", "genisoimage", "Required for iso images"),
    ("syslinux", "syslinux", "Required for disk and live images"),
    ("extlinux", "extlinux", "Required for disk-squashfs images (in the root)"),
    ("qemu-img", "qemu-utils", "Required for `system-builder convert`"),
];

/// Run all preflight checks. `manifest` is the puppet manifest of the box.
pub fn run_preflight(manifest: &Path) -> PreflightReport {
    let mut checks = Vec::new();

    println!("Running preflight checks...\n");

    // =======================================================================
    // Host Tools
    // =======================================================================
    println!("Checking host tools...");
    checks.extend(check_host_tools());

    // =======================================================================
    // Build Environment
    // =======================================================================
    println!("Checking build environment...");
    checks.extend(check_build_environment(manifest));

    println!();

    PreflightReport { checks }
}

/// Run preflight and bail if any checks fail.
pub fn run_preflight_or_fail(manifest: &Path) -> Result<()> {
    let report = run_preflight(manifest);
    report.print();

    if !report.all_passed() {
        bail!(
            "Preflight failed: {} check(s) failed. Fix the issues above before building.",
            report.fail_count()
        );
    }

    println!("All preflight checks passed!\n");
    Ok(())
}

fn check_host_tools() -> Vec<CheckResult> {
    let mut results = Vec::new();
    for (tool, package, purpose) in REQUIRED_TOOLS {
        results.push(check_tool_exists(tool, package, purpose, true));
    }
    for (tool, package, purpose) in OPTIONAL_TOOLS {
        results.push(check_tool_exists(tool, package, purpose, false));
    }
    results
}

/// Check if a tool exists in PATH (or the sbin directories).
fn check_tool_exists(tool: &str, package: &str, purpose: &str, required: bool) -> CheckResult {
    let found = which::which(tool).ok().or_else(|| {
        ["/sbin", "/usr/sbin"]
            .iter()
            .map(|dir| Path::new(dir).join(tool))
            .find(|path| path.exists())
    });
    match found {
        Some(path) => CheckResult::pass_with(tool, &path.display().to_string()),
        None => {
            let msg = format!("Not found. Install '{}' package. {}", package, purpose);
            if required {
                CheckResult::fail(tool, &msg)
            } else {
                CheckResult::warn(tool, &msg)
            }
        }
    }
}

fn check_build_environment(manifest: &Path) -> Vec<CheckResult> {
    let mut results = Vec::new();

    if running_as_root() {
        results.push(CheckResult::pass_with("Privileges", "running as root"));
    } else if which::which("sudo").is_ok() {
        results.push(CheckResult::pass_with(
            "Privileges",
            "privileged commands run through sudo",
        ));
    } else {
        results.push(CheckResult::fail(
            "Privileges",
            "Not root and sudo not found - mounts and chroots will fail",
        ));
    }

    if Path::new("/dev/loop-control").exists() {
        results.push(CheckResult::pass("Loop devices"));
    } else {
        results.push(CheckResult::fail(
            "Loop devices",
            "/dev/loop-control missing - load the loop module",
        ));
    }

    if manifest.is_file() || manifest.join("manifests/site.pp").is_file() {
        results.push(CheckResult::pass_with(
            "Puppet manifest",
            &manifest.display().to_string(),
        ));
    } else {
        results.push(CheckResult::warn(
            "Puppet manifest",
            &format!(
                "None in {} - the root will not be provisioned",
                manifest.display()
            ),
        ));
    }

    results
}
