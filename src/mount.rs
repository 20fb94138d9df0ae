//! Scoped privileged resources: mounts and loop devices.
//!
//! Acquire and release always come in pairs. The release step runs on every
//! exit path of the enclosed work, and a failing release never hides the
//! error of the work itself (see [`release_after`]).

use anyhow::{Context, Result};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::BuildError;
use crate::process::{Cmd, Executor};

/// How hard to try before an unmount counts as failed.
///
/// Unmount is the one operation expected to fail transiently, when a process
/// that just exited still holds the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnmountPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for UnmountPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl UnmountPolicy {
    /// Same attempts, no waiting in between.
    pub fn immediate() -> Self {
        Self {
            delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Unmount `dir`, retrying according to `policy`.
pub fn unmount(exec: &dyn Executor, dir: &Path, policy: &UnmountPolicy) -> Result<()> {
    let attempts = policy.attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match exec.execute(&Cmd::new("umount").arg_path(dir).privileged()) {
            Ok(_) => return Ok(()),
            Err(e) => {
                last_error = e.to_string();
                if attempt < attempts {
                    warn!(
                        "umount {} failed (attempt {}/{}), retrying",
                        dir.display(),
                        attempt,
                        attempts
                    );
                    thread::sleep(policy.delay);
                }
            }
        }
    }
    Err(BuildError::ResourceBusy {
        path: dir.to_path_buf(),
        attempts,
        last_error,
    }
    .into())
}

/// Combine the outcome of some work with the outcome of releasing the
/// resource it used.
///
/// A release failure after successful work is returned as is. After failed
/// work, the release failure is attached to the primary error as
/// [`BuildError::CleanupFailed`] context.
pub fn release_after<T>(primary: Result<T>, release: Result<()>, resource: &str) -> Result<T> {
    match (primary, release) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(release_err)) => Err(release_err),
        (Err(primary_err), Ok(())) => Err(primary_err),
        (Err(primary_err), Err(release_err)) => Err(primary_err.context(BuildError::CleanupFailed {
            resource: resource.to_string(),
            secondary: format!("{:#}", release_err),
        })),
    }
}

/// Run `work`, then `release`, on every exit path of `work` including a
/// panic. The panic resumes once the resource is released.
fn guarded<T>(
    work: impl FnOnce() -> Result<T>,
    release: impl FnOnce() -> Result<()>,
    resource: &str,
) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(result) => release_after(result, release(), resource),
        Err(payload) => {
            if let Err(e) = release() {
                warn!("Failed to release {} while unwinding: {:#}", resource, e);
            }
            panic::resume_unwind(payload)
        }
    }
}

/// A filesystem to mount on a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: String,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub options: Vec<String>,
}

impl Mount {
    pub fn new(source: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            fstype: None,
            options: Vec::new(),
        }
    }

    /// Region of `file` starting at byte `offset`, through a loop device.
    pub fn loop_offset(file: &Path, offset: u64, target: impl Into<PathBuf>) -> Self {
        let mut mount = Self::new(file.to_string_lossy(), target);
        mount.options = vec!["loop".to_string(), format!("offset={}", offset)];
        mount
    }

    /// Process information filesystem.
    pub fn proc(target: impl Into<PathBuf>) -> Self {
        let mut mount = Self::new("proc", target);
        mount.fstype = Some("proc".to_string());
        mount
    }

    fn command(&self) -> Cmd {
        let mut cmd = Cmd::new("mount");
        if !self.options.is_empty() {
            cmd = cmd.arg("-o").arg(self.options.join(","));
        }
        if let Some(fstype) = &self.fstype {
            cmd = cmd.arg("-t").arg(fstype);
        }
        cmd.arg(&self.source).arg_path(&self.target).privileged()
    }

    /// Mount, run `f` with the mount point, unmount.
    ///
    /// The mount point is created if missing. Unmount follows `policy` and
    /// happens whether `f` succeeds, fails or panics.
    pub fn scoped<T, F>(&self, exec: &dyn Executor, policy: &UnmountPolicy, f: F) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<T>,
    {
        exec.execute(
            &Cmd::new("mkdir")
                .arg("-p")
                .arg_path(&self.target)
                .privileged(),
        )?;
        exec.execute(&self.command())
            .with_context(|| format!("Failed to mount {}", self))?;
        debug!("Mounted {}", self);

        guarded(
            || f(&self.target),
            || unmount(exec, &self.target, policy),
            &self.target.display().to_string(),
        )
    }
}

impl fmt::Display for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.source, self.target.display())
    }
}

/// Attach `file` at byte `offset` to a free loop device, run `f` with the
/// device path, detach.
///
/// Devices come from `losetup --find` for each use, so concurrent builds on
/// one host never share a device.
pub fn with_loop_device<T, F>(exec: &dyn Executor, file: &Path, offset: u64, f: F) -> Result<T>
where
    F: FnOnce(&str) -> Result<T>,
{
    let attached = exec
        .execute(
            &Cmd::new("losetup")
                .args(["--find", "--show", "--offset"])
                .arg(offset.to_string())
                .arg_path(file)
                .privileged(),
        )
        .with_context(|| format!("Failed to attach {} to a loop device", file.display()))?;
    let device = attached.stdout_trimmed().to_string();
    if device.is_empty() {
        anyhow::bail!("losetup did not report a device for {}", file.display());
    }
    debug!("Attached {} at offset {} to {}", file.display(), offset, device);

    guarded(
        || f(&device),
        || {
            exec.execute(&Cmd::new("losetup").arg("-d").arg(&device).privileged())
                .map(|_| ())
        },
        &device,
    )
}
