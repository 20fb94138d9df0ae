//! Error taxonomy for image builds.
//!
//! Everything in the crate returns `anyhow::Result`. The variants below are
//! the failures callers (and tests) need to tell apart, so they are raised as
//! `BuildError` and can be recovered with `anyhow::Error::downcast_ref`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    /// An executed command exited non-zero (bootstrap, apt, formatter, ...).
    #[error("'{command}' failed (exit code {code}){}", format_stderr(.stderr))]
    ToolFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The provisioning log contains error lines. The log has already been
    /// copied out when this is raised.
    #[error("Error(s) during provisioning, see {}", .log.display())]
    Provisioning { log: PathBuf, errors: Vec<String> },

    /// An unmount kept failing after every retry.
    #[error("{} still busy after {attempts} unmount attempts: {last_error}", .path.display())]
    ResourceBusy {
        path: PathBuf,
        attempts: u32,
        last_error: String,
    },

    /// Releasing a resource failed after the enclosed work had already failed.
    /// Attached as context on top of the primary error.
    #[error("releasing {resource} also failed: {secondary}")]
    CleanupFailed { resource: String, secondary: String },

    #[error("{} resolves outside of the image root", .path.display())]
    PathEscapesRoot { path: PathBuf },

    /// SIGINT or SIGTERM arrived; no new step is started.
    #[error("Interrupted")]
    Interrupted,
}

fn format_stderr(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(":\n{}", stderr)
    }
}
