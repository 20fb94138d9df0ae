//! Command execution for every tool the build drives.
//!
//! All external commands are described with [`Cmd`] and run through an
//! [`Executor`]. The host executor elevates privileged commands with `sudo`;
//! the recording executor stands in for it in tests so the exact command
//! sequence of a build can be asserted without touching the host.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::debug;

use crate::error::BuildError;

/// Result of a command execution.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    /// Exit code, or -1 if terminated by signal.
    pub code: i32,
    /// Captured stdout as a string.
    pub stdout: String,
    /// Captured stderr as a string.
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Get stdout, trimmed of whitespace.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Get stderr, trimmed of whitespace.
    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Builder describing a command to execute.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
    /// Run with elevated privileges.
    privileged: bool,
    /// If true, don't fail on non-zero exit.
    allow_fail: bool,
    /// Custom error message prefix.
    error_prefix: Option<String>,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            stdin: None,
            privileged: false,
            allow_fail: false,
            error_prefix: None,
        }
    }

    /// `sh -c <script>`, for pipelines and redirections.
    pub fn shell(script: impl AsRef<str>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Add a path as an argument.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Feed `input` to the command's stdin.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Run the command with elevated privileges.
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Allow non-zero exit codes without failing.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Set a custom error message prefix.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// Command line as it would be typed, without the privilege prefix.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Turn a finished execution into the command's outcome: an error for a
    /// non-zero exit unless `allow_fail` was set.
    fn check(&self, result: CommandResult) -> Result<CommandResult> {
        if self.allow_fail || result.success() {
            return Ok(result);
        }
        let failure = BuildError::ToolFailed {
            command: self.command_line(),
            code: result.code,
            stderr: result.stderr.clone(),
        };
        match &self.error_prefix {
            Some(prefix) => Err(anyhow::Error::new(failure).context(prefix.clone())),
            None => Err(failure.into()),
        }
    }

    /// Run the command on the host (without privilege elevation) and capture output.
    pub fn run(self) -> Result<CommandResult> {
        HostExecutor::unprivileged().execute(&self)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.privileged {
            write!(f, "sudo ")?;
        }
        write!(f, "{}", self.command_line())
    }
}

/// Runs commands on behalf of the build.
///
/// Every privileged operation in the crate goes through this seam.
pub trait Executor: Send + Sync {
    fn execute(&self, cmd: &Cmd) -> Result<CommandResult>;
}

/// Executes commands on the build host.
#[derive(Debug, Clone)]
pub struct HostExecutor {
    /// Prefix privileged commands with this program (usually `sudo`).
    elevate_with: Option<String>,
}

impl HostExecutor {
    /// Elevate privileged commands with `sudo`, unless already running as root.
    pub fn new() -> Self {
        let elevate_with = if running_as_root() {
            None
        } else {
            Some("sudo".to_string())
        };
        Self { elevate_with }
    }

    /// Never elevate.
    pub fn unprivileged() -> Self {
        Self { elevate_with: None }
    }
}

impl Default for HostExecutor {
    fn default() -> Self {
        Self::new()
    }
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Survive SIGINT and SIGTERM instead of dying with mounts and loop
/// devices held.
///
/// The signal still reaches the running tool through the process group. Its
/// failure unwinds through the scoped releases, and [`check_interrupted`]
/// keeps further steps from starting.
pub fn install_interrupt_handler() -> Result<()> {
    ctrlc::set_handler(mark_interrupted).context("Failed to install the signal handler")
}

pub fn mark_interrupted() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

pub fn check_interrupted() -> Result<()> {
    if interrupted() {
        return Err(BuildError::Interrupted.into());
    }
    Ok(())
}

/// True when `id -u` reports uid 0.
pub fn running_as_root() -> bool {
    Cmd::new("id")
        .arg("-u")
        .run()
        .map(|r| r.stdout_trimmed() == "0")
        .unwrap_or(false)
}

impl Executor for HostExecutor {
    fn execute(&self, cmd: &Cmd) -> Result<CommandResult> {
        let mut command = match (&self.elevate_with, cmd.privileged) {
            (Some(elevate), true) => {
                let mut c = Command::new(elevate);
                c.arg(&cmd.program);
                c
            }
            _ => Command::new(&cmd.program),
        };
        command.args(&cmd.args);
        command.stdin(if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        debug!("$ {}", cmd);

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", cmd.program))?;

        if let Some(input) = &cmd.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input.as_bytes())
                    .with_context(|| format!("Failed to write stdin of '{}'", cmd.program))?;
            }
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for '{}'", cmd.program))?;

        let result = CommandResult {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        cmd.check(result)
    }
}

// =============================================================================
// Recording executor
// =============================================================================

struct FailureRule {
    pattern: String,
    remaining: usize,
    stderr: String,
}

struct Response {
    pattern: String,
    stdout: String,
}

#[derive(Default)]
struct RecorderState {
    commands: Vec<String>,
    failures: Vec<FailureRule>,
    responses: Vec<Response>,
}

/// Executor that records commands instead of running them.
///
/// Commands succeed with empty output unless a rule says otherwise. Rules
/// match on a substring of the command line (see [`Cmd::command_line`]).
#[derive(Default)]
pub struct RecordingExecutor {
    state: Mutex<RecorderState>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `times` commands containing `pattern`.
    pub fn fail_times(&self, pattern: &str, times: usize) -> &Self {
        self.lock().failures.push(FailureRule {
            pattern: pattern.to_string(),
            remaining: times,
            stderr: format!("{}: simulated failure", pattern),
        });
        self
    }

    /// Answer commands containing `pattern` with `stdout`.
    pub fn respond(&self, pattern: &str, stdout: &str) -> &Self {
        self.lock().responses.push(Response {
            pattern: pattern.to_string(),
            stdout: stdout.to_string(),
        });
        self
    }

    /// Every command line executed so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Commands containing `pattern`.
    pub fn matching(&self, pattern: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.contains(pattern))
            .collect()
    }

    /// Index of the first command containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.contains(pattern))
    }

    pub fn clear(&self) {
        self.lock().commands.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecorderState> {
        // A poisoned recorder only means a test already panicked.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Executor for RecordingExecutor {
    fn execute(&self, cmd: &Cmd) -> Result<CommandResult> {
        let line = cmd.command_line();
        let mut state = self.lock();
        state.commands.push(line.clone());

        let mut result = CommandResult::default();
        if let Some(rule) = state
            .failures
            .iter_mut()
            .find(|r| r.remaining > 0 && line.contains(&r.pattern))
        {
            rule.remaining -= 1;
            result.code = 1;
            result.stderr = rule.stderr.clone();
        } else if let Some(response) = state.responses.iter().find(|r| line.contains(&r.pattern)) {
            result.stdout = response.stdout.clone();
        }
        drop(state);

        cmd.check(result)
    }
}

// =============================================================================
// Convenience functions
// =============================================================================

/// Bail with a helpful message if `path` does not exist.
pub fn ensure_exists(path: &Path, what: &str) -> Result<()> {
    if !path.exists() {
        bail!("{} not found at {}", what, path.display());
    }
    Ok(())
}

/// First existing path among `candidates`.
pub fn find_first_existing(candidates: &[PathBuf]) -> Option<&PathBuf> {
    candidates.iter().find(|p| p.exists())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_success() {
        let result = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout_trimmed(), "hello");
    }

    #[test]
    fn test_run_failure_is_tool_failure() {
        let err = Cmd::new("ls").arg("/nonexistent_path_12345").run().unwrap_err();
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::ToolFailed { command, code, stderr }) => {
                assert_eq!(command, "ls /nonexistent_path_12345");
                assert_ne!(*code, 0);
                assert!(!stderr.is_empty());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_shell_command() {
        let result = Cmd::shell("echo hello && echo world").run().unwrap();
        assert!(result.stdout.contains("hello"));
        assert!(result.stdout.contains("world"));
    }

    #[test]
    fn test_stdin_is_forwarded() {
        let result = Cmd::new("cat").stdin("64,,L,*\n").run().unwrap();
        assert_eq!(result.stdout, "64,,L,*\n");
    }

    #[test]
    fn test_custom_error_message() {
        let err = Cmd::new("false")
            .error_msg("Custom build step failed")
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("Custom build step failed"));
        assert!(err.downcast_ref::<BuildError>().is_some());
    }

    #[test]
    fn test_allow_fail() {
        let result = Cmd::new("false").allow_fail().run().unwrap();
        assert!(!result.success());
        assert_eq!(result.code, 1);
    }

    #[test]
    fn test_display_marks_privileged() {
        let cmd = Cmd::new("umount").arg("/tmp/boot").privileged();
        assert_eq!(cmd.to_string(), "sudo umount /tmp/boot");
        assert_eq!(cmd.command_line(), "umount /tmp/boot");
    }

    #[test]
    fn test_recorder_scripted_failures_then_success() {
        let exec = RecordingExecutor::new();
        exec.fail_times("umount", 2);

        let cmd = Cmd::new("umount").arg("/mnt");
        assert!(exec.execute(&cmd).is_err());
        assert!(exec.execute(&cmd).is_err());
        assert!(exec.execute(&cmd).is_ok());
        assert_eq!(exec.matching("umount").len(), 3);
    }

    #[test]
    fn test_recorder_responses() {
        let exec = RecordingExecutor::new();
        exec.respond("losetup --find", "/dev/loop7\n");
        let result = exec
            .execute(&Cmd::new("losetup").args(["--find", "--show"]))
            .unwrap();
        assert_eq!(result.stdout_trimmed(), "/dev/loop7");
        assert_eq!(exec.position("losetup"), Some(0));
    }

    #[test]
    fn test_find_first_existing() {
        let candidates = vec![
            PathBuf::from("/nonexistent_path_12345"),
            PathBuf::from("/"),
        ];
        assert_eq!(find_first_existing(&candidates), Some(&PathBuf::from("/")));
    }
}
