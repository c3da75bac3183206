//! Thin wrapper around [`std::process::Command`] for the external tools
//! actions drive (debootstrap, apt-get, parted, mkfs, ostree, ...).
//!
//! ```rust,ignore
//! use recipe_builder::process::Cmd;
//!
//! Cmd::new("mkfs.ext4")
//!     .args(["-q", "-L", "root"])
//!     .arg_path(device)
//!     .error_msg("mkfs.ext4 failed")
//!     .run()?;
//! ```

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Stdio};
use tracing::debug;

/// Result of a captured command invocation.
#[derive(Debug)]
pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// How a process ended, for error messages.
fn describe_exit(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with code {}", code),
        (None, Some(signal)) => format!("was killed by signal {}", signal),
        (None, None) => "failed".to_string(),
    }
}

/// Last non-empty line of a tool's stderr, which is usually the one that
/// says what went wrong.
fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rev().find(|line| !line.is_empty())
}

/// Builder for an external command.
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Message used when the command exits unsuccessfully.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return a non-zero exit status to the caller instead of failing.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Program and arguments joined for display.
    pub fn command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| part.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run with stdout/stderr captured.
    pub fn run(self) -> Result<CmdResult> {
        let description = self.command_line();
        debug!(command = %description, "running");

        let output = self
            .command()
            .output()
            .with_context(|| format!("Failed to execute '{}'", description))?;

        let result = CmdResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            debug!(command = %description, stderr = %result.stderr.trim(), "command failed");
            let detail = last_line(&result.stderr)
                .map(|line| format!(": {}", line))
                .unwrap_or_default();
            bail!(
                "{}: `{}` {}{}",
                self.error_msg.as_deref().unwrap_or("command failed"),
                description,
                describe_exit(result.status),
                detail
            );
        }

        Ok(result)
    }

    /// Run with stdio inherited from this process, so tool output streams
    /// straight to the user.
    pub fn run_interactive(self) -> Result<ExitStatus> {
        let description = self.command_line();
        debug!(command = %description, "running");

        let status = self
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("Failed to execute '{}'", description))?;

        if !status.success() && !self.allow_fail {
            bail!(
                "{}: `{}` {}",
                self.error_msg.as_deref().unwrap_or("command failed"),
                description,
                describe_exit(status)
            );
        }

        Ok(status)
    }
}

/// Fail with a descriptive error when `path` does not exist.
pub fn ensure_exists(path: &Path, what: &str) -> Result<()> {
    if !path.exists() {
        bail!("{} not found: {}", what, path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_run_captures_stdout() {
        let result = Cmd::new("sh").args(["-c", "echo hello"]).run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[test]
    fn test_run_failure_uses_error_msg() {
        let err = Cmd::new("sh")
            .args(["-c", "exit 3"])
            .error_msg("custom failure")
            .run()
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "custom failure: `sh -c exit 3` exited with code 3"
        );
    }

    #[test]
    fn test_failure_is_one_line_ending_with_last_stderr_line() {
        let err = Cmd::new("sh")
            .args(["-c", "echo 'mke2fs 1.47.0' >&2; echo 'no such device' >&2; exit 1"])
            .error_msg("formatting 'root' failed")
            .run()
            .unwrap_err();
        let msg = err.to_string();
        assert!(!msg.contains('\n'));
        assert!(msg.starts_with("formatting 'root' failed: `sh -c "));
        assert!(msg.ends_with("exited with code 1: no such device"));
    }

    #[test]
    fn test_interactive_failure_names_command() {
        let err = Cmd::new("sh")
            .args(["-c", "exit 4"])
            .error_msg("debootstrap of 'bookworm' failed")
            .run_interactive()
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "debootstrap of 'bookworm' failed: `sh -c exit 4` exited with code 4"
        );
    }

    #[test]
    fn test_killed_command_reports_signal() {
        let err = Cmd::new("sh").args(["-c", "kill -9 $$"]).run().unwrap_err();
        assert_eq!(
            err.to_string(),
            "command failed: `sh -c kill -9 $$` was killed by signal 9"
        );
    }

    #[test]
    fn test_allow_fail_returns_status() {
        let result = Cmd::new("sh").args(["-c", "exit 1"]).allow_fail().run().unwrap();
        assert!(!result.success());
    }

    #[test]
    fn test_env_and_current_dir() {
        let temp = TempDir::new().unwrap();
        let result = Cmd::new("sh")
            .args(["-c", "echo \"$GREETING\" > out.txt"])
            .env("GREETING", "hi there")
            .current_dir(temp.path())
            .run()
            .unwrap();
        assert!(result.success());
        assert_eq!(
            std::fs::read_to_string(temp.path().join("out.txt")).unwrap(),
            "hi there\n"
        );
    }

    #[test]
    fn test_command_line() {
        let cmd = Cmd::new("mkfs.ext4")
            .args(["-q", "-L", "root"])
            .arg_path(Path::new("/dev/vda2"));
        assert_eq!(cmd.command_line(), "mkfs.ext4 -q -L root /dev/vda2");
    }

    #[test]
    fn test_ensure_exists() {
        let temp = TempDir::new().unwrap();
        assert!(ensure_exists(temp.path(), "temp dir").is_ok());
        let err = ensure_exists(&temp.path().join("missing"), "Keyring").unwrap_err();
        assert!(err.to_string().starts_with("Keyring not found"));
    }
}
