//! `run`: execute a shell command or script, on the host or chrooted into
//! the root filesystem.

use super::{Action, ActionBase};
use crate::build::context::BuildContext;
use crate::build::filesystem::copy_file;
use crate::build::paths::clean_path_at;
use crate::process::Cmd;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunAction {
    #[serde(flatten)]
    pub base: ActionBase,
    /// Run inside `chroot <rootdir>` instead of on the host.
    #[serde(default)]
    pub chroot: bool,
    /// Shell command line, passed to `sh -c`.
    pub command: Option<String>,
    /// Script file, relative to the recipe directory.
    pub script: Option<String>,
}

impl RunAction {
    fn script_path(&self, context: &BuildContext) -> Option<PathBuf> {
        self.script
            .as_deref()
            .map(|script| clean_path_at(script.as_ref(), &context.recipe_dir))
    }

    fn command_for(&self, context: &BuildContext) -> Result<Cmd> {
        let cmd = match (&self.command, self.script_path(context), self.chroot) {
            (Some(command), None, false) => Cmd::new("sh").args(["-c", command.as_str()]),
            (Some(command), None, true) => Cmd::new("chroot")
                .arg_path(&context.rootdir)
                .args(["sh", "-c", command.as_str()]),
            (None, Some(script), false) => Cmd::new(script.as_os_str()).arg_path(&context.rootdir),
            (None, Some(script), true) => {
                let name = script
                    .file_name()
                    .with_context(|| format!("script {} has no file name", script.display()))?;
                Cmd::new("chroot")
                    .arg_path(&context.rootdir)
                    .arg(PathBuf::from("/tmp").join(name).into_os_string())
            }
            _ => bail!("run needs exactly one of 'command' or 'script'"),
        };

        let cmd = context
            .command_env()
            .into_iter()
            .fold(cmd, |cmd, (key, value)| cmd.env(key, value));
        Ok(cmd.current_dir(&context.recipe_dir))
    }
}

impl Action for RunAction {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn verify(&mut self, context: &mut BuildContext) -> Result<()> {
        match (&self.command, &self.script) {
            (Some(_), Some(_)) => bail!("run accepts 'command' or 'script', not both"),
            (None, None) => bail!("run needs a 'command' or a 'script'"),
            (Some(command), None) if command.trim().is_empty() => {
                bail!("run 'command' is empty")
            }
            _ => {}
        }

        if let Some(script) = self.script_path(context) {
            if !script.is_file() {
                bail!("script not found: {}", script.display());
            }
        }
        Ok(())
    }

    fn run(&mut self, context: &mut BuildContext) -> Result<()> {
        let staged = match (self.script_path(context), self.chroot) {
            (Some(script), true) => {
                let tmp = context.rootdir.join("tmp");
                fs::create_dir_all(&tmp)
                    .with_context(|| format!("creating {}", tmp.display()))?;
                let name = script
                    .file_name()
                    .with_context(|| format!("script {} has no file name", script.display()))?;
                let staged = tmp.join(name);
                copy_file(&script, &staged, 0o755)?;
                Some(staged)
            }
            _ => None,
        };

        if let Some(script) = self.script_path(context).filter(|_| !self.chroot) {
            let mode = fs::metadata(&script)?.permissions().mode();
            if mode & 0o111 == 0 {
                bail!("script {} is not executable", script.display());
            }
        }

        info!(chroot = self.chroot, "Running '{}'", self.label());
        let result = self
            .command_for(context)?
            .error_msg(format!("run '{}' failed", self.label()))
            .run_interactive();

        if let Some(staged) = staged {
            fs::remove_file(&staged)
                .with_context(|| format!("removing staged script {}", staged.display()))?;
        }

        result.map(|_| ())
    }
}
