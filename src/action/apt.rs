//! `apt`: install packages into the root filesystem with apt-get.

use super::{Action, ActionBase};
use crate::build::context::BuildContext;
use crate::process::Cmd;
use anyhow::{bail, Result};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AptAction {
    #[serde(flatten)]
    pub base: ActionBase,
    pub packages: Vec<String>,
    /// Also install recommended packages.
    #[serde(default)]
    pub recommends: bool,
}

impl AptAction {
    fn apt_get(context: &BuildContext) -> Cmd {
        Cmd::new("chroot")
            .arg_path(&context.rootdir)
            .arg("apt-get")
            .env("DEBIAN_FRONTEND", "noninteractive")
    }

    fn install_command(&self, context: &BuildContext) -> Cmd {
        let mut cmd = Self::apt_get(context).args(["install", "-y"]);
        if !self.recommends {
            cmd = cmd.arg("--no-install-recommends");
        }
        cmd.args(&self.packages)
    }
}

impl Action for AptAction {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn verify(&mut self, _context: &mut BuildContext) -> Result<()> {
        if self.packages.is_empty() {
            bail!("apt needs at least one package");
        }
        if let Some(bad) = self.packages.iter().find(|p| p.trim().is_empty() || p.starts_with('-')) {
            bail!("invalid package name '{}'", bad);
        }
        Ok(())
    }

    fn run(&mut self, context: &mut BuildContext) -> Result<()> {
        info!("Installing {} package(s): {}", self.packages.len(), self.packages.join(" "));

        Self::apt_get(context)
            .arg("update")
            .error_msg("apt-get update failed")
            .run_interactive()?;

        self.install_command(context)
            .error_msg("apt-get install failed")
            .run_interactive()?;

        Self::apt_get(context)
            .arg("clean")
            .error_msg("apt-get clean failed")
            .run_interactive()?;
        Ok(())
    }
}
