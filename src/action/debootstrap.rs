//! `debootstrap`: bootstrap a Debian-family base system into the root
//! directory.

use super::{Action, ActionBase};
use crate::build::context::BuildContext;
use crate::build::paths::clean_path_at;
use crate::process::{ensure_exists, Cmd};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::os::unix::fs::MetadataExt;
use tracing::info;

const DEFAULT_MIRROR: &str = "http://deb.debian.org/debian";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DebootstrapAction {
    #[serde(flatten)]
    pub base: ActionBase,
    pub suite: String,
    #[serde(default = "default_mirror")]
    pub mirror: String,
    #[serde(default)]
    pub components: Vec<String>,
    pub variant: Option<String>,
    /// Keyring used to verify the release, relative to the recipe directory.
    pub keyring_file: Option<String>,
}

/// Effective uid of this process, as the kernel reports it through the
/// owner of `/proc/self`.
fn effective_uid() -> Result<u32> {
    let meta = fs::metadata("/proc/self").context("reading /proc/self")?;
    Ok(meta.uid())
}

fn default_mirror() -> String {
    DEFAULT_MIRROR.to_string()
}

impl DebootstrapAction {
    fn command(&self, context: &BuildContext) -> Cmd {
        let mut cmd = Cmd::new("debootstrap")
            .arg("--merged-usr")
            .arg(format!("--arch={}", context.architecture));

        if !self.components.is_empty() {
            cmd = cmd.arg(format!("--components={}", self.components.join(",")));
        }
        if let Some(variant) = &self.variant {
            cmd = cmd.arg(format!("--variant={}", variant));
        }
        if let Some(keyring) = &self.keyring_file {
            let keyring = clean_path_at(keyring.as_ref(), &context.recipe_dir);
            cmd = cmd.arg(format!("--keyring={}", keyring.display()));
        }

        cmd.arg(&self.suite)
            .arg_path(&context.rootdir)
            .arg(&self.mirror)
    }
}

impl Action for DebootstrapAction {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn verify(&mut self, context: &mut BuildContext) -> Result<()> {
        if self.suite.trim().is_empty() {
            bail!("debootstrap needs a 'suite'");
        }
        if self.mirror.trim().is_empty() {
            bail!("debootstrap 'mirror' is empty");
        }
        if let Some(keyring) = &self.keyring_file {
            ensure_exists(&clean_path_at(keyring.as_ref(), &context.recipe_dir), "Keyring")?;
        }
        Ok(())
    }

    fn pre_no_machine(&mut self, _context: &mut BuildContext) -> Result<()> {
        if effective_uid()? != 0 {
            bail!("debootstrap must run as root when no fakemachine is available");
        }
        Ok(())
    }

    fn run(&mut self, context: &mut BuildContext) -> Result<()> {
        fs::create_dir_all(&context.rootdir)
            .with_context(|| format!("creating {}", context.rootdir.display()))?;

        info!(
            suite = %self.suite,
            arch = %context.architecture,
            "Bootstrapping {}",
            context.rootdir.display()
        );
        self.command(context)
            .error_msg(format!("debootstrap of '{}' failed", self.suite))
            .run_interactive()?;

        // Leave apt with a sources.list matching the bootstrap mirror.
        let components = if self.components.is_empty() {
            "main".to_string()
        } else {
            self.components.join(" ")
        };
        let sources = context.rootdir.join("etc/apt/sources.list");
        fs::write(
            &sources,
            format!("deb {} {} {}\n", self.mirror, self.suite, components),
        )
        .with_context(|| format!("writing {}", sources.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn action() -> DebootstrapAction {
        DebootstrapAction {
            base: ActionBase::new("debootstrap"),
            suite: "bookworm".into(),
            mirror: default_mirror(),
            components: vec!["main".into(), "contrib".into()],
            variant: Some("minbase".into()),
            keyring_file: None,
        }
    }

    #[test]
    fn test_verify() {
        let temp = TempDir::new().unwrap();
        let mut ctx = BuildContext::new(
            temp.path().join("scratch"),
            temp.path().join("out"),
            temp.path().to_path_buf(),
        );

        assert!(action().verify(&mut ctx).is_ok());

        let mut empty = action();
        empty.suite = " ".into();
        assert!(empty.verify(&mut ctx).is_err());

        let mut keyed = action();
        keyed.keyring_file = Some("keys/archive.gpg".into());
        let err = keyed.verify(&mut ctx).unwrap_err();
        assert!(err.to_string().contains("Keyring not found"));

        fs::create_dir_all(temp.path().join("keys")).unwrap();
        fs::write(temp.path().join("keys/archive.gpg"), "key").unwrap();
        assert!(keyed.verify(&mut ctx).is_ok());
    }

    #[test]
    fn test_effective_uid_owns_new_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("owned");
        fs::write(&path, "").unwrap();
        assert_eq!(effective_uid().unwrap(), fs::metadata(&path).unwrap().uid());
    }

    #[test]
    fn test_pre_no_machine_requires_root() {
        let mut ctx = BuildContext::default();
        let result = action().pre_no_machine(&mut ctx);
        if effective_uid().unwrap() == 0 {
            assert!(result.is_ok());
        } else {
            let err = result.unwrap_err();
            assert!(err.to_string().contains("must run as root"));
        }
    }

    #[test]
    fn test_command_line() {
        let mut ctx = BuildContext::new(
            PathBuf::from("/scratch"),
            PathBuf::from("/out"),
            PathBuf::from("/recipes"),
        );
        ctx.architecture = "arm64".into();
        let mut keyed = action();
        keyed.keyring_file = Some("keys/archive.gpg".into());

        assert_eq!(
            keyed.command(&ctx).command_line(),
            "debootstrap --merged-usr --arch=arm64 --components=main,contrib \
             --variant=minbase --keyring=/recipes/keys/archive.gpg \
             bookworm /scratch/root http://deb.debian.org/debian"
        );
    }

    #[test]
    fn test_defaults_from_recipe() {
        let value: toml::Value = toml::from_str(
            r#"
            action = "debootstrap"
            suite = "trixie"
            "#,
        )
        .unwrap();
        let decoded: DebootstrapAction = value.try_into().unwrap();
        assert_eq!(decoded.mirror, DEFAULT_MIRROR);
        assert!(decoded.components.is_empty());
        assert_eq!(decoded.base.label(), "debootstrap");
    }
}
