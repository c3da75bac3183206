//! `ostree-commit` and `ostree-deploy`: commit the root filesystem into an
//! OSTree repository in the artifact directory, and deploy a branch of that
//! repository onto the mounted image.

use super::filesystem_deploy::{kernel_cmdline, write_boot_config};
use super::{default_true, Action, ActionBase};
use crate::build::context::BuildContext;
use crate::process::Cmd;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OstreeCommitAction {
    #[serde(flatten)]
    pub base: ActionBase,
    /// Repository path, relative to the artifact directory.
    pub repository: String,
    pub branch: String,
    pub subject: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OstreeDeployAction {
    #[serde(flatten)]
    pub base: ActionBase,
    /// Repository path, relative to the artifact directory.
    pub repository: String,
    /// URL configured as the `origin` remote of the deployed system.
    pub remote_repository: Option<String>,
    pub branch: String,
    pub os: String,
    #[serde(default = "default_true")]
    pub setup_fstab: bool,
    #[serde(default = "default_true")]
    pub setup_kernel_cmdline: bool,
    pub append_kernel_cmdline: Option<String>,
}

fn repository_path(context: &BuildContext, repository: &str) -> Result<PathBuf> {
    let repo = Path::new(repository);
    if repository.trim().is_empty() || repo.is_absolute() {
        bail!("ostree 'repository' must be relative to the artifact directory, got '{}'", repository);
    }
    if repo.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        bail!("ostree 'repository' must stay inside the artifact directory, got '{}'", repository);
    }
    Ok(context.artifactdir.join(repo))
}

fn require(field: &str, value: &str, kind: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{} needs a '{}'", kind, field);
    }
    Ok(())
}

impl OstreeCommitAction {
    fn commit_command(&self, repo: &Path, rootdir: &Path) -> Cmd {
        let mut cmd = Cmd::new("ostree")
            .arg("commit")
            .arg(format!("--repo={}", repo.display()))
            .arg(format!("--branch={}", self.branch))
            .arg(format!("--tree=dir={}", rootdir.display()));
        if let Some(subject) = &self.subject {
            cmd = cmd.arg(format!("--subject={}", subject));
        }
        cmd
    }
}

impl Action for OstreeCommitAction {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn verify(&mut self, context: &mut BuildContext) -> Result<()> {
        require("branch", &self.branch, "ostree-commit")?;
        repository_path(context, &self.repository).map(|_| ())
    }

    fn run(&mut self, context: &mut BuildContext) -> Result<()> {
        let repo = repository_path(context, &self.repository)?;
        if !repo.join("config").is_file() {
            fs::create_dir_all(&repo).with_context(|| format!("creating {}", repo.display()))?;
            Cmd::new("ostree")
                .arg("init")
                .arg(format!("--repo={}", repo.display()))
                .arg("--mode=archive")
                .error_msg("ostree init failed")
                .run()?;
        }

        info!("Committing {} to {} ({})", context.rootdir.display(), repo.display(), self.branch);
        self.commit_command(&repo, &context.rootdir)
            .error_msg(format!("ostree commit to '{}' failed", self.branch))
            .run_interactive()?;
        Ok(())
    }
}

/// Find the single deployment checkout ostree created for `os`.
fn deployment_dir(sysroot: &Path, os: &str) -> Result<PathBuf> {
    let deploy_root = sysroot.join("ostree/deploy").join(os).join("deploy");
    let mut found = Vec::new();
    for entry in fs::read_dir(&deploy_root)
        .with_context(|| format!("reading {}", deploy_root.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            found.push(entry.path());
        }
    }

    match found.as_slice() {
        [single] => Ok(single.clone()),
        [] => bail!("no deployment found under {}", deploy_root.display()),
        _ => bail!("more than one deployment under {}", deploy_root.display()),
    }
}

impl OstreeDeployAction {
    fn deploy_command(&self, sysroot: &Path, context: &BuildContext) -> Cmd {
        let mut cmd = Cmd::new("ostree")
            .args(["admin", "deploy"])
            .arg(format!("--sysroot={}", sysroot.display()))
            .arg(format!("--os={}", self.os));
        if self.setup_kernel_cmdline {
            for karg in kernel_cmdline(context, self.append_kernel_cmdline.as_deref()).split_whitespace() {
                cmd = cmd.arg(format!("--karg={}", karg));
            }
        }
        cmd.arg(&self.branch)
    }
}

impl Action for OstreeDeployAction {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn verify(&mut self, context: &mut BuildContext) -> Result<()> {
        require("branch", &self.branch, "ostree-deploy")?;
        require("os", &self.os, "ostree-deploy")?;
        repository_path(context, &self.repository).map(|_| ())
    }

    fn run(&mut self, context: &mut BuildContext) -> Result<()> {
        context.require_image("ostree-deploy")?;
        let source = repository_path(context, &self.repository)?;
        let sysroot = context.image_mnt_dir.clone();
        let sysroot_repo = sysroot.join("ostree/repo");

        info!("Deploying {} from {} onto {}", self.branch, source.display(), sysroot.display());

        Cmd::new("ostree")
            .args(["admin", "init-fs"])
            .arg_path(&sysroot)
            .error_msg("ostree admin init-fs failed")
            .run()?;
        Cmd::new("ostree")
            .args(["admin", "os-init"])
            .arg(&self.os)
            .arg(format!("--sysroot={}", sysroot.display()))
            .error_msg("ostree admin os-init failed")
            .run()?;
        Cmd::new("ostree")
            .arg(format!("--repo={}", sysroot_repo.display()))
            .arg("pull-local")
            .arg_path(&source)
            .arg(&self.branch)
            .error_msg(format!("pulling '{}' failed", self.branch))
            .run_interactive()?;

        if let Some(remote) = &self.remote_repository {
            Cmd::new("ostree")
                .arg(format!("--repo={}", sysroot_repo.display()))
                .args(["remote", "add", "--no-gpg-verify", "origin"])
                .arg(remote)
                .error_msg("adding ostree remote failed")
                .run()?;
        }

        self.deploy_command(&sysroot, context)
            .error_msg(format!("deploying '{}' failed", self.branch))
            .run_interactive()?;

        if self.setup_fstab {
            let deployment = deployment_dir(&sysroot, &self.os)?;
            write_boot_config(&deployment, context, true, None)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context() -> BuildContext {
        let mut ctx = BuildContext::new(
            PathBuf::from("/scratch"),
            PathBuf::from("/out"),
            PathBuf::from("/recipes"),
        );
        ctx.image_kernel_root = "root=UUID=f00d".into();
        ctx
    }

    fn deploy() -> OstreeDeployAction {
        let value: toml::Value = toml::from_str(
            r#"
            action = "ostree-deploy"
            repository = "repo"
            branch = "debian/bookworm/amd64"
            os = "debian"
            append-kernel-cmdline = "console=ttyS0"
            "#,
        )
        .unwrap();
        value.try_into().unwrap()
    }

    #[test]
    fn test_repository_must_stay_in_artifactdir() {
        let ctx = context();
        assert_eq!(repository_path(&ctx, "repo").unwrap(), PathBuf::from("/out/repo"));
        assert!(repository_path(&ctx, "/srv/repo").is_err());
        assert!(repository_path(&ctx, "../repo").is_err());
        assert!(repository_path(&ctx, "").is_err());
    }

    #[test]
    fn test_commit_verify_and_command() {
        let mut ctx = context();
        let mut commit = OstreeCommitAction {
            base: ActionBase::new("ostree-commit"),
            repository: "repo".into(),
            branch: "".into(),
            subject: Some("nightly".into()),
        };
        assert!(commit.verify(&mut ctx).is_err());

        commit.branch = "debian/bookworm/amd64".into();
        commit.verify(&mut ctx).unwrap();
        assert_eq!(
            commit
                .commit_command(Path::new("/out/repo"), &ctx.rootdir)
                .command_line(),
            "ostree commit --repo=/out/repo --branch=debian/bookworm/amd64 \
             --tree=dir=/scratch/root --subject=nightly"
        );
    }

    #[test]
    fn test_deploy_defaults_and_command() {
        let mut ctx = context();
        let mut action = deploy();
        action.verify(&mut ctx).unwrap();
        assert!(action.setup_fstab);
        assert!(action.setup_kernel_cmdline);

        assert_eq!(
            action.deploy_command(Path::new("/scratch/mnt"), &ctx).command_line(),
            "ostree admin deploy --sysroot=/scratch/mnt --os=debian \
             --karg=root=UUID=f00d --karg=rw --karg=console=ttyS0 debian/bookworm/amd64"
        );
    }

    #[test]
    fn test_deploy_verify_requires_os() {
        let mut action = deploy();
        action.os = " ".into();
        assert!(action.verify(&mut context()).is_err());
    }

    #[test]
    fn test_deployment_dir() {
        let temp = TempDir::new().unwrap();
        let deploy_root = temp.path().join("ostree/deploy/debian/deploy");
        fs::create_dir_all(&deploy_root).unwrap();
        assert!(deployment_dir(temp.path(), "debian").is_err());

        fs::create_dir_all(deploy_root.join("abc123.0")).unwrap();
        fs::write(deploy_root.join("abc123.0.origin"), "[origin]\n").unwrap();
        assert_eq!(
            deployment_dir(temp.path(), "debian").unwrap(),
            deploy_root.join("abc123.0")
        );
    }
}
