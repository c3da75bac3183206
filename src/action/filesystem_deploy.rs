//! `filesystem-deploy`: copy the assembled root filesystem onto the mounted
//! image and wire up its fstab and kernel command line.

use super::{default_true, Action, ActionBase};
use crate::build::context::BuildContext;
use crate::build::filesystem::copy_tree;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FilesystemDeployAction {
    #[serde(flatten)]
    pub base: ActionBase,
    #[serde(default = "default_true")]
    pub setup_fstab: bool,
    #[serde(default = "default_true")]
    pub setup_kernel_cmdline: bool,
    /// Extra arguments appended to the kernel command line.
    pub append_kernel_cmdline: Option<String>,
}

/// Kernel command line for the image: the `root=` fragment, `rw`, then any
/// extra arguments.
pub fn kernel_cmdline(context: &BuildContext, append: Option<&str>) -> String {
    let mut parts = Vec::new();
    if !context.image_kernel_root.is_empty() {
        parts.push(context.image_kernel_root.as_str());
    }
    parts.push("rw");
    if let Some(extra) = append.map(str::trim).filter(|e| !e.is_empty()) {
        parts.push(extra);
    }
    parts.join(" ")
}

/// Write `/etc/fstab` and/or `/etc/kernel/cmdline` under `root`.
pub(crate) fn write_boot_config(
    root: &Path,
    context: &BuildContext,
    fstab: bool,
    cmdline: Option<Option<&str>>,
) -> Result<()> {
    if fstab {
        let path = root.join("etc/fstab");
        fs::create_dir_all(root.join("etc"))?;
        fs::write(&path, &context.image_fstab)
            .with_context(|| format!("writing {}", path.display()))?;
    }

    if let Some(append) = cmdline {
        let dir = root.join("etc/kernel");
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join("cmdline");
        fs::write(&path, format!("{}\n", kernel_cmdline(context, append)))
            .with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

impl Action for FilesystemDeployAction {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn run(&mut self, context: &mut BuildContext) -> Result<()> {
        context.require_image("filesystem-deploy")?;
        if context.image_fstab.is_empty() {
            bail!("filesystem-deploy needs mounted image partitions; add mountpoints to image-partition");
        }

        info!("Deploying {} to {}", context.rootdir.display(), context.image_mnt_dir.display());
        copy_tree(&context.rootdir, &context.image_mnt_dir)?;

        let cmdline = self
            .setup_kernel_cmdline
            .then_some(self.append_kernel_cmdline.as_deref());
        write_boot_config(&context.image_mnt_dir, context, self.setup_fstab, cmdline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(temp: &TempDir) -> BuildContext {
        let mut ctx = BuildContext::new(
            temp.path().join("scratch"),
            temp.path().join("out"),
            temp.path().to_path_buf(),
        );
        ctx.image = Some(temp.path().join("out/disk.img"));
        ctx.image_fstab = "UUID=f00d\t/\text4\tdefaults\t0\t1\n".into();
        ctx.image_kernel_root = "root=UUID=f00d".into();
        fs::create_dir_all(ctx.rootdir.join("etc")).unwrap();
        fs::write(ctx.rootdir.join("etc/hostname"), "image\n").unwrap();
        fs::create_dir_all(&ctx.image_mnt_dir).unwrap();
        ctx
    }

    #[test]
    fn test_kernel_cmdline() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);
        assert_eq!(kernel_cmdline(&ctx, None), "root=UUID=f00d rw");
        assert_eq!(
            kernel_cmdline(&ctx, Some(" console=ttyS0 ")),
            "root=UUID=f00d rw console=ttyS0"
        );
    }

    #[test]
    fn test_deploy_copies_root_and_writes_boot_config() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp);
        let mut deploy = FilesystemDeployAction {
            base: ActionBase::new("filesystem-deploy"),
            setup_fstab: true,
            setup_kernel_cmdline: true,
            append_kernel_cmdline: Some("quiet".into()),
        };

        deploy.run(&mut ctx).unwrap();

        let mnt = &ctx.image_mnt_dir;
        assert_eq!(fs::read_to_string(mnt.join("etc/hostname")).unwrap(), "image\n");
        assert_eq!(fs::read_to_string(mnt.join("etc/fstab")).unwrap(), ctx.image_fstab);
        assert_eq!(
            fs::read_to_string(mnt.join("etc/kernel/cmdline")).unwrap(),
            "root=UUID=f00d rw quiet\n"
        );
    }

    #[test]
    fn test_deploy_respects_switches() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp);
        let value: toml::Value = toml::from_str(
            "action = \"filesystem-deploy\"\nsetup-fstab = false\nsetup-kernel-cmdline = false",
        )
        .unwrap();
        let mut deploy: FilesystemDeployAction = value.try_into().unwrap();

        deploy.run(&mut ctx).unwrap();

        assert!(!ctx.image_mnt_dir.join("etc/fstab").exists());
        assert!(!ctx.image_mnt_dir.join("etc/kernel").exists());
    }

    #[test]
    fn test_deploy_requires_image() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp);
        ctx.image = None;
        let mut deploy = FilesystemDeployAction {
            base: ActionBase::new("filesystem-deploy"),
            setup_fstab: true,
            setup_kernel_cmdline: true,
            append_kernel_cmdline: None,
        };
        assert!(deploy.run(&mut ctx).is_err());
    }
}
