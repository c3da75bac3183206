//! Shared build state threaded through every action phase.

use crate::process::Cmd;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Mutable state shared by all actions of a recipe within one process.
///
/// A single context is created per invocation by the build session and
/// handed to each phase: `&mut` for phases that may update it (Verify,
/// PreMachine, PreNoMachine, Run) and `&` for the read-only late phases
/// (Cleanup, PostMachine). The context is never sent across the sandbox
/// boundary; the inner process rebuilds its own from the forwarded
/// arguments.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    /// Scratch space for intermediate work. Never used for output.
    pub scratchdir: PathBuf,
    /// Root filesystem being assembled, always `scratchdir/root`.
    pub rootdir: PathBuf,
    /// Absolute, cleaned directory receiving build artifacts.
    pub artifactdir: PathBuf,
    /// Image file or block device the image actions operate on.
    pub image: Option<PathBuf>,
    /// Mount point of the image's partitions, always `scratchdir/mnt`.
    pub image_mnt_dir: PathBuf,
    /// fstab lines accumulated while partitioning.
    pub image_fstab: String,
    /// Kernel command line `root=` fragment for the image's `/`.
    pub image_kernel_root: String,
    /// Directory holding the recipe file.
    pub recipe_dir: PathBuf,
    /// Target architecture from the recipe.
    pub architecture: String,
    /// Filesystems mounted for the build, in mount order. They stay mounted
    /// across actions and are released once the last action has run.
    pub mounts: Vec<PathBuf>,
}

impl BuildContext {
    /// Create a context rooted at `scratchdir`, deriving the root and mount
    /// directories from it.
    pub fn new(scratchdir: PathBuf, artifactdir: PathBuf, recipe_dir: PathBuf) -> Self {
        Self {
            rootdir: scratchdir.join("root"),
            image_mnt_dir: scratchdir.join("mnt"),
            scratchdir,
            artifactdir,
            recipe_dir,
            ..Default::default()
        }
    }

    /// The image the recipe partitions, or an error naming the action that
    /// needed one.
    pub fn require_image(&self, who: &str) -> anyhow::Result<&Path> {
        self.image.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "{} needs an image; add an image-partition action earlier in the recipe",
                who
            )
        })
    }

    /// Record a mount that later actions rely on.
    pub fn add_mount(&mut self, target: PathBuf) {
        self.mounts.push(target);
    }

    /// Unmount everything recorded with [`add_mount`](Self::add_mount),
    /// innermost first.
    pub fn release_mounts(&mut self) -> anyhow::Result<()> {
        self.release_mounts_with(|target| {
            Cmd::new("umount")
                .arg_path(target)
                .error_msg(format!("unmounting {} failed", target.display()))
                .run()
                .map(|_| ())
        })
    }

    /// Like [`release_mounts`](Self::release_mounts) with a custom unmount.
    /// Every mount is attempted; those that fail stay recorded and the first
    /// error is returned.
    pub fn release_mounts_with<F>(&mut self, mut unmount: F) -> anyhow::Result<()>
    where
        F: FnMut(&Path) -> anyhow::Result<()>,
    {
        let mut still_mounted = Vec::new();
        let mut first_error = None;

        while let Some(target) = self.mounts.pop() {
            info!("Unmounting {}", target.display());
            if let Err(err) = unmount(&target) {
                warn!("{:#}", err);
                first_error.get_or_insert(err);
                still_mounted.push(target);
            }
        }

        still_mounted.reverse();
        self.mounts = still_mounted;
        first_error.map_or(Ok(()), Err)
    }

    /// Environment exported to commands run on behalf of the recipe.
    pub fn command_env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("ROOTDIR", self.rootdir.display().to_string()),
            ("ARTIFACTDIR", self.artifactdir.display().to_string()),
            ("RECIPEDIR", self.recipe_dir.display().to_string()),
            ("ARCHITECTURE", self.architecture.clone()),
        ];
        if let Some(image) = &self.image {
            env.push(("IMAGE", image.display().to_string()));
            env.push(("IMAGEMNTDIR", self.image_mnt_dir.display().to_string()));
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_derives_root_and_mount_dirs() {
        let ctx = BuildContext::new(
            PathBuf::from("/scratch"),
            PathBuf::from("/out"),
            PathBuf::from("/recipes"),
        );
        assert_eq!(ctx.rootdir, PathBuf::from("/scratch/root"));
        assert_eq!(ctx.image_mnt_dir, PathBuf::from("/scratch/mnt"));
        assert!(ctx.image.is_none());
        assert!(ctx.image_fstab.is_empty());
    }

    #[test]
    fn test_require_image() {
        let mut ctx = BuildContext::new(
            PathBuf::from("/scratch"),
            PathBuf::from("/out"),
            PathBuf::from("/recipes"),
        );
        let err = ctx.require_image("raw").unwrap_err();
        assert!(err.to_string().contains("raw needs an image"));

        ctx.image = Some(PathBuf::from("/dev/vda"));
        assert_eq!(ctx.require_image("raw").unwrap(), Path::new("/dev/vda"));
    }

    #[test]
    fn test_command_env() {
        let mut ctx = BuildContext::new(
            PathBuf::from("/scratch"),
            PathBuf::from("/out"),
            PathBuf::from("/recipes"),
        );
        ctx.architecture = "arm64".into();

        let env = ctx.command_env();
        assert!(env.contains(&("ROOTDIR", "/scratch/root".to_string())));
        assert!(env.contains(&("ARCHITECTURE", "arm64".to_string())));
        assert!(!env.iter().any(|(k, _)| *k == "IMAGE"));

        ctx.image = Some(PathBuf::from("/out/disk.img"));
        let env = ctx.command_env();
        assert!(env.contains(&("IMAGE", "/out/disk.img".to_string())));
        assert!(env.contains(&("IMAGEMNTDIR", "/scratch/mnt".to_string())));
    }

    #[test]
    fn test_release_mounts_innermost_first() {
        let mut ctx = BuildContext::new(
            PathBuf::from("/scratch"),
            PathBuf::from("/out"),
            PathBuf::from("/recipes"),
        );
        ctx.add_mount(PathBuf::from("/scratch/mnt"));
        ctx.add_mount(PathBuf::from("/scratch/mnt/boot/efi"));

        let mut order = Vec::new();
        ctx.release_mounts_with(|target| {
            order.push(target.to_path_buf());
            Ok(())
        })
        .unwrap();

        assert_eq!(
            order,
            vec![PathBuf::from("/scratch/mnt/boot/efi"), PathBuf::from("/scratch/mnt")]
        );
        assert!(ctx.mounts.is_empty());
    }

    #[test]
    fn test_release_mounts_keeps_failures_and_tries_the_rest() {
        let mut ctx = BuildContext::new(
            PathBuf::from("/scratch"),
            PathBuf::from("/out"),
            PathBuf::from("/recipes"),
        );
        ctx.add_mount(PathBuf::from("/scratch/mnt"));
        ctx.add_mount(PathBuf::from("/scratch/mnt/busy"));
        ctx.add_mount(PathBuf::from("/scratch/mnt/boot"));

        let mut attempted = 0;
        let err = ctx
            .release_mounts_with(|target| {
                attempted += 1;
                if target.ends_with("busy") {
                    anyhow::bail!("target is busy");
                }
                Ok(())
            })
            .unwrap_err();

        assert_eq!(attempted, 3);
        assert_eq!(err.to_string(), "target is busy");
        assert_eq!(ctx.mounts, vec![PathBuf::from("/scratch/mnt/busy")]);
    }
}
