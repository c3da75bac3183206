//! `overlay`: copy a directory tree from the recipe onto the root
//! filesystem.

use super::{Action, ActionBase};
use crate::build::context::BuildContext;
use crate::build::filesystem::copy_tree;
use crate::build::paths::clean_path_at;
use anyhow::{bail, Result};
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OverlayAction {
    #[serde(flatten)]
    pub base: ActionBase,
    /// Tree to copy, relative to the recipe directory.
    pub source: String,
    /// Where to put it inside the root filesystem (default `/`).
    pub destination: Option<String>,
}

impl OverlayAction {
    fn source_dir(&self, context: &BuildContext) -> PathBuf {
        clean_path_at(self.source.as_ref(), &context.recipe_dir)
    }

    fn destination_dir(&self, context: &BuildContext) -> PathBuf {
        let inside = self.destination.as_deref().unwrap_or("/");
        let relative: PathBuf = Path::new(inside)
            .components()
            .filter(|c| matches!(c, Component::Normal(_) | Component::ParentDir))
            .collect();
        clean_path_at(&relative, &context.rootdir)
    }
}

impl Action for OverlayAction {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn verify(&mut self, context: &mut BuildContext) -> Result<()> {
        let source = self.source_dir(context);
        if !source.is_dir() {
            bail!("overlay source is not a directory: {}", source.display());
        }
        if !self.destination_dir(context).starts_with(&context.rootdir) {
            bail!(
                "overlay destination '{}' escapes the root filesystem",
                self.destination.as_deref().unwrap_or_default()
            );
        }
        Ok(())
    }

    fn run(&mut self, context: &mut BuildContext) -> Result<()> {
        copy_tree(&self.source_dir(context), &self.destination_dir(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, BuildContext) {
        let temp = TempDir::new().unwrap();
        let ctx = BuildContext::new(
            temp.path().join("scratch"),
            temp.path().join("out"),
            temp.path().join("recipe"),
        );
        fs::create_dir_all(ctx.recipe_dir.join("overlays/base/etc")).unwrap();
        fs::write(ctx.recipe_dir.join("overlays/base/etc/hostname"), "image\n").unwrap();
        fs::create_dir_all(ctx.rootdir.join("etc")).unwrap();
        (temp, ctx)
    }

    fn action(destination: Option<&str>) -> OverlayAction {
        OverlayAction {
            base: ActionBase::new("overlay"),
            source: "overlays/base".into(),
            destination: destination.map(String::from),
        }
    }

    #[test]
    fn test_overlay_onto_root() {
        let (_temp, mut ctx) = setup();
        let mut overlay = action(None);

        overlay.verify(&mut ctx).unwrap();
        overlay.run(&mut ctx).unwrap();

        assert_eq!(
            fs::read_to_string(ctx.rootdir.join("etc/hostname")).unwrap(),
            "image\n"
        );
    }

    #[test]
    fn test_overlay_into_subdirectory() {
        let (_temp, mut ctx) = setup();
        fs::create_dir_all(ctx.rootdir.join("opt")).unwrap();
        let mut overlay = action(Some("/opt/defaults"));

        overlay.verify(&mut ctx).unwrap();
        overlay.run(&mut ctx).unwrap();

        assert!(ctx.rootdir.join("opt/defaults/etc/hostname").is_file());
    }

    #[test]
    fn test_verify_rejects_missing_source_and_escapes() {
        let (_temp, mut ctx) = setup();

        let mut missing = action(None);
        missing.source = "overlays/nope".into();
        assert!(missing.verify(&mut ctx).is_err());

        let err = action(Some("../../etc")).verify(&mut ctx).unwrap_err();
        assert!(err.to_string().contains("escapes"));
    }
}
