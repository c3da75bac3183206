//! Recipe loading and action dispatch.
//!
//! A recipe file is a template (see [`crate::template`]) that expands to a
//! TOML document:
//!
//! ```toml
//! architecture = "amd64"
//!
//! [[actions]]
//! action = "debootstrap"
//! suite = "bookworm"
//!
//! [[actions]]
//! action = "run"
//! description = "Set hostname"
//! chroot = true
//! command = "echo builder > /etc/hostname"
//! ```
//!
//! Each `[[actions]]` entry is decoded twice: once into [`ActionBase`] to
//! read its `action` tag, then in full into the concrete type that tag
//! selects. Tags outside [`ACTION_KINDS`] are rejected.

use crate::action::{
    Action, ActionBase, AptAction, DebootstrapAction, FilesystemDeployAction,
    ImagePartitionAction, OstreeCommitAction, OstreeDeployAction, OverlayAction, PackAction,
    RawAction, RunAction, UnpackAction,
};
use crate::template;
use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Every recognised `action` tag.
pub const ACTION_KINDS: &[&str] = &[
    "apt",
    "debootstrap",
    "filesystem-deploy",
    "image-partition",
    "ostree-commit",
    "ostree-deploy",
    "overlay",
    "pack",
    "raw",
    "run",
    "unpack",
];

/// Builds a concrete action from its full recipe entry.
pub type Constructor = fn(toml::Value) -> Result<Box<dyn Action>>;

fn decode<T>(entry: toml::Value) -> Result<Box<dyn Action>>
where
    T: Action + DeserializeOwned + 'static,
{
    let action: T = entry.try_into()?;
    Ok(Box::new(action))
}

/// Constructor for `tag`, or `None` when the tag is unknown.
pub fn constructor(tag: &str) -> Option<Constructor> {
    let ctor: Constructor = match tag {
        "apt" => decode::<AptAction>,
        "debootstrap" => decode::<DebootstrapAction>,
        "filesystem-deploy" => decode::<FilesystemDeployAction>,
        "image-partition" => decode::<ImagePartitionAction>,
        "ostree-commit" => decode::<OstreeCommitAction>,
        "ostree-deploy" => decode::<OstreeDeployAction>,
        "overlay" => decode::<OverlayAction>,
        "pack" => decode::<PackAction>,
        "raw" => decode::<RawAction>,
        "run" => decode::<RunAction>,
        "unpack" => decode::<UnpackAction>,
        _ => return None,
    };
    Some(ctor)
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRecipe {
    architecture: String,
    #[serde(default)]
    actions: Vec<toml::Value>,
}

/// Target architecture plus the ordered actions to run.
pub struct Recipe {
    pub architecture: String,
    pub actions: Vec<Box<dyn Action>>,
}

impl fmt::Debug for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recipe")
            .field("architecture", &self.architecture)
            .field("actions", &self.actions)
            .finish()
    }
}

impl Recipe {
    pub fn new(architecture: impl Into<String>, actions: Vec<Box<dyn Action>>) -> Self {
        Self {
            architecture: architecture.into(),
            actions,
        }
    }

    /// Decode an already expanded recipe document.
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawRecipe = toml::from_str(text).context("Failed to parse recipe")?;
        if raw.architecture.trim().is_empty() {
            bail!("recipe 'architecture' must not be empty");
        }

        let mut actions = Vec::with_capacity(raw.actions.len());
        for (index, entry) in raw.actions.into_iter().enumerate() {
            let base: ActionBase = entry
                .clone()
                .try_into()
                .with_context(|| format!("action #{} has no valid 'action' tag", index + 1))?;
            let Some(ctor) = constructor(&base.action) else {
                bail!(
                    "action #{}: unknown action '{}' (known: {})",
                    index + 1,
                    base.action,
                    ACTION_KINDS.join(", ")
                );
            };
            let action = ctor(entry)
                .with_context(|| format!("action #{} ({})", index + 1, base.label()))?;
            debug!(index, kind = %base.action, label = %action.label(), "decoded action");
            actions.push(action);
        }

        Ok(Self::new(raw.architecture, actions))
    }

    /// Read `path`, expand it with `vars` and decode the result.
    pub fn load(path: &Path, vars: &BTreeMap<String, String>) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read recipe {}", path.display()))?;
        let expanded = template::expand(&text, vars)
            .with_context(|| format!("Failed to expand template {}", path.display()))?;
        Self::parse(&expanded).with_context(|| format!("in {}", path.display()))
    }
}
