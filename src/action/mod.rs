//! Recipe actions and their six-phase lifecycle.
//!
//! Every step of a recipe is an [`Action`]. The lifecycle driver calls the
//! phases in a fixed order over the whole recipe; each phase has a no-op
//! default so a kind only implements what it needs.
//!
//! | Phase | When |
//! |---|---|
//! | [`Phase::Verify`] | always, before deciding where to run |
//! | [`Phase::PreMachine`] | on the host, before starting a sandbox |
//! | [`Phase::PreNoMachine`] | on the host, when no sandbox is used |
//! | [`Phase::Run`] | wherever the real work happens |
//! | [`Phase::Cleanup`] | right after that action's Run |
//! | [`Phase::PostMachine`] | on the host, once the work is done |
//!
//! # Example
//!
//! ```rust
//! use recipe_builder::action::{Action, ActionBase};
//! use recipe_builder::BuildContext;
//!
//! struct Hello {
//!     base: ActionBase,
//! }
//!
//! impl Action for Hello {
//!     fn base(&self) -> &ActionBase {
//!         &self.base
//!     }
//!
//!     fn run(&mut self, context: &mut BuildContext) -> anyhow::Result<()> {
//!         println!("hello from {}", context.architecture);
//!         Ok(())
//!     }
//! }
//! ```

pub mod apt;
pub mod debootstrap;
pub mod filesystem_deploy;
pub mod image_partition;
pub mod ostree;
pub mod overlay;
pub mod pack;
pub mod raw;
pub mod run;

use crate::build::context::BuildContext;
use crate::machine::Machine;
use anyhow::Result;
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use std::fmt;

pub use apt::AptAction;
pub use debootstrap::DebootstrapAction;
pub use filesystem_deploy::FilesystemDeployAction;
pub use image_partition::ImagePartitionAction;
pub use ostree::{OstreeCommitAction, OstreeDeployAction};
pub use overlay::OverlayAction;
pub use pack::{PackAction, UnpackAction};
pub use raw::RawAction;
pub use run::RunAction;

/// The lifecycle phases, in the order the driver runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Verify,
    PreMachine,
    PreNoMachine,
    Run,
    Cleanup,
    PostMachine,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Verify => write!(f, "Verify"),
            Phase::PreMachine => write!(f, "PreMachine"),
            Phase::PreNoMachine => write!(f, "PreNoMachine"),
            Phase::Run => write!(f, "Run"),
            Phase::Cleanup => write!(f, "Cleanup"),
            Phase::PostMachine => write!(f, "PostMachine"),
        }
    }
}

/// Fields every recipe entry carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ActionBase {
    /// Kind tag selecting the implementation.
    pub action: String,
    /// Human-readable label, defaulting to the tag.
    #[serde(default)]
    pub description: Option<String>,
}

impl ActionBase {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            description: None,
        }
    }

    /// Label used in logs and error messages.
    pub fn label(&self) -> &str {
        match self.description.as_deref() {
            Some(description) if !description.is_empty() => description,
            _ => &self.action,
        }
    }
}

/// One step of a recipe.
pub trait Action {
    /// Common fields decoded from the recipe entry.
    fn base(&self) -> &ActionBase;

    /// Label used in logs and error messages.
    fn label(&self) -> &str {
        self.base().label()
    }

    /// Validate configuration and preconditions.
    fn verify(&mut self, _context: &mut BuildContext) -> Result<()> {
        Ok(())
    }

    /// Register volumes, images and forwarded arguments the sandboxed run
    /// will need.
    fn pre_machine(
        &mut self,
        _context: &mut BuildContext,
        _machine: &mut dyn Machine,
        _args: &mut Vec<String>,
    ) -> Result<()> {
        Ok(())
    }

    /// Host-side setup a sandboxed run would otherwise get from the sandbox.
    fn pre_no_machine(&mut self, _context: &mut BuildContext) -> Result<()> {
        Ok(())
    }

    /// Perform the action's effect.
    fn run(&mut self, _context: &mut BuildContext) -> Result<()> {
        Ok(())
    }

    /// Release resources acquired during [`Action::run`].
    fn cleanup(&mut self, _context: &BuildContext) -> Result<()> {
        Ok(())
    }

    /// Finalize host-visible artifacts.
    fn post_machine(&mut self, _context: &BuildContext) -> Result<()> {
        Ok(())
    }
}

impl fmt::Debug for dyn Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("action", &self.base().action)
            .field("label", &self.label())
            .finish()
    }
}

impl fmt::Display for dyn Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Default for boolean recipe keys that are on unless switched off.
pub(crate) fn default_true() -> bool {
    true
}

/// Deserialize a size or offset written either as a string (`"1MiB"`,
/// `"100%"`) or as a bare integer, which is how `{{ sector N }}` expands.
pub(crate) fn string_or_integer<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    struct SizeVisitor;

    impl<'de> Visitor<'de> for SizeVisitor {
        type Value = String;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a string or a non-negative integer")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<String, E> {
            u64::try_from(v)
                .map(|v| v.to_string())
                .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<String, E> {
            Ok(v.to_string())
        }
    }

    deserializer.deserialize_any(SizeVisitor)
}
