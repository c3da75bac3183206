//! Build operating system images from declarative recipes.
//!
//! A recipe is a TOML document listing an architecture and an ordered set of
//! actions (bootstrap a root filesystem, install packages, partition an
//! image, deploy onto it, ...). Every action goes through the same six-phase
//! lifecycle. Privileged work runs inside a throwaway fakemachine VM when one
//! is available: the host verifies the recipe, prepares volumes and images,
//! then re-executes this program inside the VM.
//!
//! # Architecture
//!
//! ```text
//! session ──► recipe ──► template
//!    │           └─────► action::* (closed set of kinds)
//!    └──────► pipeline ──► machine (fakemachine | host-only)
//!                 │
//!                 └──► BuildContext, build::filesystem, process::Cmd
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use recipe_builder::machine::Fakemachine;
//! use recipe_builder::session::{self, SessionOptions};
//!
//! let options = SessionOptions {
//!     recipe: "debian.toml".into(),
//!     ..Default::default()
//! };
//! session::run(&options, &Fakemachine::new())?;
//! ```

pub mod action;
pub mod build;
pub mod machine;
pub mod pipeline;
pub mod process;
pub mod recipe;
pub mod session;
pub mod template;

pub use action::{Action, ActionBase, Phase};
pub use build::context::BuildContext;
pub use pipeline::{Outcome, PhaseError};
pub use recipe::Recipe;
