//! Lifecycle driver.
//!
//! Runs the six phases over a [`Recipe`] and decides where the real work
//! happens. When a sandbox is available the host only verifies and prepares,
//! then re-executes this program inside the sandbox with a forwarded argument
//! list that lets the inner process rebuild the same recipe and context.
//!
//! ```text
//! Verify ──► mode ─┬─ HostDirect ──────► PreNoMachine ─► Run/Cleanup ─► unmount ─► PostMachine
//!                  ├─ HostWithSandbox ─► PreMachine ─► [sandbox] ─────────────────► PostMachine
//!                  └─ InsideSandbox ─────────────────► Run/Cleanup ─► unmount
//! ```
//!
//! Mounts registered on the [`BuildContext`] outlive the action that made
//! them and are released once the last Cleanup has run, or as soon as Run
//! or Cleanup fails.

use crate::action::{Action, Phase};
use crate::build::context::BuildContext;
use crate::machine::MachineBackend;
use crate::recipe::Recipe;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Where this process runs the recipe's work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No sandbox: everything runs in this process on the host.
    HostDirect,
    /// On the host with a sandbox available: prepare, then re-execute inside it.
    HostWithSandbox,
    /// Already inside the sandbox started by a host process.
    InsideSandbox,
}

pub fn decide_mode(backend: &dyn MachineBackend) -> Mode {
    if backend.in_machine() {
        Mode::InsideSandbox
    } else if backend.supported() {
        Mode::HostWithSandbox
    } else {
        Mode::HostDirect
    }
}

/// How a build that did not fail in this process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// The sandboxed run exited with this non-zero status.
    SandboxExited(i32),
}

/// A phase of one action failed.
#[derive(Debug, Error)]
#[error("Action `{action}` failed at stage {phase}, error: {error:#}")]
pub struct PhaseError {
    /// Label of the failing action.
    pub action: String,
    pub phase: Phase,
    pub error: anyhow::Error,
}

fn attempt(action: &dyn Action, phase: Phase, result: Result<()>) -> Result<(), PhaseError> {
    result.map_err(|error| PhaseError {
        action: action.label().to_string(),
        phase,
        error,
    })
}

/// Run `phase` over every action in order, stopping at the first failure.
fn each_action<F>(actions: &mut [Box<dyn Action>], phase: Phase, mut call: F) -> Result<(), PhaseError>
where
    F: FnMut(&mut dyn Action) -> Result<()>,
{
    for action in actions.iter_mut() {
        let result = call(action.as_mut());
        attempt(action.as_ref(), phase, result)?;
    }
    Ok(())
}

fn run_and_cleanup(actions: &mut [Box<dyn Action>], context: &mut BuildContext) -> Result<(), PhaseError> {
    for action in actions.iter_mut() {
        info!("==> {}", action.label());
        let result = action.run(context);
        attempt(action.as_ref(), Phase::Run, result)?;
        let result = action.cleanup(context);
        attempt(action.as_ref(), Phase::Cleanup, result)?;
    }
    Ok(())
}

fn run_and_release(actions: &mut [Box<dyn Action>], context: &mut BuildContext) -> Result<()> {
    let ran = run_and_cleanup(actions, context);
    let released = context.release_mounts();
    ran?;
    released.context("Failed to release build mounts")
}

/// Arguments that make the sandboxed process rebuild this build's recipe
/// and context. PreMachine phases append to the returned list.
pub fn forwarded_args(
    context: &BuildContext,
    vars: &BTreeMap<String, String>,
    recipe_file: &Path,
) -> Vec<String> {
    let mut args = vec![
        "--artifactdir".to_string(),
        context.artifactdir.display().to_string(),
    ];
    for (name, value) in vars {
        args.push("--template-var".to_string());
        args.push(format!("{}:\"{}\"", name, value));
    }
    args.push(recipe_file.display().to_string());
    args
}

/// Drive `recipe` through its lifecycle.
///
/// Phase failures come back as [`PhaseError`] inside the `anyhow::Error`;
/// failures to start the sandbox are plain errors.
pub fn run(
    recipe: &mut Recipe,
    context: &mut BuildContext,
    backend: &dyn MachineBackend,
    vars: &BTreeMap<String, String>,
    recipe_file: &Path,
) -> Result<Outcome> {
    let actions = recipe.actions.as_mut_slice();

    info!(architecture = %recipe.architecture, actions = actions.len(), "Verifying recipe");
    each_action(actions, Phase::Verify, |action| action.verify(context))?;

    let mode = decide_mode(backend);
    info!(?mode, "Execution mode");

    match mode {
        Mode::InsideSandbox => {
            run_and_release(actions, context)?;
        }
        Mode::HostDirect => {
            each_action(actions, Phase::PreNoMachine, |action| action.pre_no_machine(context))?;
            run_and_release(actions, context)?;
            each_action(actions, Phase::PostMachine, |action| action.post_machine(context))?;
        }
        Mode::HostWithSandbox => {
            let mut machine = backend.new_machine().context("Failed to set up sandbox")?;
            machine.add_volume(&context.artifactdir);
            machine.add_volume(&context.recipe_dir);

            let mut args = forwarded_args(context, vars, recipe_file);
            each_action(actions, Phase::PreMachine, |action| {
                action.pre_machine(context, machine.as_mut(), &mut args)
            })?;

            let code = machine.run_with_args(&args).context("Failed to run sandbox")?;
            if code != 0 {
                warn!(code, "Sandboxed build failed");
                return Ok(Outcome::SandboxExited(code));
            }

            each_action(actions, Phase::PostMachine, |action| action.post_machine(context))?;
        }
    }

    info!("Build finished");
    Ok(Outcome::Completed)
}
