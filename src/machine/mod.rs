//! Sandbox machines used to run privileged actions.
//!
//! The lifecycle driver only talks to the two traits here. A
//! [`MachineBackend`] answers whether a sandbox can be (or already is) used
//! and creates [`Machine`] sessions. A session collects shared volumes and
//! images, then re-executes this program inside the sandbox with a
//! forwarded argument list and reports its exit status.
//!
//! - [`fakemachine::Fakemachine`] - launches the `fakemachine` tool
//! - [`HostOnly`] - never uses a sandbox

pub mod fakemachine;

use anyhow::Result;
use std::path::{Path, PathBuf};

pub use fakemachine::Fakemachine;

/// Probe and factory for sandbox sessions.
pub trait MachineBackend {
    /// True when this process is itself running inside a sandbox.
    fn in_machine(&self) -> bool;

    /// True when a sandbox can be started from this host.
    fn supported(&self) -> bool;

    /// Create a fresh, unstarted sandbox session.
    fn new_machine(&self) -> Result<Box<dyn Machine>>;
}

/// One ephemeral sandbox session.
pub trait Machine {
    /// Share a host directory with the sandbox at the same path.
    fn add_volume(&mut self, path: &Path);

    /// Create a sparse image file of `size` bytes on the host and attach it
    /// to the sandbox. Returns the device path the image has inside.
    fn create_image(&mut self, path: &Path, size: u64) -> Result<PathBuf>;

    /// Run this program inside the sandbox with `args`, blocking until it
    /// exits. Returns the sandboxed process's exit status.
    fn run_with_args(&mut self, args: &[String]) -> Result<i32>;
}

/// Backend for hosts where sandboxing is unavailable or disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostOnly;

impl MachineBackend for HostOnly {
    fn in_machine(&self) -> bool {
        false
    }

    fn supported(&self) -> bool {
        false
    }

    fn new_machine(&self) -> Result<Box<dyn Machine>> {
        anyhow::bail!("sandboxing is disabled on this host")
    }
}
