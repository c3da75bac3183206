//! Build state and filesystem helpers shared by the actions.
//!
//! - [`context`] - the [`BuildContext`](context::BuildContext) threaded through every phase
//! - [`filesystem`] - atomic file copy and tree overlay
//! - [`paths`] - absolute, lexically cleaned paths

pub mod context;
pub mod filesystem;
pub mod paths;
