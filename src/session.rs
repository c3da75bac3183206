//! Build session: resolve paths, prepare directories and hand the recipe to
//! the lifecycle driver.

use crate::build::context::BuildContext;
use crate::build::paths::clean_path_at;
use crate::machine::MachineBackend;
use crate::pipeline::{self, decide_mode, Mode, Outcome};
use crate::recipe::Recipe;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Scratch directory used inside the sandbox, and announced by the host
/// process that starts one.
pub const SANDBOX_SCRATCH: &str = "/scratch";

/// Prefix of the temporary scratch directory created under the working
/// directory when no sandbox is involved.
pub const SCRATCH_PREFIX: &str = ".recipe-builder-";

/// What the user (or the forwarding host process) asked for.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub recipe: PathBuf,
    /// Defaults to the working directory.
    pub artifactdir: Option<PathBuf>,
    /// Image device handed in by the host process.
    pub internal_image: Option<PathBuf>,
    pub template_vars: BTreeMap<String, String>,
}

/// A loaded recipe together with its resolved build context.
#[derive(Debug)]
pub struct Session {
    pub recipe: Recipe,
    /// Absolute, canonical recipe path.
    pub recipe_file: PathBuf,
    pub context: BuildContext,
    vars: BTreeMap<String, String>,
    // Removed on drop, unless something is still mounted under it.
    scratch: Option<TempDir>,
}

impl Session {
    /// Resolve every path relative to `cwd`, load the recipe and set up the
    /// scratch and artifact directories.
    pub fn prepare(options: &SessionOptions, backend: &dyn MachineBackend, cwd: &Path) -> Result<Self> {
        let recipe_file = fs::canonicalize(clean_path_at(&options.recipe, cwd))
            .with_context(|| format!("Recipe not found: {}", options.recipe.display()))?;
        let recipe_dir = recipe_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        let recipe = Recipe::load(&recipe_file, &options.template_vars)?;

        let artifactdir = clean_path_at(options.artifactdir.as_deref().unwrap_or(cwd), cwd);
        fs::create_dir_all(&artifactdir)
            .with_context(|| format!("Failed to create artifact directory {}", artifactdir.display()))?;

        let (scratchdir, scratch) = match decide_mode(backend) {
            Mode::HostDirect => {
                let dir = tempfile::Builder::new()
                    .prefix(SCRATCH_PREFIX)
                    .tempdir_in(cwd)
                    .with_context(|| format!("Failed to create scratch directory in {}", cwd.display()))?;
                (dir.path().to_path_buf(), Some(dir))
            }
            Mode::HostWithSandbox | Mode::InsideSandbox => (PathBuf::from(SANDBOX_SCRATCH), None),
        };

        let mut context = BuildContext::new(scratchdir, artifactdir, recipe_dir);
        context.architecture = recipe.architecture.clone();
        context.image = options.internal_image.clone();

        info!(
            recipe = %recipe_file.display(),
            artifactdir = %context.artifactdir.display(),
            architecture = %context.architecture,
            "Prepared build"
        );
        debug!(scratchdir = %context.scratchdir.display(), "Scratch directory");

        Ok(Self {
            recipe,
            recipe_file,
            context,
            vars: options.template_vars.clone(),
            scratch,
        })
    }

    /// Run the recipe. The scratch directory goes away with the session
    /// unless a mount under it could not be released.
    pub fn run(mut self, backend: &dyn MachineBackend) -> Result<Outcome> {
        let outcome = pipeline::run(
            &mut self.recipe,
            &mut self.context,
            backend,
            &self.vars,
            &self.recipe_file,
        );
        self.keep_scratch_if_mounted();
        outcome
    }

    fn keep_scratch_if_mounted(&mut self) {
        if self.context.mounts.is_empty() {
            return;
        }
        if let Some(dir) = self.scratch.take() {
            let kept = dir.keep();
            for target in &self.context.mounts {
                warn!("{} is still mounted", target.display());
            }
            warn!("Leaving scratch directory {} in place", kept.display());
        }
    }
}

/// Prepare and run a session from the process working directory.
pub fn run(options: &SessionOptions, backend: &dyn MachineBackend) -> Result<Outcome> {
    let cwd = std::env::current_dir().context("Failed to read working directory")?;
    Session::prepare(options, backend, &cwd)?.run(backend)
}
