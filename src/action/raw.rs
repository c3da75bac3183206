//! `raw`: write a file's bytes into the image at a fixed offset, typically a
//! bootloader blob.

use super::{Action, ActionBase};
use crate::build::context::BuildContext;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs::{self, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::PathBuf;
use tracing::info;

/// Where a `raw` source path is resolved from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    #[default]
    Recipe,
    Artifacts,
}

fn default_offset() -> String {
    "0".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawAction {
    #[serde(flatten)]
    pub base: ActionBase,
    pub source: String,
    /// Byte offset into the image. A string so `{{ sector N }}` can fill it.
    #[serde(default = "default_offset", deserialize_with = "super::string_or_integer")]
    pub offset: String,
    #[serde(default)]
    pub origin: Origin,
}

impl RawAction {
    fn offset_bytes(&self) -> Result<u64> {
        self.offset
            .trim()
            .parse()
            .with_context(|| format!("raw offset '{}' is not a byte count", self.offset))
    }

    fn source_path(&self, context: &BuildContext) -> PathBuf {
        match self.origin {
            Origin::Recipe => context.recipe_dir.join(&self.source),
            Origin::Artifacts => context.artifactdir.join(&self.source),
        }
    }
}

impl Action for RawAction {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn verify(&mut self, context: &mut BuildContext) -> Result<()> {
        if self.source.trim().is_empty() {
            bail!("raw needs a 'source'");
        }
        self.offset_bytes()?;
        // Artifacts may be produced by earlier actions, so only recipe
        // sources can be checked up front.
        if self.origin == Origin::Recipe {
            let source = self.source_path(context);
            if !source.is_file() {
                bail!("raw source not found: {}", source.display());
            }
        }
        Ok(())
    }

    fn run(&mut self, context: &mut BuildContext) -> Result<()> {
        let image = context.require_image("raw")?;
        let source = self.source_path(context);
        let offset = self.offset_bytes()?;

        info!("Writing {} to {} at offset {}", source.display(), image.display(), offset);

        let mut input = fs::File::open(&source)
            .with_context(|| format!("Failed to open {}", source.display()))?;
        let mut output = OpenOptions::new()
            .write(true)
            .open(image)
            .with_context(|| format!("Failed to open image {}", image.display()))?;
        output.seek(SeekFrom::Start(offset))?;
        io::copy(&mut input, &mut output)
            .with_context(|| format!("Failed to write {} into {}", source.display(), image.display()))?;
        output.sync_all()?;
        Ok(())
    }
}
