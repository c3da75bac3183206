//! `pack` and `unpack`: archive the root filesystem into the artifact
//! directory, or restore it from a previous archive.

use super::{Action, ActionBase};
use crate::build::context::BuildContext;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::info;
use walkdir::WalkDir;

const ZSTD_LEVEL: i32 = 3;

/// Archive compression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Zstd,
    None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PackAction {
    #[serde(flatten)]
    pub base: ActionBase,
    /// Archive name inside the artifact directory.
    pub file: String,
    #[serde(default)]
    pub compression: Compression,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UnpackAction {
    #[serde(flatten)]
    pub base: ActionBase,
    /// Archive name inside the artifact directory.
    pub file: String,
    #[serde(default)]
    pub compression: Compression,
}

fn archive_path(context: &BuildContext, file: &str) -> Result<PathBuf> {
    let name = Path::new(file);
    if file.trim().is_empty() || name.is_absolute() || name.components().count() != 1 {
        bail!("archive 'file' must be a plain file name, got '{}'", file);
    }
    Ok(context.artifactdir.join(name))
}

/// Write `root` as a tar stream into `writer`, in sorted path order.
fn write_tar<W: Write>(writer: W, root: &Path) -> Result<W> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        let rel = entry.path().strip_prefix(root)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        builder
            .append_path_with_name(entry.path(), rel)
            .with_context(|| format!("archiving {}", entry.path().display()))?;
    }

    Ok(builder.into_inner()?)
}

fn read_tar<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(true);
    archive.set_overwrite(true);
    archive
        .unpack(dest)
        .with_context(|| format!("extracting into {}", dest.display()))
}

impl Action for PackAction {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn verify(&mut self, context: &mut BuildContext) -> Result<()> {
        archive_path(context, &self.file).map(|_| ())
    }

    fn run(&mut self, context: &mut BuildContext) -> Result<()> {
        let output = archive_path(context, &self.file)?;
        info!("Packing {} into {}", context.rootdir.display(), output.display());

        let tmp = NamedTempFile::new_in(&context.artifactdir).with_context(|| {
            format!("creating temporary archive in {}", context.artifactdir.display())
        })?;
        let writer = BufWriter::new(tmp.reopen()?);

        let mut writer = match self.compression {
            Compression::Zstd => {
                let encoder = zstd::stream::Encoder::new(writer, ZSTD_LEVEL)?;
                write_tar(encoder, &context.rootdir)?.finish()?
            }
            Compression::None => write_tar(writer, &context.rootdir)?,
        };
        writer.flush()?;
        drop(writer);
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o644))?;

        tmp.persist(&output)
            .map_err(|e| e.error)
            .with_context(|| format!("writing {}", output.display()))?;
        Ok(())
    }
}

impl Action for UnpackAction {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn verify(&mut self, context: &mut BuildContext) -> Result<()> {
        archive_path(context, &self.file).map(|_| ())
    }

    fn run(&mut self, context: &mut BuildContext) -> Result<()> {
        let input = archive_path(context, &self.file)?;
        info!("Unpacking {} into {}", input.display(), context.rootdir.display());

        fs::create_dir_all(&context.rootdir)
            .with_context(|| format!("creating {}", context.rootdir.display()))?;
        let reader = BufReader::new(
            File::open(&input).with_context(|| format!("opening {}", input.display()))?,
        );

        match self.compression {
            Compression::Zstd => read_tar(zstd::stream::Decoder::new(reader)?, &context.rootdir),
            Compression::None => read_tar(reader, &context.rootdir),
        }
    }
}
