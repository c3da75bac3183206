//! Copying files and trees onto a root filesystem.
//!
//! Files are never written in place: each one is streamed into a temporary
//! file next to its destination and renamed over it, so a reader of the
//! destination path sees either the old content or the complete new
//! content. Directories and symlinks are recreated with the source's mode
//! and link target.

use anyhow::{bail, Context, Result};
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Atomically copy `src` to `dst`, giving the result permission bits `mode`.
///
/// # Example
///
/// ```rust,ignore
/// use recipe_builder::build::filesystem::copy_file;
/// use std::path::Path;
///
/// copy_file(Path::new("overlay/etc/hostname"), Path::new("/scratch/root/etc/hostname"), 0o644)?;
/// ```
pub fn copy_file(src: &Path, dst: &Path, mode: u32) -> Result<()> {
    let mut input =
        fs::File::open(src).with_context(|| format!("Failed to open {}", src.display()))?;
    write_atomic(&mut input, dst, mode)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))
}

/// Stream `reader` into a temporary file in `dst`'s directory, then rename
/// it into place. On any error the temporary file is removed and `dst` is
/// left untouched.
fn write_atomic(reader: &mut impl Read, dst: &Path, mode: u32) -> Result<()> {
    let dir = match dst.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
    io::copy(reader, tmp.as_file_mut())?;
    fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode))?;
    tmp.persist(dst)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to rename into {}", dst.display()))?;
    Ok(())
}

/// Overlay the tree at `source` onto `dest`.
///
/// Walks `source` top-down so every directory exists before anything is
/// copied into it. Existing destination directories are kept as they are;
/// existing files and symlinks are replaced. Sockets, FIFOs and device
/// nodes are rejected.
pub fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    info!("Overlaying {} on {}", source.display(), dest.display());

    for entry in WalkDir::new(source)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("Failed to walk {}", source.display()))?;
        let suffix = entry
            .path()
            .strip_prefix(source)
            .with_context(|| format!("{} escaped {}", entry.path().display(), source.display()))?;
        let target = dest.join(suffix);
        let metadata = entry
            .path()
            .symlink_metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
        let mode = metadata.permissions().mode() & 0o7777;
        let file_type = metadata.file_type();

        if file_type.is_file() {
            debug!("F> {}", entry.path().display());
            copy_file(entry.path(), &target, mode)?;
        } else if file_type.is_dir() {
            debug!("D> {} -> {}", entry.path().display(), target.display());
            create_dir(&target, mode)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .with_context(|| format!("Failed to read symlink /{}", suffix.display()))?;
            debug!("L> {} -> {}", target.display(), link.display());
            replace_with_symlink(&link, &target)?;
        } else {
            bail!(
                "Not handled /{} ({:?})",
                suffix.display(),
                file_type
            );
        }
    }

    Ok(())
}

fn create_dir(target: &Path, mode: u32) -> Result<()> {
    match fs::create_dir(target) {
        Ok(()) => fs::set_permissions(target, fs::Permissions::from_mode(mode))
            .with_context(|| format!("Failed to set mode on {}", target.display())),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && target.is_dir() => Ok(()),
        Err(e) => {
            Err(e).with_context(|| format!("Failed to create directory {}", target.display()))
        }
    }
}

fn replace_with_symlink(link: &Path, target: &Path) -> Result<()> {
    if let Ok(existing) = target.symlink_metadata() {
        if existing.is_dir() {
            bail!(
                "Cannot replace directory {} with a symlink",
                target.display()
            );
        }
        fs::remove_file(target)
            .with_context(|| format!("Failed to remove {}", target.display()))?;
    }
    symlink(link, target)
        .with_context(|| format!("Failed to create symlink {}", target.display()))
}
