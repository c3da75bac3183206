//! Sandbox backend driving the `fakemachine` tool.
//!
//! fakemachine boots a throwaway VM that shares the host's `/usr` and any
//! extra volumes at the same paths, then runs a single command in it. Inside
//! the VM it exports `IN_FAKE_MACHINE=yes`.

use super::{Machine, MachineBackend};
use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Environment variable set inside a fakemachine VM.
pub const IN_MACHINE_ENV: &str = "IN_FAKE_MACHINE";

/// Launcher binary looked up in `PATH`.
pub const LAUNCHER: &str = "fakemachine";

const KVM_DEVICE: &str = "/dev/kvm";

/// [`MachineBackend`] that starts VMs through the `fakemachine` launcher.
#[derive(Debug, Clone)]
pub struct Fakemachine {
    launcher: String,
}

impl Default for Fakemachine {
    fn default() -> Self {
        Self {
            launcher: LAUNCHER.to_string(),
        }
    }
}

impl Fakemachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different launcher binary.
    pub fn with_launcher(launcher: impl Into<String>) -> Self {
        Self {
            launcher: launcher.into(),
        }
    }
}

impl MachineBackend for Fakemachine {
    fn in_machine(&self) -> bool {
        std::env::var(IN_MACHINE_ENV).map(|v| v == "yes").unwrap_or(false)
    }

    fn supported(&self) -> bool {
        Path::new(KVM_DEVICE).exists() && which::which(&self.launcher).is_ok()
    }

    fn new_machine(&self) -> Result<Box<dyn Machine>> {
        Ok(Box::new(FakemachineSession::new(&self.launcher)))
    }
}

/// A single fakemachine VM invocation being assembled.
#[derive(Debug, Default)]
pub struct FakemachineSession {
    launcher: String,
    volumes: Vec<PathBuf>,
    images: Vec<(PathBuf, u64)>,
}

impl FakemachineSession {
    pub fn new(launcher: &str) -> Self {
        Self {
            launcher: launcher.to_string(),
            ..Default::default()
        }
    }

    /// Build the launcher command that runs `program args...` in the VM.
    pub fn build(&self, program: &Path, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.launcher);

        for volume in &self.volumes {
            cmd.arg("--volume").arg(volume);
        }

        for (image, size) in &self.images {
            cmd.arg("--image")
                .arg(format!("{}:{}", image.display(), size));
        }

        cmd.arg("--").arg(program).args(args);
        cmd
    }
}

/// Device name the VM gives the `index`th attached image.
fn image_device(index: usize) -> Result<PathBuf> {
    let Some(letter) = u8::try_from(index)
        .ok()
        .and_then(|i| b'a'.checked_add(i))
        .filter(u8::is_ascii_lowercase)
    else {
        bail!("too many images attached to one machine ({})", index + 1);
    };
    Ok(PathBuf::from(format!("/dev/vd{}", letter as char)))
}

impl Machine for FakemachineSession {
    fn add_volume(&mut self, path: &Path) {
        if !self.volumes.iter().any(|v| v == path) {
            self.volumes.push(path.to_path_buf());
        }
    }

    fn create_image(&mut self, path: &Path, size: u64) -> Result<PathBuf> {
        let device = image_device(self.images.len())?;

        let file = fs::File::create(path)
            .with_context(|| format!("Failed to create image {}", path.display()))?;
        file.set_len(size)
            .with_context(|| format!("Failed to size image {} to {} bytes", path.display(), size))?;

        self.images.push((path.to_path_buf(), size));
        Ok(device)
    }

    fn run_with_args(&mut self, args: &[String]) -> Result<i32> {
        let program = std::env::current_exe().context("resolving current executable")?;
        if let Some(dir) = program.parent() {
            self.add_volume(dir);
        }

        let mut cmd = self.build(&program, args);
        info!(
            volumes = self.volumes.len(),
            images = self.images.len(),
            "Starting fakemachine"
        );
        debug!(command = ?cmd, "fakemachine invocation");

        let status = cmd
            .stdin(Stdio::null())
            .status()
            .with_context(|| format!("Failed to launch {}", self.launcher))?;

        Ok(match (status.code(), status.signal()) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_build_command_layout() {
        let mut session = FakemachineSession::new("fakemachine");
        session.add_volume(Path::new("/out"));
        session.add_volume(Path::new("/recipes"));
        session.add_volume(Path::new("/out"));
        session.images.push((PathBuf::from("/out/disk.img"), 4096));

        let cmd = session.build(
            Path::new("/usr/bin/recipe-builder"),
            &["--artifactdir".to_string(), "/out".to_string()],
        );

        assert_eq!(cmd.get_program(), "fakemachine");
        assert_eq!(
            args_of(&cmd),
            vec![
                "--volume",
                "/out",
                "--volume",
                "/recipes",
                "--image",
                "/out/disk.img:4096",
                "--",
                "/usr/bin/recipe-builder",
                "--artifactdir",
                "/out",
            ]
        );
    }

    #[test]
    fn test_create_image_assigns_devices() {
        let temp = TempDir::new().unwrap();
        let mut session = FakemachineSession::new("fakemachine");

        let first = session
            .create_image(&temp.path().join("a.img"), 1 << 20)
            .unwrap();
        let second = session
            .create_image(&temp.path().join("b.img"), 1 << 20)
            .unwrap();

        assert_eq!(first, PathBuf::from("/dev/vda"));
        assert_eq!(second, PathBuf::from("/dev/vdb"));
        assert_eq!(
            fs::metadata(temp.path().join("a.img")).unwrap().len(),
            1 << 20
        );
    }

    #[test]
    fn test_image_device_limit() {
        assert_eq!(image_device(25).unwrap(), PathBuf::from("/dev/vdz"));
        assert!(image_device(26).is_err());
    }

    #[test]
    fn test_missing_launcher_is_unsupported() {
        let backend = Fakemachine::with_launcher("definitely_not_a_real_launcher_12345");
        assert!(!backend.supported());
    }
}
