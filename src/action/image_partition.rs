//! `image-partition`: create a disk image, partition and format it, and
//! mount its filesystems for later actions.
//!
//! With a sandbox the image file is created on the host and attached to the
//! machine; the device name it gets inside is forwarded through
//! `--internal-image`. Without one the image is attached to a loop device.
//! Either way `Run` sees the device in [`BuildContext::image`].
//!
//! The partitions stay mounted for the actions that follow. They are
//! recorded with [`BuildContext::add_mount`] and released after the last
//! action has run; the loop device is detached in `PostMachine`.

use super::{Action, ActionBase};
use crate::build::context::BuildContext;
use crate::machine::Machine;
use crate::process::Cmd;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// Filesystems `mkfs` is known for.
pub const KNOWN_FILESYSTEMS: &[&str] = &["ext2", "ext3", "ext4", "vfat", "fat32", "btrfs", "xfs", "none"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionType {
    #[default]
    Gpt,
    Msdos,
}

impl PartitionType {
    fn label(self) -> &'static str {
        match self {
            PartitionType::Gpt => "gpt",
            PartitionType::Msdos => "msdos",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Partition {
    pub name: String,
    pub fs: String,
    /// Start offset as understood by parted (`0%`, `1MiB`, or bytes).
    #[serde(deserialize_with = "super::string_or_integer")]
    pub start: String,
    /// End offset as understood by parted (`100%`, `512MiB`, or bytes).
    #[serde(deserialize_with = "super::string_or_integer")]
    pub end: String,
    #[serde(default)]
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Mountpoint {
    pub mountpoint: String,
    /// Name of the partition mounted here.
    pub partition: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImagePartitionAction {
    #[serde(flatten)]
    pub base: ActionBase,
    /// Image file name inside the artifact directory.
    pub imagename: String,
    /// Image size: bytes, or a number with a KB/MB/GB/TB or KiB/MiB/GiB/TiB
    /// suffix.
    #[serde(deserialize_with = "super::string_or_integer")]
    pub imagesize: String,
    #[serde(default)]
    pub partitiontype: PartitionType,
    pub partitions: Vec<Partition>,
    #[serde(default)]
    pub mountpoints: Vec<Mountpoint>,

    #[serde(skip)]
    size: u64,
    #[serde(skip)]
    loop_device: Option<PathBuf>,
}

/// Parse a human-readable size into bytes.
pub fn parse_size(size: &str) -> Result<u64> {
    let trimmed = size.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let count: u64 = digits
        .parse()
        .with_context(|| format!("invalid size '{}'", size))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" => 1000,
        "mb" => 1000_u64.pow(2),
        "gb" => 1000_u64.pow(3),
        "tb" => 1000_u64.pow(4),
        "k" | "kib" => 1 << 10,
        "m" | "mib" => 1 << 20,
        "g" | "gib" => 1 << 30,
        "t" | "tib" => 1 << 40,
        other => bail!("unknown size unit '{}' in '{}'", other, size),
    };

    count
        .checked_mul(multiplier)
        .with_context(|| format!("size '{}' is too large", size))
}

/// Device node of partition `number` on `device`.
///
/// Devices whose name ends in a digit (`/dev/loop0`, `/dev/nvme0n1`) get a
/// `p` separator.
pub fn partition_device(device: &Path, number: usize) -> PathBuf {
    let name = device.as_os_str().to_string_lossy();
    if name.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{}p{}", name, number))
    } else {
        PathBuf::from(format!("{}{}", name, number))
    }
}

/// parted takes bare numbers as megabytes; recipes give them in bytes.
fn parted_offset(offset: &str) -> String {
    let offset = offset.trim();
    if !offset.is_empty() && offset.chars().all(|c| c.is_ascii_digit()) {
        format!("{}B", offset)
    } else {
        offset.to_string()
    }
}

fn fstab_fs(fs: &str) -> &str {
    match fs {
        "fat32" => "vfat",
        other => other,
    }
}

/// One `/etc/fstab` line for a mounted partition.
pub fn fstab_line(uuid: &str, mountpoint: &str, fs: &str, options: &[String]) -> String {
    let options = if options.is_empty() {
        "defaults".to_string()
    } else {
        options.join(",")
    };
    let pass = if mountpoint == "/" { 1 } else { 2 };
    format!(
        "UUID={}\t{}\t{}\t{}\t0\t{}\n",
        uuid,
        mountpoint,
        fstab_fs(fs),
        options,
        pass
    )
}

fn depth(mountpoint: &str) -> usize {
    Path::new(mountpoint)
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count()
}

impl ImagePartitionAction {
    fn image_path(&self, context: &BuildContext) -> PathBuf {
        context.artifactdir.join(&self.imagename)
    }

    fn partition_index(&self, name: &str) -> Option<usize> {
        self.partitions.iter().position(|p| p.name == name)
    }

    /// Mountpoints ordered so parents are mounted before their children.
    fn mount_order(&self) -> Vec<&Mountpoint> {
        let mut order: Vec<&Mountpoint> = self.mountpoints.iter().collect();
        order.sort_by_key(|m| depth(&m.mountpoint));
        order
    }

    fn mkpart_command(&self, device: &Path, partition: &Partition) -> Cmd {
        let name = match self.partitiontype {
            PartitionType::Gpt => partition.name.as_str(),
            PartitionType::Msdos => "primary",
        };
        let fs_hint = match partition.fs.as_str() {
            "vfat" | "fat32" => "fat32",
            "none" => "",
            other => other,
        };

        let mut cmd = Cmd::new("parted")
            .args(["-a", "none", "-s", "--"])
            .arg_path(device)
            .args(["mkpart", name]);
        if !fs_hint.is_empty() {
            cmd = cmd.arg(fs_hint);
        }
        cmd.arg(parted_offset(&partition.start))
            .arg(parted_offset(&partition.end))
    }

    fn mkfs_command(partition: &Partition, device: &Path) -> Option<Cmd> {
        let cmd = match partition.fs.as_str() {
            "none" => return None,
            "vfat" | "fat32" => Cmd::new("mkfs.vfat").args(["-F", "32", "-n", partition.name.as_str()]),
            "xfs" => Cmd::new("mkfs.xfs").args(["-f", "-L", partition.name.as_str()]),
            "btrfs" => Cmd::new("mkfs.btrfs").args(["-f", "-L", partition.name.as_str()]),
            fs => Cmd::new(format!("mkfs.{}", fs)).args(["-F", "-L", partition.name.as_str()]),
        };
        Some(cmd.arg_path(device))
    }

    fn format_partitions(&self, device: &Path) -> Result<()> {
        Cmd::new("parted")
            .args(["-s"])
            .arg_path(device)
            .args(["mklabel", self.partitiontype.label()])
            .error_msg("parted mklabel failed")
            .run()?;

        for (index, partition) in self.partitions.iter().enumerate() {
            let number = index + 1;
            info!(
                "Creating partition {} '{}' ({} -> {})",
                number, partition.name, partition.start, partition.end
            );
            self.mkpart_command(device, partition)
                .error_msg(format!("parted mkpart '{}' failed", partition.name))
                .run()?;

            for flag in &partition.flags {
                Cmd::new("parted")
                    .arg("-s")
                    .arg_path(device)
                    .args(["set", number.to_string().as_str(), flag.as_str(), "on"])
                    .error_msg(format!("setting flag '{}' on '{}' failed", flag, partition.name))
                    .run()?;
            }
        }

        Cmd::new("udevadm").arg("settle").allow_fail().run()?;

        for (index, partition) in self.partitions.iter().enumerate() {
            let part_device = partition_device(device, index + 1);
            if let Some(mkfs) = Self::mkfs_command(partition, &part_device) {
                mkfs.error_msg(format!("formatting '{}' failed", partition.name))
                    .run()?;
            }
        }
        Ok(())
    }

    fn mount_partitions(&mut self, context: &mut BuildContext, device: &Path) -> Result<()> {
        let mut fstab = String::new();
        let mut kernel_root = String::new();

        for mountpoint in self.mount_order() {
            let Some(index) = self.partition_index(&mountpoint.partition) else {
                bail!("mountpoint '{}' names unknown partition '{}'", mountpoint.mountpoint, mountpoint.partition);
            };
            let partition = &self.partitions[index];
            let part_device = partition_device(device, index + 1);
            let relative = mountpoint.mountpoint.trim_start_matches('/');
            let target = context.image_mnt_dir.join(relative);

            fs::create_dir_all(&target)
                .with_context(|| format!("creating mount point {}", target.display()))?;
            let mut mount = Cmd::new("mount");
            if !mountpoint.options.is_empty() {
                mount = mount.arg("-o").arg(mountpoint.options.join(","));
            }
            mount
                .arg_path(&part_device)
                .arg_path(&target)
                .error_msg(format!("mounting '{}' failed", partition.name))
                .run()?;
            context.add_mount(target);

            let uuid = Cmd::new("blkid")
                .args(["-o", "value", "-s", "UUID"])
                .arg_path(&part_device)
                .error_msg(format!("reading UUID of '{}' failed", partition.name))
                .run()?
                .stdout
                .trim()
                .to_string();

            fstab.push_str(&fstab_line(&uuid, &mountpoint.mountpoint, &partition.fs, &mountpoint.options));
            if mountpoint.mountpoint == "/" {
                kernel_root = format!("root=UUID={}", uuid);
            }
        }

        context.image_fstab.push_str(&fstab);
        context.image_kernel_root = kernel_root;
        Ok(())
    }
}

impl Action for ImagePartitionAction {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn verify(&mut self, _context: &mut BuildContext) -> Result<()> {
        let name = Path::new(&self.imagename);
        if self.imagename.trim().is_empty() || name.components().count() != 1 {
            bail!("'imagename' must be a plain file name, got '{}'", self.imagename);
        }

        self.size = parse_size(&self.imagesize)?;
        if self.size == 0 {
            bail!("'imagesize' must be larger than zero");
        }

        if self.partitions.is_empty() {
            bail!("image-partition needs at least one partition");
        }

        let mut seen = HashSet::new();
        for partition in &self.partitions {
            if !seen.insert(partition.name.as_str()) {
                bail!("duplicate partition name '{}'", partition.name);
            }
            if !KNOWN_FILESYSTEMS.contains(&partition.fs.as_str()) {
                bail!(
                    "partition '{}' has unknown filesystem '{}'; expected one of: {}",
                    partition.name,
                    partition.fs,
                    KNOWN_FILESYSTEMS.join(", ")
                );
            }
        }

        let mut mounted = HashSet::new();
        for mountpoint in &self.mountpoints {
            if !mountpoint.mountpoint.starts_with('/') {
                bail!("mountpoint '{}' must be absolute", mountpoint.mountpoint);
            }
            if !mounted.insert(mountpoint.mountpoint.as_str()) {
                bail!("mountpoint '{}' is used twice", mountpoint.mountpoint);
            }
            match self.partition_index(&mountpoint.partition) {
                None => bail!(
                    "mountpoint '{}' names unknown partition '{}'",
                    mountpoint.mountpoint,
                    mountpoint.partition
                ),
                Some(index) if self.partitions[index].fs == "none" => bail!(
                    "mountpoint '{}' uses partition '{}' which has no filesystem",
                    mountpoint.mountpoint,
                    mountpoint.partition
                ),
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn pre_machine(
        &mut self,
        context: &mut BuildContext,
        machine: &mut dyn Machine,
        args: &mut Vec<String>,
    ) -> Result<()> {
        let image = machine.create_image(&self.image_path(context), self.size)?;
        args.push("--internal-image".to_string());
        args.push(image.display().to_string());
        context.image = Some(image);
        Ok(())
    }

    fn pre_no_machine(&mut self, context: &mut BuildContext) -> Result<()> {
        let path = self.image_path(context);
        let file = fs::File::create(&path)
            .with_context(|| format!("creating image {}", path.display()))?;
        file.set_len(self.size)
            .with_context(|| format!("sizing image {}", path.display()))?;

        let device = Cmd::new("losetup")
            .args(["--show", "-f", "-P"])
            .arg_path(&path)
            .error_msg("attaching loop device failed")
            .run()?
            .stdout
            .trim()
            .to_string();
        if device.is_empty() {
            bail!("losetup returned no device for {}", path.display());
        }

        info!("Attached {} to {}", path.display(), device);
        let device = PathBuf::from(device);
        self.loop_device = Some(device.clone());
        context.image = Some(device);
        Ok(())
    }

    fn run(&mut self, context: &mut BuildContext) -> Result<()> {
        let device = context.require_image("image-partition")?.to_path_buf();
        self.format_partitions(&device)?;
        self.mount_partitions(context, &device)
    }

    fn post_machine(&mut self, _context: &BuildContext) -> Result<()> {
        if let Some(device) = self.loop_device.take() {
            let result = Cmd::new("losetup")
                .arg("-d")
                .arg_path(&device)
                .allow_fail()
                .run()?;
            if !result.success() {
                warn!("Failed to detach {}: {}", device.display(), result.stderr.trim());
            }
        }
        Ok(())
    }
}
