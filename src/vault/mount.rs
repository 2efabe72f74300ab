use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    error::Result,
    exec::{CommandRunner, CommandSpec},
    fs_secure::chown_recursive,
    types::Identity,
};

/// One row of the live mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mounted source.
    pub source: String,
    /// Mount point.
    pub target: PathBuf,
    /// Filesystem type.
    pub fstype: String,
}

/// Reader for a `/proc/self/mounts` style table.
#[derive(Debug, Clone)]
pub struct MountTable {
    path: PathBuf,
}

impl MountTable {
    /// Reads the table at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Table file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current entries. An unreadable table is treated as empty.
    pub fn entries(&self) -> Vec<MountEntry> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => parse_mount_table(&raw),
            Err(error) => {
                debug!(%error, table = %self.path.display(), "cannot read mount table");
                Vec::new()
            }
        }
    }

    /// Whether `target` is a mount point. Matches whole paths only.
    pub fn is_mounted(&self, target: &Path) -> bool {
        self.entries().iter().any(|entry| entry.target == target)
    }
}

/// Outcome of [`MountController::mount`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStatus {
    /// The filesystem was mounted by this call.
    Mounted,
    /// The target was already mounted; nothing changed.
    AlreadyMounted,
}

/// Mounts, bind-mounts and unmounts through the command runner.
pub struct MountController<R: CommandRunner> {
    runner: R,
    table: MountTable,
}

impl<R: CommandRunner> MountController<R> {
    /// Constructs a controller reading `table`.
    pub fn new(runner: R, table: MountTable) -> Self {
        Self { runner, table }
    }

    /// Mount table used for idempotence checks.
    pub fn table(&self) -> &MountTable {
        &self.table
    }

    /// Mounts `device` read-write at `mount_point` and hands the tree to `owner`.
    pub fn mount(&self, device: &Path, mount_point: &Path, owner: &Identity) -> Result<MountStatus> {
        if self.table.is_mounted(mount_point) {
            debug!(mount_point = %mount_point.display(), "already mounted");
            return Ok(MountStatus::AlreadyMounted);
        }
        fs::create_dir_all(mount_point)?;
        self.runner
            .output(
                &CommandSpec::new("mount")
                    .args(["-o", "rw", "-t", "ext4"])
                    .arg(device)
                    .arg(mount_point),
            )?
            .into_result()?;
        chown_recursive(mount_point, owner)?;
        Ok(MountStatus::Mounted)
    }

    /// Bind-mounts `source` over `target`.
    pub fn bind(&self, source: &Path, target: &Path) -> Result<MountStatus> {
        if self.table.is_mounted(target) {
            return Ok(MountStatus::AlreadyMounted);
        }
        self.runner
            .output(
                &CommandSpec::new("mount")
                    .arg("--bind")
                    .arg(source)
                    .arg(target),
            )?
            .into_result()?;
        Ok(MountStatus::Mounted)
    }

    /// Lazily unmounts `target`. "Not mounted" counts as success.
    ///
    /// Returns false only when a mounted target could not be detached.
    pub fn unmount(&self, target: &Path) -> bool {
        if !self.table.is_mounted(target) {
            return true;
        }
        match self
            .runner
            .output(&CommandSpec::new("umount").arg("-l").arg(target))
        {
            Ok(output) => output.ok_or_ignore("unmount") || !self.table.is_mounted(target),
            Err(error) => {
                debug!(%error, target = %target.display(), "umount could not start");
                false
            }
        }
    }
}

/// Parses mount table text, decoding the kernel's octal escapes.
pub fn parse_mount_table(raw: &str) -> Vec<MountEntry> {
    raw.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next().unwrap_or_default();
            Some(MountEntry {
                source: decode_octal_escapes(source),
                target: PathBuf::from(decode_octal_escapes(target)),
                fstype: fstype.to_owned(),
            })
        })
        .collect()
}

fn decode_octal_escapes(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'\\'
            && index + 3 < bytes.len()
            && is_octal_triplet(&bytes[index + 1..index + 4])
        {
            let value = bytes[index + 1..index + 4]
                .iter()
                .fold(0_u32, |acc, digit| acc * 8 + u32::from(digit - b'0'));
            decoded.push(value as u8);
            index += 4;
            continue;
        }
        decoded.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn is_octal_triplet(digits: &[u8]) -> bool {
    digits.len() == 3 && digits.iter().all(|digit| (b'0'..=b'7').contains(digit))
}
