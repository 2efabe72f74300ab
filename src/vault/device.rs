use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{
    error::{PodvaultError, Result},
    exec::{CommandRunner, CommandSpec},
};

const LOOP_MAJOR: u32 = 7;
const MISC_MAJOR: u32 = 10;
const LOOP_CONTROL_MINOR: u32 = 237;
const MAPPER_CONTROL_MINOR: u32 = 236;

/// One row of `losetup -a`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopBinding {
    /// Loop device node, e.g. `/dev/loop3`.
    pub device: PathBuf,
    /// Backing file as reported by the kernel.
    pub backing_file: PathBuf,
}

/// Creates loop and device-mapper nodes and manages loop bindings.
pub struct DeviceProvisioner<R: CommandRunner> {
    runner: R,
    dev_dir: PathBuf,
    loop_devices: u32,
}

impl<R: CommandRunner> DeviceProvisioner<R> {
    /// Constructs a provisioner rooted at `dev_dir`.
    pub fn new(runner: R, dev_dir: impl AsRef<Path>, loop_devices: u32) -> Self {
        Self {
            runner,
            dev_dir: dev_dir.as_ref().to_path_buf(),
            loop_devices,
        }
    }

    /// Creates missing device nodes. Best effort: existing nodes are skipped
    /// and failed `mknod` calls are logged, never raised.
    ///
    /// Returns how many nodes were created.
    pub fn ensure_device_nodes(&self, include_mapper_control: bool) -> usize {
        let mut created = 0;
        if self.ensure_node(
            &self.dev_dir.join("loop-control"),
            'c',
            MISC_MAJOR,
            LOOP_CONTROL_MINOR,
        ) {
            created += 1;
        }
        for index in 0..self.loop_devices {
            if self.ensure_node(
                &self.dev_dir.join(format!("loop{index}")),
                'b',
                LOOP_MAJOR,
                index,
            ) {
                created += 1;
            }
        }
        if include_mapper_control {
            let mapper_dir = self.dev_dir.join("mapper");
            if let Err(error) = std::fs::create_dir_all(&mapper_dir) {
                debug!(%error, "cannot create mapper directory");
            }
            if self.ensure_node(
                &mapper_dir.join("control"),
                'c',
                MISC_MAJOR,
                MAPPER_CONTROL_MINOR,
            ) {
                created += 1;
            }
        }
        debug!(created, "device nodes ensured");
        created
    }

    /// Binds `image` to the first free loop device.
    pub fn attach_loop_device(&self, image: &Path) -> Result<PathBuf> {
        let output = self
            .runner
            .output(&CommandSpec::new("losetup").args(["-f", "--show"]).arg(image))?
            .into_result()?;
        let device = output.stdout_text();
        if device.is_empty() || !device.starts_with('/') {
            return Err(PodvaultError::Environment(format!(
                "losetup returned no usable device for {}",
                image.display()
            )));
        }
        debug!(device = %device, "loop device attached");
        Ok(PathBuf::from(device))
    }

    /// Lists current loop bindings. An unreadable listing yields nothing.
    pub fn list_bindings(&self) -> Vec<LoopBinding> {
        match self.runner.output(&CommandSpec::new("losetup").arg("-a")) {
            Ok(output) if output.success() => {
                parse_loop_bindings(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                output.ok_or_ignore("list loop bindings");
                Vec::new()
            }
            Err(error) => {
                debug!(%error, "cannot list loop bindings");
                Vec::new()
            }
        }
    }

    /// Detaches every binding whose backing file is `image`.
    ///
    /// Bindings are matched by backing-file name; a binding whose recorded
    /// path differs from `image` only counts when that path no longer exists
    /// (the image was moved while bound). Returns how many were detached.
    pub fn detach_stale_loop_bindings(&self, image: &Path) -> usize {
        let Some(image_name) = image.file_name() else {
            return 0;
        };
        let mut detached = 0;
        for binding in self.list_bindings() {
            let same_name = binding.backing_file.file_name() == Some(image_name);
            let same_file = binding.backing_file == image || !binding.backing_file.exists();
            if same_name && same_file && self.detach(&binding.device) {
                detached += 1;
            }
        }
        if detached > 0 {
            debug!(detached, image = %image.display(), "stale loop bindings detached");
        }
        detached
    }

    /// Detaches one loop device. Returns false when `losetup -d` failed.
    pub fn detach(&self, device: &Path) -> bool {
        match self
            .runner
            .output(&CommandSpec::new("losetup").arg("-d").arg(device))
        {
            Ok(output) => output.ok_or_ignore("detach loop device"),
            Err(error) => {
                debug!(%error, device = %device.display(), "cannot detach loop device");
                false
            }
        }
    }

    fn ensure_node(&self, path: &Path, kind: char, major: u32, minor: u32) -> bool {
        if path.exists() {
            return false;
        }
        let spec = CommandSpec::new("mknod")
            .args(["-m", "0660"])
            .arg(path)
            .args([kind.to_string(), major.to_string(), minor.to_string()]);
        match self.runner.output(&spec) {
            Ok(output) => output.ok_or_ignore("create device node"),
            Err(error) => {
                debug!(%error, node = %path.display(), "mknod unavailable");
                false
            }
        }
    }
}

/// Parses `losetup -a` output.
///
/// Lines look like `/dev/loop0: [2049]:1234 (/path/to/vault.img)`; a
/// trailing ` (deleted)` marker is stripped.
pub fn parse_loop_bindings(listing: &str) -> Vec<LoopBinding> {
    listing
        .lines()
        .filter_map(|line| {
            let (device, rest) = line.split_once(':')?;
            let open = rest.find('(')?;
            let close = rest.rfind(')')?;
            if close <= open {
                return None;
            }
            let backing = rest[open + 1..close].trim();
            let backing = backing.strip_suffix("(deleted)").unwrap_or(backing).trim();
            Some(LoopBinding {
                device: PathBuf::from(device.trim()),
                backing_file: PathBuf::from(backing),
            })
        })
        .collect()
}
