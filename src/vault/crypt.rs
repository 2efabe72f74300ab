use std::{
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use tracing::debug;

use crate::{
    error::{PodvaultError, Result},
    exec::{CommandRunner, CommandSpec},
    types::Passphrase,
};

const DEVICE_POLL_ATTEMPTS: u32 = 20;
const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// `cryptsetup` exit status for "no key available with this passphrase".
const CRYPTSETUP_EXIT_BAD_PASSPHRASE: i32 = 2;

/// LUKS volume under a fixed device-mapper name.
pub struct CryptVolume<R: CommandRunner> {
    runner: R,
    mapper_name: String,
    mapper_device: PathBuf,
    poll_attempts: u32,
    poll_interval: Duration,
}

impl<R: CommandRunner> CryptVolume<R> {
    /// Constructs a volume handle for `mapper_name`, exposed at `mapper_device`.
    pub fn new(runner: R, mapper_name: impl Into<String>, mapper_device: impl AsRef<Path>) -> Self {
        Self {
            runner,
            mapper_name: mapper_name.into(),
            mapper_device: mapper_device.as_ref().to_path_buf(),
            poll_attempts: DEVICE_POLL_ATTEMPTS,
            poll_interval: DEVICE_POLL_INTERVAL,
        }
    }

    /// Overrides the bounded poll used while waiting for the mapper node.
    pub fn with_device_poll(mut self, attempts: u32, interval: Duration) -> Self {
        self.poll_attempts = attempts.max(1);
        self.poll_interval = interval;
        self
    }

    /// Decrypted block device path.
    pub fn mapper_device(&self) -> &Path {
        &self.mapper_device
    }

    /// Device-mapper name.
    pub fn mapper_name(&self) -> &str {
        &self.mapper_name
    }

    /// Whether device-mapper knows the entry.
    pub fn is_open(&self) -> bool {
        self.runner
            .output(&CommandSpec::new("dmsetup").arg("info").arg(&self.mapper_name))
            .map(|output| output.success())
            .unwrap_or(false)
    }

    /// Removes a leftover mapper entry. Returns true if one was present.
    pub fn force_close(&self) -> bool {
        if !self.is_open() {
            return false;
        }
        debug!(mapper = %self.mapper_name, "closing leftover mapper entry");
        self.run_best_effort(
            CommandSpec::new("cryptsetup")
                .arg("close")
                .arg(&self.mapper_name),
            "close leftover volume",
        );
        if self.is_open() {
            self.run_best_effort(
                CommandSpec::new("dmsetup")
                    .args(["remove", "--force"])
                    .arg(&self.mapper_name),
                "force remove mapper entry",
            );
        }
        true
    }

    /// Formats `loop_device` as a new LUKS volume. Destroys prior content.
    pub fn format(&self, loop_device: &Path, passphrase: &Passphrase) -> Result<()> {
        self.runner
            .output(
                &CommandSpec::new("cryptsetup")
                    .args(["luksFormat", "--batch-mode", "--key-file", "-"])
                    .arg(loop_device)
                    .stdin_bytes(passphrase.expose_bytes()),
            )?
            .into_result()?;
        Ok(())
    }

    /// Opens the volume on `loop_device` under the mapper name.
    ///
    /// A rejected passphrase surfaces as [`PodvaultError::WrongPassphrase`];
    /// every other failure stays a command error.
    pub fn open(&self, loop_device: &Path, passphrase: &Passphrase) -> Result<()> {
        let output = self.runner.output(
            &CommandSpec::new("cryptsetup")
                .args(["open", "--key-file", "-"])
                .arg(loop_device)
                .arg(&self.mapper_name)
                .stdin_bytes(passphrase.expose_bytes()),
        )?;
        if output.code == Some(CRYPTSETUP_EXIT_BAD_PASSPHRASE) {
            return Err(PodvaultError::WrongPassphrase);
        }
        output.into_result()?;
        Ok(())
    }

    /// Asks device-mapper to refresh `/dev/mapper` nodes.
    pub fn refresh_nodes(&self) {
        self.run_best_effort(CommandSpec::new("dmsetup").arg("mknodes"), "refresh mapper nodes");
    }

    /// Polls until the mapper node exists.
    pub fn wait_for_device(&self) -> Result<()> {
        for attempt in 0..self.poll_attempts {
            if self.mapper_device.exists() {
                return Ok(());
            }
            if attempt + 1 < self.poll_attempts {
                thread::sleep(self.poll_interval);
            }
        }
        Err(PodvaultError::DeviceTimeout(self.mapper_device.clone()))
    }

    /// Creates an ext4 filesystem on the mapper device.
    pub fn make_filesystem(&self) -> Result<()> {
        self.runner
            .output(
                &CommandSpec::new("mkfs.ext4")
                    .arg("-q")
                    .arg(&self.mapper_device),
            )?
            .into_result()?;
        Ok(())
    }

    /// Closes the volume. A volume that is not open counts as closed.
    pub fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        let output = self.runner.output(
            &CommandSpec::new("cryptsetup")
                .arg("close")
                .arg(&self.mapper_name),
        )?;
        if output.success() || !self.is_open() {
            return Ok(());
        }
        output.into_result().map(|_| ())
    }

    fn run_best_effort(&self, spec: CommandSpec, step: &str) {
        match self.runner.output(&spec) {
            Ok(output) => {
                output.ok_or_ignore(step);
            }
            Err(error) => debug!(%error, step, "best-effort command could not start"),
        }
    }
}
