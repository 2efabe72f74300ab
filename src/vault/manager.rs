use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    audit::{AuditEvent, AuditLog},
    config::VaultSettings,
    error::{PodvaultError, Result},
    exec::CommandRunner,
    fs_secure::ensure_shared_dir,
    paths::VaultPaths,
    types::{Identity, Passphrase},
};

use super::{
    crypt::CryptVolume,
    device::DeviceProvisioner,
    image::{allocate_image, migrate_legacy_image, wipe_image},
    lock::SessionLock,
    mount::{MountController, MountStatus, MountTable},
};

/// Steps of a teardown that failed and were tolerated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Human-readable step names.
    pub failed_steps: Vec<String>,
}

impl TeardownReport {
    /// Whether every step succeeded.
    pub fn is_clean(&self) -> bool {
        self.failed_steps.is_empty()
    }
}

/// Coordinator for the encrypted volume lifecycle.
pub struct VaultManager<R: CommandRunner> {
    paths: VaultPaths,
    runner: R,
    owner: Identity,
    settings: VaultSettings,
    audit_log: Option<AuditLog>,
    device_poll: Option<(u32, Duration)>,
}

impl<R: CommandRunner> VaultManager<R> {
    /// Constructs a manager.
    pub fn new(paths: VaultPaths, runner: R, owner: Identity, settings: VaultSettings) -> Self {
        Self {
            paths,
            runner,
            owner,
            settings,
            audit_log: None,
            device_poll: None,
        }
    }

    /// Records lifecycle events to `audit_log`.
    pub fn with_audit(mut self, audit_log: AuditLog) -> Self {
        self.audit_log = Some(audit_log);
        self
    }

    /// Overrides the mapper-node poll.
    pub fn with_device_poll(mut self, attempts: u32, interval: Duration) -> Self {
        self.device_poll = Some((attempts, interval));
        self
    }

    /// Path layout.
    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    /// Identity owning the mounted tree.
    pub fn owner(&self) -> &Identity {
        &self.owner
    }

    /// Command runner shared with collaborators.
    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Moves a legacy image into place and reports whether an image exists.
    pub fn prepare(&self) -> Result<bool> {
        migrate_legacy_image(&self.paths)?;
        ensure_shared_dir(&self.paths.vault_dir())?;
        Ok(self.image_exists())
    }

    /// Whether the Vault Image exists.
    pub fn image_exists(&self) -> bool {
        self.paths.vault_image().is_file()
    }

    /// Whether the mount point is live in the mount table.
    pub fn is_unlocked(&self) -> bool {
        self.mounts().table().is_mounted(&self.paths.mount_point())
    }

    /// Takes the advisory session lock.
    pub fn acquire_session(&self) -> Result<SessionLock> {
        SessionLock::acquire(&self.paths.session_lock_file())
    }

    /// Provisions, opens (formatting first when no image exists) and mounts
    /// the vault.
    ///
    /// Stale mapper entries and loop bindings are cleared first. On any
    /// failure the partial state is torn down before returning, and an image
    /// allocated by this call is removed.
    pub fn unlock(&self, passphrase: &Passphrase) -> Result<UnlockedVault<'_, R>> {
        if passphrase.is_empty() {
            return Err(PodvaultError::InvalidInput(
                "passphrase cannot be empty".to_owned(),
            ));
        }
        self.prepare()?;
        self.clear_stale_state();

        let image = self.paths.vault_image();
        let fresh = !image.exists();
        if fresh {
            info!(size_mb = self.settings.size_mb, "allocating new vault image");
            allocate_image(&image, self.settings.size_mb)?;
        }

        match self.open_and_mount(passphrase, fresh) {
            Ok(unlocked) => {
                if fresh {
                    self.record_event(AuditEvent::VaultCreated {
                        size_mb: self.settings.size_mb,
                    });
                }
                self.record_event(AuditEvent::VaultUnlocked {
                    loop_device: unlocked.loop_device().display().to_string(),
                });
                Ok(unlocked)
            }
            Err(error) => {
                if matches!(error, PodvaultError::WrongPassphrase) {
                    self.record_event(AuditEvent::UnlockRejected);
                }
                if fresh {
                    if let Err(wipe_error) = wipe_image(&image) {
                        warn!(%wipe_error, "could not remove half-created vault image");
                    }
                }
                Err(error)
            }
        }
    }

    /// Unmounts, closes and detaches. Every step is best effort.
    pub fn teardown(&self, loop_device_hint: Option<&Path>) -> TeardownReport {
        let report = self.release_devices(loop_device_hint);
        self.record_event(AuditEvent::VaultLocked {
            failed_steps: report.failed_steps.clone(),
        });
        report
    }

    fn release_devices(&self, loop_device_hint: Option<&Path>) -> TeardownReport {
        let mut report = TeardownReport::default();
        let mounts = self.mounts();
        let mapper_device = self.paths.mapper_device();
        let mount_point = self.paths.mount_point();

        let mut targets: Vec<PathBuf> = mounts
            .table()
            .entries()
            .into_iter()
            .filter(|entry| Path::new(&entry.source) == mapper_device && entry.target != mount_point)
            .map(|entry| entry.target)
            .collect();
        targets.reverse();
        targets.push(mount_point);
        for target in targets {
            if !mounts.unmount(&target) {
                report
                    .failed_steps
                    .push(format!("unmount {}", target.display()));
            }
        }

        if let Err(error) = self.crypt().close() {
            warn!(%error, "volume close failed");
            report.failed_steps.push("close volume".to_owned());
        }

        let device = self.device();
        if let Some(loop_device) = loop_device_hint {
            device.detach(loop_device);
        }
        device.detach_stale_loop_bindings(&self.paths.vault_image());
        let image = self.paths.vault_image();
        if device
            .list_bindings()
            .iter()
            .any(|binding| binding.backing_file == image)
        {
            report.failed_steps.push("detach loop device".to_owned());
        }

        if report.is_clean() {
            debug!("teardown complete");
        } else {
            warn!(failed = ?report.failed_steps, "teardown incomplete");
        }
        report
    }

    /// Deletes the Vault Image. Refused while the vault is unlocked.
    pub fn wipe(&self) -> Result<bool> {
        migrate_legacy_image(&self.paths)?;
        if self.is_unlocked() {
            return Err(PodvaultError::InvalidInput(
                "vault is unlocked; lock it before wiping".to_owned(),
            ));
        }
        let _session = self.acquire_session()?;
        let removed = wipe_image(&self.paths.vault_image())?;
        if removed {
            self.record_event(AuditEvent::VaultWiped);
        }
        Ok(removed)
    }

    fn clear_stale_state(&self) {
        let device = self.device();
        device.ensure_device_nodes(true);
        let crypt = self.crypt();
        if crypt.force_close() {
            info!("removed leftover mapper entry from an earlier session");
        }
        let detached = device.detach_stale_loop_bindings(&self.paths.vault_image());
        if detached > 0 {
            info!(detached, "removed stale loop bindings from an earlier session");
        }
    }

    fn open_and_mount(&self, passphrase: &Passphrase, fresh: bool) -> Result<UnlockedVault<'_, R>> {
        let loop_device = self.device().attach_loop_device(&self.paths.vault_image())?;
        let mut unlocked = UnlockedVault {
            manager: self,
            loop_device,
            fresh,
            mounted: false,
            released: false,
        };

        let crypt = self.crypt();
        if fresh {
            crypt.format(&unlocked.loop_device, passphrase)?;
        }
        crypt.open(&unlocked.loop_device, passphrase)?;
        crypt.refresh_nodes();
        crypt.wait_for_device()?;
        if fresh {
            crypt.make_filesystem()?;
        }

        let status = self.mounts().mount(
            crypt.mapper_device(),
            &self.paths.mount_point(),
            &self.owner,
        )?;
        if status == MountStatus::AlreadyMounted {
            debug!("mount point was already live");
        }
        unlocked.mounted = true;
        Ok(unlocked)
    }

    fn device(&self) -> DeviceProvisioner<&R> {
        DeviceProvisioner::new(
            &self.runner,
            self.paths.dev_dir(),
            self.settings.loop_devices,
        )
    }

    fn crypt(&self) -> CryptVolume<&R> {
        let crypt = CryptVolume::new(
            &self.runner,
            self.paths.mapper_name(),
            self.paths.mapper_device(),
        );
        match self.device_poll {
            Some((attempts, interval)) => crypt.with_device_poll(attempts, interval),
            None => crypt,
        }
    }

    fn mounts(&self) -> MountController<&R> {
        MountController::new(&self.runner, MountTable::new(self.paths.mount_table()))
    }

    /// Appends an event to the audit log, if one is attached.
    pub fn record_event(&self, event: AuditEvent) {
        if let Some(audit_log) = &self.audit_log {
            audit_log.record(event);
        }
    }
}

/// A mounted vault. Tears the volume down when dropped.
pub struct UnlockedVault<'a, R: CommandRunner> {
    manager: &'a VaultManager<R>,
    loop_device: PathBuf,
    fresh: bool,
    mounted: bool,
    released: bool,
}

impl<R: CommandRunner> UnlockedVault<'_, R> {
    /// Loop device backing the volume.
    pub fn loop_device(&self) -> &Path {
        &self.loop_device
    }

    /// Whether the volume was formatted by this unlock.
    pub fn fresh(&self) -> bool {
        self.fresh
    }

    /// Mount point of the decrypted filesystem.
    pub fn mount_point(&self) -> PathBuf {
        self.manager.paths.mount_point()
    }

    /// Tears down now and reports failed steps.
    pub fn lock(mut self) -> TeardownReport {
        self.release()
    }

    fn release(&mut self) -> TeardownReport {
        self.released = true;
        // only a mounted vault was ever unlocked
        if self.mounted {
            self.manager.teardown(Some(&self.loop_device))
        } else {
            self.manager.release_devices(Some(&self.loop_device))
        }
    }
}

impl<R: CommandRunner> Drop for UnlockedVault<'_, R> {
    fn drop(&mut self) {
        if !self.released {
            self.release();
        }
    }
}
