use std::{
    fs,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use crate::{
    config::PersistenceMode,
    error::Result,
    exec::CommandRunner,
    fs_secure::{chown_path, chown_recursive, copy_dir_recursive, remove_path},
    paths::VaultPaths,
    types::Identity,
};

use super::mount::{MountController, MountTable};

/// A home-side directory and its vault-backed counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgePair {
    /// Path the collaborator program expects.
    pub home: PathBuf,
    /// Directory inside the mounted vault.
    pub vault: PathBuf,
}

impl BridgePair {
    /// Pairs `home` with `vault`.
    pub fn new(home: impl AsRef<Path>, vault: impl AsRef<Path>) -> Self {
        Self {
            home: home.as_ref().to_path_buf(),
            vault: vault.as_ref().to_path_buf(),
        }
    }
}

/// State of a home-side path relative to its vault copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomeState {
    /// Nothing at the home path.
    Missing,
    /// Already resolves into the vault.
    Linked,
    /// A real directory holding unrelocated state.
    RealDirectory,
    /// Something else (a foreign symlink or a file).
    Other,
}

/// Links a collaborator's credential directories into the mounted vault.
pub struct SessionBridge<R: CommandRunner> {
    mounts: MountController<R>,
    mode: PersistenceMode,
    owner: Identity,
    pairs: Vec<BridgePair>,
}

impl<R: CommandRunner> SessionBridge<R> {
    /// Constructs a bridge over explicit pairs.
    pub fn new(
        runner: R,
        table: MountTable,
        mode: PersistenceMode,
        owner: Identity,
        pairs: Vec<BridgePair>,
    ) -> Self {
        Self {
            mounts: MountController::new(runner, table),
            mode,
            owner,
            pairs,
        }
    }

    /// Bridge for the credential home and keyring directories of `paths`.
    pub fn for_paths(runner: R, paths: &VaultPaths, mode: PersistenceMode, owner: Identity) -> Self {
        Self::new(
            runner,
            MountTable::new(paths.mount_table()),
            mode,
            owner,
            vec![
                BridgePair::new(paths.credential_home(), paths.credential_vault()),
                BridgePair::new(paths.keyring_home(), paths.keyring_vault()),
            ],
        )
    }

    /// Configured pairs.
    pub fn pairs(&self) -> &[BridgePair] {
        &self.pairs
    }

    /// Classifies the home side of `pair`.
    pub fn home_state(&self, pair: &BridgePair) -> HomeState {
        let Ok(metadata) = fs::symlink_metadata(&pair.home) else {
            return HomeState::Missing;
        };
        match self.mode {
            PersistenceMode::Symlink if metadata.file_type().is_symlink() => {
                match fs::read_link(&pair.home) {
                    Ok(target) if target == pair.vault => HomeState::Linked,
                    _ => HomeState::Other,
                }
            }
            PersistenceMode::Bind if self.mounts.table().is_mounted(&pair.home) => {
                HomeState::Linked
            }
            _ if metadata.is_dir() => HomeState::RealDirectory,
            _ => HomeState::Other,
        }
    }

    /// Renames credential dirs left by older layouts to `current`.
    ///
    /// When `current` already exists the legacy copies are deleted instead.
    pub fn migrate_legacy(&self, legacy: &[PathBuf], current: &Path) -> Result<usize> {
        let mut migrated = 0;
        for old in legacy {
            if old == current || !old.exists() {
                continue;
            }
            if current.exists() {
                remove_path(old)?;
                debug!(path = %old.display(), "removed superseded legacy credential dir");
            } else {
                fs::rename(old, current)?;
                info!(from = %old.display(), to = %current.display(), "migrated legacy credential dir");
                migrated += 1;
            }
        }
        Ok(migrated)
    }

    /// Re-links every pair whose vault copy exists. Idempotent.
    ///
    /// Returns how many pairs were linked by this call.
    pub fn restore(&self) -> Result<usize> {
        let mut linked = 0;
        for pair in &self.pairs {
            if !pair.vault.is_dir() {
                continue;
            }
            if self.link(pair)? {
                linked += 1;
            }
        }
        Ok(linked)
    }

    /// Links every pair, creating empty vault copies where needed.
    ///
    /// Used before an interactive login so fresh state lands in the vault.
    pub fn establish(&self) -> Result<usize> {
        let mut linked = 0;
        for pair in &self.pairs {
            if !pair.vault.exists() {
                fs::create_dir_all(&pair.vault)?;
            }
            if self.link(pair)? {
                linked += 1;
            }
        }
        Ok(linked)
    }

    /// Relocates real home directories into the vault and links them.
    ///
    /// Already linked or missing paths are left alone. Returns the home paths
    /// that were relocated.
    pub fn persist(&self) -> Result<Vec<PathBuf>> {
        let mut relocated = Vec::new();
        for pair in &self.pairs {
            if self.home_state(pair) != HomeState::RealDirectory {
                continue;
            }
            copy_dir_recursive(&pair.home, &pair.vault)?;
            remove_path(&pair.home)?;
            self.link(pair)?;
            info!(path = %pair.home.display(), "credential state relocated into vault");
            relocated.push(pair.home.clone());
        }
        Ok(relocated)
    }

    /// Drops bind mounts before the vault is unmounted. Symlinks are left
    /// dangling on purpose; they point into the locked volume.
    ///
    /// Returns the home paths that could not be unmounted.
    pub fn release(&self) -> Vec<PathBuf> {
        if self.mode != PersistenceMode::Bind {
            return Vec::new();
        }
        self.pairs
            .iter()
            .rev()
            .filter(|pair| !self.mounts.unmount(&pair.home))
            .map(|pair| pair.home.clone())
            .collect()
    }

    fn link(&self, pair: &BridgePair) -> Result<bool> {
        if self.home_state(pair) == HomeState::Linked {
            return Ok(false);
        }
        chown_recursive(&pair.vault, &self.owner)?;
        remove_path(&pair.home)?;
        if let Some(parent) = pair.home.parent() {
            fs::create_dir_all(parent)?;
        }
        match self.mode {
            PersistenceMode::Symlink => {
                symlink(&pair.vault, &pair.home)?;
                chown_path(&pair.home, &self.owner)?;
            }
            PersistenceMode::Bind => {
                fs::create_dir_all(&pair.home)?;
                self.mounts.bind(&pair.vault, &pair.home)?;
                chown_path(&pair.home, &self.owner)?;
            }
        }
        debug!(home = %pair.home.display(), vault = %pair.vault.display(), "bridge linked");
        Ok(true)
    }
}
