use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
};

use tracing::{debug, info};

use crate::{
    error::{PodvaultError, Result},
    fs_secure::{ensure_shared_dir, remove_path, set_permissions, PRIVATE_FILE_MODE},
    paths::VaultPaths,
};

const MIB: usize = 1024 * 1024;

/// Allocates a zero-filled image of `size_mb` MiB. Never overwrites.
///
/// A partially written image is removed before the error is returned.
pub fn allocate_image(path: &Path, size_mb: u64) -> Result<()> {
    if size_mb == 0 {
        return Err(PodvaultError::InvalidInput(
            "vault image size must be positive".to_owned(),
        ));
    }
    if let Some(parent) = path.parent() {
        ensure_shared_dir(parent)?;
    }
    let result = write_zeroes(path, size_mb);
    if result.is_err() {
        let _ = remove_path(path);
    }
    result
}

fn write_zeroes(path: &Path, size_mb: u64) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|error| match error.kind() {
            std::io::ErrorKind::AlreadyExists => PodvaultError::AlreadyExists,
            _ => PodvaultError::Io(error),
        })?;
    let chunk = vec![0_u8; MIB];
    for _ in 0..size_mb {
        file.write_all(&chunk)?;
    }
    file.sync_all()?;
    set_permissions(path, PRIVATE_FILE_MODE)?;
    debug!(path = %path.display(), size_mb, "vault image allocated");
    Ok(())
}

/// Moves an image from the legacy location into the vault dir.
///
/// Returns true when an image was moved. A current image always wins.
pub fn migrate_legacy_image(paths: &VaultPaths) -> Result<bool> {
    let legacy = paths.legacy_vault_image();
    let current = paths.vault_image();
    if !legacy.is_file() || current.exists() {
        return Ok(false);
    }
    ensure_shared_dir(&paths.vault_dir())?;
    fs::rename(&legacy, &current)?;
    if let Some(legacy_dir) = legacy.parent() {
        // only removes the directory when nothing else lives there
        let _ = fs::remove_dir(legacy_dir);
    }
    info!(from = %legacy.display(), to = %current.display(), "migrated legacy vault image");
    Ok(true)
}

/// Deletes the vault image. Returns false when there was nothing to delete.
pub fn wipe_image(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    fs::remove_file(path)?;
    Ok(true)
}
