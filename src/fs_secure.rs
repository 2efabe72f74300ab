use std::{
    fs,
    path::{Path, PathBuf},
};

use uuid::Uuid;

use crate::{error::Result, types::Identity};

/// Default Unix mode for private files.
pub const PRIVATE_FILE_MODE: u32 = 0o600;
/// Mode for directories the unprivileged user must traverse.
pub const SHARED_DIR_MODE: u32 = 0o755;

/// Ensures a directory exists with traversable permissions.
pub fn ensure_shared_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    set_permissions(path, SHARED_DIR_MODE)
}

/// Writes a file atomically with restricted permissions.
pub fn write_private_file_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    create_parent_dir(path)?;

    let (temp_path, file) = create_private_temp(path)?;
    if let Err(error) = write_and_rename(file, bytes, &temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(error);
    }
    set_permissions(path, PRIVATE_FILE_MODE)
}

/// Writes a private file atomically and hands it to `owner`.
pub fn write_owned_file_atomic(path: &Path, bytes: &[u8], owner: &Identity) -> Result<()> {
    write_private_file_atomic(path, bytes)?;
    chown_path(path, owner)
}

/// Writes a private file only if it does not exist.
pub fn create_private_file_if_missing(path: &Path, bytes: &[u8]) -> Result<()> {
    if !path.exists() {
        write_private_file_atomic(path, bytes)?;
    }
    Ok(())
}

/// Creates a file with `mode` unless one already exists. Returns whether it
/// was written.
pub fn write_file_if_missing(path: &Path, bytes: &[u8], mode: u32) -> Result<bool> {
    use std::{io::Write, os::unix::fs::OpenOptionsExt};
    create_parent_dir(path)?;
    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
    {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(error) => return Err(error.into()),
    };
    file.write_all(bytes)?;
    Ok(true)
}

/// Applies Unix permissions.
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Changes ownership of one path without following a final symlink.
pub fn chown_path(path: &Path, owner: &Identity) -> Result<()> {
    std::os::unix::fs::lchown(path, Some(owner.uid), Some(owner.gid))?;
    Ok(())
}

/// Changes ownership of a tree. Symlinks are re-owned but never followed.
pub fn chown_recursive(path: &Path, owner: &Identity) -> Result<()> {
    chown_path(path, owner)?;
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(path)? {
            chown_recursive(&entry?.path(), owner)?;
        }
    }
    Ok(())
}

/// Copies a directory tree, preserving symlinks as symlinks.
pub fn copy_dir_recursive(source: &Path, destination: &Path) -> Result<()> {
    fs::create_dir_all(destination)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = destination.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Removes a file, symlink, or directory tree. Missing paths are fine.
pub fn remove_path(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => return Err(error.into()),
    }
    Ok(())
}

// The temp file never exists with wider permissions than 0600.
fn create_private_temp(path: &Path) -> Result<(PathBuf, fs::File)> {
    use std::os::unix::fs::OpenOptionsExt;
    let temp_path = temp_path_for(path);
    let file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(PRIVATE_FILE_MODE)
        .open(&temp_path)?;
    Ok((temp_path, file))
}

fn write_and_rename(mut file: fs::File, bytes: &[u8], temp_path: &Path, path: &Path) -> Result<()> {
    use std::io::Write;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(temp_path, path)?;
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let suffix = Uuid::new_v4();
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("tmp");
    let temp_name = format!(".{file_name}.{suffix}.tmp");
    path.with_file_name(temp_name)
}

fn create_parent_dir(path: &Path) -> Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;
    Ok(())
}

#[cfg(test)]
mod unit_tests {
    use std::os::unix::fs::PermissionsExt;

    use super::{create_private_temp, PRIVATE_FILE_MODE};

    #[test]
    fn temp_file_is_private_from_creation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (temp_path, _file) = create_private_temp(&temp_dir.path().join("token")).unwrap();
        let mode = std::fs::metadata(&temp_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
        assert_eq!(mode & 0o777 & !PRIVATE_FILE_MODE, 0);
    }
}
