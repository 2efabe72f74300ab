use std::path::{Component, Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{PodvaultError, Result};

const MAX_SECRET_NAME_LENGTH: usize = 256;

/// Unix identity the interactive session runs as.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    /// Login name.
    pub name: String,
    /// Numeric user id.
    pub uid: u32,
    /// Numeric group id.
    pub gid: u32,
}

impl Identity {
    /// Creates an identity.
    pub fn new(name: impl Into<String>, uid: u32, gid: u32) -> Self {
        Self {
            name: name.into(),
            uid,
            gid,
        }
    }

    /// Returns the identity of the calling process.
    pub fn current() -> Self {
        let uid = nix::unistd::getuid();
        let name = nix::unistd::User::from_uid(uid)
            .ok()
            .flatten()
            .map(|user| user.name)
            .unwrap_or_else(|| uid.to_string());
        Self {
            name,
            uid: uid.as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

/// One secret declared in the secrets file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretMapping {
    /// Logical name at the secrets authority.
    pub name: String,
    /// Destination file, relative to the vault mount point.
    pub file: String,
    /// Optional variable exported with the file's absolute path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
}

impl SecretMapping {
    /// Validates name, file, and env fields.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.name.len() > MAX_SECRET_NAME_LENGTH {
            return Err(PodvaultError::InvalidInput(
                "secret name must be 1..=256 characters".to_owned(),
            ));
        }
        validate_relative_file(&self.file)?;
        if let Some(env) = &self.env {
            if !is_env_identifier(env) {
                return Err(PodvaultError::InvalidInput(format!(
                    "secret `{}` has invalid env name `{env}`",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Absolute destination under `mount_point`.
    pub fn target(&self, mount_point: &Path) -> PathBuf {
        mount_point.join(&self.file)
    }
}

/// Passphrase for the encrypted volume. Zeroized on drop.
#[derive(Debug)]
pub struct Passphrase(SecretString);

impl Passphrase {
    /// Wraps a passphrase.
    pub fn new(value: String) -> Self {
        Self(SecretString::new(value))
    }

    /// Returns true when nothing was entered.
    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().is_empty()
    }

    /// Constant-shape comparison used by the confirmation prompt.
    pub fn matches(&self, other: &Passphrase) -> bool {
        let left = self.0.expose_secret().as_bytes();
        let right = other.0.expose_secret().as_bytes();
        if left.len() != right.len() {
            return false;
        }
        left.iter()
            .zip(right)
            .fold(0_u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    /// Exposes the raw bytes for feeding to a key-file on stdin.
    pub fn expose_bytes(&self) -> &[u8] {
        self.0.expose_secret().as_bytes()
    }
}

/// Returns true for POSIX shell variable names.
pub fn is_env_identifier(value: &str) -> bool {
    let mut characters = value.chars();
    match characters.next() {
        Some(first) if first == '_' || first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    characters.all(|character| character == '_' || character.is_ascii_alphanumeric())
}

fn validate_relative_file(file: &str) -> Result<()> {
    if file.trim().is_empty() {
        return Err(PodvaultError::InvalidInput(
            "secret file cannot be empty".to_owned(),
        ));
    }
    let path = Path::new(file);
    if path.is_absolute() {
        return Err(PodvaultError::InvalidInput(format!(
            "secret file `{file}` must be relative to the vault"
        )));
    }
    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(PodvaultError::InvalidInput(format!(
            "secret file `{file}` cannot use parent traversal"
        )));
    }
    Ok(())
}
