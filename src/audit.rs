use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    fs_secure::{create_private_file_if_missing, set_permissions, PRIVATE_FILE_MODE},
};

/// Vault lifecycle events. Never carries secret values.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A fresh vault image was formatted.
    VaultCreated {
        /// Image size in MiB.
        size_mb: u64,
    },
    /// The volume was opened and mounted.
    VaultUnlocked {
        /// Loop device backing the volume.
        loop_device: String,
    },
    /// The volume rejected a passphrase.
    UnlockRejected,
    /// The volume was unmounted and closed.
    VaultLocked {
        /// Teardown steps that failed and were tolerated.
        failed_steps: Vec<String>,
    },
    /// Secrets were pulled from the authority.
    SecretsSynced {
        /// Entries written.
        written: usize,
        /// Entries whose fetch failed but a prior copy was kept.
        kept: usize,
        /// Entries that failed without a fallback.
        failed: usize,
    },
    /// A credential directory was relocated into the vault.
    SessionPersisted {
        /// Home-side path that now links into the vault.
        path: PathBuf,
    },
    /// The vault image was deleted on request.
    VaultWiped,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct AuditLine {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: AuditEvent,
}

/// JSONL append-only audit log writer.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// Creates a new audit log at `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let file_path = path.as_ref().to_path_buf();
        create_private_file_if_missing(&file_path, b"")?;
        set_permissions(&file_path, PRIVATE_FILE_MODE)?;
        Ok(Self { path: file_path })
    }

    /// Appends one event as a JSON line.
    pub fn log(&self, event: AuditEvent) -> Result<()> {
        let line = AuditLine {
            timestamp: Utc::now(),
            event,
        };

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        serde_json::to_writer(&mut file, &line)?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Appends one event, logging instead of failing.
    pub fn record(&self, event: AuditEvent) {
        if let Err(error) = self.log(event) {
            tracing::warn!(%error, path = %self.path.display(), "audit write failed");
        }
    }

    /// Returns the audit file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
