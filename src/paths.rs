use std::path::{Path, PathBuf};

/// Device-mapper name used for the decrypted vault volume.
pub const DEFAULT_MAPPER_NAME: &str = "podvault_vault";
/// Kernel device directory.
pub const DEFAULT_DEV_DIR: &str = "/dev";
/// Live mount table of the current mount namespace.
pub const DEFAULT_MOUNT_TABLE: &str = "/proc/self/mounts";

const STATE_DIR_NAME: &str = ".podvault";
const LEGACY_VAULT_DIR_NAME: &str = ".podvault-vault";
const VAULT_IMAGE_NAME: &str = "vault.img";

/// Canonical path layout for vault runtime files.
#[derive(Debug, Clone)]
pub struct VaultPaths {
    workspace: PathBuf,
    home: PathBuf,
    dev_dir: PathBuf,
    mount_table: PathBuf,
    mapper_name: String,
}

impl VaultPaths {
    /// Creates a path layout for a workspace and the unprivileged user's home.
    pub fn new(workspace: impl AsRef<Path>, home: impl AsRef<Path>) -> Self {
        Self {
            workspace: workspace.as_ref().to_path_buf(),
            home: home.as_ref().to_path_buf(),
            dev_dir: PathBuf::from(DEFAULT_DEV_DIR),
            mount_table: PathBuf::from(DEFAULT_MOUNT_TABLE),
            mapper_name: DEFAULT_MAPPER_NAME.to_owned(),
        }
    }

    /// Overrides the device directory and mount table location.
    pub fn with_system(mut self, dev_dir: impl AsRef<Path>, mount_table: impl AsRef<Path>) -> Self {
        self.dev_dir = dev_dir.as_ref().to_path_buf();
        self.mount_table = mount_table.as_ref().to_path_buf();
        self
    }

    /// Overrides the device-mapper name.
    pub fn with_mapper_name(mut self, mapper_name: impl Into<String>) -> Self {
        self.mapper_name = mapper_name.into();
        self
    }

    /// Project workspace root.
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Unprivileged user's home directory.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Per-project state directory.
    pub fn state_dir(&self) -> PathBuf {
        self.workspace.join(STATE_DIR_NAME)
    }

    /// Project settings file.
    pub fn config_file(&self) -> PathBuf {
        self.state_dir().join("config.yaml")
    }

    /// Secrets declaration file.
    pub fn secrets_file(&self) -> PathBuf {
        self.workspace.join("secrets.yml")
    }

    /// Directory holding the vault image.
    pub fn vault_dir(&self) -> PathBuf {
        self.state_dir().join("vault")
    }

    /// Vault image file.
    pub fn vault_image(&self) -> PathBuf {
        self.vault_dir().join(VAULT_IMAGE_NAME)
    }

    /// Image location used by older layouts.
    pub fn legacy_vault_image(&self) -> PathBuf {
        self.workspace
            .join(LEGACY_VAULT_DIR_NAME)
            .join(VAULT_IMAGE_NAME)
    }

    /// Lifecycle audit log.
    pub fn audit_file(&self) -> PathBuf {
        self.vault_dir().join("audit.jsonl")
    }

    /// Advisory lock held for the duration of an enclave session.
    pub fn session_lock_file(&self) -> PathBuf {
        self.vault_dir().join("session.lock")
    }

    /// Mount point of the decrypted filesystem.
    pub fn mount_point(&self) -> PathBuf {
        self.home.join("secrets")
    }

    /// Whole-environment dotenv export inside the vault.
    pub fn env_file(&self) -> PathBuf {
        self.mount_point().join(".env-secrets")
    }

    /// Device-mapper name.
    pub fn mapper_name(&self) -> &str {
        &self.mapper_name
    }

    /// Decrypted block device path.
    pub fn mapper_device(&self) -> PathBuf {
        self.dev_dir.join("mapper").join(&self.mapper_name)
    }

    /// Kernel device directory.
    pub fn dev_dir(&self) -> &Path {
        &self.dev_dir
    }

    /// Mount table file.
    pub fn mount_table(&self) -> &Path {
        &self.mount_table
    }

    /// Secrets-manager credential directory in the user's home.
    pub fn credential_home(&self) -> PathBuf {
        self.home.join(".infisical")
    }

    /// Vault-backed copy of the credential directory.
    pub fn credential_vault(&self) -> PathBuf {
        self.mount_point().join(".infisical-vault")
    }

    /// Secrets-manager keyring directory in the user's home.
    pub fn keyring_home(&self) -> PathBuf {
        self.home.join("infisical-keyring")
    }

    /// Vault-backed copy of the keyring directory.
    pub fn keyring_vault(&self) -> PathBuf {
        self.mount_point().join(".infisical-keyring")
    }

    /// Credential directory names written by older layouts inside the vault.
    pub fn legacy_credential_dirs(&self) -> Vec<PathBuf> {
        let mount_point = self.mount_point();
        [".infisical-storage", ".infisical-auth", ".auth-infisical"]
            .iter()
            .map(|name| mount_point.join(name))
            .collect()
    }

    /// Workspace link file written by the secrets manager's `init`.
    pub fn project_link_file(&self) -> PathBuf {
        self.workspace.join(".infisical.json")
    }
}
