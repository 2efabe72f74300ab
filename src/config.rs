use std::{
    fs,
    path::{Component, Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::{PodvaultError, Result},
    types::{Identity, SecretMapping},
};

const DEFAULT_IMAGE: &str = "podvault-base:local";
const DEFAULT_CONTAINER_NAME: &str = "podvault-lab";
const DEFAULT_USER: &str = "podvault";
const DEFAULT_UID: u32 = 1000;
const DEFAULT_GID: u32 = 1000;
const DEFAULT_ENVIRONMENT: &str = "dev";
const MIN_VAULT_SIZE_MB: u64 = 32;
const MAX_LOOP_DEVICES: u32 = 256;

/// Default vault image size in MiB.
pub const DEFAULT_VAULT_SIZE_MB: u64 = 512;
/// Number of loop device nodes provisioned by default.
pub const DEFAULT_LOOP_DEVICES: u32 = 64;
/// Per-project state directory name.
pub const STATE_DIR_NAME: &str = ".podvault";
/// Project settings file name inside the state directory.
pub const CONFIG_FILE_NAME: &str = "config.yaml";
/// Secrets declaration file name at the workspace root.
pub const SECRETS_FILE_NAME: &str = "secrets.yml";
/// Environment variable selecting a config file.
pub const CONFIG_ENV_VAR: &str = "PODVAULT_CONFIG";

/// Source used to select the effective config file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConfigSource {
    /// Selected via `--config` CLI flag.
    Flag,
    /// Selected via `PODVAULT_CONFIG`.
    Env,
    /// Found by walking from the working directory to root.
    Discovered,
    /// No config file selected.
    None,
}

/// Resolved config selection before parsing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigSelection {
    /// Source used for selection.
    pub source: ConfigSource,
    /// Selected path when a config file was found.
    pub path: Option<PathBuf>,
}

impl ConfigSelection {
    /// Workspace root owning the selected config, or `fallback` when none was found.
    ///
    /// A config at `<root>/.podvault/config.yaml` yields `<root>`.
    pub fn workspace_root(&self, fallback: &Path) -> PathBuf {
        let Some(path) = &self.path else {
            return fallback.to_path_buf();
        };
        let parent = path.parent().unwrap_or(Path::new("."));
        if parent.file_name().and_then(|name| name.to_str()) == Some(STATE_DIR_NAME) {
            return parent.parent().unwrap_or(parent).to_path_buf();
        }
        parent.to_path_buf()
    }
}

/// How the collaborator's credential directory is linked into the vault.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceMode {
    /// Bind-mount the in-vault directory over the home path.
    #[default]
    Bind,
    /// Replace the home path with a symlink into the vault.
    Symlink,
}

/// Which secret shapes `pull` fetches.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Only the declared per-secret files.
    PerSecret,
    /// Only the whole-environment dotenv export.
    WholeEnv,
    /// Both shapes.
    #[default]
    Both,
}

impl SyncMode {
    /// Whether declared mapping entries are fetched.
    pub fn per_secret(self) -> bool {
        matches!(self, Self::PerSecret | Self::Both)
    }

    /// Whether the dotenv export is fetched.
    pub fn whole_env(self) -> bool {
        matches!(self, Self::WholeEnv | Self::Both)
    }
}

/// `features` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FeatureFlags {
    /// Enables the encrypted vault commands.
    pub ghost_mode: bool,
    /// Raises diagnostic logging to debug.
    pub debug: bool,
}

/// `build` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BuildConfig {
    /// Dockerfile used by `up`; no build when absent.
    pub dockerfile: Option<String>,
    /// Build context directory.
    pub context: Option<String>,
}

/// `vault` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VaultSettings {
    /// Image size in MiB, applied only when the image is created.
    pub size_mb: u64,
    /// Credential bridge mode.
    pub persistence: PersistenceMode,
    /// Secret sync mode.
    pub sync: SyncMode,
    /// Loop device nodes to provision.
    pub loop_devices: u32,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            size_mb: DEFAULT_VAULT_SIZE_MB,
            persistence: PersistenceMode::default(),
            sync: SyncMode::default(),
            loop_devices: DEFAULT_LOOP_DEVICES,
        }
    }
}

/// Project settings read from `.podvault/config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProjectConfig {
    /// Container image.
    pub image: String,
    /// Container name.
    pub container_name: String,
    /// Unprivileged user inside the container.
    pub user: String,
    /// Numeric id of `user`.
    pub uid: u32,
    /// Numeric group of `user`.
    pub gid: u32,
    /// Feature flags.
    pub features: FeatureFlags,
    /// Image build settings.
    pub build: BuildConfig,
    /// Vault settings.
    pub vault: VaultSettings,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_owned(),
            container_name: DEFAULT_CONTAINER_NAME.to_owned(),
            user: DEFAULT_USER.to_owned(),
            uid: DEFAULT_UID,
            gid: DEFAULT_GID,
            features: FeatureFlags {
                ghost_mode: true,
                debug: false,
            },
            build: BuildConfig::default(),
            vault: VaultSettings::default(),
        }
    }
}

impl ProjectConfig {
    /// Parses and validates a config file. Fails on any problem.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|error| match error.kind() {
            std::io::ErrorKind::NotFound => PodvaultError::NotFound,
            _ => PodvaultError::Io(error),
        })?;
        Self::parse_from_str(&raw)
    }

    /// Parses and validates config YAML.
    pub fn parse_from_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the file when present; otherwise or on error returns defaults.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match Self::load_from_path(path) {
            Ok(config) => config,
            Err(PodvaultError::NotFound) => Self::default(),
            Err(error) => {
                warn!(path = %path.display(), %error, "ignoring unusable project config");
                Self::default()
            }
        }
    }

    /// Checks semantic constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.user.trim().is_empty() {
            return Err(PodvaultError::InvalidInput("user cannot be empty".to_owned()));
        }
        if self.uid == 0 {
            return Err(PodvaultError::InvalidInput(
                "uid must name an unprivileged user".to_owned(),
            ));
        }
        if self.container_name.trim().is_empty() || self.image.trim().is_empty() {
            return Err(PodvaultError::InvalidInput(
                "image and container_name cannot be empty".to_owned(),
            ));
        }
        if self.vault.size_mb < MIN_VAULT_SIZE_MB {
            return Err(PodvaultError::InvalidInput(format!(
                "vault.size_mb must be at least {MIN_VAULT_SIZE_MB}"
            )));
        }
        if self.vault.loop_devices == 0 || self.vault.loop_devices > MAX_LOOP_DEVICES {
            return Err(PodvaultError::InvalidInput(format!(
                "vault.loop_devices must be between 1 and {MAX_LOOP_DEVICES}"
            )));
        }
        Ok(())
    }

    /// Identity the interactive shell runs as.
    pub fn identity(&self) -> Identity {
        Identity::new(self.user.clone(), self.uid, self.gid)
    }

    /// Home directory of the unprivileged user.
    pub fn home_dir(&self) -> PathBuf {
        PathBuf::from("/home").join(&self.user)
    }
}

/// `config` section of `secrets.yml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SecretsProject {
    /// Project identifier at the secrets authority.
    #[serde(alias = "infisical_project_id")]
    pub project_id: Option<String>,
    /// Environment slug passed to every fetch.
    pub environment: String,
}

impl Default for SecretsProject {
    fn default() -> Self {
        Self {
            project_id: None,
            environment: DEFAULT_ENVIRONMENT.to_owned(),
        }
    }
}

impl SecretsProject {
    /// Project id, treating blanks and the scaffold placeholder as unset.
    pub fn project_id(&self) -> Option<&str> {
        self.project_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty() && *value != "null")
    }
}

/// Secrets declaration read from `secrets.yml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SecretsConfig {
    /// Authority settings.
    pub config: SecretsProject,
    /// Declared mapping entries.
    pub secrets: Vec<SecretMapping>,
}

impl SecretsConfig {
    /// Parses secrets YAML strictly, validating every entry.
    pub fn parse_from_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw)?;
        for mapping in &config.secrets {
            mapping.validate()?;
        }
        Ok(config)
    }

    /// Loads the file leniently: parse failures fall back to defaults and
    /// invalid entries are dropped.
    pub fn load_or_default(path: &Path) -> Self {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(error) => {
                warn!(path = %path.display(), %error, "cannot read secrets file");
                return Self::default();
            }
        };
        let mut config: Self = match serde_yaml::from_str(&raw) {
            Ok(config) => config,
            Err(error) => {
                warn!(path = %path.display(), %error, "ignoring unparseable secrets file");
                return Self::default();
            }
        };
        config.secrets.retain(|mapping| match mapping.validate() {
            Ok(()) => true,
            Err(error) => {
                warn!(secret = %mapping.name, %error, "skipping secret entry");
                false
            }
        });
        config
    }

    /// Mapping entries that export an environment variable.
    pub fn env_mappings(&self) -> impl Iterator<Item = &SecretMapping> {
        self.secrets.iter().filter(|mapping| mapping.env.is_some())
    }
}

/// Selects the config file by precedence: flag, env var, upward discovery.
pub fn resolve_config_path(
    explicit_path: Option<&Path>,
    env_path: Option<&str>,
    cwd: impl AsRef<Path>,
) -> Result<ConfigSelection> {
    let cwd = cwd.as_ref();
    if let Some(path) = explicit_path {
        let candidate = absolutize_path(path, cwd);
        if !is_regular_config_candidate(&candidate) {
            return Err(PodvaultError::InvalidInput(format!(
                "config file must be a regular file: {}",
                candidate.display()
            )));
        }
        return Ok(ConfigSelection {
            source: ConfigSource::Flag,
            path: Some(candidate),
        });
    }

    if let Some(value) = env_path {
        if value.trim().is_empty() {
            return Err(PodvaultError::InvalidInput(format!(
                "{CONFIG_ENV_VAR} cannot be empty"
            )));
        }
        let candidate = absolutize_path(Path::new(value), cwd);
        if !is_regular_config_candidate(&candidate) {
            return Err(PodvaultError::InvalidInput(format!(
                "config file must be a regular file: {}",
                candidate.display()
            )));
        }
        return Ok(ConfigSelection {
            source: ConfigSource::Env,
            path: Some(candidate),
        });
    }

    if let Some(path) = discover_config(cwd) {
        return Ok(ConfigSelection {
            source: ConfigSource::Discovered,
            path: Some(path),
        });
    }

    Ok(ConfigSelection {
        source: ConfigSource::None,
        path: None,
    })
}

/// Walks from `start_dir` upward looking for `.podvault/config.yaml`.
pub fn discover_config(start_dir: impl AsRef<Path>) -> Option<PathBuf> {
    let mut current = start_dir.as_ref();
    loop {
        let candidate = current.join(STATE_DIR_NAME).join(CONFIG_FILE_NAME);
        if is_regular_config_candidate(&candidate) {
            return Some(candidate);
        }
        current = current.parent()?;
    }
}

fn absolutize_path(path: &Path, cwd: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

fn is_regular_config_candidate(path: &Path) -> bool {
    fs::metadata(path)
        .map(|metadata| metadata.is_file())
        .unwrap_or(false)
}
