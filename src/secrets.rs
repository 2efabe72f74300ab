use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::{
    config::{SecretsProject, SyncMode},
    error::{PodvaultError, Result},
    exec::{CommandRunner, CommandSpec},
    fs_secure::{chown_path, write_owned_file_atomic},
    types::{Identity, SecretMapping},
};

const AUTHORITY_PROGRAM: &str = "infisical";
const CREDENTIAL_MARKER_FILE: &str = "infisical-config.json";

/// External authority that owns secret values and login state.
pub trait SecretsAuthority {
    /// Fetches one named secret value.
    fn fetch_secret(&self, name: &str) -> Result<Vec<u8>>;
    /// Exports the whole environment as dotenv text.
    fn export_env(&self) -> Result<Vec<u8>>;
    /// Cheap authenticated call used to detect an expired session.
    fn probe(&self) -> Result<()>;
    /// Interactive login on the caller's terminal.
    fn login(&self) -> Result<()>;
    /// Interactive workspace link on the caller's terminal.
    fn link_project(&self) -> Result<()>;
}

impl<A: SecretsAuthority + ?Sized> SecretsAuthority for &A {
    fn fetch_secret(&self, name: &str) -> Result<Vec<u8>> {
        (**self).fetch_secret(name)
    }

    fn export_env(&self) -> Result<Vec<u8>> {
        (**self).export_env()
    }

    fn probe(&self) -> Result<()> {
        (**self).probe()
    }

    fn login(&self) -> Result<()> {
        (**self).login()
    }

    fn link_project(&self) -> Result<()> {
        (**self).link_project()
    }
}

/// Authority backed by the `infisical` CLI, run as the unprivileged identity.
pub struct CliSecretsAuthority<R: CommandRunner> {
    runner: R,
    identity: Identity,
    home: PathBuf,
    workspace: PathBuf,
    project: SecretsProject,
}

impl<R: CommandRunner> CliSecretsAuthority<R> {
    /// Constructs an authority client.
    pub fn new(
        runner: R,
        identity: Identity,
        home: impl AsRef<Path>,
        workspace: impl AsRef<Path>,
        project: SecretsProject,
    ) -> Self {
        Self {
            runner,
            identity,
            home: home.as_ref().to_path_buf(),
            workspace: workspace.as_ref().to_path_buf(),
            project,
        }
    }

    fn command(&self) -> CommandSpec {
        let mut spec = CommandSpec::new(AUTHORITY_PROGRAM)
            .as_identity(&self.identity)
            .env("HOME", self.home.to_string_lossy())
            .env("USER", self.identity.name.clone())
            .env("INFISICAL_VAULT_BACKEND", "file");
        if self.workspace.is_dir() {
            spec = spec.current_dir(&self.workspace);
        }
        spec
    }

    fn scoped(&self, spec: CommandSpec) -> CommandSpec {
        let spec = match self.project.project_id() {
            Some(project_id) => spec.args(["--projectId", project_id]),
            None => spec,
        };
        spec.args(["--env", self.project.environment.as_str()])
    }
}

impl<R: CommandRunner> SecretsAuthority for CliSecretsAuthority<R> {
    fn fetch_secret(&self, name: &str) -> Result<Vec<u8>> {
        let spec = self.scoped(
            self.command()
                .args(["secrets", "get", name, "--plain", "--silent"]),
        );
        let output = self.runner.output(&spec)?.into_result()?;
        if output.stdout_text().is_empty() {
            return Err(PodvaultError::NotFound);
        }
        Ok(output.stdout)
    }

    fn export_env(&self) -> Result<Vec<u8>> {
        let spec = self.scoped(
            self.command()
                .args(["export", "--format=dotenv", "--silent"]),
        );
        Ok(self.runner.output(&spec)?.into_result()?.stdout)
    }

    fn probe(&self) -> Result<()> {
        let spec = self.scoped(self.command().args(["secrets", "--silent"]));
        self.runner.output(&spec)?.into_result()?;
        Ok(())
    }

    fn login(&self) -> Result<()> {
        self.runner
            .output(&self.command().args(["vault", "set", "file"]))?
            .ok_or_ignore("select file credential backend");
        self.runner
            .interactive(&self.command().arg("login"))?
            .into_result()?;
        Ok(())
    }

    fn link_project(&self) -> Result<()> {
        self.runner
            .interactive(&self.command().arg("init"))?
            .into_result()?;
        Ok(())
    }
}

/// Result of one mapping entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Fresh value written.
    Written,
    /// Fetch failed; the previously synced file was kept.
    KeptPrevious(String),
    /// Fetch failed and no previous copy exists.
    Failed(String),
}

/// One mapping entry's sync result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEntry {
    /// Logical secret name.
    pub name: String,
    /// Destination relative to the mount point.
    pub file: String,
    /// What happened.
    pub outcome: SyncOutcome,
}

/// Aggregate result of [`sync_secrets`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Per-secret results, in declaration order.
    pub entries: Vec<SyncEntry>,
    /// Whole-environment export result; `None` when not requested.
    pub env_export: Option<SyncOutcome>,
}

impl SyncReport {
    /// Entries and exports that failed without a fallback.
    pub fn failures(&self) -> usize {
        let entry_failures = self
            .entries
            .iter()
            .filter(|entry| matches!(entry.outcome, SyncOutcome::Failed(_)))
            .count();
        let export_failure = usize::from(matches!(self.env_export, Some(SyncOutcome::Failed(_))));
        entry_failures + export_failure
    }

    /// Entries written fresh.
    pub fn written(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.outcome == SyncOutcome::Written)
            .count()
    }

    /// Entries that fell back to a previous copy.
    pub fn kept(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.outcome, SyncOutcome::KeptPrevious(_)))
            .count()
    }
}

/// Where and as whom synced material is written.
#[derive(Debug, Clone)]
pub struct SyncTarget<'a> {
    /// Vault mount point.
    pub mount_point: &'a Path,
    /// Dotenv export file.
    pub env_file: &'a Path,
    /// Owner of written files.
    pub owner: &'a Identity,
}

/// Pulls declared secrets into the mounted vault.
///
/// Tolerates partial failure: every entry is attempted, a failed fetch keeps
/// an existing local copy, and the report counts what could not be synced.
pub fn sync_secrets<A: SecretsAuthority>(
    authority: &A,
    mappings: &[SecretMapping],
    mode: SyncMode,
    target: &SyncTarget<'_>,
) -> SyncReport {
    let mut report = SyncReport::default();

    if mode.whole_env() {
        report.env_export = Some(match export_env_file(authority, target) {
            Ok(()) => SyncOutcome::Written,
            Err(error) if target.env_file.exists() => {
                warn!(%error, "environment export failed, keeping previous export");
                SyncOutcome::KeptPrevious(error.to_string())
            }
            Err(error) => {
                warn!(%error, "environment export failed");
                SyncOutcome::Failed(error.to_string())
            }
        });
    }

    if mode.per_secret() {
        for mapping in mappings {
            let destination = mapping.target(target.mount_point);
            let outcome = match fetch_into(authority, mapping, &destination, target) {
                Ok(()) => SyncOutcome::Written,
                Err(error) if destination.is_file() => {
                    warn!(secret = %mapping.name, %error, "fetch failed, keeping local copy");
                    SyncOutcome::KeptPrevious(error.to_string())
                }
                Err(error) => {
                    warn!(secret = %mapping.name, %error, "fetch failed");
                    SyncOutcome::Failed(error.to_string())
                }
            };
            report.entries.push(SyncEntry {
                name: mapping.name.clone(),
                file: mapping.file.clone(),
                outcome,
            });
        }
    }

    debug!(
        written = report.written(),
        kept = report.kept(),
        failed = report.failures(),
        "secret sync finished"
    );
    report
}

/// Runs a login when no credential file exists or the session was rejected.
///
/// Returns true when a login was performed.
pub fn ensure_authenticated<A: SecretsAuthority>(authority: &A, credential_home: &Path) -> Result<bool> {
    if has_stored_session(credential_home) {
        match authority.probe() {
            Ok(()) => return Ok(false),
            Err(error) => debug!(%error, "stored session rejected"),
        }
    }
    authority.login()?;
    Ok(true)
}

/// Whether a stored credential file is present.
pub fn has_stored_session(credential_home: &Path) -> bool {
    credential_home.join(CREDENTIAL_MARKER_FILE).is_file()
}

fn export_env_file<A: SecretsAuthority>(authority: &A, target: &SyncTarget<'_>) -> Result<()> {
    let exported = authority.export_env()?;
    if String::from_utf8_lossy(&exported).trim().is_empty() {
        return Err(PodvaultError::NotFound);
    }
    write_owned_file_atomic(target.env_file, &exported, target.owner)
}

fn fetch_into<A: SecretsAuthority>(
    authority: &A,
    mapping: &SecretMapping,
    destination: &Path,
    target: &SyncTarget<'_>,
) -> Result<()> {
    let value = authority.fetch_secret(&mapping.name)?;
    ensure_owned_parents(target.mount_point, destination, target.owner)?;
    write_owned_file_atomic(destination, &value, target.owner)
}

fn ensure_owned_parents(root: &Path, destination: &Path, owner: &Identity) -> Result<()> {
    let Some(parent) = destination.parent() else {
        return Ok(());
    };
    let Ok(relative) = parent.strip_prefix(root) else {
        return Ok(());
    };
    let mut current = root.to_path_buf();
    for component in relative.components() {
        current.push(component);
        if !current.exists() {
            fs::create_dir(&current)?;
            chown_path(&current, owner)?;
        }
    }
    Ok(())
}
