use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use tracing::{debug, info, warn};

use crate::{
    audit::AuditEvent,
    config::{PersistenceMode, SyncMode},
    error::{PodvaultError, Result},
    exec::{CommandRunner, CommandSpec},
    secrets::{ensure_authenticated, sync_secrets, SecretsAuthority, SyncOutcome, SyncReport, SyncTarget},
    types::{Passphrase, SecretMapping},
    vault::{
        bridge::SessionBridge,
        lock::{ControlChannel, ControlRequest},
        shell::{SessionEnvironment, ShellSession, CONTROL_FD_VAR, DEBUG_VAR},
        UnlockedVault, VaultManager,
    },
};

/// Exit code the enclave uses to ask the outer process to keep its shell.
pub const STAY_EXIT_CODE: i32 = 2;
/// Hidden subcommand the launcher re-executes into.
pub const INTERNAL_ENCLAVE_COMMAND: &str = "internal-enclave";
const WIPE_FLAG: &str = "--wipe";

/// Orchestrator states, in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnclaveState {
    /// Nothing done yet.
    Uninitialized,
    /// Waiting for a passphrase.
    PassphrasePrompt,
    /// Volume opened.
    VolumeReady,
    /// Filesystem mounted and bridge restored.
    Mounted,
    /// Interactive shell running.
    SessionActive,
    /// Saving bridge state and closing the volume.
    Teardown,
    /// Finished.
    Closed,
}

/// How the enclave ended, as seen by the unprivileged parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnclaveOutcome {
    /// The shell ended; the parent should finish normally.
    Exit,
    /// A nested `lock` closed the vault; the parent should keep its shell.
    Stay,
}

impl EnclaveOutcome {
    /// Process exit code carrying this outcome.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Exit => 0,
            Self::Stay => STAY_EXIT_CODE,
        }
    }

    /// Maps the enclave child's exit code back to an outcome.
    pub fn from_exit_code(code: Option<i32>) -> Result<Self> {
        match code {
            Some(0) => Ok(Self::Exit),
            Some(STAY_EXIT_CODE) => Ok(Self::Stay),
            other => Err(PodvaultError::Command {
                program: INTERNAL_ENCLAVE_COMMAND.to_owned(),
                code: other.unwrap_or(-1),
                stderr: "enclave exited abnormally".to_owned(),
            }),
        }
    }
}

/// Work done after mounting and before the interactive shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnclaveAction {
    /// Only open the shell.
    #[default]
    Shell,
    /// Authenticate if needed, then sync secrets.
    Pull,
    /// Run the interactive login.
    Login,
}

impl EnclaveAction {
    /// Argument passed to the re-executed enclave.
    pub fn as_arg(self) -> Option<&'static str> {
        match self {
            Self::Shell => None,
            Self::Pull => Some("pull"),
            Self::Login => Some("login"),
        }
    }
}

impl FromStr for EnclaveAction {
    type Err = PodvaultError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "" | "shell" => Ok(Self::Shell),
            "pull" | "sync" => Ok(Self::Pull),
            "login" => Ok(Self::Login),
            other => Err(PodvaultError::InvalidInput(format!(
                "unknown enclave action `{other}`"
            ))),
        }
    }
}

/// Supplies passphrases and shows short notices to the human.
pub trait PassphraseSource {
    /// Reads one passphrase without echo.
    fn read_passphrase(&mut self, prompt: &str) -> Result<Passphrase>;
    /// Shows a one-line notice.
    fn notice(&mut self, message: &str);
}

/// Reads a new passphrase twice until both entries match and are non-empty.
pub fn confirm_new_passphrase<S: PassphraseSource + ?Sized>(source: &mut S) -> Result<Passphrase> {
    loop {
        let first = source.read_passphrase("Define master passphrase: ")?;
        let second = source.read_passphrase("Confirm passphrase: ")?;
        if first.is_empty() {
            source.notice("Passphrase cannot be empty.");
            continue;
        }
        if first.matches(&second) {
            return Ok(first);
        }
        source.notice("Passphrases do not match.");
    }
}

/// Enclave behaviour chosen by configuration.
#[derive(Debug, Clone)]
pub struct EnclaveSettings {
    /// Credential bridge mode.
    pub persistence: PersistenceMode,
    /// Secret sync mode.
    pub sync: SyncMode,
    /// Declared mapping entries.
    pub mappings: Vec<SecretMapping>,
    /// Forward the debug flag into the session.
    pub debug: bool,
    /// Shell program.
    pub shell: String,
    /// Parent environment the shell baseline may copy from.
    pub parent_env: Vec<(String, String)>,
}

impl Default for EnclaveSettings {
    fn default() -> Self {
        Self {
            persistence: PersistenceMode::default(),
            sync: SyncMode::default(),
            mappings: Vec::new(),
            debug: false,
            shell: "bash".to_owned(),
            parent_env: Vec::new(),
        }
    }
}

/// Privileged orchestrator that owns the vault's mounted lifetime.
pub struct Enclave<'a, R: CommandRunner, A: SecretsAuthority> {
    manager: &'a VaultManager<R>,
    authority: A,
    settings: EnclaveSettings,
    verify_entry: bool,
    history: Vec<EnclaveState>,
    last_sync: Option<SyncReport>,
}

impl<'a, R: CommandRunner, A: SecretsAuthority> Enclave<'a, R, A> {
    /// Constructs an enclave that verifies root and a private mount namespace.
    pub fn new(manager: &'a VaultManager<R>, authority: A, settings: EnclaveSettings) -> Self {
        Self {
            manager,
            authority,
            settings,
            verify_entry: true,
            history: Vec::new(),
            last_sync: None,
        }
    }

    /// Skips the privilege and namespace check.
    pub fn without_entry_check(mut self) -> Self {
        self.verify_entry = false;
        self
    }

    /// States visited by the last run.
    pub fn history(&self) -> &[EnclaveState] {
        &self.history
    }

    /// Current state.
    pub fn state(&self) -> EnclaveState {
        self.history
            .last()
            .copied()
            .unwrap_or(EnclaveState::Uninitialized)
    }

    /// Report of the sync performed by the last `pull` action.
    pub fn last_sync(&self) -> Option<&SyncReport> {
        self.last_sync.as_ref()
    }

    /// Runs one enclave session to completion.
    ///
    /// Teardown runs on every path once the volume has been opened.
    pub fn run<S: PassphraseSource + ?Sized>(
        &mut self,
        action: EnclaveAction,
        source: &mut S,
    ) -> Result<EnclaveOutcome> {
        self.history.clear();
        self.transition(EnclaveState::Uninitialized);
        if self.verify_entry {
            verify_entry()?;
        }

        let manager = self.manager;
        let (vault, _session) = if manager.is_unlocked() {
            source.notice("Vault already unlocked.");
            (None, None)
        } else {
            let session = manager.acquire_session()?;
            self.transition(EnclaveState::PassphrasePrompt);
            let vault = self.unlock_with_prompt(source)?;
            self.transition(EnclaveState::VolumeReady);
            (Some(vault), Some(session))
        };
        let result = self.mounted_session(action, source);
        self.transition(EnclaveState::Teardown);
        let bridge = self.bridge();
        match bridge.persist() {
            Ok(relocated) => {
                for path in relocated {
                    manager.record_event(AuditEvent::SessionPersisted { path });
                }
            }
            Err(error) => warn!(%error, "could not relocate credential state"),
        }
        bridge.release();
        if let Some(vault) = vault {
            let report = vault.lock();
            if report.is_clean() {
                source.notice("Vault locked.");
            } else {
                source.notice(&format!(
                    "Vault locked with errors: {}",
                    report.failed_steps.join(", ")
                ));
            }
        }
        self.transition(EnclaveState::Closed);
        result
    }

    fn unlock_with_prompt<S: PassphraseSource + ?Sized>(
        &mut self,
        source: &mut S,
    ) -> Result<UnlockedVault<'a, R>> {
        let manager = self.manager;
        if !manager.prepare()? {
            source.notice("Creating a new vault.");
            let passphrase = confirm_new_passphrase(source)?;
            return manager.unlock(&passphrase);
        }
        loop {
            let passphrase = source.read_passphrase("Enter master passphrase: ")?;
            if passphrase.is_empty() {
                return Err(PodvaultError::InvalidInput("unlock aborted".to_owned()));
            }
            match manager.unlock(&passphrase) {
                Ok(vault) => return Ok(vault),
                Err(PodvaultError::WrongPassphrase) => {
                    source.notice("Wrong passphrase, try again (empty input aborts).");
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn mounted_session<S: PassphraseSource + ?Sized>(
        &mut self,
        action: EnclaveAction,
        source: &mut S,
    ) -> Result<EnclaveOutcome> {
        self.transition(EnclaveState::Mounted);
        let manager = self.manager;
        let paths = manager.paths();
        let bridge = self.bridge();
        if let Err(error) =
            bridge.migrate_legacy(&paths.legacy_credential_dirs(), &paths.credential_vault())
        {
            warn!(%error, "legacy credential migration failed");
        }
        if let Err(error) = bridge.restore() {
            warn!(%error, "credential bridge restore failed");
            source.notice(&format!("credential restore failed: {error}"));
        }

        if let Err(error) = self.run_action(action, source) {
            warn!(%error, "pre-session action failed");
            source.notice(&format!("{action:?} failed: {error}"));
        }

        self.transition(EnclaveState::SessionActive);
        let owner = manager.owner().clone();
        let mut control = ControlChannel::open()?;
        control.grant(&owner)?;

        let mut environment =
            SessionEnvironment::baseline(&owner, paths.home(), self.settings.parent_env.clone());
        if let Err(error) = environment.apply_dotenv_file(&paths.env_file()) {
            warn!(%error, file = %paths.env_file().display(), "environment export skipped");
            source.notice(&format!("environment export skipped: {error}"));
        }
        let applied = environment.apply_mappings(&self.settings.mappings, &paths.mount_point());
        debug!(variables = ?applied, "secret variables exported");
        environment.set(CONTROL_FD_VAR, control.child_fd().to_string());
        if self.settings.debug {
            environment.set(DEBUG_VAR, "true");
        }

        source.notice("Ghost mode active. Exit the shell or run `podvault lock` to close the vault.");
        let shell = ShellSession::new(manager.runner(), owner, paths.workspace())
            .with_shell(self.settings.shell.clone());
        match shell.run(&environment) {
            Ok(exit) => debug!(code = ?exit.code, "session ended"),
            Err(error) => warn!(%error, "interactive shell failed"),
        }

        let request = control.take_request().unwrap_or_else(|error| {
            warn!(%error, "control channel unreadable");
            ControlRequest::None
        });
        Ok(match request {
            ControlRequest::Lock => EnclaveOutcome::Stay,
            ControlRequest::None => EnclaveOutcome::Exit,
        })
    }

    fn run_action<S: PassphraseSource + ?Sized>(
        &mut self,
        action: EnclaveAction,
        source: &mut S,
    ) -> Result<()> {
        let manager = self.manager;
        let paths = manager.paths();
        match action {
            EnclaveAction::Shell => Ok(()),
            EnclaveAction::Login => {
                self.bridge().establish()?;
                source.notice("Starting secrets login.");
                self.authority.login()?;
                if !paths.project_link_file().exists() {
                    self.authority.link_project()?;
                }
                Ok(())
            }
            EnclaveAction::Pull => {
                self.bridge().establish()?;
                if ensure_authenticated(&self.authority, &paths.credential_home())? {
                    source.notice("Logged in to the secrets authority.");
                }
                let owner = manager.owner();
                let mount_point = paths.mount_point();
                let env_file = paths.env_file();
                let report = sync_secrets(
                    &self.authority,
                    &self.settings.mappings,
                    self.settings.sync,
                    &SyncTarget {
                        mount_point: &mount_point,
                        env_file: &env_file,
                        owner,
                    },
                );
                announce_sync(&report, source);
                manager.record_event(AuditEvent::SecretsSynced {
                    written: report.written(),
                    kept: report.kept(),
                    failed: report.failures(),
                });
                self.last_sync = Some(report);
                Ok(())
            }
        }
    }

    fn bridge(&self) -> SessionBridge<&R> {
        SessionBridge::for_paths(
            self.manager.runner(),
            self.manager.paths(),
            self.settings.persistence,
            self.manager.owner().clone(),
        )
    }

    fn transition(&mut self, state: EnclaveState) {
        debug!(?state, "enclave state");
        self.history.push(state);
    }
}

/// Shows one line per synced entry through `source`.
pub fn announce_sync<S: PassphraseSource + ?Sized>(report: &SyncReport, source: &mut S) {
    if let Some(outcome) = &report.env_export {
        source.notice(&format!("environment export: {}", describe(outcome)));
    }
    for entry in &report.entries {
        source.notice(&format!(
            "{} -> {}: {}",
            entry.name,
            entry.file,
            describe(&entry.outcome)
        ));
    }
    if report.failures() > 0 {
        info!(failed = report.failures(), "some secrets could not be synced");
    }
}

fn describe(outcome: &SyncOutcome) -> &'static str {
    match outcome {
        SyncOutcome::Written => "ok",
        SyncOutcome::KeptPrevious(_) => "kept previous copy",
        SyncOutcome::Failed(_) => "FAILED",
    }
}

/// Fails unless running as root inside a mount namespace other than init's.
pub fn verify_entry() -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        return Err(PodvaultError::Environment(
            "the enclave must run as root".to_owned(),
        ));
    }
    let own = fs::read_link("/proc/self/ns/mnt")?;
    let init = fs::read_link("/proc/1/ns/mnt").map_err(|error| {
        PodvaultError::Environment(format!("cannot inspect init mount namespace: {error}"))
    })?;
    if own == init {
        return Err(PodvaultError::Environment(
            "the enclave must run in a private mount namespace".to_owned(),
        ));
    }
    Ok(())
}

/// Starts the enclave from the unprivileged side and maps its exit code.
pub struct EnclaveLauncher<R: CommandRunner> {
    runner: R,
    executable: PathBuf,
    workspace: PathBuf,
    config: Option<PathBuf>,
    debug: bool,
    wipe: bool,
}

impl<R: CommandRunner> EnclaveLauncher<R> {
    /// Launcher re-executing `executable` for `workspace`.
    pub fn new(runner: R, executable: impl AsRef<Path>, workspace: impl AsRef<Path>) -> Self {
        Self {
            runner,
            executable: executable.as_ref().to_path_buf(),
            workspace: workspace.as_ref().to_path_buf(),
            config: None,
            debug: false,
            wipe: false,
        }
    }

    /// Forwards an explicit config path.
    pub fn with_config(mut self, config: Option<PathBuf>) -> Self {
        self.config = config;
        self
    }

    /// Forwards the debug flag.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Asks the enclave to delete the Vault Image before unlocking.
    pub fn with_wipe(mut self, wipe: bool) -> Self {
        self.wipe = wipe;
        self
    }

    /// Command that enters a private mount namespace as root.
    pub fn command(&self, action: EnclaveAction) -> CommandSpec {
        let base = if nix::unistd::geteuid().is_root() {
            CommandSpec::new("unshare")
        } else {
            CommandSpec::new("sudo").arg("unshare")
        };
        let mut spec = base
            .args(["--mount", "--propagation", "private"])
            .arg(&self.executable)
            .arg(INTERNAL_ENCLAVE_COMMAND)
            .arg("--workspace")
            .arg(&self.workspace);
        if let Some(config) = &self.config {
            spec = spec.arg("--config").arg(config);
        }
        if self.debug {
            spec = spec.arg("--debug");
        }
        if self.wipe {
            spec = spec.arg(WIPE_FLAG);
        }
        match action.as_arg() {
            Some(argument) => spec.arg(argument),
            None => spec,
        }
    }

    /// Runs the enclave attached to the terminal.
    pub fn launch(&self, action: EnclaveAction) -> Result<EnclaveOutcome> {
        let output = self.runner.interactive(&self.command(action))?;
        EnclaveOutcome::from_exit_code(output.code)
    }
}
