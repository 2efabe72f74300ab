use std::fs;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use nix::{
    sys::signal::{kill, Signal},
    unistd::getppid,
};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    audit::AuditLog,
    config::{
        resolve_config_path, ConfigSelection, ProjectConfig, SecretsConfig, CONFIG_ENV_VAR,
        CONFIG_FILE_NAME, SECRETS_FILE_NAME, STATE_DIR_NAME,
    },
    container::{ContainerEngine, ContainerLaunch},
    enclave::{
        announce_sync, verify_entry, Enclave, EnclaveAction, EnclaveLauncher, EnclaveSettings,
        PassphraseSource,
    },
    error::{explain_error_code, known_error_codes, PodvaultError, Result},
    exec::SystemRunner,
    fs_secure::write_file_if_missing,
    paths::VaultPaths,
    secrets::{ensure_authenticated, sync_secrets, CliSecretsAuthority, SecretsAuthority, SyncTarget},
    types::Identity,
    vault::{
        lock::send_lock_request,
        shell::{parse_dotenv, CONTROL_FD_VAR, DEBUG_VAR, ENCLAVE_MARKER_VAR},
        VaultManager,
    },
};

use super::{
    output::{self, OutputStatus},
    prompt::{confirm, TerminalPrompt},
    Cli, Command, ConfigCommand,
};

const LOG_ENV_VAR: &str = "PODVAULT_LOG";
const SCAFFOLD_FILE_MODE: u32 = 0o644;
const SCAFFOLD_GITIGNORE: &str = "# podvault local state\nvault/\n";
const SCAFFOLD_CONFIG: &str = r#"# podvault project configuration
image: podvault-base:local
container_name: podvault-lab
user: podvault
uid: 1000
gid: 1000
features:
  ghost_mode: true
  debug: false
# build:
#   dockerfile: .podvault/Dockerfile
#   context: .
vault:
  size_mb: 512
  persistence: bind
  sync: both
  loop_devices: 64
"#;
const SCAFFOLD_SECRETS: &str = r#"# podvault secrets declaration
config:
  project_id: ""
  environment: dev

# Each entry is fetched into the vault; `env` exports the file path.
#   - name: KUBECONFIG_CONTENT
#     file: kubeconfig
#     env: KUBECONFIG
secrets: []
"#;

struct CliContext {
    selection: ConfigSelection,
    workspace: PathBuf,
    config: ProjectConfig,
    secrets: SecretsConfig,
    paths: VaultPaths,
    debug: bool,
}

pub(crate) fn run(cli: Cli) -> Result<i32> {
    init_logging(debug_requested(&cli));

    match cli.command {
        Command::Init => run_init(),
        Command::Explain { ref code } => run_explain(code),
        Command::Config {
            command: ConfigCommand::Validate,
        } => run_config_validate(cli.config.as_deref()),
        Command::Up => {
            let context = load_context(&cli, None)?;
            run_up(&context)
        }
        Command::Down => {
            let context = load_context(&cli, None)?;
            let engine = ContainerEngine::new(SystemRunner::new());
            let message = if engine.remove(&context.config.container_name) {
                format!("removed {}", context.config.container_name)
            } else {
                format!("{} was not running", context.config.container_name)
            };
            Ok(stdout_line_or_exit(&message)?.unwrap_or(0))
        }
        Command::Enter => {
            let context = load_context(&cli, None)?;
            ContainerEngine::new(SystemRunner::new()).enter(&context.config.container_name)
        }
        Command::Lock => run_lock(),
        Command::Unlock => {
            let context = vault_context(&cli, None)?;
            if in_enclave() {
                return Ok(stdout_line_or_exit("Already in ghost mode.")?.unwrap_or(0));
            }
            launch(&context, EnclaveAction::Shell, false)
        }
        Command::Pull => {
            let context = vault_context(&cli, None)?;
            if in_enclave() {
                return pull_in_session(&context);
            }
            stderr_line_ignore_broken_pipe("Vault closed. Unlocking to pull secrets.")?;
            launch(&context, EnclaveAction::Pull, false)
        }
        Command::Login => {
            let context = vault_context(&cli, None)?;
            if in_enclave() {
                return login_in_session(&context);
            }
            stderr_line_ignore_broken_pipe("Vault closed. Unlocking for login.")?;
            launch(&context, EnclaveAction::Login, false)
        }
        Command::Env => {
            let context = vault_context(&cli, None)?;
            run_env(&context)
        }
        Command::Reinit { yes } => {
            let context = vault_context(&cli, None)?;
            run_reinit(&context, yes)
        }
        Command::InternalEnclave {
            ref workspace,
            wipe,
            ref action,
        } => {
            let context = vault_context(&cli, Some(workspace))?;
            run_internal_enclave(&context, wipe, action.as_deref())
        }
    }
}

fn init_logging(debug: bool) {
    let default_directive = if debug { "podvault=debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn debug_requested(cli: &Cli) -> bool {
    if cli.debug || env_flag(DEBUG_VAR) {
        return true;
    }
    std::env::current_dir()
        .ok()
        .and_then(|cwd| select_config(cli.config.as_deref(), &cwd).ok())
        .and_then(|selection| selection.path)
        .and_then(|path| ProjectConfig::load_from_path(path).ok())
        .is_some_and(|config| config.features.debug)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|value| value == "true" || value == "1")
}

fn in_enclave() -> bool {
    env_flag(ENCLAVE_MARKER_VAR)
}

fn select_config(explicit: Option<&Path>, cwd: &Path) -> Result<ConfigSelection> {
    let env_value = std::env::var(CONFIG_ENV_VAR).ok();
    resolve_config_path(explicit, env_value.as_deref(), cwd)
}

fn load_context(cli: &Cli, workspace: Option<&Path>) -> Result<CliContext> {
    let cwd = std::env::current_dir()?;
    let selection = select_config(cli.config.as_deref(), &cwd)?;
    let workspace = match workspace {
        Some(workspace) => workspace.to_path_buf(),
        None => selection.workspace_root(&cwd),
    };
    let config = ProjectConfig::load_or_default(selection.path.as_deref());
    let paths = VaultPaths::new(&workspace, config.home_dir());
    let secrets = SecretsConfig::load_or_default(&paths.secrets_file());
    let debug = cli.debug || env_flag(DEBUG_VAR) || config.features.debug;
    debug!(
        source = ?selection.source,
        workspace = %workspace.display(),
        "configuration loaded"
    );
    Ok(CliContext {
        selection,
        workspace,
        config,
        secrets,
        paths,
        debug,
    })
}

fn vault_context(cli: &Cli, workspace: Option<&Path>) -> Result<CliContext> {
    let context = load_context(cli, workspace)?;
    if !context.config.features.ghost_mode {
        return Err(PodvaultError::InvalidInput(
            "vault commands are disabled (`features.ghost_mode: false`)".to_owned(),
        ));
    }
    Ok(context)
}

fn run_init() -> Result<i32> {
    let cwd = std::env::current_dir()?;
    let state_dir = cwd.join(STATE_DIR_NAME);
    let files = [
        (state_dir.join(CONFIG_FILE_NAME), SCAFFOLD_CONFIG),
        (state_dir.join(".gitignore"), SCAFFOLD_GITIGNORE),
        (cwd.join(SECRETS_FILE_NAME), SCAFFOLD_SECRETS),
    ];
    for (path, contents) in files {
        let status = if write_file_if_missing(&path, contents.as_bytes(), SCAFFOLD_FILE_MODE)? {
            "created"
        } else {
            "kept"
        };
        let relative = path.strip_prefix(&cwd).unwrap_or(&path);
        if let Some(code) = stdout_line_or_exit(&format!("{status} {}", relative.display()))? {
            return Ok(code);
        }
    }
    Ok(0)
}

fn run_explain(code: &str) -> Result<i32> {
    let Some(explanation) = explain_error_code(code) else {
        return Err(PodvaultError::InvalidInput(format!(
            "unknown error code `{code}` (known: {})",
            known_error_codes().join(", ")
        )));
    };
    Ok(stdout_line_or_exit(explanation)?.unwrap_or(0))
}

fn run_config_validate(explicit: Option<&Path>) -> Result<i32> {
    let cwd = std::env::current_dir()?;
    let selection = select_config(explicit, &cwd)?;
    let config = match &selection.path {
        Some(path) => {
            let config = ProjectConfig::load_from_path(path)?;
            if let Some(code) = stdout_line_or_exit(&format!("config ok: {}", path.display()))? {
                return Ok(code);
            }
            config
        }
        None => {
            if let Some(code) = stdout_line_or_exit("config: none found, defaults apply")? {
                return Ok(code);
            }
            ProjectConfig::default()
        }
    };
    let paths = VaultPaths::new(selection.workspace_root(&cwd), config.home_dir());
    let secrets_file = paths.secrets_file();
    let line = match fs::read_to_string(&secrets_file) {
        Ok(raw) => {
            let secrets = SecretsConfig::parse_from_str(&raw)?;
            format!(
                "secrets ok: {} ({} entries)",
                secrets_file.display(),
                secrets.secrets.len()
            )
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            format!("secrets: {} not found", secrets_file.display())
        }
        Err(error) => return Err(error.into()),
    };
    Ok(stdout_line_or_exit(&line)?.unwrap_or(0))
}

fn run_up(context: &CliContext) -> Result<i32> {
    let engine = ContainerEngine::new(SystemRunner::new());
    let config = &context.config;
    if let Some(dockerfile) = &config.build.dockerfile {
        let build_context = config
            .build
            .context
            .as_deref()
            .map(|dir| context.workspace.join(dir))
            .unwrap_or_else(|| context.workspace.clone());
        let dockerfile = context.workspace.join(dockerfile);
        engine.build(&config.image, &dockerfile.to_string_lossy(), &build_context)?;
    }
    if engine.remove(&config.container_name) {
        debug!(container = %config.container_name, "removed previous container");
    }
    engine.run(&ContainerLaunch::from_config(config, &context.workspace))?;
    Ok(stdout_line_or_exit(&format!("{} is running", config.container_name))?.unwrap_or(0))
}

fn launch(context: &CliContext, action: EnclaveAction, wipe: bool) -> Result<i32> {
    let executable = std::env::current_exe()?;
    let outcome = EnclaveLauncher::new(SystemRunner::new(), executable, &context.workspace)
        .with_config(context.selection.path.clone())
        .with_debug(context.debug)
        .with_wipe(wipe)
        .launch(action)?;
    Ok(outcome.exit_code())
}

fn run_lock() -> Result<i32> {
    if !in_enclave() {
        return Ok(stdout_line_or_exit("Not inside an unlocked shell; nothing to lock.")?.unwrap_or(0));
    }
    let raw = std::env::var(CONTROL_FD_VAR).map_err(|_| {
        PodvaultError::Environment(format!("{CONTROL_FD_VAR} is not set in this shell"))
    })?;
    let fd: RawFd = raw.trim().parse().map_err(|_| {
        PodvaultError::Environment(format!("{CONTROL_FD_VAR} is not a descriptor: `{raw}`"))
    })?;
    send_lock_request(fd)?;
    stderr_line_ignore_broken_pipe("Locking vault...")?;
    kill(getppid(), Signal::SIGKILL)?;
    Ok(0)
}

fn run_reinit(context: &CliContext, yes: bool) -> Result<i32> {
    if in_enclave() {
        return Err(PodvaultError::InvalidInput(
            "cannot reinit inside an unlocked shell; run `podvault lock` first".to_owned(),
        ));
    }
    if !yes && !confirm("Delete the vault and every secret in it? (y/N): ")? {
        return Ok(stdout_line_or_exit("reinit cancelled")?.unwrap_or(0));
    }
    launch(context, EnclaveAction::Pull, true)
}

fn run_env(context: &CliContext) -> Result<i32> {
    if atty::is(atty::Stream::Stdout) {
        return Err(PodvaultError::InvalidInput(
            "refusing to print secrets to a terminal; use `eval \"$(podvault env)\"`".to_owned(),
        ));
    }
    for line in env_lines(context) {
        if let Some(code) = stdout_line_or_exit(&line)? {
            return Ok(code);
        }
    }
    Ok(0)
}

fn env_lines(context: &CliContext) -> Vec<String> {
    let mut lines = Vec::new();
    let env_file = context.paths.env_file();
    match fs::read(&env_file) {
        Ok(raw) => lines.extend(
            parse_dotenv(&String::from_utf8_lossy(&raw))
                .into_iter()
                .map(|(key, value)| format!("export {key}={}", shell_quote(&value))),
        ),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!(path = %env_file.display(), %error, "cannot read environment export"),
    }
    let mount_point = context.paths.mount_point();
    for mapping in context.secrets.env_mappings() {
        let Some(variable) = &mapping.env else {
            continue;
        };
        let target = mapping.target(&mount_point);
        if target.is_file() {
            lines.push(format!(
                "export {variable}={}",
                shell_quote(&target.to_string_lossy())
            ));
        } else {
            let _ = stderr_line_ignore_broken_pipe(&format!("{} not found", mapping.file));
            lines.push(format!("unset {variable}"));
        }
    }
    lines
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'\''"#))
}

fn session_authority<'a>(
    runner: &'a SystemRunner,
    context: &CliContext,
    identity: Identity,
) -> CliSecretsAuthority<&'a SystemRunner> {
    CliSecretsAuthority::new(
        runner,
        identity,
        context.paths.home(),
        &context.workspace,
        context.secrets.config.clone(),
    )
}

fn pull_in_session(context: &CliContext) -> Result<i32> {
    let runner = SystemRunner::new();
    let identity = Identity::current();
    let authority = session_authority(&runner, context, identity.clone());
    let mut prompt = TerminalPrompt;
    if ensure_authenticated(&authority, &context.paths.credential_home())? {
        prompt.notice("Logged in to the secrets authority.");
    }
    let mount_point = context.paths.mount_point();
    let env_file = context.paths.env_file();
    let report = sync_secrets(
        &authority,
        &context.secrets.secrets,
        context.config.vault.sync,
        &SyncTarget {
            mount_point: &mount_point,
            env_file: &env_file,
            owner: &identity,
        },
    );
    announce_sync(&report, &mut prompt);
    if report.failures() > 0 {
        prompt.notice(&format!(
            "{} secret(s) could not be synced; re-run `podvault pull` to retry.",
            report.failures()
        ));
    }
    Ok(0)
}

fn login_in_session(context: &CliContext) -> Result<i32> {
    let runner = SystemRunner::new();
    let authority = session_authority(&runner, context, Identity::current());
    authority.login()?;
    if !context.paths.project_link_file().exists() {
        authority.link_project()?;
    }
    Ok(0)
}

fn run_internal_enclave(context: &CliContext, wipe: bool, action: Option<&str>) -> Result<i32> {
    verify_entry()?;
    let action: EnclaveAction = action.unwrap_or_default().parse()?;
    let runner = SystemRunner::new();
    let owner = context.config.identity();
    let manager = VaultManager::new(
        context.paths.clone(),
        &runner,
        owner.clone(),
        context.config.vault.clone(),
    );
    let manager = match AuditLog::new(context.paths.audit_file()) {
        Ok(audit_log) => manager.with_audit(audit_log),
        Err(error) => {
            warn!(%error, "audit log unavailable");
            manager
        }
    };

    let mut prompt = TerminalPrompt;
    if wipe && manager.wipe()? {
        prompt.notice("Vault image deleted.");
    }

    let authority = CliSecretsAuthority::new(
        &runner,
        owner,
        context.paths.home(),
        &context.workspace,
        context.secrets.config.clone(),
    );
    let settings = EnclaveSettings {
        persistence: context.config.vault.persistence,
        sync: context.config.vault.sync,
        mappings: context.secrets.secrets.clone(),
        debug: context.debug,
        parent_env: std::env::vars().collect(),
        ..EnclaveSettings::default()
    };
    let mut enclave = Enclave::new(&manager, authority, settings);
    let outcome = enclave.run(action, &mut prompt)?;
    Ok(outcome.exit_code())
}

fn stdout_line_or_exit(line: &str) -> Result<Option<i32>> {
    match output::stdout_line(line) {
        Ok(OutputStatus::Written) => Ok(None),
        Ok(OutputStatus::BrokenPipe) => Ok(Some(0)),
        Err(error) => Err(PodvaultError::Io(error)),
    }
}

fn stderr_line_ignore_broken_pipe(line: &str) -> std::io::Result<()> {
    match output::stderr_line(line) {
        Ok(OutputStatus::Written | OutputStatus::BrokenPipe) => Ok(()),
        Err(error) => Err(error),
    }
}
