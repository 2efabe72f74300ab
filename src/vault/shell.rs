use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::{
    error::Result,
    exec::{CommandRunner, CommandSpec},
    types::{is_env_identifier, Identity, SecretMapping},
};

/// Marker telling nested invocations that an enclave is active.
pub const ENCLAVE_MARKER_VAR: &str = "PODVAULT_GHOST_MODE";
/// Inherited descriptor a nested `lock` writes its request to.
pub const CONTROL_FD_VAR: &str = "PODVAULT_CONTROL_FD";
/// Debug flag forwarded into the session.
pub const DEBUG_VAR: &str = "PODVAULT_DEBUG";

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const DEFAULT_SHELL: &str = "bash";
const BASELINE_VARS: &[&str] = &["TERM", "LANG", "LC_ALL", "COLORTERM", "DISPLAY", "TZ"];

/// Explicitly assembled environment for the unprivileged shell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionEnvironment {
    vars: Vec<(String, String)>,
}

impl SessionEnvironment {
    /// Safe baseline for `identity`: identity vars, a fixed `PATH`, terminal
    /// settings copied from `parent`, and the enclave marker.
    pub fn baseline<I>(identity: &Identity, home: &Path, parent: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut environment = Self::default();
        for (key, value) in parent {
            if BASELINE_VARS.contains(&key.as_str()) {
                environment.set(key, value);
            }
        }
        environment.set("PATH", DEFAULT_PATH);
        environment.set("USER", identity.name.clone());
        environment.set("LOGNAME", identity.name.clone());
        environment.set("HOME", home.to_string_lossy());
        environment.set("INFISICAL_VAULT_BACKEND", "file");
        environment.set(ENCLAVE_MARKER_VAR, "true");
        environment
    }

    /// Sets `key`, replacing an earlier value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.vars.iter_mut().find(|(existing, _)| *existing == key) {
            Some(slot) => slot.1 = value,
            None => self.vars.push((key, value)),
        }
    }

    /// Looks up `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_str())
    }

    /// Exports each mapping's env var pointing at its file, skipping files
    /// that were never synced. Returns the variables set.
    pub fn apply_mappings(&mut self, mappings: &[SecretMapping], mount_point: &Path) -> Vec<String> {
        let mut applied = Vec::new();
        for mapping in mappings {
            let Some(env) = &mapping.env else {
                continue;
            };
            let target = mapping.target(mount_point);
            if target.exists() {
                self.set(env.clone(), target.to_string_lossy());
                applied.push(env.clone());
            } else {
                warn!(variable = %env, file = %mapping.file, "secret file not synced, variable skipped");
            }
        }
        applied
    }

    /// Appends variables from a dotenv export file. A missing file is fine.
    ///
    /// Bytes that are not valid UTF-8 are replaced rather than rejected.
    pub fn apply_dotenv_file(&mut self, path: &Path) -> Result<usize> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(error) => return Err(error.into()),
        };
        let parsed = parse_dotenv(&String::from_utf8_lossy(&raw));
        let count = parsed.len();
        for (key, value) in parsed {
            self.set(key, value);
        }
        Ok(count)
    }

    /// Variables in insertion order.
    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }
}

/// Parses `KEY=value` and `export KEY=value` lines, stripping one layer of
/// matching quotes. Comments, blanks and invalid names are skipped.
pub fn parse_dotenv(raw: &str) -> Vec<(String, String)> {
    raw.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if !is_env_identifier(key) {
                return None;
            }
            Some((key.to_owned(), unquote(value.trim()).to_owned()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['\'', '"'] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// How the interactive shell ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShellExit {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
}

/// Interactive shell running as the unprivileged identity.
pub struct ShellSession<R: CommandRunner> {
    runner: R,
    identity: Identity,
    shell: String,
    working_dir: PathBuf,
}

impl<R: CommandRunner> ShellSession<R> {
    /// Shell for `identity`, started in `working_dir`.
    pub fn new(runner: R, identity: Identity, working_dir: impl AsRef<Path>) -> Self {
        Self {
            runner,
            identity,
            shell: DEFAULT_SHELL.to_owned(),
            working_dir: working_dir.as_ref().to_path_buf(),
        }
    }

    /// Overrides the shell program.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Runs the shell on the caller's terminal until it exits.
    ///
    /// The exit status is reported, never treated as a failure.
    pub fn run(&self, environment: &SessionEnvironment) -> Result<ShellExit> {
        let mut spec = CommandSpec::new(self.shell.clone())
            .env_clear()
            .envs(environment.vars().iter().cloned())
            .as_identity(&self.identity);
        if self.working_dir.is_dir() {
            spec = spec.current_dir(&self.working_dir);
        }
        let output = self.runner.interactive(&spec)?;
        debug!(code = ?output.code, "interactive shell ended");
        Ok(ShellExit { code: output.code })
    }
}
