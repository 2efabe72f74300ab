use std::{
    ffi::{OsStr, OsString},
    io::{self, Write},
    os::unix::process::{CommandExt, ExitStatusExt},
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    thread,
    time::Duration,
};

use tracing::debug;
use zeroize::Zeroizing;

use crate::{
    error::{PodvaultError, Result},
    types::Identity,
};

const EXEC_BUSY_RETRY_ATTEMPTS: usize = 20;
const EXEC_BUSY_RETRY_DELAY: Duration = Duration::from_millis(10);
const SIGNAL_EXIT_CODE: i32 = -1;

/// Description of one external command invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: String,
    args: Vec<OsString>,
    stdin: Option<StdinBytes>,
    env: Vec<(String, String)>,
    env_clear: bool,
    identity: Option<Identity>,
    current_dir: Option<PathBuf>,
}

#[derive(Clone)]
struct StdinBytes(Zeroizing<Vec<u8>>);

impl std::fmt::Debug for StdinBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

impl CommandSpec {
    /// Starts a spec for `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            env: Vec::new(),
            env_clear: false,
            identity: None,
            current_dir: None,
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, value: impl AsRef<OsStr>) -> Self {
        self.args.push(value.as_ref().to_os_string());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(values.into_iter().map(|value| value.as_ref().to_os_string()));
        self
    }

    /// Feeds `bytes` on standard input. The buffer is wiped on drop.
    pub fn stdin_bytes(mut self, bytes: &[u8]) -> Self {
        self.stdin = Some(StdinBytes(Zeroizing::new(bytes.to_vec())));
        self
    }

    /// Adds one environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Adds several environment variables.
    pub fn envs(mut self, values: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(values);
        self
    }

    /// Starts the child with an empty environment.
    pub fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self
    }

    /// Runs the child as `identity`.
    pub fn as_identity(mut self, identity: &Identity) -> Self {
        self.identity = Some(identity.clone());
        self
    }

    /// Sets the working directory.
    pub fn current_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.current_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Program name.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments rendered lossily.
    pub fn arg_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|value| value.to_string_lossy().into_owned())
            .collect()
    }

    /// Environment additions.
    pub fn env_vars(&self) -> &[(String, String)] {
        &self.env
    }

    /// Whether the environment is cleared first.
    pub fn clears_env(&self) -> bool {
        self.env_clear
    }

    /// Identity the child runs as, if dropped.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Bytes fed on stdin, if any.
    pub fn stdin(&self) -> Option<&[u8]> {
        self.stdin.as_ref().map(|bytes| bytes.0.as_slice())
    }

    /// One-line rendering for logs. Never includes stdin.
    pub fn display(&self) -> String {
        let mut rendered = self.program.clone();
        for argument in self.arg_strings() {
            rendered.push(' ');
            rendered.push_str(&argument);
        }
        rendered
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Program that ran.
    pub program: String,
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error, lossily decoded.
    pub stderr: String,
}

impl CommandOutput {
    /// Builds an output with empty streams.
    pub fn from_code(program: impl Into<String>, code: Option<i32>) -> Self {
        Self {
            program: program.into(),
            code,
            stdout: Vec::new(),
            stderr: String::new(),
        }
    }

    /// Returns true on exit code zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Trimmed standard output as text.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_owned()
    }

    /// Converts a failed run into [`PodvaultError::Command`].
    pub fn into_result(self) -> Result<CommandOutput> {
        if self.success() {
            return Ok(self);
        }
        Err(PodvaultError::Command {
            program: self.program,
            code: self.code.unwrap_or(SIGNAL_EXIT_CODE),
            stderr: self.stderr.trim().to_owned(),
        })
    }

    /// Logs a failure and carries on. Used for best-effort steps.
    pub fn ok_or_ignore(self, step: &str) -> bool {
        if self.success() {
            return true;
        }
        debug!(
            step,
            program = %self.program,
            code = ?self.code,
            stderr = %self.stderr.trim(),
            "ignoring failed best-effort command"
        );
        false
    }
}

/// Executes external commands. The seam every privileged step goes through.
pub trait CommandRunner {
    /// Runs a command with captured output.
    fn output(&self, spec: &CommandSpec) -> Result<CommandOutput>;
    /// Runs a command attached to the caller's terminal and waits for it.
    fn interactive(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn output(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        (**self).output(spec)
    }

    fn interactive(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        (**self).interactive(spec)
    }
}

/// Runner backed by `std::process::Command`.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    bin_dir: Option<PathBuf>,
}

impl SystemRunner {
    /// Resolves programs through `PATH`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves programs found in `bin_dir` before falling back to `PATH`.
    pub fn with_bin_dir(bin_dir: impl AsRef<Path>) -> Self {
        Self {
            bin_dir: Some(bin_dir.as_ref().to_path_buf()),
        }
    }

    fn resolve_program(&self, program: &str) -> PathBuf {
        if let Some(bin_dir) = &self.bin_dir {
            let candidate = bin_dir.join(program);
            if candidate.is_file() {
                return candidate;
            }
        }
        PathBuf::from(program)
    }

    fn build(&self, spec: &CommandSpec) -> Command {
        let mut command = Command::new(self.resolve_program(&spec.program));
        command.args(&spec.args);
        if spec.env_clear {
            command.env_clear();
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        if let Some(identity) = &spec.identity {
            command.gid(identity.gid).uid(identity.uid);
        }
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }
        command
    }
}

impl CommandRunner for SystemRunner {
    fn output(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec.display(), "exec");
        let output = retry_exec_busy(|| {
            let mut command = self.build(spec);
            command
                .stdin(if spec.stdin.is_some() {
                    Stdio::piped()
                } else {
                    Stdio::null()
                })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            let mut child = command.spawn()?;
            if let (Some(bytes), Some(mut stdin)) = (spec.stdin.as_ref(), child.stdin.take()) {
                match stdin.write_all(&bytes.0) {
                    Err(error) if error.kind() != io::ErrorKind::BrokenPipe => return Err(error),
                    _ => {}
                }
            }
            child.wait_with_output()
        })
        .map_err(|error| map_command_execution_error(&spec.program, error))?;

        Ok(CommandOutput {
            program: spec.program.clone(),
            code: exit_code(output.status),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn interactive(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec.display(), "exec interactive");
        let status = retry_exec_busy(|| {
            self.build(spec)
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
        })
        .map_err(|error| map_command_execution_error(&spec.program, error))?;
        Ok(CommandOutput::from_code(
            spec.program.clone(),
            exit_code(status),
        ))
    }
}

fn exit_code(status: ExitStatus) -> Option<i32> {
    if let Some(signal) = status.signal() {
        debug!(signal, "child terminated by signal");
        return None;
    }
    status.code()
}

fn map_command_execution_error(binary: &str, error: io::Error) -> PodvaultError {
    if error.kind() == io::ErrorKind::NotFound {
        return PodvaultError::InvalidInput(format!("required binary not found: {binary}"));
    }
    PodvaultError::Io(error)
}

fn retry_exec_busy<T, F>(mut operation: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let mut last_error = None;
    for attempt in 0..EXEC_BUSY_RETRY_ATTEMPTS {
        match operation() {
            Ok(value) => return Ok(value),
            Err(error) if is_exec_busy_error(&error) && attempt + 1 < EXEC_BUSY_RETRY_ATTEMPTS => {
                last_error = Some(error);
                thread::sleep(EXEC_BUSY_RETRY_DELAY);
            }
            Err(error) => return Err(error),
        }
    }

    Err(last_error.unwrap_or_else(|| io::Error::other("command execution failed")))
}

fn is_exec_busy_error(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::ExecutableFileBusy || error.raw_os_error() == Some(26)
}
