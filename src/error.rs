use std::{io, path::PathBuf};

use thiserror::Error;

/// Top-level application errors.
#[derive(Debug, Error)]
pub enum PodvaultError {
    /// Resource was not found.
    #[error("not found")]
    NotFound,
    /// Resource already exists and overwrite is disallowed.
    #[error("already exists")]
    AlreadyExists,
    /// Input was syntactically valid but semantically unsupported.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Host is not set up to run the enclave (privilege, namespace, device nodes).
    #[error("environment error: {0}")]
    Environment(String),
    /// The encrypted volume rejected the supplied passphrase.
    #[error("wrong passphrase")]
    WrongPassphrase,
    /// External tool exited unsuccessfully.
    #[error("{program} failed (exit {code}): {stderr}")]
    Command {
        /// Program name.
        program: String,
        /// Exit code, or -1 when terminated by a signal.
        code: i32,
        /// Captured diagnostic output.
        stderr: String,
    },
    /// A device node never appeared.
    #[error("device did not appear: {}", .0.display())]
    DeviceTimeout(PathBuf),
    /// Another enclave session holds the vault.
    #[error("vault session is held by another process")]
    SessionBusy,
    /// I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// JSON serialization error.
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// YAML parse error.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl From<nix::Error> for PodvaultError {
    fn from(error: nix::Error) -> Self {
        PodvaultError::Io(io::Error::from(error))
    }
}

/// A typed result used across the crate.
pub type Result<T> = std::result::Result<T, PodvaultError>;

/// Generic invalid-input error.
pub const ERROR_CODE_INVALID_INPUT: &str = "E100";
/// Missing runtime dependency or binary.
pub const ERROR_CODE_MISSING_RUNTIME: &str = "E103";
/// Host environment is not usable for the enclave.
pub const ERROR_CODE_ENVIRONMENT: &str = "E200";
/// Passphrase was rejected.
pub const ERROR_CODE_WRONG_PASSPHRASE: &str = "E201";
/// Resource lookup failed.
pub const ERROR_CODE_NOT_FOUND: &str = "E300";
/// Resource already exists.
pub const ERROR_CODE_ALREADY_EXISTS: &str = "E301";
/// External command failed.
pub const ERROR_CODE_COMMAND: &str = "E400";
/// Device node did not materialize.
pub const ERROR_CODE_DEVICE_TIMEOUT: &str = "E401";
/// Session lock is held elsewhere.
pub const ERROR_CODE_SESSION_BUSY: &str = "E402";
/// Filesystem or stream I/O failed.
pub const ERROR_CODE_IO: &str = "E900";
/// Internal serialization failure.
pub const ERROR_CODE_INTERNAL: &str = "E999";

const ERROR_EXPLANATION_E100: &str = r#"E100 invalid input

The command arguments or configuration values are not supported.

Common fixes:
  - Run `podvault help <command>` for exact argument usage.
  - Check `secrets.yml` entries: `file` must be a relative path, `env` a shell identifier."#;
const ERROR_EXPLANATION_E103: &str = r#"E103 missing runtime dependency

The command requires one or more binaries that were not found in PATH.

Recovery:
  - Install the missing binary (for example `cryptsetup`, `losetup`, `dmsetup`, `mkfs.ext4`).
  - Inside the container, confirm the image ships the block-device toolchain.
  - Retry the command."#;
const ERROR_EXPLANATION_E200: &str = r#"E200 unusable environment

The enclave must run as root inside a private mount namespace of a privileged container.

Recovery:
  - Start the container with `podvault up` (it runs with --privileged).
  - Use `podvault unlock` instead of invoking the internal enclave action directly."#;
const ERROR_EXPLANATION_E201: &str = r#"E201 wrong passphrase

The encrypted volume could not be opened with the supplied passphrase.
The vault image was not modified and the loop device was released.

Recovery:
  - Retry `podvault unlock` and re-enter the passphrase.
  - If the passphrase is lost, `podvault reinit` wipes the vault."#;
const ERROR_EXPLANATION_E300: &str = r#"E300 resource not found

The referenced file or directory could not be located.

Recovery:
  podvault init"#;
const ERROR_EXPLANATION_E301: &str = r#"E301 resource already exists

The target is already present and will not be overwritten."#;
const ERROR_EXPLANATION_E400: &str = r#"E400 external command failed

A block-device, container, or secrets-manager command exited unsuccessfully.
Its diagnostic output is included in the error message.

Recovery:
  - Re-run with `PODVAULT_DEBUG=true` to trace every command.
  - Check that the container is privileged and device nodes exist."#;
const ERROR_EXPLANATION_E401: &str = r#"E401 device timeout

The decrypted mapper device node did not appear in time.

Recovery:
  - Run `dmsetup mknodes` inside the container and retry."#;
const ERROR_EXPLANATION_E402: &str = r#"E402 vault session busy

Another unlock session currently holds the vault.

Recovery:
  - Exit the other session (or run `podvault lock` inside it) and retry."#;
const ERROR_EXPLANATION_E900: &str = r#"E900 I/O failure

Filesystem or stream operations failed.

Recovery:
  - Verify the workspace is writable and has free space."#;
const ERROR_EXPLANATION_E999: &str = r#"E999 internal runtime failure

An internal serialization or decoding error occurred.

Recovery:
  - Retry once with the same inputs.
  - If it persists, collect command, inputs, and stderr for diagnosis."#;

const KNOWN_ERROR_CODES: [&str; 11] = [
    ERROR_CODE_INVALID_INPUT,
    ERROR_CODE_MISSING_RUNTIME,
    ERROR_CODE_ENVIRONMENT,
    ERROR_CODE_WRONG_PASSPHRASE,
    ERROR_CODE_NOT_FOUND,
    ERROR_CODE_ALREADY_EXISTS,
    ERROR_CODE_COMMAND,
    ERROR_CODE_DEVICE_TIMEOUT,
    ERROR_CODE_SESSION_BUSY,
    ERROR_CODE_IO,
    ERROR_CODE_INTERNAL,
];

/// Returns the stable error code for a runtime error.
pub fn classify_error_code(error: &PodvaultError) -> &'static str {
    match error {
        PodvaultError::InvalidInput(message) => classify_invalid_input_code(message),
        PodvaultError::Environment(_) => ERROR_CODE_ENVIRONMENT,
        PodvaultError::WrongPassphrase => ERROR_CODE_WRONG_PASSPHRASE,
        PodvaultError::NotFound => ERROR_CODE_NOT_FOUND,
        PodvaultError::AlreadyExists => ERROR_CODE_ALREADY_EXISTS,
        PodvaultError::Command { .. } => ERROR_CODE_COMMAND,
        PodvaultError::DeviceTimeout(_) => ERROR_CODE_DEVICE_TIMEOUT,
        PodvaultError::SessionBusy => ERROR_CODE_SESSION_BUSY,
        PodvaultError::Io(_) => ERROR_CODE_IO,
        PodvaultError::Serde(_) | PodvaultError::Yaml(_) => ERROR_CODE_INTERNAL,
    }
}

fn classify_invalid_input_code(message: &str) -> &'static str {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("required binary not found") {
        return ERROR_CODE_MISSING_RUNTIME;
    }
    if lowered.contains("not found") {
        return ERROR_CODE_NOT_FOUND;
    }
    ERROR_CODE_INVALID_INPUT
}

/// Normalizes a user-provided error code for lookups.
pub fn normalize_error_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Returns an explanation block for a known error code.
pub fn explain_error_code(raw: &str) -> Option<&'static str> {
    let normalized = normalize_error_code(raw);
    match normalized.as_str() {
        ERROR_CODE_INVALID_INPUT => Some(ERROR_EXPLANATION_E100),
        ERROR_CODE_MISSING_RUNTIME => Some(ERROR_EXPLANATION_E103),
        ERROR_CODE_ENVIRONMENT => Some(ERROR_EXPLANATION_E200),
        ERROR_CODE_WRONG_PASSPHRASE => Some(ERROR_EXPLANATION_E201),
        ERROR_CODE_NOT_FOUND => Some(ERROR_EXPLANATION_E300),
        ERROR_CODE_ALREADY_EXISTS => Some(ERROR_EXPLANATION_E301),
        ERROR_CODE_COMMAND => Some(ERROR_EXPLANATION_E400),
        ERROR_CODE_DEVICE_TIMEOUT => Some(ERROR_EXPLANATION_E401),
        ERROR_CODE_SESSION_BUSY => Some(ERROR_EXPLANATION_E402),
        ERROR_CODE_IO => Some(ERROR_EXPLANATION_E900),
        ERROR_CODE_INTERNAL => Some(ERROR_EXPLANATION_E999),
        _ => None,
    }
}

/// Stable list of explainable error codes.
pub fn known_error_codes() -> &'static [&'static str] {
    &KNOWN_ERROR_CODES
}
