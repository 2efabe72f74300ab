#![deny(missing_docs)]
//! podvault keeps a project's secrets in a LUKS-encrypted image that is only
//! mounted inside a private mount namespace of a development container.

/// Lifecycle audit log.
pub mod audit;
/// Command-line interface.
pub mod cli;
/// Project and secrets configuration.
pub mod config;
/// Development container lifecycle.
pub mod container;
/// Privileged enclave orchestrator.
pub mod enclave;
/// Error types.
pub mod error;
/// External command execution.
pub mod exec;
/// Secure filesystem helpers.
pub mod fs_secure;
/// Shared path layout.
pub mod paths;
/// Secrets-manager collaborator and sync.
pub mod secrets;
/// Shared types.
pub mod types;
/// Encrypted vault lifecycle.
pub mod vault;
