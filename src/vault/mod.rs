//! Encrypted vault lifecycle: devices, LUKS volume, mounts, bridge and shell.

/// Credential directory bridge into the mounted vault.
pub mod bridge;
/// LUKS volume operations.
pub mod crypt;
/// Loop and device-mapper node provisioning.
pub mod device;
/// Vault image allocation and migration.
pub mod image;
/// Session lock and stay/exit control pipe.
pub mod lock;
/// Mount table and mount operations.
pub mod mount;
/// Unprivileged interactive shell.
pub mod shell;

mod manager;

pub use manager::{TeardownReport, UnlockedVault, VaultManager};
