mod commands;
mod output;
mod prompt;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::error::Result;

const ERROR_CODE_ARG_HELP: &str = "Error code from CLI stderr (example: `E201`).";
const CLI_AFTER_HELP: &str = r#"Examples:
  podvault init
  podvault up
  podvault enter
  podvault unlock
  podvault pull
  eval "$(podvault env)"
  podvault lock
  podvault explain E201

Host side:
  init, up, down, enter

Inside the container:
  unlock, lock, pull, login, env, reinit

More help:
  podvault help <command>
"#;
const UP_COMMAND_AFTER_HELP: &str = r#"Examples:
  podvault up
  podvault --config ./other/.podvault/config.yaml up

Notes:
  - Builds the image first when `build.dockerfile` is configured.
  - Any previous container with the same name is removed.
"#;
const ENTER_COMMAND_AFTER_HELP: &str = r#"Examples:
  podvault enter
  podvault ssh
"#;
const UNLOCK_COMMAND_AFTER_HELP: &str = r#"Examples:
  podvault unlock

Notes:
  - The first unlock creates the vault and asks for the passphrase twice.
  - Exit the shell to lock the vault and leave; run `podvault lock` to lock
    it and stay in the outer shell (exit code 2).
"#;
const LOCK_COMMAND_AFTER_HELP: &str = r#"Examples:
  podvault lock

Tip:
  Only meaningful inside an unlocked shell.
"#;
const PULL_COMMAND_AFTER_HELP: &str = r#"Examples:
  podvault pull
  podvault sync

Notes:
  - Opens the vault first when it is closed.
  - A failed secret keeps its previously synced copy.
"#;
const ENV_COMMAND_AFTER_HELP: &str = r#"Examples:
  eval "$(podvault env)"

Tip:
  Refuses to print to a terminal; pipe or capture the output.
"#;
const REINIT_COMMAND_AFTER_HELP: &str = r#"Examples:
  podvault reinit
  podvault reinit --yes

Warning:
  Deletes the vault image and every secret stored in it.
"#;
const EXPLAIN_COMMAND_AFTER_HELP: &str = r#"Examples:
  podvault explain E201
  podvault explain e402
"#;

/// Top-level command line parser.
#[derive(Debug, Parser)]
#[command(
    name = "podvault",
    version,
    about = "Encrypted per-project secret vault for development containers.",
    after_help = CLI_AFTER_HELP,
    infer_subcommands = true,
    arg_required_else_help = true,
    next_line_help = true
)]
pub struct Cli {
    /// Config file override path.
    /// Default: `PODVAULT_CONFIG`, then `.podvault/config.yaml` discovered upward.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Enables debug diagnostics.
    #[arg(long, global = true)]
    pub debug: bool,
    /// Subcommand.
    #[command(subcommand)]
    pub command: Command,
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Scaffolds `.podvault/` and a sample `secrets.yml`.
    Init,
    /// Builds (when configured) and starts the development container.
    #[command(after_help = UP_COMMAND_AFTER_HELP)]
    Up,
    /// Removes the development container.
    Down,
    /// Opens a shell in the running container.
    #[command(visible_alias = "ssh", after_help = ENTER_COMMAND_AFTER_HELP)]
    Enter,
    /// Unlocks the vault and opens a shell with secrets available.
    #[command(after_help = UNLOCK_COMMAND_AFTER_HELP)]
    Unlock,
    /// Locks the vault from inside an unlocked shell.
    #[command(after_help = LOCK_COMMAND_AFTER_HELP)]
    Lock,
    /// Deletes the vault and creates a fresh one.
    #[command(after_help = REINIT_COMMAND_AFTER_HELP)]
    Reinit {
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
    /// Syncs declared secrets into the vault.
    #[command(visible_alias = "sync", after_help = PULL_COMMAND_AFTER_HELP)]
    Pull,
    /// Logs in to the secrets manager and stores the session in the vault.
    Login,
    /// Prints shell `export` lines for synced secrets.
    #[command(after_help = ENV_COMMAND_AFTER_HELP)]
    Env,
    /// Explains a stable error code with recovery guidance.
    #[command(after_help = EXPLAIN_COMMAND_AFTER_HELP)]
    Explain {
        /// Error code from stderr (for example: `E201`).
        #[arg(help = ERROR_CODE_ARG_HELP)]
        code: String,
    },
    /// Inspects project configuration.
    Config {
        /// Config operation.
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Privileged enclave entry point. Started by `unlock`, `pull` and `login`.
    #[command(name = "internal-enclave", hide = true)]
    InternalEnclave {
        /// Workspace root owning the vault.
        #[arg(long)]
        workspace: PathBuf,
        /// Delete the Vault Image before unlocking.
        #[arg(long)]
        wipe: bool,
        /// Action run after mounting (`pull` or `login`).
        action: Option<String>,
    },
}

/// Supported config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parses config and secrets files strictly and reports problems.
    Validate,
}

/// Runs a parsed CLI invocation and returns the process exit code.
pub fn run(cli: Cli) -> Result<i32> {
    commands::run(cli)
}
