use assert_cmd::Command;
use predicates::prelude::*;

use std::{fs, path::Path};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const SCRUBBED_ENV: &[&str] = &[
    "PODVAULT_CONFIG",
    "PODVAULT_GHOST_MODE",
    "PODVAULT_CONTROL_FD",
    "PODVAULT_DEBUG",
    "PODVAULT_LOG",
];

fn podvault(cwd: &Path) -> Command {
    let mut command = Command::new(assert_cmd::cargo::cargo_bin!("podvault"));
    command.current_dir(cwd);
    for key in SCRUBBED_ENV {
        command.env_remove(key);
    }
    command
}

fn write_config(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, body).unwrap();
}

#[test]
fn cli_help_lists_commands() {
    let temp_dir = tempfile::tempdir().unwrap();
    podvault(temp_dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("unlock"))
        .stdout(predicate::str::contains("eval \"$(podvault env)\""))
        .stdout(predicate::str::contains("internal-enclave").not());
}

#[test]
fn cli_explain_known_code_is_case_insensitive() {
    let temp_dir = tempfile::tempdir().unwrap();
    podvault(temp_dir.path())
        .args(["explain", "e201"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("E201 wrong passphrase"));
}

#[test]
fn cli_explain_unknown_code_fails_with_stable_code() {
    let temp_dir = tempfile::tempdir().unwrap();
    podvault(temp_dir.path())
        .args(["explain", "E777"])
        .assert()
        .code(1)
        .stderr(predicate::str::starts_with("error[E100]: "))
        .stderr(predicate::str::contains("E201"));
}

#[test]
fn cli_init_scaffolds_once() {
    let temp_dir = tempfile::tempdir().unwrap();
    podvault(temp_dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("created .podvault/config.yaml"))
        .stdout(predicate::str::contains("created secrets.yml"));

    let config_path = temp_dir.path().join(".podvault/config.yaml");
    assert!(config_path.is_file());
    assert!(temp_dir.path().join(".podvault/.gitignore").is_file());
    #[cfg(unix)]
    assert_eq!(
        fs::metadata(&config_path).unwrap().permissions().mode() & 0o777,
        0o644
    );

    fs::write(&config_path, "container_name: mine\n").unwrap();
    podvault(temp_dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("kept .podvault/config.yaml"));
    assert_eq!(
        fs::read_to_string(&config_path).unwrap(),
        "container_name: mine\n"
    );
}

#[test]
fn cli_config_validate_after_init() {
    let temp_dir = tempfile::tempdir().unwrap();
    podvault(temp_dir.path()).arg("init").assert().success();

    podvault(temp_dir.path())
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config ok: "))
        .stdout(predicate::str::contains("(0 entries)"));
}

#[test]
fn cli_config_validate_reports_bad_secrets_file() {
    let temp_dir = tempfile::tempdir().unwrap();
    write_config(&temp_dir.path().join(".podvault/config.yaml"), "image: a\n");
    write_config(
        &temp_dir.path().join("secrets.yml"),
        "secrets:\n  - name: X\n    file: /etc/shadow\n",
    );

    podvault(temp_dir.path())
        .args(["config", "validate"])
        .assert()
        .code(1)
        .stderr(predicate::str::starts_with("error[E100]: "));
}

#[test]
fn cli_config_validate_without_files_uses_defaults() {
    let temp_dir = tempfile::tempdir().unwrap();
    podvault(temp_dir.path())
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config: none found, defaults apply"));
}

#[test]
fn cli_lock_outside_session_is_a_no_op() {
    let temp_dir = tempfile::tempdir().unwrap();
    podvault(temp_dir.path())
        .arg("lock")
        .assert()
        .success()
        .stdout(predicate::str::contains("nothing to lock"));
}

#[test]
fn cli_lock_inside_session_without_control_fd_fails() {
    let temp_dir = tempfile::tempdir().unwrap();
    podvault(temp_dir.path())
        .env("PODVAULT_GHOST_MODE", "true")
        .arg("lock")
        .assert()
        .code(1)
        .stderr(predicate::str::starts_with("error[E200]: "));
}

#[test]
fn cli_unlock_inside_session_reports_ghost_mode() {
    let temp_dir = tempfile::tempdir().unwrap();
    podvault(temp_dir.path())
        .env("PODVAULT_GHOST_MODE", "true")
        .arg("unlock")
        .assert()
        .success()
        .stdout(predicate::str::contains("Already in ghost mode."));
}

#[test]
fn cli_reinit_inside_session_is_refused() {
    let temp_dir = tempfile::tempdir().unwrap();
    podvault(temp_dir.path())
        .env("PODVAULT_GHOST_MODE", "1")
        .args(["reinit", "--yes"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("podvault lock"));
}

#[test]
fn cli_vault_commands_respect_disabled_ghost_mode() {
    let temp_dir = tempfile::tempdir().unwrap();
    write_config(
        &temp_dir.path().join(".podvault/config.yaml"),
        "features:\n  ghost_mode: false\n",
    );
    podvault(temp_dir.path())
        .arg("unlock")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("ghost_mode"));
}

#[test]
fn cli_env_unsets_variables_for_unsynced_files() {
    let temp_dir = tempfile::tempdir().unwrap();
    write_config(
        &temp_dir.path().join(".podvault/config.yaml"),
        "user: podvault-test-nobody\n",
    );
    write_config(
        &temp_dir.path().join("secrets.yml"),
        "secrets:\n  - name: KUBE\n    file: kube/config\n    env: KUBECONFIG\n  - name: PLAIN\n    file: plain.txt\n",
    );

    podvault(temp_dir.path())
        .arg("env")
        .assert()
        .success()
        .stdout("unset KUBECONFIG\n")
        .stderr(predicate::str::contains("kube/config not found"));
}

#[test]
fn cli_missing_subcommand_prints_help() {
    let temp_dir = tempfile::tempdir().unwrap();
    podvault(temp_dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}
