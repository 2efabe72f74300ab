#![cfg(unix)]

mod common;

use std::fs;

use common::{read_bytes, FakeHost};
use podvault::{
    audit::AuditLog,
    error::PodvaultError,
    types::{Identity, Passphrase},
    vault::{
        device::DeviceProvisioner,
        mount::{MountController, MountStatus, MountTable},
    },
};

fn passphrase(value: &str) -> Passphrase {
    Passphrase::new(value.to_owned())
}

#[test]
fn fresh_unlock_formats_mounts_and_locks_cleanly() {
    let host = FakeHost::new();
    let paths = host.paths();
    let manager = host
        .manager()
        .with_audit(AuditLog::new(paths.audit_file()).unwrap());

    let vault = manager.unlock(&passphrase("correct-horse")).unwrap();
    assert!(vault.fresh());
    assert_eq!(vault.loop_device().to_str(), Some("/dev/loop0"));
    assert!(paths.vault_image().is_file());
    assert_eq!(fs::metadata(paths.vault_image()).unwrap().len(), 1024 * 1024);
    assert!(manager.is_unlocked());
    assert!(host.mapper_open());
    assert!(host.state_dir.join("filesystem").exists());

    let commands = host.commands();
    let position = |prefix: &str| {
        commands
            .iter()
            .position(|line| line.starts_with(prefix))
            .unwrap_or_else(|| panic!("missing `{prefix}` in {commands:?}"))
    };
    assert!(position("losetup -f --show") < position("cryptsetup luksFormat"));
    assert!(position("cryptsetup luksFormat") < position("cryptsetup open"));
    assert!(position("cryptsetup open") < position("mkfs.ext4 -q"));
    assert!(position("mkfs.ext4 -q") < position("mount -o rw -t ext4"));

    let report = vault.lock();
    assert!(report.is_clean(), "{:?}", report.failed_steps);
    assert!(!manager.is_unlocked());
    assert!(!host.mapper_open());
    assert!(host.loop_bindings().trim().is_empty());

    let audit = fs::read_to_string(paths.audit_file()).unwrap();
    assert!(audit.contains("\"event\":\"vault_created\""));
    assert!(audit.contains("\"event\":\"vault_unlocked\""));
    assert!(audit.contains("\"event\":\"vault_locked\""));
    assert!(!audit.contains("correct-horse"));
}

#[test]
fn existing_vault_reopens_without_formatting() {
    let host = FakeHost::new();
    let manager = host.manager();
    let vault = manager.unlock(&passphrase("correct-horse")).unwrap();
    let marker = vault.mount_point().join("kept.txt");
    fs::write(&marker, "still here").unwrap();
    assert!(vault.lock().is_clean());
    host.clear_commands();

    let vault = manager.unlock(&passphrase("correct-horse")).unwrap();
    assert!(!vault.fresh());
    let commands = host.commands();
    assert!(!commands.iter().any(|line| line.starts_with("cryptsetup luksFormat")));
    assert!(!commands.iter().any(|line| line.starts_with("mkfs.ext4")));
    assert_eq!(fs::read_to_string(&marker).unwrap(), "still here");
    drop(vault);
    assert!(!manager.is_unlocked());
}

#[test]
fn wrong_passphrase_leaves_image_untouched_and_detaches_loop() {
    let host = FakeHost::new();
    let paths = host.paths();
    let manager = host
        .manager()
        .with_audit(AuditLog::new(paths.audit_file()).unwrap());
    manager.unlock(&passphrase("correct-horse")).unwrap().lock();
    let before = read_bytes(&paths.vault_image());

    let error = manager.unlock(&passphrase("battery-staple")).err().unwrap();
    assert!(matches!(error, PodvaultError::WrongPassphrase));
    assert_eq!(read_bytes(&paths.vault_image()), before);
    assert!(host.loop_bindings().trim().is_empty());
    assert!(!manager.is_unlocked());
    assert!(!host.mapper_open());

    let audit = fs::read_to_string(paths.audit_file()).unwrap();
    let events: Vec<serde_json::Value> = audit
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let names: Vec<&str> = events
        .iter()
        .map(|event| event["event"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        vec!["vault_created", "vault_unlocked", "vault_locked", "unlock_rejected"]
    );
}

#[test]
fn empty_passphrase_is_rejected_before_any_device_work() {
    let host = FakeHost::new();
    let manager = host.manager();
    let error = manager.unlock(&passphrase("")).err().unwrap();
    assert!(matches!(error, PodvaultError::InvalidInput(_)));
    assert!(host.commands().is_empty());
    assert!(!manager.paths().vault_image().exists());
}

#[test]
fn failed_format_removes_half_created_image() {
    let host = FakeHost::new();
    host.write_script(
        "cryptsetup",
        "#!/usr/bin/env bash\necho \"cryptsetup $*\" >> \"__LOG__\"\ncat > /dev/null\nexit 1\n",
    );
    let manager = host.manager();
    let error = manager.unlock(&passphrase("correct-horse")).err().unwrap();
    assert!(matches!(error, PodvaultError::Command { .. }));
    assert!(!manager.paths().vault_image().exists());
    assert!(host.loop_bindings().trim().is_empty());
}

#[test]
fn unlock_after_crash_clears_stale_mapper_and_loop_bindings() {
    let host = FakeHost::new();
    let manager = host.manager();
    let vault = manager.unlock(&passphrase("correct-horse")).unwrap();
    // the process died: the namespace's mounts vanished, kernel state stayed
    std::mem::forget(vault);
    fs::write(&host.mount_table, "").unwrap();
    assert!(host.mapper_open());
    assert!(!host.loop_bindings().trim().is_empty());
    host.clear_commands();

    let vault = manager.unlock(&passphrase("correct-horse")).unwrap();
    let commands = host.commands();
    let close = commands
        .iter()
        .position(|line| line == "cryptsetup close podvault_vault")
        .expect("leftover mapper closed");
    let detach = commands
        .iter()
        .position(|line| line == "losetup -d /dev/loop0")
        .expect("stale loop detached");
    let attach = commands
        .iter()
        .position(|line| line.starts_with("losetup -f --show"))
        .unwrap();
    assert!(close < attach && detach < attach);
    assert_eq!(host.loop_bindings().lines().count(), 1);
    assert!(vault.lock().is_clean());
}

#[test]
fn teardown_unmounts_bind_mounts_of_the_volume_first() {
    let host = FakeHost::new();
    let manager = host.manager();
    let vault = manager.unlock(&passphrase("correct-horse")).unwrap();
    let mapper = manager.paths().mapper_device();
    let bound = host.home.join(".infisical");
    fs::create_dir_all(&bound).unwrap();
    let mut table = host.mounts();
    table.push_str(&format!(
        "{} {} ext4 rw,relatime 0 0\n",
        mapper.display(),
        bound.display()
    ));
    fs::write(&host.mount_table, table).unwrap();
    host.clear_commands();

    assert!(vault.lock().is_clean());
    let unmounts: Vec<String> = host
        .commands()
        .into_iter()
        .filter(|line| line.starts_with("umount"))
        .collect();
    assert_eq!(
        unmounts,
        vec![
            format!("umount -l {}", bound.display()),
            format!("umount -l {}", manager.paths().mount_point().display()),
        ]
    );
    assert!(host.mounts().trim().is_empty());
}

#[test]
fn mount_is_idempotent() {
    let host = FakeHost::new();
    let runner = host.runner();
    let controller = MountController::new(&runner, MountTable::new(&host.mount_table));
    let device = host.dev_dir.join("mapper").join("podvault_vault");
    let mount_point = host.home.join("secrets");
    let owner = Identity::current();

    assert_eq!(
        controller.mount(&device, &mount_point, &owner).unwrap(),
        MountStatus::Mounted
    );
    assert_eq!(
        controller.mount(&device, &mount_point, &owner).unwrap(),
        MountStatus::AlreadyMounted
    );
    let mounts = host
        .commands()
        .into_iter()
        .filter(|line| line.starts_with("mount "))
        .count();
    assert_eq!(mounts, 1);
    assert!(controller.unmount(&mount_point));
    assert!(controller.unmount(&mount_point));
    assert_eq!(
        host.commands()
            .into_iter()
            .filter(|line| line.starts_with("umount"))
            .count(),
        1
    );
}

#[test]
fn wipe_is_refused_while_unlocked() {
    let host = FakeHost::new();
    let manager = host.manager();
    let vault = manager.unlock(&passphrase("correct-horse")).unwrap();
    assert!(matches!(
        manager.wipe(),
        Err(PodvaultError::InvalidInput(_))
    ));
    vault.lock();
    assert!(manager.wipe().unwrap());
    assert!(!manager.paths().vault_image().exists());
    assert!(!manager.wipe().unwrap());
}

#[test]
fn legacy_image_is_migrated_before_unlock() {
    let host = FakeHost::new();
    let manager = host.manager();
    let paths = manager.paths();
    let legacy = paths.legacy_vault_image();
    fs::create_dir_all(legacy.parent().unwrap()).unwrap();
    fs::write(&legacy, b"legacy").unwrap();

    assert!(manager.prepare().unwrap());
    assert!(!legacy.exists());
    assert_eq!(fs::read(paths.vault_image()).unwrap(), b"legacy");
}

#[test]
fn second_session_is_busy_while_first_holds_the_lock() {
    let host = FakeHost::new();
    let manager = host.manager();
    let _held = manager.acquire_session().unwrap();
    assert!(matches!(
        manager.acquire_session(),
        Err(PodvaultError::SessionBusy)
    ));
}

#[test]
fn device_nodes_are_created_once() {
    let host = FakeHost::new();
    let runner = host.runner();
    let provisioner = DeviceProvisioner::new(&runner, &host.dev_dir, 3);

    // loop-control, loop0..loop2 and mapper/control
    assert_eq!(provisioner.ensure_device_nodes(true), 5);
    assert!(host.dev_dir.join("loop2").exists());
    assert!(host.dev_dir.join("mapper/control").exists());
    assert_eq!(provisioner.ensure_device_nodes(true), 0);
    assert!(host
        .commands()
        .contains(&format!("mknod -m 0660 {} b 7 1", host.dev_dir.join("loop1").display())));
}
