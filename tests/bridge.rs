#![cfg(unix)]

mod common;

use std::fs;

use common::FakeHost;
use podvault::{
    config::PersistenceMode,
    types::Identity,
    vault::{
        bridge::{BridgePair, HomeState, SessionBridge},
        mount::MountTable,
    },
};

fn symlink_bridge(host: &FakeHost) -> SessionBridge<podvault::exec::SystemRunner> {
    SessionBridge::for_paths(
        host.runner(),
        &host.paths(),
        PersistenceMode::Symlink,
        Identity::current(),
    )
}

#[test]
fn persist_relocates_real_directory_and_restore_is_idempotent() {
    let host = FakeHost::new();
    let paths = host.paths();
    fs::create_dir_all(paths.mount_point()).unwrap();
    let credential_home = paths.credential_home();
    fs::create_dir_all(&credential_home).unwrap();
    fs::write(credential_home.join("infisical-config.json"), "{\"token\":1}").unwrap();

    let bridge = symlink_bridge(&host);
    let relocated = bridge.persist().unwrap();
    assert_eq!(relocated, vec![credential_home.clone()]);
    assert!(fs::symlink_metadata(&credential_home)
        .unwrap()
        .file_type()
        .is_symlink());
    assert_eq!(fs::read_link(&credential_home).unwrap(), paths.credential_vault());
    assert_eq!(
        fs::read_to_string(paths.credential_vault().join("infisical-config.json")).unwrap(),
        "{\"token\":1}"
    );

    // a second persist finds nothing left to move
    assert!(bridge.persist().unwrap().is_empty());
    assert_eq!(bridge.restore().unwrap(), 0);

    // next session: the link was removed while locked, restore brings it back
    fs::remove_file(&credential_home).unwrap();
    assert_eq!(bridge.restore().unwrap(), 1);
    assert_eq!(bridge.restore().unwrap(), 0);
    assert_eq!(
        fs::read_to_string(credential_home.join("infisical-config.json")).unwrap(),
        "{\"token\":1}"
    );
    assert!(bridge.release().is_empty());
}

#[test]
fn restore_skips_pairs_without_vault_copy() {
    let host = FakeHost::new();
    let paths = host.paths();
    fs::create_dir_all(paths.mount_point()).unwrap();
    let bridge = symlink_bridge(&host);
    assert_eq!(bridge.restore().unwrap(), 0);
    assert!(!paths.credential_home().exists());
    for pair in bridge.pairs() {
        assert_eq!(bridge.home_state(pair), HomeState::Missing);
    }
}

#[test]
fn establish_creates_vault_copies_before_login() {
    let host = FakeHost::new();
    let paths = host.paths();
    fs::create_dir_all(paths.mount_point()).unwrap();
    let bridge = symlink_bridge(&host);

    assert_eq!(bridge.establish().unwrap(), 2);
    assert!(paths.credential_vault().is_dir());
    assert!(paths.keyring_vault().is_dir());
    for pair in bridge.pairs() {
        assert_eq!(bridge.home_state(pair), HomeState::Linked);
    }
    assert_eq!(bridge.establish().unwrap(), 0);
}

#[test]
fn foreign_symlink_is_not_treated_as_linked() {
    let host = FakeHost::new();
    let elsewhere = host.root.path().join("elsewhere");
    fs::create_dir_all(&elsewhere).unwrap();
    let pair = BridgePair::new(host.home.join(".tool"), host.home.join("secrets/.tool"));
    std::os::unix::fs::symlink(&elsewhere, &pair.home).unwrap();
    let bridge = SessionBridge::new(
        host.runner(),
        MountTable::new(&host.mount_table),
        PersistenceMode::Symlink,
        Identity::current(),
        vec![pair.clone()],
    );
    assert_eq!(bridge.home_state(&pair), HomeState::Other);
    assert!(bridge.persist().unwrap().is_empty());
}

#[test]
fn bind_mode_mounts_on_establish_and_unmounts_on_release() {
    let host = FakeHost::new();
    let paths = host.paths();
    fs::create_dir_all(paths.mount_point()).unwrap();
    let bridge = SessionBridge::for_paths(
        host.runner(),
        &paths,
        PersistenceMode::Bind,
        Identity::current(),
    );

    assert_eq!(bridge.establish().unwrap(), 2);
    let table = MountTable::new(&host.mount_table);
    assert!(table.is_mounted(&paths.credential_home()));
    assert!(table.is_mounted(&paths.keyring_home()));
    assert_eq!(bridge.establish().unwrap(), 0);

    assert!(bridge.release().is_empty());
    assert!(host.mounts().trim().is_empty());
    let unmounts: Vec<String> = host
        .commands()
        .into_iter()
        .filter(|line| line.starts_with("umount"))
        .collect();
    assert_eq!(
        unmounts,
        vec![
            format!("umount -l {}", paths.keyring_home().display()),
            format!("umount -l {}", paths.credential_home().display()),
        ]
    );
}

#[test]
fn legacy_credential_dirs_are_renamed_or_dropped() {
    let host = FakeHost::new();
    let paths = host.paths();
    let legacy = paths.legacy_credential_dirs();
    fs::create_dir_all(&legacy[0]).unwrap();
    fs::write(legacy[0].join("session"), "old").unwrap();
    fs::create_dir_all(&legacy[1]).unwrap();

    let bridge = symlink_bridge(&host);
    let current = paths.credential_vault();
    assert_eq!(bridge.migrate_legacy(&legacy, &current).unwrap(), 1);
    assert_eq!(fs::read_to_string(current.join("session")).unwrap(), "old");
    assert!(!legacy[0].exists());
    assert!(!legacy[1].exists());
    assert_eq!(bridge.migrate_legacy(&legacy, &current).unwrap(), 0);
}
