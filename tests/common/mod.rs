#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use podvault::{
    config::VaultSettings,
    enclave::PassphraseSource,
    error::{PodvaultError, Result},
    exec::SystemRunner,
    paths::VaultPaths,
    secrets::SecretsAuthority,
    types::{Identity, Passphrase},
    vault::VaultManager,
};
use tempfile::TempDir;

pub const MAPPER_NAME: &str = "podvault_vault";

const LOSETUP_SCRIPT: &str = r#"#!/usr/bin/env bash
set -euo pipefail
echo "losetup $*" >> "__LOG__"
bindings="__STATE__/loop-bindings"
touch "$bindings"
case "$1" in
  -f)
    image="$3"
    for index in 0 1 2 3 4 5 6 7; do
      if ! grep -q "^/dev/loop$index:" "$bindings"; then
        echo "/dev/loop$index: [2049]:12 ($image)" >> "$bindings"
        echo "/dev/loop$index"
        exit 0
      fi
    done
    echo "losetup: cannot find an unused loop device" >&2
    exit 1
    ;;
  -a)
    cat "$bindings"
    ;;
  -d)
    grep -vF "$2:" "$bindings" > "$bindings.tmp" || true
    mv "$bindings.tmp" "$bindings"
    ;;
esac
"#;

const CRYPTSETUP_SCRIPT: &str = r#"#!/usr/bin/env bash
set -euo pipefail
echo "cryptsetup $*" >> "__LOG__"
header="__STATE__/luks-header"
case "$1" in
  luksFormat)
    cat > "$header"
    ;;
  open)
    key="$(cat)"
    if [[ ! -f "$header" || "$key" != "$(cat "$header")" ]]; then
      echo "No key available with this passphrase." >&2
      exit 2
    fi
    mkdir -p "__DEV__/mapper"
    touch "__DEV__/mapper/$5" "__STATE__/dm-$5"
    ;;
  close)
    if [[ ! -f "__STATE__/dm-$2" ]]; then
      echo "Device $2 is not active." >&2
      exit 4
    fi
    rm -f "__STATE__/dm-$2" "__DEV__/mapper/$2"
    ;;
esac
"#;

const DMSETUP_SCRIPT: &str = r#"#!/usr/bin/env bash
set -uo pipefail
echo "dmsetup $*" >> "__LOG__"
case "$1" in
  info)
    [[ -f "__STATE__/dm-$2" ]]
    ;;
  remove)
    rm -f "__STATE__/dm-$3" "__DEV__/mapper/$3"
    ;;
  *)
    exit 0
    ;;
esac
"#;

const MKFS_SCRIPT: &str = r#"#!/usr/bin/env bash
set -euo pipefail
echo "mkfs.ext4 $*" >> "__LOG__"
touch "__STATE__/filesystem"
"#;

const MOUNT_SCRIPT: &str = r#"#!/usr/bin/env bash
set -euo pipefail
echo "mount $*" >> "__LOG__"
if [[ "$1" == "--bind" ]]; then
  echo "$2 $3 none rw,bind 0 0" >> "__MOUNTS__"
else
  echo "$5 $6 ext4 rw,relatime 0 0" >> "__MOUNTS__"
fi
"#;

const UMOUNT_SCRIPT: &str = r#"#!/usr/bin/env bash
set -euo pipefail
echo "umount $*" >> "__LOG__"
target="$2"
grep -vF " $target " "__MOUNTS__" > "__MOUNTS__.tmp" || true
mv "__MOUNTS__.tmp" "__MOUNTS__"
"#;

const MKNOD_SCRIPT: &str = r#"#!/usr/bin/env bash
set -euo pipefail
echo "mknod $*" >> "__LOG__"
touch "$3"
"#;

const SHELL_SCRIPT: &str = r#"#!/usr/bin/env bash
env | sort > "__STATE__/shell.env"
if [[ -f "__STATE__/shell-hook" ]]; then
  source "__STATE__/shell-hook"
fi
exit 0
"#;

/// Scratch host with a scripted block-device toolchain.
pub struct FakeHost {
    pub root: TempDir,
    pub bin_dir: PathBuf,
    pub dev_dir: PathBuf,
    pub state_dir: PathBuf,
    pub mount_table: PathBuf,
    pub workspace: PathBuf,
    pub home: PathBuf,
    pub log_file: PathBuf,
}

impl FakeHost {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let bin_dir = root.path().join("bin");
        let dev_dir = root.path().join("dev");
        let state_dir = root.path().join("state");
        let workspace = root.path().join("workspace");
        let home = root.path().join("home");
        for dir in [&bin_dir, &dev_dir, &state_dir, &workspace, &home] {
            fs::create_dir_all(dir).unwrap();
        }
        let mount_table = state_dir.join("mounts");
        fs::write(&mount_table, "").unwrap();
        let log_file = state_dir.join("commands.log");
        fs::write(&log_file, "").unwrap();

        let host = Self {
            root,
            bin_dir,
            dev_dir,
            state_dir,
            mount_table,
            workspace,
            home,
            log_file,
        };
        for (name, body) in [
            ("losetup", LOSETUP_SCRIPT),
            ("cryptsetup", CRYPTSETUP_SCRIPT),
            ("dmsetup", DMSETUP_SCRIPT),
            ("mkfs.ext4", MKFS_SCRIPT),
            ("mount", MOUNT_SCRIPT),
            ("umount", UMOUNT_SCRIPT),
            ("mknod", MKNOD_SCRIPT),
            ("bash", SHELL_SCRIPT),
        ] {
            host.write_script(name, body);
        }
        host
    }

    pub fn write_script(&self, name: &str, body: &str) {
        let path = self.bin_dir.join(name);
        let body = body
            .replace("__LOG__", &self.log_file.to_string_lossy())
            .replace("__STATE__", &self.state_dir.to_string_lossy())
            .replace("__DEV__", &self.dev_dir.to_string_lossy())
            .replace("__MOUNTS__", &self.mount_table.to_string_lossy());
        fs::write(&path, body).unwrap();
        let mut permissions = fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(&path, permissions).unwrap();
    }

    /// Bash sourced by the fake interactive shell after it records its env.
    pub fn set_shell_hook(&self, body: &str) {
        fs::write(self.state_dir.join("shell-hook"), body).unwrap();
    }

    pub fn runner(&self) -> SystemRunner {
        SystemRunner::with_bin_dir(&self.bin_dir)
    }

    pub fn paths(&self) -> VaultPaths {
        VaultPaths::new(&self.workspace, &self.home).with_system(&self.dev_dir, &self.mount_table)
    }

    pub fn settings(&self) -> VaultSettings {
        VaultSettings {
            size_mb: 1,
            loop_devices: 2,
            ..VaultSettings::default()
        }
    }

    pub fn manager(&self) -> VaultManager<SystemRunner> {
        VaultManager::new(self.paths(), self.runner(), Identity::current(), self.settings())
            .with_device_poll(5, Duration::from_millis(10))
    }

    pub fn commands(&self) -> Vec<String> {
        fs::read_to_string(&self.log_file)
            .unwrap()
            .lines()
            .map(ToOwned::to_owned)
            .collect()
    }

    pub fn clear_commands(&self) {
        fs::write(&self.log_file, "").unwrap();
    }

    pub fn loop_bindings(&self) -> String {
        fs::read_to_string(self.state_dir.join("loop-bindings")).unwrap_or_default()
    }

    pub fn mounts(&self) -> String {
        fs::read_to_string(&self.mount_table).unwrap()
    }

    pub fn mapper_open(&self) -> bool {
        self.state_dir.join(format!("dm-{MAPPER_NAME}")).exists()
    }

    pub fn shell_env(&self) -> HashMap<String, String> {
        fs::read_to_string(self.state_dir.join("shell.env"))
            .unwrap_or_default()
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.to_owned(), value.to_owned()))
            .collect()
    }
}

/// Passphrase source answering from a fixed script.
pub struct ScriptedPrompt {
    answers: VecDeque<String>,
    pub prompts: Vec<String>,
    pub notices: Vec<String>,
}

impl ScriptedPrompt {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: answers.iter().map(|answer| (*answer).to_owned()).collect(),
            prompts: Vec::new(),
            notices: Vec::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.answers.len()
    }
}

impl PassphraseSource for ScriptedPrompt {
    fn read_passphrase(&mut self, prompt: &str) -> Result<Passphrase> {
        self.prompts.push(prompt.to_owned());
        self.answers
            .pop_front()
            .map(Passphrase::new)
            .ok_or_else(|| PodvaultError::InvalidInput("prompt script exhausted".to_owned()))
    }

    fn notice(&mut self, message: &str) {
        self.notices.push(message.to_owned());
    }
}

/// In-memory secrets authority.
#[derive(Default)]
pub struct MockAuthority {
    pub values: HashMap<String, Vec<u8>>,
    pub export: Option<Vec<u8>>,
    pub session_valid: bool,
    pub logins: Mutex<usize>,
    pub links: Mutex<usize>,
    pub fetched: Mutex<Vec<String>>,
}

impl MockAuthority {
    pub fn with_secret(mut self, name: &str, value: &str) -> Self {
        self.values.insert(name.to_owned(), value.as_bytes().to_vec());
        self
    }

    pub fn with_export(mut self, dotenv: &str) -> Self {
        self.export = Some(dotenv.as_bytes().to_vec());
        self
    }

    pub fn logins(&self) -> usize {
        *self.logins.lock().unwrap()
    }
}

impl SecretsAuthority for MockAuthority {
    fn fetch_secret(&self, name: &str) -> Result<Vec<u8>> {
        self.fetched.lock().unwrap().push(name.to_owned());
        self.values.get(name).cloned().ok_or(PodvaultError::Command {
            program: "infisical".to_owned(),
            code: 1,
            stderr: format!("secret {name} not found"),
        })
    }

    fn export_env(&self) -> Result<Vec<u8>> {
        self.export.clone().ok_or(PodvaultError::Command {
            program: "infisical".to_owned(),
            code: 1,
            stderr: "export failed".to_owned(),
        })
    }

    fn probe(&self) -> Result<()> {
        if self.session_valid {
            Ok(())
        } else {
            Err(PodvaultError::Command {
                program: "infisical".to_owned(),
                code: 1,
                stderr: "session expired".to_owned(),
            })
        }
    }

    fn login(&self) -> Result<()> {
        *self.logins.lock().unwrap() += 1;
        Ok(())
    }

    fn link_project(&self) -> Result<()> {
        *self.links.lock().unwrap() += 1;
        Ok(())
    }
}

pub fn read_bytes(path: &Path) -> Vec<u8> {
    fs::read(path).unwrap()
}
