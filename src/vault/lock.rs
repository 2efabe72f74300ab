use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    os::fd::{AsRawFd, OwnedFd, RawFd},
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, FdFlag, Flock, FlockArg, OFlag},
    unistd::pipe2,
};
use tracing::debug;

use crate::{
    error::{PodvaultError, Result},
    fs_secure::{set_permissions, PRIVATE_FILE_MODE},
    types::Identity,
};

const LOCK_REQUEST: &str = "lock";

/// Exclusive advisory lock held for the lifetime of one enclave session.
///
/// Released when dropped.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
    _guard: Flock<File>,
}

impl SessionLock {
    /// Takes the lock without blocking.
    ///
    /// Fails with [`PodvaultError::SessionBusy`] when another process holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        set_permissions(path, PRIVATE_FILE_MODE)?;
        let guard = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(
            |(_, errno)| match errno {
                Errno::EAGAIN => PodvaultError::SessionBusy,
                other => PodvaultError::from(other),
            },
        )?;
        debug!(path = %path.display(), "session lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            _guard: guard,
        })
    }

    /// Lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Request read back from the control pipe after the shell exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Nothing was written; the shell simply ended.
    None,
    /// A nested `lock` asked to close the vault and keep the outer shell.
    Lock,
}

/// Pipe whose write end is inherited by the interactive shell.
///
/// The read end stays close-on-exec and non-blocking so it can be drained
/// while this process still holds the write end.
#[derive(Debug)]
pub struct ControlChannel {
    read: File,
    write: OwnedFd,
}

impl ControlChannel {
    /// Creates the pipe and clears close-on-exec on the write end.
    pub fn open() -> Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        fcntl(write.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty()))?;
        Ok(Self {
            read: File::from(read),
            write,
        })
    }

    /// Descriptor number to advertise to the shell.
    pub fn child_fd(&self) -> RawFd {
        self.write.as_raw_fd()
    }

    /// Hands the pipe to `owner` so a nested, unprivileged `lock` can
    /// reopen the write end through `/proc/self/fd`.
    pub fn grant(&self, owner: &Identity) -> Result<()> {
        std::os::unix::fs::fchown(&self.write, Some(owner.uid), Some(owner.gid))?;
        Ok(())
    }

    /// Drains whatever the shell's descendants wrote.
    pub fn take_request(&mut self) -> Result<ControlRequest> {
        let mut buffer = Vec::new();
        let mut chunk = [0_u8; 64];
        loop {
            match self.read.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => buffer.extend_from_slice(&chunk[..read]),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            }
        }
        Ok(parse_request(&buffer))
    }
}

/// Writes a lock request to an inherited control descriptor.
pub fn send_lock_request(fd: RawFd) -> Result<()> {
    let mut pipe = OpenOptions::new()
        .write(true)
        .open(format!("/proc/self/fd/{fd}"))
        .map_err(|error| {
            PodvaultError::Environment(format!("control channel {fd} is not usable: {error}"))
        })?;
    pipe.write_all(LOCK_REQUEST.as_bytes())?;
    pipe.write_all(b"\n")?;
    Ok(())
}

fn parse_request(buffer: &[u8]) -> ControlRequest {
    let text = String::from_utf8_lossy(buffer);
    if text.lines().any(|line| line.trim() == LOCK_REQUEST) {
        ControlRequest::Lock
    } else {
        ControlRequest::None
    }
}

#[cfg(test)]
mod unit_tests {
    use super::{parse_request, ControlRequest};

    #[test]
    fn recognizes_lock_line() {
        assert_eq!(parse_request(b"lock\n"), ControlRequest::Lock);
        assert_eq!(parse_request(b"noise\nlock\n"), ControlRequest::Lock);
        assert_eq!(parse_request(b""), ControlRequest::None);
        assert_eq!(parse_request(b"unlock\n"), ControlRequest::None);
    }
}
