use std::{
    io::{self, BufRead},
    os::fd::AsFd,
};

use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg, Termios};

use crate::{
    enclave::PassphraseSource,
    error::{PodvaultError, Result},
    types::Passphrase,
};

use super::output::{stderr_line, stderr_prompt};

/// Reads passphrases from stdin with echo disabled when stdin is a terminal.
pub(crate) struct TerminalPrompt;

impl PassphraseSource for TerminalPrompt {
    fn read_passphrase(&mut self, prompt: &str) -> Result<Passphrase> {
        stderr_prompt(prompt)?;
        let line = {
            let _echo = EchoGuard::disable()?;
            read_line()?
        };
        line.map(Passphrase::new).ok_or_else(|| {
            PodvaultError::InvalidInput("stdin closed before a passphrase was entered".to_owned())
        })
    }

    fn notice(&mut self, message: &str) {
        let _ = stderr_line(message);
    }
}

/// Asks a yes/no question. Anything but `y`/`yes` is a no.
pub(crate) fn confirm(question: &str) -> Result<bool> {
    stderr_prompt(question)?;
    Ok(read_line()?
        .map(|answer| matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
        .unwrap_or(false))
}

fn read_line() -> Result<Option<String>> {
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let trimmed = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed);
    Ok(Some(line))
}

/// Restores the terminal attributes on drop.
struct EchoGuard {
    original: Termios,
}

impl EchoGuard {
    fn disable() -> Result<Option<Self>> {
        if !atty::is(atty::Stream::Stdin) {
            return Ok(None);
        }
        let stdin = io::stdin();
        let original = tcgetattr(stdin.as_fd())?;
        let mut silent = original.clone();
        silent.local_flags.remove(LocalFlags::ECHO);
        silent.local_flags.insert(LocalFlags::ECHONL);
        tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &silent)?;
        Ok(Some(Self { original }))
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        let _ = tcsetattr(io::stdin().as_fd(), SetArg::TCSANOW, &self.original);
    }
}
