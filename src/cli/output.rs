use std::io::{self, Write};

/// Result of writing to an output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputStatus {
    /// Write completed.
    Written,
    /// Stream was closed by the reader.
    BrokenPipe,
}

fn map_result(result: io::Result<()>) -> io::Result<OutputStatus> {
    match result {
        Ok(()) => Ok(OutputStatus::Written),
        Err(error) if error.kind() == io::ErrorKind::BrokenPipe => Ok(OutputStatus::BrokenPipe),
        Err(error) => Err(error),
    }
}

fn write_line(handle: &mut impl Write, text: &str) -> io::Result<OutputStatus> {
    map_result(
        handle
            .write_all(text.as_bytes())
            .and_then(|_| handle.write_all(b"\n"))
            .and_then(|_| handle.flush()),
    )
}

/// Writes text and a newline to stdout.
pub(crate) fn stdout_line(text: &str) -> io::Result<OutputStatus> {
    write_line(&mut io::stdout().lock(), text)
}

/// Writes text and a newline to stderr.
pub(crate) fn stderr_line(text: &str) -> io::Result<OutputStatus> {
    write_line(&mut io::stderr().lock(), text)
}

/// Writes a prompt without a trailing newline to stderr.
pub(crate) fn stderr_prompt(text: &str) -> io::Result<OutputStatus> {
    let mut handle = io::stderr().lock();
    map_result(
        handle
            .write_all(text.as_bytes())
            .and_then(|_| handle.flush()),
    )
}
