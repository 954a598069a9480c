use anyhow::{Context, Result};
use nix::{
    errno::Errno,
    fcntl::OFlag,
    unistd::{pipe2, read, write},
};
use std::os::fd::OwnedFd;

const MAX_MESSAGE: usize = 4096;

/// Pipe carrying a forked child's fatal error back to its parent, so setup
/// failures are told apart from the payload's own exit status.
#[derive(Debug)]
pub struct ErrorReporter {
    /// Read end of the pipe
    reader: OwnedFd,

    /// Write end of the pipe
    writer: OwnedFd,
}

impl ErrorReporter {
    /// Create new instance of `ErrorReporter`
    pub fn new() -> Result<Self> {
        let (reader, writer) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
            .context("Failed to create pipe for process error reporting")?;

        Ok(Self { reader, writer })
    }

    /// Splits into the parent's reader and the child's writer.
    pub fn split(self) -> (ParentErrorReader, ChildErrorWriter) {
        (
            ParentErrorReader { reader: self.reader },
            ChildErrorWriter { writer: self.writer },
        )
    }
}

/// Helper to manage FD in child processes
#[derive(Debug)]
pub struct ChildErrorWriter {
    writer: OwnedFd,
}

impl ChildErrorWriter {
    /// Reports an error to the parent process. Long chains are truncated.
    pub fn report(&self, error: &anyhow::Error) -> Result<()> {
        let message = format!("{error:#}");
        let bytes = message.as_bytes();
        let n = bytes.len().min(MAX_MESSAGE);

        write(&self.writer, &bytes[..n])
            .context("Failed to write error message to parent process")?;

        Ok(())
    }
}

/// Helper to manage FD in parent processes
#[derive(Debug)]
pub struct ParentErrorReader {
    reader: OwnedFd,
}

impl ParentErrorReader {
    /// Reads a reported message without blocking. `None` when the child
    /// reported nothing.
    pub fn take_message(&self) -> Result<Option<String>> {
        let mut buffer = vec![0u8; MAX_MESSAGE];

        match read(&self.reader, &mut buffer) {
            Ok(0) | Err(Errno::EAGAIN) => Ok(None),
            Ok(n) => Ok(Some(String::from_utf8_lossy(&buffer[..n]).into_owned())),
            Err(err) => Err(err).context("Failed to read child error report"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_round_trip_through_pipe() -> Result<()> {
        let (reader, writer) = ErrorReporter::new()?.split();
        assert_eq!(reader.take_message()?, None);

        let error = anyhow::anyhow!("inner").context("outer");
        writer.report(&error)?;
        assert_eq!(reader.take_message()?.as_deref(), Some("outer: inner"));
        Ok(())
    }
}
