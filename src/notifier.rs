use core::fmt;

use anyhow::{Context, Result};
use nix::{
    errno::Errno,
    sys::eventfd::{EfdFlags, EventFd},
    unistd::{read, write},
};

/// One-shot gate between a forked child and its parent: the child blocks in
/// `wait` until the parent has finished its side of the setup.
pub struct Notifier {
    inner: EventFd,
}

impl Notifier {
    pub fn new() -> Result<Self> {
        let inner = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC)
            .context("Failed to create EventFd")?;

        Ok(Self { inner })
    }

    pub fn wait(&self) -> Result<()> {
        let mut buffer = 0u64.to_ne_bytes();
        loop {
            match read(&self.inner, &mut buffer) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("Failed to wait for parent"),
            }
        }
    }

    pub fn release(&self) -> Result<()> {
        let buffer = 1u64.to_ne_bytes();
        write(&self.inner, &buffer).context("Failed to release child")?;
        Ok(())
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier").field("fd", &self.inner).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_then_wait_does_not_block() -> Result<()> {
        let notifier = Notifier::new()?;
        notifier.release()?;
        notifier.wait()
    }
}
