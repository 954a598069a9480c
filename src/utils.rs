use crate::error::Error;
use anyhow::{Context, Result, anyhow, bail};
use nix::{
    errno::Errno,
    fcntl::{FcntlArg, Flock, FlockArg, fcntl},
};
use std::{
    fs::{self, DirBuilder, File},
    os::{
        fd::BorrowedFd,
        unix::fs::{DirBuilderExt, MetadataExt},
    },
    path::{Component, Path, PathBuf},
};

/// Checks whether a given FD is valid.
pub fn is_fd_valid(raw_fd: i32) -> Result<i32> {
    if raw_fd < 0 {
        bail!("Invalid file descriptor ({raw_fd})");
    }

    // SAFETY: This call doesn't dereference or take ownership, just validates via `fcntl`.
    let fd = unsafe { BorrowedFd::borrow_raw(raw_fd) };

    fcntl(fd, FcntlArg::F_GETFD)
        .map_err(|error| anyhow!("Invalid file descriptor ({raw_fd}): {error}"))?;
    Ok(raw_fd)
}

/// `mkdir -p` with an explicit mode for every created component.
pub fn create_directory_recursive(path: &Path, mode: u32) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .with_context(|| format!("Failed to create directory {}", path.display()))
}

/// Creates an empty regular file to serve as a bind target.
pub fn create_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_directory_recursive(parent, 0o755)?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(())
}

/// Fails unless `path` exists and is owned by `uid`.
pub fn ensure_owner(path: &Path, uid: u32) -> Result<()> {
    let metadata = fs::metadata(path).with_context(|| format!("Failed to stat {}", path.display()))?;
    if metadata.uid() != uid {
        bail!(Error::Policy(format!(
            "{} is owned by uid {}, expected {uid}",
            path.display(),
            metadata.uid()
        )));
    }
    Ok(())
}

/// Joins an absolute container path below `root` without letting `..` climb out.
pub fn join_inside(root: &Path, inner: &Path) -> PathBuf {
    let mut joined = root.to_path_buf();
    for component in inner.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::ParentDir => {
                if joined != root {
                    joined.pop();
                }
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    joined
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn arg(self, nonblocking: bool) -> FlockArg {
        match (self, nonblocking) {
            (Self::Shared, false) => FlockArg::LockShared,
            (Self::Shared, true) => FlockArg::LockSharedNonblock,
            (Self::Exclusive, false) => FlockArg::LockExclusive,
            (Self::Exclusive, true) => FlockArg::LockExclusiveNonblock,
        }
    }
}

/// Outcome of [`lock`].
#[derive(Debug)]
pub enum Lock {
    Held(Flock<File>),
    /// A non-blocking attempt found the lock held elsewhere.
    Busy(File),
}

/// `flock(2)` on `file`, retried on `EINTR`.
pub fn lock(mut file: File, mode: LockMode, nonblocking: bool) -> Result<Lock> {
    loop {
        match Flock::lock(file, mode.arg(nonblocking)) {
            Ok(lock) => return Ok(Lock::Held(lock)),
            Err((returned, Errno::EINTR)) => file = returned,
            Err((returned, Errno::EWOULDBLOCK)) => return Ok(Lock::Busy(returned)),
            Err((_, errno)) => return Err(errno).context(format!("flock({mode:?}) failed")),
        }
    }
}

/// Converts a held lock, waiting until the new mode is granted.
pub fn relock(lock: &Flock<File>, mode: LockMode) -> Result<()> {
    loop {
        match lock.relock(mode.arg(false)) {
            Ok(()) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno).context(format!("flock({mode:?}) failed")),
        }
    }
}

pub fn unlock(lock: Flock<File>) -> Result<File> {
    lock.unlock()
        .map_err(|(_, errno)| errno)
        .context("flock(LOCK_UN) failed")
}
