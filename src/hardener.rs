use crate::error::Error;
use anyhow::{Context, Result, bail};
use nix::{
    libc::{PR_GET_NO_NEW_PRIVS, PR_SET_NO_NEW_PRIVS, prctl},
    mount::{MsFlags, mount},
    sys::{prctl as nix_prctl, signal::Signal},
    unistd::{Uid, chroot, setfsuid},
};
use std::path::Path;
use tracing::{debug, warn};

/// The process and its children are prevented from gaining new privileges via `execve()`
pub(crate) fn apply_no_new_privs() -> Result<()> {
    let ret = unsafe { prctl(PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        warn!("PR_SET_NO_NEW_PRIVS: failed to set this flag");
        Err(std::io::Error::last_os_error()).context("Failed to restrict privileges")
    } else {
        Ok(())
    }
}

/// Kernel understands `PR_SET_NO_NEW_PRIVS` (Linux 3.5+).
pub(crate) fn no_new_privs_supported() -> bool {
    let ret = unsafe { prctl(PR_GET_NO_NEW_PRIVS, 0, 0, 0, 0) };
    ret >= 0
}

/// Kill this process when its parent goes away.
pub(crate) fn kill_on_parent_death() -> Result<()> {
    nix_prctl::set_pdeathsig(Signal::SIGKILL).context("Failed to set parent death signal")?;
    Ok(())
}

/// Holds the filesystem uid at the invoker's for the lifetime of the guard.
///
/// Bind sources are resolved with the invoker's filesystem identity so an NFS
/// export with `root_squash` cannot be used to reach files the invoker could
/// not read.
///
/// # NOTES:
/// Error handling based on https://www.man7.org/linux/man-pages/man2/setfsuid.2.html
pub(crate) struct FsUidGuard {
    previous: Uid,
}

impl FsUidGuard {
    pub fn restrict(target: Uid) -> Result<Self> {
        // 1. Request FSUID change
        let previous = setfsuid(target);

        // 2. Read current FSUID with setfsuid(-1)
        let current = setfsuid(Uid::from_raw(!0u32));

        // 3. Compare actual FSUID with target
        if current != target {
            setfsuid(previous);
            bail!(Error::Privilege(format!(
                "FSUID: failed to set FSUID to {target} (current FSUID is {current})"
            )));
        }

        Ok(Self { previous })
    }
}

impl Drop for FsUidGuard {
    fn drop(&mut self) {
        setfsuid(self.previous);
    }
}

/// Recursively marks `/` private (or slave) so mounts made in this namespace
/// never propagate back to the host.
pub fn set_mount_propagation(slave: bool) -> Result<()> {
    let propagation = if slave {
        MsFlags::MS_SLAVE
    } else {
        MsFlags::MS_PRIVATE
    };
    let flags = MsFlags::MS_REC | propagation;

    debug!(slave, "detaching mount propagation from the host");
    mount::<str, str, str, str>(None, "/", None, flags, None)
        .map_err(|err| Error::Privilege(format!("failed to set mount propagation on /: {err}")))?;
    Ok(())
}

pub fn change_root(new_root: &Path) -> Result<()> {
    chroot(new_root)
        .map_err(|err| Error::Privilege(format!("chroot to {} failed: {err}", new_root.display())))?;
    chdir(Path::new("/"))
}

pub fn chdir(path: &Path) -> Result<()> {
    nix::unistd::chdir(path).with_context(|| format!("Failed to chdir to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_new_privs_probe() {
        assert!(no_new_privs_supported());
    }
}
