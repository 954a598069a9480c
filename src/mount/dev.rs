use super::{Composer, MountOps};
use crate::{config, error::Error, utils};
use anyhow::{Result, bail};
use nix::mount::MsFlags;
use std::{os::unix::fs::symlink, path::Path, str::FromStr};
use tracing::{debug, warn};

const MINIMAL_NODES: [&str; 4] = ["null", "zero", "random", "urandom"];

const MINIMAL_LINKS: [(&str, &str); 4] = [
    ("fd", "/proc/self/fd"),
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevPolicy {
    /// Recursive bind of the host `/dev`.
    Host,
    /// Leave the container's own `/dev` alone.
    Skip,
    /// A tmpfs holding only a handful of host device nodes.
    Minimal,
}

impl FromStr for DevPolicy {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "yes" | "y" | "1" => Ok(Self::Host),
            "no" | "n" | "0" => Ok(Self::Skip),
            "minimal" => Ok(Self::Minimal),
            other => Err(Error::Config(format!(
                "mount dev must be yes, no or minimal, got '{other}'"
            ))),
        }
    }
}

pub(super) fn mount<O: MountOps>(composer: &Composer<'_, O>) -> Result<()> {
    let policy = composer.config.get_parsed::<DevPolicy>(config::MOUNT_DEV)?;
    debug!(?policy, "mounting /dev");

    match policy {
        DevPolicy::Skip => Ok(()),
        DevPolicy::Host => host(composer),
        DevPolicy::Minimal => minimal(composer),
    }
}

fn host<O: MountOps>(composer: &Composer<'_, O>) -> Result<()> {
    let Some(target) = composer.ensure_target(Path::new("/dev"), true)? else {
        bail!("container has no /dev directory");
    };

    composer
        .mounter()
        .bind(Path::new("/dev"), &target, MsFlags::MS_REC | MsFlags::MS_NOSUID)?;
    Ok(())
}

fn minimal<O: MountOps>(composer: &Composer<'_, O>) -> Result<()> {
    let Some(target) = composer.ensure_target(Path::new("/dev"), true)? else {
        bail!("container has no /dev directory");
    };

    let mounter = composer.mounter();
    let flags = MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC;
    if !mounter.mount(Some(Path::new("tmpfs")), &target, Some("tmpfs"), flags, Some("mode=0755"))? {
        return Ok(());
    }

    for node in MINIMAL_NODES {
        let host = Path::new("/dev").join(node);
        if !host.exists() {
            warn!(node, "host device node missing");
            continue;
        }

        let inner = target.join(node);
        mounter.with_escalated(|| utils::create_file(&inner))?;
        mounter.bind(&host, &inner, MsFlags::MS_NOSUID)?;
    }

    let shm = target.join("shm");
    mounter.with_escalated(|| utils::create_directory_recursive(&shm, 0o1777))?;
    mounter.mount(
        Some(Path::new("tmpfs")),
        &shm,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=1777"),
    )?;

    mounter.with_escalated(|| {
        for (name, destination) in MINIMAL_LINKS {
            let link = target.join(name);
            if let Err(err) = symlink(destination, &link) {
                warn!(link = %link.display(), "cannot create /dev link: {err}");
            }
        }
        Ok(())
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_policy_values() {
        assert_eq!("yes".parse::<DevPolicy>().ok(), Some(DevPolicy::Host));
        assert_eq!("NO".parse::<DevPolicy>().ok(), Some(DevPolicy::Skip));
        assert_eq!("minimal".parse::<DevPolicy>().ok(), Some(DevPolicy::Minimal));
        assert!("maybe".parse::<DevPolicy>().is_err());
    }
}
