//! Creating and joining namespaces.

use crate::{
    checks::is_namespace_supported,
    config::{self, Config},
    error::Error,
    registry::Registry,
    utils,
};
use anyhow::{Context, Result, bail};
use nix::{
    sched::{CloneFlags, setns, unshare},
    unistd::{Pid, Uid},
};
use std::{
    fs::{self, File},
    os::unix::fs::MetadataExt,
    path::PathBuf,
};
use tracing::{debug, info, warn};

/// Namespaces joinable through `/proc/<pid>/ns`, in join order. The mount
/// namespace goes last so the others are still reachable through `/proc`.
const JOIN_ORDER: [(CloneFlags, &str); 4] = [
    (CloneFlags::CLONE_NEWIPC, "ipc"),
    (CloneFlags::CLONE_NEWNET, "net"),
    (CloneFlags::CLONE_NEWPID, "pid"),
    (CloneFlags::CLONE_NEWNS, "mnt"),
];

/// Namespaces requested for this invocation. A user namespace is handled by
/// the privilege manager before any of these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NamespaceRequest {
    pub pid: bool,
    pub ipc: bool,
    pub net: bool,
}

impl NamespaceRequest {
    pub fn from_registry(registry: &Registry, config: &Config) -> Result<Self> {
        let mut pid = registry.is_set("UNSHARE_PID") || registry.is_set("PIDNS_ENABLED");
        if pid && !config.get_bool(config::ALLOW_PID_NS)? {
            warn!("not virtualizing the PID namespace by configuration");
            pid = false;
        }

        Ok(Self {
            pid,
            ipc: registry.is_set("UNSHARE_IPC"),
            net: registry.is_set("UNSHARE_NET"),
        })
    }

    /// Flags for `unshare`, always including a mount namespace.
    pub fn flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::CLONE_NEWNS;
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.net {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        flags
    }
}

/// Unshares every namespace in `flags`. A new PID namespace only applies to
/// children forked afterwards.
pub fn unshare_namespaces(flags: CloneFlags) -> Result<()> {
    for (flag, name) in JOIN_ORDER {
        if flags.contains(flag) && !is_namespace_supported(flag) {
            bail!(Error::Resource(format!("{name} namespaces are not supported by this kernel")));
        }
    }

    unshare(flags).map_err(|err| Error::Privilege(format!("unshare({flags:?}) failed: {err}")))?;
    info!(?flags, "namespaces unshared");
    Ok(())
}

/// Where to find an existing instance's namespaces.
#[derive(Debug, Clone)]
pub enum NamespaceSource {
    Pid(Pid),
    /// Directory descriptor on `/proc/<pid>/ns`.
    Fd(i32),
}

impl NamespaceSource {
    pub fn from_registry(registry: &Registry) -> Result<Option<Self>> {
        if !registry.is_set("DAEMON_JOIN") {
            return Ok(None);
        }

        if let Some(fd) = registry.get_parsed::<i32>("DAEMON_NS_FD")? {
            return Ok(Some(Self::Fd(utils::is_fd_valid(fd)?)));
        }

        match registry.get_parsed::<i32>("DAEMON_PID")? {
            Some(pid) if pid > 0 => Ok(Some(Self::Pid(Pid::from_raw(pid)))),
            _ => bail!(Error::Usage(
                "DAEMON_JOIN needs DAEMON_PID or DAEMON_NS_FD".into()
            )),
        }
    }

    /// Refuses an instance whose processes belong to anyone but `uid`.
    pub fn ensure_owned_by(&self, uid: Uid) -> Result<()> {
        let path = match self {
            Self::Pid(pid) => PathBuf::from(format!("/proc/{pid}")),
            Self::Fd(fd) => PathBuf::from(format!("/proc/self/fd/{fd}")),
        };

        let owner = fs::metadata(&path)
            .with_context(|| format!("Failed to stat instance at {}", path.display()))?
            .uid();

        if owner != uid.as_raw() {
            bail!(Error::Policy(format!(
                "instance at {} belongs to uid {owner}, not {uid}",
                path.display()
            )));
        }
        Ok(())
    }

    fn path(&self, name: &str) -> PathBuf {
        match self {
            Self::Pid(pid) => PathBuf::from(format!("/proc/{pid}/ns/{name}")),
            Self::Fd(fd) => PathBuf::from(format!("/proc/self/fd/{fd}/{name}")),
        }
    }
}

/// `setns` into each namespace in `flags` that the instance has.
pub fn join_namespaces(source: &NamespaceSource, flags: CloneFlags) -> Result<()> {
    let handles = JOIN_ORDER
        .iter()
        .filter(|(flag, _)| flags.contains(*flag))
        .map(|(flag, name)| {
            let path = source.path(name);
            File::open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))
                .map(|file| (*flag, *name, file))
        })
        .collect::<Result<Vec<_>>>()?;

    for (flag, name, file) in handles {
        setns(&file, flag)
            .map_err(|err| Error::Privilege(format!("failed to join {name} namespace: {err}")))?;
        debug!(namespace = name, "joined");
    }

    info!(?flags, "joined instance namespaces");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_flags() -> Result<()> {
        let registry = Registry::from_vars([
            ("SINGULARITY_UNSHARE_PID", "1"),
            ("SINGULARITY_UNSHARE_IPC", "1"),
        ])?;
        let request = NamespaceRequest::from_registry(&registry, &Config::default())?;

        assert!(request.pid && request.ipc && !request.net);
        assert!(request.flags().contains(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID));
        Ok(())
    }

    #[test]
    fn test_pid_namespace_gated_by_config() -> Result<()> {
        let registry = Registry::from_vars([("SINGULARITY_UNSHARE_PID", "1")])?;
        let config = Config::from_str_contents("allow pid ns = no")?;
        let request = NamespaceRequest::from_registry(&registry, &config)?;

        assert!(!request.pid);
        assert!(!request.flags().contains(CloneFlags::CLONE_NEWPID));
        Ok(())
    }

    #[test]
    fn test_join_source() -> Result<()> {
        assert!(NamespaceSource::from_registry(&Registry::new())?.is_none());

        let registry = Registry::from_vars([
            ("SINGULARITY_DAEMON_JOIN", "1"),
            ("SINGULARITY_DAEMON_PID", "42"),
        ])?;
        let source = NamespaceSource::from_registry(&registry)?.expect("join requested");
        assert_eq!(source.path("mnt"), PathBuf::from("/proc/42/ns/mnt"));

        let incomplete = Registry::from_vars([("SINGULARITY_DAEMON_JOIN", "1")])?;
        assert!(NamespaceSource::from_registry(&incomplete).is_err());
        Ok(())
    }

    #[test]
    fn test_foreign_instance_is_refused() -> Result<()> {
        let me = nix::unistd::geteuid();
        let own = NamespaceSource::Pid(nix::unistd::getpid());
        own.ensure_owned_by(me)?;

        let error = own
            .ensure_owned_by(Uid::from_raw(me.as_raw() + 1))
            .unwrap_err();
        assert!(matches!(error.downcast_ref::<Error>(), Some(Error::Policy(_))));

        let dir = File::open("/proc/self/ns")?;
        NamespaceSource::Fd(std::os::fd::AsRawFd::as_raw_fd(&dir)).ensure_owned_by(me)?;
        Ok(())
    }
}
