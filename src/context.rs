use crate::{
    capabilities::has_any_permitted_capabilities,
    config::{self, Config},
    error::Error,
    registry::Registry,
};
use anyhow::{Result, bail};
use nix::unistd::{Gid, Uid, getegid, geteuid, getgid, getuid, setresuid};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PrivilegeLevel {
    Root,
    Rootless,
    Setuid,
    RootlessWithCapabilities,
}

/// Credentials observed at startup, before anything was changed.
#[derive(Debug, Clone, Copy)]
pub struct ProcessContext {
    ruid: Uid,
    rgid: Gid,
    level: PrivilegeLevel,
}

impl ProcessContext {
    pub fn detect() -> Result<Self> {
        let ruid = getuid();
        let euid = geteuid();
        let rgid = getgid();
        let egid = getegid();

        let level = if ruid != euid {
            if !euid.is_root() {
                bail!(Error::Privilege(format!(
                    "setuid binary must elevate to root (euid=0), but got euid={euid}"
                )));
            }
            PrivilegeLevel::Setuid
        } else if euid.is_root() {
            PrivilegeLevel::Root
        } else if has_any_permitted_capabilities()? {
            PrivilegeLevel::RootlessWithCapabilities
        } else {
            PrivilegeLevel::Rootless
        };

        debug!(%ruid, %euid, %rgid, %egid, ?level, "process context");

        Ok(Self {
            ruid,
            rgid,
            level,
        })
    }

    #[inline]
    pub fn ruid(&self) -> Uid {
        self.ruid
    }

    #[inline]
    pub fn rgid(&self) -> Gid {
        self.rgid
    }

    #[inline]
    pub fn real_root(&self) -> bool {
        self.ruid.is_root()
    }

    #[inline]
    pub fn setuid(&self) -> bool {
        self.level == PrivilegeLevel::Setuid
    }

    #[inline]
    pub fn privilege_level(&self) -> PrivilegeLevel {
        self.level
    }
}

/// Proof that the process may switch its effective ids to root.
///
/// Only `Authority::resolve` can mint one, so code that needs real root
/// (loop devices, `setgroups`, target mode) cannot be reached on the
/// user namespace path.
#[derive(Debug)]
pub struct Escalation {
    _private: (),
}

#[derive(Debug)]
pub enum Authority {
    /// Setuid-root binary or a real root invoker.
    Privileged(Escalation),

    /// Unprivileged invoker; privilege comes from a user namespace.
    UserNamespace,
}

impl Authority {
    /// Chooses the execution path for this invocation.
    ///
    /// A setuid binary asked to run without setuid (`NOSUID`) or forbidden by
    /// `allow setuid = no` permanently gives up root here, before anything else
    /// happens.
    pub fn resolve(context: &ProcessContext, registry: &Registry, config: &Config) -> Result<Self> {
        match context.privilege_level() {
            PrivilegeLevel::Root => {
                info!("running as root");
                Ok(Self::Privileged(Escalation { _private: () }))
            }

            PrivilegeLevel::Setuid => {
                let nosuid = registry.is_set("NOSUID");
                let allowed = config.get_bool(config::ALLOW_SETUID)?;

                if allowed && !nosuid {
                    info!("running setuid");
                    return Ok(Self::Privileged(Escalation { _private: () }));
                }

                debug!(nosuid, allowed, "giving up setuid privileges");
                let ruid = context.ruid();
                setresuid(ruid, ruid, ruid).map_err(|err| {
                    Error::Privilege(format!("failed to give up setuid root: {err}"))
                })?;

                Self::user_namespace(config)
            }

            PrivilegeLevel::Rootless => Self::user_namespace(config),

            PrivilegeLevel::RootlessWithCapabilities => {
                bail!(Error::Privilege(ROOTLESS_WITH_CAPABILITY_ERROR_MESSAGE.into()))
            }
        }
    }

    fn user_namespace(config: &Config) -> Result<Self> {
        if !config.get_bool(config::ALLOW_USER_NS)? {
            bail!(Error::Policy(
                "not running setuid and user namespaces are disabled by configuration".into()
            ));
        }

        info!("running unprivileged with a user namespace");
        Ok(Self::UserNamespace)
    }

    pub fn escalation(&self) -> Option<&Escalation> {
        match self {
            Self::Privileged(token) => Some(token),
            Self::UserNamespace => None,
        }
    }

    #[inline]
    pub fn is_userns(&self) -> bool {
        matches!(self, Self::UserNamespace)
    }
}

pub(crate) const ROOTLESS_WITH_CAPABILITY_ERROR_MESSAGE: &str = "Unsupported configuration: Detected unexpected capabilities without setuid or root privileges. \
This may indicate that the binary is using file capabilities (setcap), which is not supported. \
Please install the binary setuid root or run it unprivileged, and retry.";

#[cfg(test)]
mod tests {
    use super::*;

    fn rootless() -> ProcessContext {
        ProcessContext {
            ruid: Uid::from_raw(1000),
            rgid: Gid::from_raw(1000),
            level: PrivilegeLevel::Rootless,
        }
    }

    #[test]
    fn test_rootless_resolves_to_userns() -> Result<()> {
        let config = Config::from_str_contents("allow user ns = yes")?;
        let authority = Authority::resolve(&rootless(), &Registry::new(), &config)?;
        assert!(authority.is_userns());
        assert!(authority.escalation().is_none());
        Ok(())
    }

    #[test]
    fn test_rootless_without_userns_is_denied() -> Result<()> {
        let config = Config::from_str_contents("allow user ns = no")?;
        let error = Authority::resolve(&rootless(), &Registry::new(), &config).unwrap_err();
        assert!(matches!(error.downcast_ref::<Error>(), Some(Error::Policy(_))));
        Ok(())
    }

    #[test]
    fn test_root_is_privileged() -> Result<()> {
        let context = ProcessContext {
            ruid: Uid::from_raw(0),
            rgid: Gid::from_raw(0),
            level: PrivilegeLevel::Root,
        };
        let authority = Authority::resolve(&context, &Registry::new(), &Config::default())?;
        assert!(authority.escalation().is_some());
        Ok(())
    }

    #[test]
    fn test_file_capabilities_are_rejected() {
        let context = ProcessContext {
            level: PrivilegeLevel::RootlessWithCapabilities,
            ..rootless()
        };
        assert!(Authority::resolve(&context, &Registry::new(), &Config::default()).is_err());
    }
}
