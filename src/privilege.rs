//! Effective-id switching around privileged syscalls.
//!
//! Setuid invocations start with euid 0; `PrivilegeManager::init` drops to the
//! invoker right away and every privileged step brackets itself with
//! `escalate`/`drop_privileges` (usually through `with_escalated`). On the user
//! namespace path both are no-ops.

use crate::{
    capabilities::{Capability, CapabilityManager, CapabilitySet},
    context::{Authority, Escalation, ProcessContext},
    error::Error,
    hardener,
    registry::Registry,
};
use anyhow::{Context, Result, bail};
use nix::unistd::{
    Gid, Uid, User, getegid, geteuid, getgroups, getgrouplist, getresgid, getresuid, setegid,
    seteuid, setgroups, setresgid, setresuid, setuid,
};
use std::{cell::Cell, ffi::CString, fs, path::PathBuf};
use tracing::{debug, info, trace};

/// Lowest uid/gid accepted for target mode.
pub const MIN_TARGET_ID: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: Uid,
    pub gid: Gid,
    pub groups: Vec<Gid>,
}

/// Passwd data of the user the payload runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub home: PathBuf,
    pub shell: PathBuf,
    pub gecos: String,
}

impl Account {
    /// Looks `uid` up in the user database. Unknown users get their uid
    /// as a name and `/` as home.
    pub fn lookup(uid: Uid) -> Result<Self> {
        let account = match User::from_uid(uid).context("Failed to look up user")? {
            Some(user) => Self {
                name: user.name,
                home: user.dir,
                shell: user.shell,
                gecos: user.gecos.to_string_lossy().into_owned(),
            },
            None => Self {
                name: uid.to_string(),
                home: PathBuf::from("/"),
                shell: PathBuf::from("/bin/sh"),
                gecos: String::new(),
            },
        };
        Ok(account)
    }
}

#[derive(Debug)]
pub struct PrivilegeManager {
    authority: Authority,
    invoker: Identity,
    account: Account,
    target: Option<Identity>,
    userns_ready: Cell<bool>,
    dropped_groups: Cell<bool>,
    permanent: Cell<bool>,
}

impl PrivilegeManager {
    /// Records the invoking credentials and leaves the process in the
    /// dropped state.
    pub fn init(context: &ProcessContext, authority: Authority, registry: &Registry) -> Result<Self> {
        let uid = context.ruid();
        let gid = context.rgid();
        let groups = getgroups().context("Failed to read supplementary groups")?;

        let target = match parse_target(registry, context.real_root())? {
            Some((target_uid, target_gid)) => {
                info!(%target_uid, %target_gid, "target mode enabled");
                Some(target_identity(target_uid, target_gid)?)
            }
            None => None,
        };

        // The payload's account, not the invoker's, in target mode.
        let account = Account::lookup(target.as_ref().map_or(uid, |target| target.uid))?;

        let manager = Self {
            authority,
            invoker: Identity { uid, gid, groups },
            account,
            target,
            userns_ready: Cell::new(false),
            dropped_groups: Cell::new(false),
            permanent: Cell::new(false),
        };

        manager.drop_privileges()?;
        Ok(manager)
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Token for operations that need real root.
    pub fn escalation(&self) -> Result<&Escalation> {
        self.authority.escalation().ok_or_else(|| {
            Error::Privilege("operation requires setuid or root privileges".into()).into()
        })
    }

    pub fn is_userns(&self) -> bool {
        self.authority.is_userns()
    }

    pub fn uid(&self) -> Uid {
        self.invoker.uid
    }

    pub fn gid(&self) -> Gid {
        self.invoker.gid
    }

    pub fn groups(&self) -> &[Gid] {
        &self.invoker.groups
    }

    /// Name of the payload user.
    pub fn username(&self) -> &str {
        &self.account.name
    }

    pub fn home(&self) -> &PathBuf {
        &self.account.home
    }

    pub fn shell(&self) -> &PathBuf {
        &self.account.shell
    }

    pub fn gecos(&self) -> &str {
        &self.account.gecos
    }

    /// Invoker is uid 0 (and not in target mode).
    pub fn is_root(&self) -> bool {
        self.invoker.uid.is_root() && self.target.is_none()
    }

    pub fn target(&self) -> Option<&Identity> {
        self.target.as_ref()
    }

    pub fn userns_ready(&self) -> bool {
        self.userns_ready.get()
    }

    pub fn dropped_groups(&self) -> bool {
        self.dropped_groups.get()
    }

    /// Identity the payload ends up running as.
    pub fn effective_identity(&self) -> &Identity {
        self.target.as_ref().unwrap_or(&self.invoker)
    }

    /// Switches effective ids to root and clears supplementary groups.
    pub fn escalate(&self) -> Result<()> {
        if self.is_userns() {
            return Ok(());
        }

        if self.permanent.get() {
            bail!(Error::Privilege(
                "cannot escalate after privileges were permanently dropped".into()
            ));
        }

        trace!("escalating privileges");

        seteuid(Uid::from_raw(0))
            .map_err(|err| Error::Privilege(format!("failed to set effective uid to 0: {err}")))?;
        setegid(Gid::from_raw(0))
            .map_err(|err| Error::Privilege(format!("failed to set effective gid to 0: {err}")))?;
        setgroups(&[])
            .map_err(|err| Error::Privilege(format!("failed to clear supplementary groups: {err}")))?;
        self.dropped_groups.set(true);

        if !geteuid().is_root() {
            bail!(Error::Privilege(format!(
                "escalation left effective uid at {}",
                geteuid()
            )));
        }

        Ok(())
    }

    /// Returns effective ids to the invoker (or the target in target mode)
    /// and restores supplementary groups.
    pub fn drop_privileges(&self) -> Result<()> {
        if self.is_userns() || self.permanent.get() {
            return Ok(());
        }

        let identity = self.effective_identity();
        trace!(uid = %identity.uid, gid = %identity.gid, "dropping privileges");

        // setgroups needs CAP_SETGID, so it runs while still root.
        if geteuid().is_root() {
            setgroups(&identity.groups).map_err(|err| {
                Error::Privilege(format!("failed to restore supplementary groups: {err}"))
            })?;
            self.dropped_groups.set(false);
        }

        setegid(identity.gid).map_err(|err| {
            Error::Privilege(format!("failed to set effective gid to {}: {err}", identity.gid))
        })?;
        seteuid(identity.uid).map_err(|err| {
            Error::Privilege(format!("failed to set effective uid to {}: {err}", identity.uid))
        })?;

        if geteuid() != identity.uid || getegid() != identity.gid {
            bail!(Error::Privilege(format!(
                "drop left effective ids at {}:{}, expected {}:{}",
                geteuid(),
                getegid(),
                identity.uid,
                identity.gid
            )));
        }

        Ok(())
    }

    /// Runs `f` with root effective ids, dropping again afterwards.
    pub fn with_escalated<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.escalate()?;
        let result = f();
        self.drop_privileges()?;
        result
    }

    /// Irreversibly sets real, effective and saved ids to the payload identity,
    /// clears effective and permitted capabilities and latches
    /// `PR_SET_NO_NEW_PRIVS`.
    pub fn drop_perm(&self) -> Result<()> {
        self.drop_perm_keeping(CapabilitySet::EMPTY)
    }

    /// Like `drop_perm`, but effective and permitted end up as `keep`.
    ///
    /// Latched `NO_SETUID_FIXUP` stops the kernel from clearing them on the
    /// uid change, so this is what actually takes root away.
    pub fn drop_perm_keeping(&self, keep: CapabilitySet) -> Result<()> {
        if self.permanent.get() {
            return Ok(());
        }

        let identity = self.effective_identity().clone();
        debug!(uid = %identity.uid, gid = %identity.gid, "dropping privileges permanently");

        if !self.is_userns() {
            self.escalate()?;

            setgroups(&identity.groups).map_err(|err| {
                Error::Privilege(format!("failed to set supplementary groups: {err}"))
            })?;
            self.dropped_groups.set(false);

            setresgid(identity.gid, identity.gid, identity.gid).map_err(|err| {
                Error::Privilege(format!("failed to set gid to {}: {err}", identity.gid))
            })?;
            setresuid(identity.uid, identity.uid, identity.uid).map_err(|err| {
                Error::Privilege(format!("failed to set uid to {}: {err}", identity.uid))
            })?;
        }

        let uids = getresuid().context("Failed to read uids")?;
        let gids = getresgid().context("Failed to read gids")?;

        let uid_ok = [uids.real, uids.effective, uids.saved]
            .iter()
            .all(|uid| *uid == identity.uid);
        let gid_ok = [gids.real, gids.effective, gids.saved]
            .iter()
            .all(|gid| *gid == identity.gid);

        if !uid_ok || !gid_ok {
            bail!(Error::Privilege(format!(
                "permanent drop left uids {:?}/{:?}/{:?} gids {:?}/{:?}/{:?}",
                uids.real, uids.effective, uids.saved, gids.real, gids.effective, gids.saved
            )));
        }

        CapabilityManager::limit_permitted(keep)?;
        self.permanent.set(true);

        if !identity.uid.is_root() && !keep.contains(Capability::CAP_SETUID) {
            ensure_root_unreachable()?;
        }

        hardener::apply_no_new_privs()?;
        Ok(())
    }

    /// Enters a fresh user namespace mapping the invoker onto itself.
    pub fn userns(&self) -> Result<()> {
        if !self.is_userns() {
            bail!(Error::Privilege(
                "user namespace path requested while running privileged".into()
            ));
        }

        if self.userns_ready.get() {
            return Ok(());
        }

        nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWUSER)
            .map_err(|err| Error::Privilege(format!("failed to create user namespace: {err}")))?;

        let uid = self.invoker.uid;
        let gid = self.invoker.gid;

        fs::write("/proc/self/setgroups", "deny")
            .context("Failed to write to /proc/self/setgroups")?;
        fs::write("/proc/self/uid_map", id_map(uid.as_raw()))
            .context("Failed to write to /proc/self/uid_map")?;
        fs::write("/proc/self/gid_map", id_map(gid.as_raw()))
            .context("Failed to write to /proc/self/gid_map")?;

        self.userns_ready.set(true);
        debug!(%uid, %gid, "user namespace ready");
        Ok(())
    }
}

/// Fails if the process can still become root.
fn ensure_root_unreachable() -> Result<()> {
    if setuid(Uid::from_raw(0)).is_ok() {
        bail!(Error::Privilege(
            "uid 0 is still reachable after the permanent drop".into()
        ));
    }
    Ok(())
}

/// Single-entry identity mapping, `"<id> <id> 1"`.
pub fn id_map(id: u32) -> String {
    format!("{id} {id} 1")
}

/// Reads `TARGET_UID`/`TARGET_GID`. Both or neither must be given, and they
/// are honoured only for a real root invoker.
pub fn parse_target(registry: &Registry, real_root: bool) -> Result<Option<(Uid, Gid)>> {
    let uid = registry.get_parsed::<u64>("TARGET_UID")?;
    let gid = registry.get_parsed::<u64>("TARGET_GID")?;

    let (uid, gid) = match (uid, gid) {
        (None, None) => return Ok(None),
        (Some(uid), Some(gid)) => (uid, gid),
        _ => bail!(Error::Usage(
            "EINVAL: TARGET_UID and TARGET_GID must be set together".into()
        )),
    };

    if !real_root {
        bail!(Error::Usage(
            "EINVAL: TARGET_UID/TARGET_GID are only valid for the root user".into()
        ));
    }

    let valid = |id: u64| (MIN_TARGET_ID..=u64::from(u32::MAX)).contains(&id);
    if !valid(uid) || !valid(gid) {
        bail!(Error::Usage(format!(
            "EINVAL: target ids {uid}:{gid} out of range [{MIN_TARGET_ID}, {}]",
            u32::MAX
        )));
    }

    // The range check above guarantees the narrowing is lossless.
    Ok(Some((Uid::from_raw(uid as u32), Gid::from_raw(gid as u32))))
}

fn target_identity(uid: Uid, gid: Gid) -> Result<Identity> {
    let groups = match User::from_uid(uid).context("Failed to look up target user")? {
        Some(user) => {
            let name = CString::new(user.name).context("Target user name contains NUL")?;
            getgrouplist(&name, gid).context("Failed to read target user's groups")?
        }
        None => vec![gid],
    };

    Ok(Identity { uid, gid, groups })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(vars: &[(&str, &str)]) -> Registry {
        Registry::from_vars(vars.iter().copied()).expect("registry")
    }

    #[test]
    fn test_no_target_by_default() -> Result<()> {
        assert_eq!(parse_target(&Registry::new(), true)?, None);
        Ok(())
    }

    #[test]
    fn test_target_requires_both_ids() {
        let registry = registry(&[("SINGULARITY_TARGET_UID", "1000")]);
        let error = parse_target(&registry, true).unwrap_err();
        assert!(error.to_string().contains("EINVAL"));
    }

    #[test]
    fn test_target_range_is_enforced() {
        let low = registry(&[("SINGULARITY_TARGET_UID", "499"), ("SINGULARITY_TARGET_GID", "1000")]);
        assert!(parse_target(&low, true).is_err());

        let high = registry(&[
            ("SINGULARITY_TARGET_UID", "4294967296"),
            ("SINGULARITY_TARGET_GID", "1000"),
        ]);
        assert!(parse_target(&high, true).is_err());
    }

    #[test]
    fn test_target_only_for_real_root() {
        let registry = registry(&[("SINGULARITY_TARGET_UID", "1000"), ("SINGULARITY_TARGET_GID", "1000")]);
        assert!(parse_target(&registry, false).is_err());
    }

    #[test]
    fn test_target_accepted() -> Result<()> {
        let registry = registry(&[("SINGULARITY_TARGET_UID", "1001"), ("SINGULARITY_TARGET_GID", "500")]);
        assert_eq!(
            parse_target(&registry, true)?,
            Some((Uid::from_raw(1001), Gid::from_raw(500)))
        );
        Ok(())
    }

    #[test]
    fn test_unknown_account_falls_back_to_uid() -> Result<()> {
        let account = Account::lookup(Uid::from_raw(3_999_999))?;
        assert_eq!(account.name, "3999999");
        assert_eq!(account.home, PathBuf::from("/"));
        Ok(())
    }

    /// Runs `body` in a forked child so credential changes stay there.
    fn in_child(body: impl FnOnce() -> Result<()>) -> Result<()> {
        use nix::{
            sys::wait::{WaitStatus, waitpid},
            unistd::{ForkResult, fork},
        };

        match unsafe { fork() }? {
            ForkResult::Child => {
                let code = match body() {
                    Ok(()) => 0,
                    Err(err) => {
                        eprintln!("{err:#}");
                        1
                    }
                };
                std::process::exit(code);
            }
            ForkResult::Parent { child } => {
                assert_eq!(waitpid(child, None)?, WaitStatus::Exited(child, 0));
                Ok(())
            }
        }
    }

    #[test]
    fn test_target_mode_drop_is_final() -> Result<()> {
        if !geteuid().is_root() {
            return Ok(());
        }

        in_child(|| {
            let context = ProcessContext::detect()?;
            let registry = registry(&[("SINGULARITY_TARGET_UID", "1001"), ("SINGULARITY_TARGET_GID", "1001")]);
            let authority = Authority::resolve(&context, &registry, &crate::config::Config::default())?;
            let manager = PrivilegeManager::init(&context, authority, &registry)?;

            let expected = Account::lookup(Uid::from_raw(1001))?;
            anyhow::ensure!(manager.username() == expected.name, "account taken from the invoker");
            anyhow::ensure!(manager.home() == &expected.home, "home taken from the invoker");

            let latching = CapabilityManager::with_config(crate::capabilities::CapabilityConfig {
                ambient: false,
                latch_securebits: true,
            });
            manager.with_escalated(|| latching.apply(CapabilitySet::EMPTY))?;
            manager.drop_perm()?;

            anyhow::ensure!(geteuid() == Uid::from_raw(1001), "euid is {}", geteuid());
            anyhow::ensure!(!crate::capabilities::has_any_permitted_capabilities()?, "capabilities kept");
            anyhow::ensure!(setresuid(Uid::from_raw(0), Uid::from_raw(0), Uid::from_raw(0)).is_err(), "root regained");
            anyhow::ensure!(manager.escalate().is_err(), "escalation allowed");
            Ok(())
        })
    }

    #[test]
    fn test_identity_map_format() {
        assert_eq!(id_map(1000), "1000 1000 1");
    }
}
