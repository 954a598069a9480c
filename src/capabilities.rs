//! Capability set arithmetic, the root/user capability policy and its
//! application to the current process.

use crate::{
    config::{self, Config},
    error::Error,
    registry::Registry,
};
use anyhow::{Context, Result, bail};
use caps::CapsHashSet;
use nix::{
    libc::{PR_CAPBSET_DROP, PR_CAPBSET_READ, PR_GET_SECUREBITS, PR_SET_SECUREBITS, c_ulong, prctl},
    unistd::{Gid, Group},
};
use once_cell::sync::Lazy;
use std::{
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, trace, warn};

pub(crate) use caps::{CapSet, Capability};

/// Highest capability index probed in the bounding set.
pub const CAPSET_MAX: u8 = 63;

/// Groups below this gid never contribute file-based capabilities.
const MIN_CAPABILITY_GID: u32 = 500;

const SECBIT_NOROOT: c_ulong = 1 << 0;
const SECBIT_NOROOT_LOCKED: c_ulong = 1 << 1;
const SECBIT_NO_SETUID_FIXUP: c_ulong = 1 << 2;
const SECBIT_NO_SETUID_FIXUP_LOCKED: c_ulong = 1 << 3;
const SECBIT_KEEP_CAPS: c_ulong = 1 << 4;
const SECBIT_KEEP_CAPS_LOCKED: c_ulong = 1 << 5;

const LATCHED_SECUREBITS: c_ulong = SECBIT_KEEP_CAPS
    | SECBIT_KEEP_CAPS_LOCKED
    | SECBIT_NOROOT
    | SECBIT_NOROOT_LOCKED
    | SECBIT_NO_SETUID_FIXUP
    | SECBIT_NO_SETUID_FIXUP_LOCKED;

pub const DEFAULT_CAPABILITIES: [Capability; 14] = [
    Capability::CAP_CHOWN,
    Capability::CAP_DAC_OVERRIDE,
    Capability::CAP_FOWNER,
    Capability::CAP_FSETID,
    Capability::CAP_KILL,
    Capability::CAP_SETGID,
    Capability::CAP_SETUID,
    Capability::CAP_SETPCAP,
    Capability::CAP_NET_BIND_SERVICE,
    Capability::CAP_NET_ADMIN,
    Capability::CAP_SYS_CHROOT,
    Capability::CAP_SYS_ADMIN,
    Capability::CAP_MKNOD,
    Capability::CAP_AUDIT_WRITE,
];

static BY_INDEX: Lazy<HashMap<u8, Capability>> =
    Lazy::new(|| caps::all().into_iter().map(|cap| (cap.index(), cap)).collect());

/// Immutable bitmask of capability indices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u64);

impl CapabilitySet {
    pub const EMPTY: Self = Self(0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn default_set() -> Self {
        DEFAULT_CAPABILITIES.into_iter().collect()
    }

    pub fn add(self, capability: Capability) -> Self {
        Self(self.0 | capability.bitmask())
    }

    pub fn drop(self, capability: Capability) -> Self {
        Self(self.0 & !capability.bitmask())
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn contains(self, capability: Capability) -> bool {
        self.contains_index(capability.index())
    }

    pub fn contains_index(self, index: u8) -> bool {
        index <= CAPSET_MAX && self.0 & (1u64 << index) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn indices(self) -> impl Iterator<Item = u8> {
        (0..=CAPSET_MAX).filter(move |index| self.contains_index(*index))
    }

    /// Members known to this build of the `caps` crate.
    pub fn capabilities(self) -> CapsHashSet {
        self.indices()
            .filter_map(|index| BY_INDEX.get(&index).copied())
            .collect()
    }

    /// Parses `"sys_admin,CAP_NET_RAW"` style lists; `all` selects every
    /// known capability.
    pub fn parse_list(list: &str) -> Result<Self> {
        let mut set = Self::EMPTY;

        for item in list.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            let name = item.to_ascii_uppercase();

            if name == "ALL" {
                set = set.union(caps::all().into_iter().collect());
                continue;
            }

            let name = if name.starts_with("CAP_") {
                name
            } else {
                format!("CAP_{name}")
            };

            let capability = Capability::from_str(&name)
                .map_err(|_| Error::Usage(format!("unknown capability '{item}'")))?;
            set = set.add(capability);
        }

        Ok(set)
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Self::EMPTY, Self::add)
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self
            .indices()
            .map(|index| match BY_INDEX.get(&index) {
                Some(cap) => cap.to_string(),
                None => format!("cap_{index}"),
            })
            .collect::<Vec<_>>();
        write!(f, "[{}]", names.join(","))
    }
}

/// `root default capabilities` in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootCapabilityPolicy {
    Full,
    File,
    Default,
    No,
}

impl FromStr for RootCapabilityPolicy {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "file" => Ok(Self::File),
            "default" => Ok(Self::Default),
            "no" => Ok(Self::No),
            other => Err(Error::Config(format!(
                "root default capabilities must be full, file, default or no, got '{other}'"
            ))),
        }
    }
}

/// Everything the capability policy looks at.
#[derive(Debug, Clone)]
pub struct CapabilityRequest {
    pub invoker_root: bool,
    pub policy: RootCapabilityPolicy,
    pub allow_root_capabilities: bool,
    pub allow_user_capabilities: bool,
    pub keep_privs: bool,
    pub no_privs: bool,
    pub add: CapabilitySet,
    pub drop: CapabilitySet,
    pub user_file: CapabilitySet,
    pub group_file: CapabilitySet,
    pub current_bounding: CapabilitySet,
}

impl CapabilityRequest {
    /// Reads registry flags, configuration and the per-user/group files.
    pub fn gather(
        registry: &Registry,
        config: &Config,
        invoker_root: bool,
        username: &str,
        groups: &[Gid],
    ) -> Result<Self> {
        let add = match registry.get("ADD_CAPS") {
            Some(list) => CapabilitySet::parse_list(list)?,
            None => CapabilitySet::EMPTY,
        };
        let drop = match registry.get("DROP_CAPS") {
            Some(list) => CapabilitySet::parse_list(list)?,
            None => CapabilitySet::EMPTY,
        };

        let store = CapabilityStore::system();

        Ok(Self {
            invoker_root,
            policy: config.get(config::ROOT_DEFAULT_CAPABILITIES)?.parse()?,
            allow_root_capabilities: config.get_bool(config::ALLOW_ROOT_CAPABILITIES)?,
            allow_user_capabilities: config.get_bool(config::ALLOW_USER_CAPABILITIES)?,
            keep_privs: registry.is_set("KEEP_PRIVS"),
            no_privs: registry.is_set("NO_PRIVS"),
            add,
            drop,
            user_file: store.user(username)?,
            group_file: store.groups(groups)?,
            current_bounding: CapabilityManager::bounding_set()?,
        })
    }

    /// Resolves the target set.
    ///
    /// For root, `NO_PRIVS` beats everything, then `KEEP_PRIVS`, then the
    /// configured policy. Non-root invokers only ever get what they asked for
    /// and were granted by both the user and the group files.
    pub fn compute(&self) -> CapabilitySet {
        if !self.invoker_root {
            if !self.allow_user_capabilities {
                return CapabilitySet::EMPTY;
            }

            return self
                .add
                .intersect(self.user_file)
                .intersect(self.group_file)
                .difference(self.drop);
        }

        if self.no_privs {
            return CapabilitySet::EMPTY;
        }

        if self.keep_privs {
            return self.current_bounding;
        }

        let add = if self.allow_root_capabilities {
            self.add
        } else {
            CapabilitySet::EMPTY
        };

        let set = match self.policy {
            RootCapabilityPolicy::Full => self.current_bounding,
            RootCapabilityPolicy::Default => CapabilitySet::default_set().union(add),
            RootCapabilityPolicy::File => CapabilitySet::default_set()
                .union(add)
                .union(self.user_file)
                .union(self.group_file),
            RootCapabilityPolicy::No => add,
        };

        set.difference(self.drop)
    }

    /// Whether the target set should also be raised into the ambient set.
    pub fn wants_ambient(&self) -> bool {
        if self.invoker_root {
            !self.no_privs
        } else {
            self.allow_user_capabilities
        }
    }
}

/// Per-user and per-group capability files: a decimal 64-bit mask each.
#[derive(Debug, Clone)]
pub struct CapabilityStore {
    dir: PathBuf,
}

impl CapabilityStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn system() -> Self {
        Self::new(Path::new(config::SYSCONFDIR).join("singularity/capabilities"))
    }

    pub fn user(&self, name: &str) -> Result<CapabilitySet> {
        self.read(&format!("user.{name}"))
    }

    /// Union over every eligible group of the caller.
    pub fn groups(&self, gids: &[Gid]) -> Result<CapabilitySet> {
        let mut set = CapabilitySet::EMPTY;

        for gid in gids {
            if gid.as_raw() < MIN_CAPABILITY_GID || gid.as_raw() == u32::MAX {
                trace!(%gid, "group not eligible for file capabilities");
                continue;
            }

            let Some(group) = Group::from_gid(*gid).context("Failed to look up group")? else {
                continue;
            };

            set = set.union(self.read(&format!("group.{}", group.name))?);
        }

        Ok(set)
    }

    fn read(&self, name: &str) -> Result<CapabilitySet> {
        if name.contains('/') {
            bail!(Error::Config(format!("invalid capability file name '{name}'")));
        }

        let path = self.dir.join(name);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CapabilitySet::EMPTY);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read {}", path.display()));
            }
        };

        let bits = contents.trim().parse::<u64>().map_err(|err| {
            Error::Config(format!("invalid capability mask in {}: {err}", path.display()))
        })?;

        Ok(CapabilitySet::from_bits(bits))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CapabilityConfig {
    /// Raise the target set into the ambient set.
    pub ambient: bool,

    /// Latch securebits so the set survives the final uid change.
    pub latch_securebits: bool,
}

#[derive(Debug)]
pub(crate) struct CapabilityManager {
    config: CapabilityConfig,
}

impl CapabilityManager {
    pub fn with_config(config: CapabilityConfig) -> Self {
        Self { config }
    }

    /// Get the current snapshot of all capability sets
    pub fn current() -> Result<CapabilitySnapshot> {
        Ok(CapabilitySnapshot {
            effective: Self::read_capability_set(CapSet::Effective)
                .context("Failed to read effective capabilities")?,
            permitted: Self::read_capability_set(CapSet::Permitted)
                .context("Failed to read permitted capabilities")?,
            inheritable: Self::read_capability_set(CapSet::Inheritable)
                .context("Failed to read inheritable capabilities")?,
            bounding: Self::read_capability_set(CapSet::Bounding)
                .context("Failed to read bounding capabilities")?,
            ambient: Self::read_capability_set(CapSet::Ambient)
                .context("Failed to read ambient capabilities")?,
        })
    }

    /// Highest index the kernel answers `PR_CAPBSET_READ` for.
    pub fn high_water_mark() -> Result<u8> {
        (0..=CAPSET_MAX)
            .rev()
            .find(|index| capbset_read(*index).is_some())
            .ok_or_else(|| Error::Privilege("PR_CAPBSET_READ is not supported".into()).into())
    }

    /// Current bounding set as a bitmask.
    pub fn bounding_set() -> Result<CapabilitySet> {
        let high = Self::high_water_mark()?;
        Ok(CapabilitySet::from_bits(
            (0..=high)
                .filter(|index| capbset_read(*index) == Some(true))
                .fold(0u64, |bits, index| bits | (1u64 << index)),
        ))
    }

    /// Restricts the process to `target`.
    ///
    /// Safe to call repeatedly; securebits are only written while they are
    /// not yet latched.
    pub fn apply(&self, target: CapabilitySet) -> Result<()> {
        let high = Self::high_water_mark()?;
        debug!(%target, high, "applying capability set");

        for index in 0..=high {
            if target.contains_index(index) || capbset_read(index) != Some(true) {
                continue;
            }

            let ret = unsafe { prctl(PR_CAPBSET_DROP, c_ulong::from(index), 0, 0, 0) };
            if ret != 0 {
                bail!(Error::Privilege(format!(
                    "failed to drop capability {index} from the bounding set: {}",
                    std::io::Error::last_os_error()
                )));
            }
        }

        let bounding = Self::bounding_set()?;
        let expected = target.intersect(CapabilitySet::from_bits(mask_up_to(high)));
        if bounding.difference(expected) != CapabilitySet::EMPTY {
            bail!(Error::Privilege(format!(
                "bounding set is {bounding}, expected {target}"
            )));
        }

        let wanted = target.capabilities();

        let ambient_supported = caps::runtime::ambient_set_supported().is_ok();

        if self.config.ambient && ambient_supported && !wanted.is_empty() {
            self.set_capability_set(CapSet::Inheritable, &wanted)?;
            for capability in &wanted {
                caps::raise(None, CapSet::Ambient, *capability).map_err(|err| {
                    Error::Privilege(format!("failed to raise ambient {capability}: {err}"))
                })?;
            }
        } else {
            self.clear_capability_set(CapSet::Inheritable)?;
            if ambient_supported {
                self.clear_capability_set(CapSet::Ambient)?;
            }
        }

        if self.config.latch_securebits {
            latch_securebits()?;
        }

        Ok(())
    }

    /// Narrows effective and permitted to `keep`. Effective is written
    /// first as it must stay within permitted.
    pub fn limit_permitted(keep: CapabilitySet) -> Result<()> {
        let permitted = Self::read_capability_set(CapSet::Permitted)?;
        let wanted: CapsHashSet = keep.capabilities().intersection(&permitted).copied().collect();

        for cap_set in [CapSet::Effective, CapSet::Permitted] {
            caps::set(None, cap_set, &wanted)
                .map_err(|err| Error::Privilege(format!("failed to limit {cap_set:?} set: {err}")))?;
        }

        let left = Self::read_capability_set(CapSet::Permitted)?;
        if !left.is_subset(&wanted) {
            bail!(Error::Privilege(format!(
                "permitted set still holds {} capabilities, expected at most {}",
                left.len(),
                wanted.len()
            )));
        }

        Ok(())
    }

    fn set_capability_set(&self, cap_set: CapSet, capabilities: &CapsHashSet) -> Result<()> {
        caps::set(None, cap_set, capabilities)
            .map_err(|err| Error::Privilege(format!("failed to set {cap_set:?} set: {err}")))?;
        Ok(())
    }

    fn read_capability_set(cap_set: CapSet) -> Result<CapsHashSet> {
        caps::read(None, cap_set).context(format!("Failed to read {:?} capability set", cap_set))
    }

    fn clear_capability_set(&self, cap_set: CapSet) -> Result<()> {
        caps::clear(None, cap_set)
            .map_err(|err| Error::Privilege(format!("failed to clear {cap_set:?} set: {err}")))?;
        Ok(())
    }
}

/// Represents the current state of process capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    pub effective: CapsHashSet,
    pub permitted: CapsHashSet,
    pub inheritable: CapsHashSet,
    pub bounding: CapsHashSet,
    pub ambient: CapsHashSet,
}

impl fmt::Display for CapabilitySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capabilities - ")?;
        write!(f, "Effective: {}, ", self.effective.len())?;
        write!(f, "Permitted: {}, ", self.permitted.len())?;
        write!(f, "Inheritable: {}, ", self.inheritable.len())?;
        write!(f, "Bounding: {}, ", self.bounding.len())?;
        write!(f, "Ambient: {}", self.ambient.len())
    }
}

pub(crate) fn log_capability_snapshot(label: &str) {
    match CapabilityManager::current() {
        Ok(snapshot) => debug!(%snapshot, "{label}"),
        Err(err) => warn!("{label}: cannot read capabilities: {err:#}"),
    }
}

pub(crate) fn has_any_permitted_capabilities() -> Result<bool> {
    let capabilities = CapabilityManager::read_capability_set(CapSet::Permitted)?;
    Ok(!capabilities.is_empty())
}

fn capbset_read(index: u8) -> Option<bool> {
    let ret = unsafe { prctl(PR_CAPBSET_READ, c_ulong::from(index), 0, 0, 0) };
    match ret {
        r if r < 0 => None,
        0 => Some(false),
        _ => Some(true),
    }
}

fn mask_up_to(high: u8) -> u64 {
    if high >= CAPSET_MAX {
        u64::MAX
    } else {
        (1u64 << (high + 1)) - 1
    }
}

fn latch_securebits() -> Result<()> {
    let current = unsafe { prctl(PR_GET_SECUREBITS, 0, 0, 0, 0) };
    if current < 0 {
        bail!(Error::Privilege(format!(
            "PR_GET_SECUREBITS failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    let current = current as c_ulong;
    if current & LATCHED_SECUREBITS == LATCHED_SECUREBITS {
        trace!("securebits already latched");
        return Ok(());
    }

    let ret = unsafe { prctl(PR_SET_SECUREBITS, current | LATCHED_SECUREBITS, 0, 0, 0) };
    if ret != 0 {
        bail!(Error::Privilege(format!(
            "PR_SET_SECUREBITS failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}
