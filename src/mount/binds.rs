use super::{Composer, MountOps};
use crate::{config, error::Error, hardener};
use anyhow::{Context, Result, bail};
use nix::mount::MsFlags;
use std::{
    fs,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// One `src[:dst[:ro|rw]]` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub read_only: bool,
}

impl BindSpec {
    pub fn parse(entry: &str) -> Result<Self> {
        let mut parts = entry.trim().splitn(3, ':');
        let source = parts.next().unwrap_or_default();
        let dest = parts.next().filter(|dest| !dest.is_empty()).unwrap_or(source);
        let read_only = match parts.next() {
            None | Some("rw") => false,
            Some("ro") => true,
            Some(other) => bail!(Error::Usage(format!(
                "bind option must be ro or rw, got '{other}' in '{entry}'"
            ))),
        };

        if source.is_empty() || !source.starts_with('/') || !dest.starts_with('/') {
            bail!(Error::Usage(format!("bind paths must be absolute: '{entry}'")));
        }

        Ok(Self {
            source: PathBuf::from(source),
            dest: PathBuf::from(dest),
            read_only,
        })
    }

    /// Parses a comma separated list, skipping empty items.
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        list.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(Self::parse)
            .collect()
    }
}

/// `BINDPATH` from the environment.
pub(super) fn mount_user<O: MountOps>(composer: &Composer<'_, O>) -> Result<()> {
    let entries = composer.registry.get_multi("BINDPATH");
    if entries.is_empty() {
        return Ok(());
    }

    if !composer.config.get_bool(config::USER_BIND_CONTROL)? {
        bail!(Error::Policy("user bind control is disabled by configuration".into()));
    }

    if !hardener::no_new_privs_supported() {
        bail!(Error::Policy(
            "user binds need PR_SET_NO_NEW_PRIVS, which this kernel lacks".into()
        ));
    }

    for entry in entries {
        let specs = match BindSpec::parse_list(entry) {
            Ok(specs) => specs,
            Err(err) => {
                warn!("ignoring BINDPATH entry: {err:#}");
                continue;
            }
        };

        for spec in specs {
            if let Err(err) = bind(composer, &spec) {
                warn!(source = %spec.source.display(), "skipping user bind: {err:#}");
            }
        }
    }

    Ok(())
}

/// `bind path` entries from the configuration.
pub(super) fn mount_admin<O: MountOps>(composer: &Composer<'_, O>) -> Result<()> {
    for entry in composer.config.get_multi(config::BIND_PATH) {
        let spec = match BindSpec::parse(entry) {
            Ok(spec) => spec,
            Err(err) => {
                warn!("ignoring bind path entry: {err:#}");
                continue;
            }
        };

        if let Err(err) = bind(composer, &spec) {
            warn!(source = %spec.source.display(), "skipping bind path: {err:#}");
        }
    }

    Ok(())
}

/// Makes the invoker's working directory reachable unless the container
/// already shows the same directory there.
pub(super) fn mount_cwd<O: MountOps>(composer: &Composer<'_, O>) -> Result<()> {
    if composer.options.contain {
        return Ok(());
    }

    let Some(cwd) = composer.options.cwd.as_deref() else {
        return Ok(());
    };
    if cwd == Path::new("/") {
        return Ok(());
    }

    let inside = composer.tree().in_container(cwd);
    if inside.exists() {
        if same_inode(cwd, &inside)? {
            debug!(cwd = %cwd.display(), "working directory already visible");
        } else {
            debug!(cwd = %cwd.display(), "container has its own directory at the working directory path");
        }
        return Ok(());
    }

    bind(
        composer,
        &BindSpec {
            source: cwd.to_path_buf(),
            dest: cwd.to_path_buf(),
            read_only: false,
        },
    )
}

fn bind<O: MountOps>(composer: &Composer<'_, O>, spec: &BindSpec) -> Result<()> {
    let metadata = fs::metadata(&spec.source)
        .with_context(|| format!("bind source {} does not exist", spec.source.display()))?;

    let Some(target) = composer.ensure_target(&spec.dest, metadata.is_dir())? else {
        bail!("{} does not exist in the container", spec.dest.display());
    };

    let mounter = composer.mounter();
    let flags = MsFlags::MS_REC | composer.restrictive_flags();

    if !mounter.bind(&spec.source, &target, flags)? {
        bail!("{} refused", spec.dest.display());
    }

    if spec.read_only {
        mounter.remount(&target, MsFlags::MS_BIND | MsFlags::MS_RDONLY | composer.restrictive_flags())?;
    }

    debug!(source = %spec.source.display(), dest = %spec.dest.display(), read_only = spec.read_only, "bound");
    Ok(())
}

fn same_inode(a: &Path, b: &Path) -> Result<bool> {
    let a = fs::metadata(a)?;
    let b = fs::metadata(b)?;
    Ok(a.dev() == b.dev() && a.ino() == b.ino())
}
