use super::{Composer, MountOps};
use crate::{
    config,
    error::Error,
    utils::{self, join_inside},
};
use anyhow::{Result, bail};
use nix::mount::MsFlags;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

const STAGING_DIR: &str = "home";
const CONTAINED_HOME: &str = "home.tmp";

/// Where the home directory comes from on the host and where it appears in
/// the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeSpec {
    pub source: PathBuf,
    pub dest: PathBuf,
}

impl HomeSpec {
    /// `HOME` override syntax, `src[:dst]`.
    pub fn parse(value: &str) -> Result<Self> {
        let (source, dest) = match value.split_once(':') {
            Some((source, dest)) => (source, dest),
            None => (value, value),
        };

        let spec = Self {
            source: PathBuf::from(source),
            dest: PathBuf::from(dest),
        };

        if !spec.source.is_absolute() || !spec.dest.is_absolute() || spec.dest == Path::new("/") {
            bail!(Error::Usage(format!("invalid home specification '{value}'")));
        }

        Ok(spec)
    }
}

pub(super) fn mount<O: MountOps>(composer: &Composer<'_, O>) -> Result<()> {
    if !composer.config.get_bool(config::MOUNT_HOME)? {
        debug!("not mounting home by configuration");
        return Ok(());
    }

    let spec = resolve(composer)?;
    let tree = composer.tree();
    let mounter = composer.mounter();
    let flags = MsFlags::MS_REC | composer.restrictive_flags();

    if !spec.source.is_dir() {
        bail!("home source {} is not a directory", spec.source.display());
    }
    if !composer.options.invoker_root {
        utils::ensure_owner(&spec.source, composer.privileges.effective_identity().uid.as_raw())?;
    }

    let staging_root = tree.session().join(STAGING_DIR);
    let staging = join_inside(&staging_root, &spec.dest);
    utils::create_directory_recursive(&staging, 0o755)?;

    debug!(source = %spec.source.display(), dest = %spec.dest.display(), "mounting home");
    mounter.require(mounter.bind(&spec.source, &staging, flags)?, &staging)?;

    if let Some(target) = composer.ensure_target(&spec.dest, true)? {
        mounter.bind(&staging, &target, flags)?;
        return Ok(());
    }

    // Without an overlay the home path cannot be created, so its first
    // component is replaced wholesale by the staging tree.
    let Some(top) = first_component(&spec.dest) else {
        bail!("cannot place home at {}", spec.dest.display());
    };
    let target = tree.in_container(&top);
    if !target.is_dir() {
        bail!("container has no {} to hold home", top.display());
    }

    mounter.bind(&join_inside(&staging_root, &top), &target, flags)?;
    Ok(())
}

fn resolve<O: MountOps>(composer: &Composer<'_, O>) -> Result<HomeSpec> {
    if let Some(value) = composer.registry.get("HOME") {
        return HomeSpec::parse(value);
    }

    let home = composer.privileges.home().clone();

    if !composer.options.contain {
        return Ok(HomeSpec {
            source: home.clone(),
            dest: home,
        });
    }

    let source = match composer.registry.get("WORKDIR") {
        Some(workdir) => Path::new(workdir).join("home"),
        None => composer.tree().session().join(CONTAINED_HOME),
    };
    utils::create_directory_recursive(&source, 0o755)?;

    Ok(HomeSpec { source, dest: home })
}

fn first_component(path: &Path) -> Option<PathBuf> {
    path.components().find_map(|component| match component {
        Component::Normal(part) => Some(Path::new("/").join(part)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_home_override_syntax() -> Result<()> {
        let same = HomeSpec::parse("/home/alice")?;
        assert_eq!(same.source, same.dest);

        let moved = HomeSpec::parse("/scratch/alice:/home/alice")?;
        assert_eq!(moved.source, PathBuf::from("/scratch/alice"));
        assert_eq!(moved.dest, PathBuf::from("/home/alice"));

        assert!(HomeSpec::parse("relative").is_err());
        assert!(HomeSpec::parse("/scratch/alice:/").is_err());
        Ok(())
    }

    #[test]
    fn test_first_component() {
        assert_eq!(first_component(Path::new("/home/alice")), Some(PathBuf::from("/home")));
        assert_eq!(first_component(Path::new("/")), None);
    }
}
