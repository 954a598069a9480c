use super::{Composer, MountOps};
use crate::{config, utils};
use anyhow::{Result, bail};
use nix::mount::MsFlags;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const SCRATCH_DIR: &str = "scratch";

/// `/tmp` and `/var/tmp`, from the host or from private storage under
/// `CONTAIN`.
pub(super) fn mount<O: MountOps>(composer: &Composer<'_, O>) -> Result<()> {
    if !composer.config.get_bool(config::MOUNT_TMP)? {
        debug!("not mounting temporary directories by configuration");
        return Ok(());
    }

    for (inner, private_name) in [("/tmp", "tmp"), ("/var/tmp", "var_tmp")] {
        let source = if composer.options.contain {
            let source = private_root(composer).join(private_name);
            utils::create_directory_recursive(&source, 0o750)?;
            source
        } else {
            PathBuf::from(inner)
        };

        if !source.is_dir() {
            warn!(source = %source.display(), "temporary directory source missing");
            continue;
        }

        let Some(target) = composer.ensure_target(Path::new(inner), true)? else {
            warn!(path = inner, "container has no mount point for temporary directory");
            continue;
        };

        composer
            .mounter()
            .bind(&source, &target, MsFlags::MS_REC | composer.restrictive_flags())?;
    }

    Ok(())
}

/// `SCRATCHDIR`: comma separated container paths backed by fresh private
/// directories.
pub(super) fn mount_scratch<O: MountOps>(composer: &Composer<'_, O>) -> Result<()> {
    let paths = composer.registry.get_list("SCRATCHDIR");
    if paths.is_empty() {
        return Ok(());
    }

    let root = private_root(composer).join(SCRATCH_DIR);

    for path in paths {
        let inner = Path::new(&path);
        let Some(name) = scratch_name(inner) else {
            warn!(path, "ignoring invalid scratch path");
            continue;
        };

        let source = root.join(name);
        utils::create_directory_recursive(&source, 0o750)?;

        let Some(target) = composer.ensure_target(inner, true)? else {
            warn!(path, "scratch path does not exist in the container");
            continue;
        };

        let mounted = composer
            .mounter()
            .bind(&source, &target, MsFlags::MS_REC | composer.restrictive_flags())?;
        if !mounted {
            bail!("scratch directory {path} refused");
        }
    }

    Ok(())
}

/// `WORKDIR` when set, the session directory otherwise.
fn private_root<O: MountOps>(composer: &Composer<'_, O>) -> PathBuf {
    match composer.registry.get("WORKDIR") {
        Some(workdir) => PathBuf::from(workdir),
        None => composer.tree().session().to_path_buf(),
    }
}

fn scratch_name(path: &Path) -> Option<String> {
    if !path.is_absolute() {
        return None;
    }
    path.file_name().map(|name| name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_names() {
        assert_eq!(scratch_name(Path::new("/scratch/data")), Some("data".to_string()));
        assert_eq!(scratch_name(Path::new("data")), None);
        assert_eq!(scratch_name(Path::new("/")), None);
    }
}
