use super::{Composer, MountOps};
use crate::{checks, config, utils};
use anyhow::Result;
use nix::mount::MsFlags;
use std::path::Path;
use tracing::{debug, info};

/// Builds `final` either as an overlay over `source` or as a plain bind of
/// it. Returns whether the overlay is active.
pub(super) fn setup<O: MountOps>(composer: &Composer<'_, O>) -> Result<bool> {
    let tree = composer.tree();
    let mounter = composer.mounter();

    if !wanted(composer)? {
        let flags = MsFlags::MS_REC | composer.restrictive_flags();
        mounter.require(mounter.bind(tree.source(), tree.final_dir(), flags)?, tree.final_dir())?;
        debug!("final is a bind of source");
        return Ok(false);
    }

    let restrictive = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    mounter.require(
        mounter.mount(Some(Path::new("tmpfs")), tree.overlay(), Some("tmpfs"), restrictive, Some("mode=0755"))?,
        tree.overlay(),
    )?;

    let upper = tree.upper();
    let work = tree.work();
    mounter.with_escalated(|| {
        utils::create_directory_recursive(&upper, 0o755)?;
        utils::create_directory_recursive(&work, 0o755)
    })?;

    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        tree.source().display(),
        upper.display(),
        work.display()
    );

    mounter.require(
        mounter.mount(Some(Path::new("overlay")), tree.final_dir(), Some("overlay"), MsFlags::MS_NOSUID, Some(&options))?,
        tree.final_dir(),
    )?;

    info!("overlay enabled");
    Ok(true)
}

fn wanted<O: MountOps>(composer: &Composer<'_, O>) -> Result<bool> {
    if !composer.config.get_bool(config::ENABLE_OVERLAY)? {
        debug!("overlay disabled by configuration");
        return Ok(false);
    }

    if composer.image.writable() {
        debug!("writable image, overlay not needed");
        return Ok(false);
    }

    if composer.options.userns {
        debug!("overlay unavailable in a user namespace");
        return Ok(false);
    }

    Ok(checks::is_overlay_supported())
}
