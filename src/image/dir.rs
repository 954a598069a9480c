use super::Image;
use crate::{
    error::Error,
    mount::{MountOps, Mounter},
};
use anyhow::{Result, bail};
use nix::mount::MsFlags;
use std::path::Path;

pub(super) fn mount<O: MountOps>(
    image: &Image,
    mounter: &Mounter<'_, O>,
    invoker_root: bool,
) -> Result<()> {
    if image.path() == Path::new("/") {
        bail!(Error::Policy("refusing to use / as a container root".into()));
    }

    let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_REC;
    if !invoker_root {
        flags |= MsFlags::MS_NODEV;
    }

    let target = mounter.tree().source();
    mounter.require(mounter.bind(image.path(), target, flags)?, target)?;

    if !image.writable() {
        mounter.remount(target, MsFlags::MS_BIND | MsFlags::MS_RDONLY | flags)?;
    }

    Ok(())
}
