use super::Image;
use crate::mount::{MountOps, Mounter};
use anyhow::Result;
use nix::mount::MsFlags;
use tracing::debug;

const OPTIONS: &str = "errors=remount-ro";

pub(super) fn mount<O: MountOps>(
    image: &Image,
    mounter: &Mounter<'_, O>,
    invoker_root: bool,
) -> Result<()> {
    let device = image.require_loop_device()?;
    let target = mounter.tree().source();

    let mut flags = MsFlags::MS_NOSUID;
    if !invoker_root {
        flags |= MsFlags::MS_NODEV;
    }
    if !image.writable() {
        flags |= MsFlags::MS_RDONLY;
    }

    let mounted = match mounter.mount(Some(device.path()), target, Some("ext3"), flags, Some(OPTIONS)) {
        Ok(mounted) => mounted,
        Err(err) => {
            debug!("ext3 mount failed, trying ext4: {err:#}");
            mounter.mount(Some(device.path()), target, Some("ext4"), flags, Some(OPTIONS))?
        }
    };

    mounter.require(mounted, target)
}
