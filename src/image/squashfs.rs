use super::Image;
use crate::mount::{MountOps, Mounter};
use anyhow::{Context, Result};
use nix::{errno::Errno, mount::MsFlags};
use tracing::debug;

const OPTIONS: &str = "errors=remount-ro";

pub(super) fn mount<O: MountOps>(image: &Image, mounter: &Mounter<'_, O>) -> Result<()> {
    if image.writable() {
        return Err(Errno::EROFS).context("squashfs images cannot be mounted writable");
    }

    let device = image.require_loop_device()?;
    let target = mounter.tree().source();
    let flags = MsFlags::MS_NOSUID | MsFlags::MS_RDONLY | MsFlags::MS_NODEV;

    let mounted = match mounter.mount(Some(device.path()), target, Some("squashfs"), flags, Some(OPTIONS)) {
        Err(err) if err.root_cause().downcast_ref::<Errno>() == Some(&Errno::EINVAL) => {
            debug!("squashfs rejected '{OPTIONS}', mounting without options");
            mounter.mount(Some(device.path()), target, Some("squashfs"), flags, None)?
        }
        other => other?,
    };

    mounter.require(mounted, target)
}
