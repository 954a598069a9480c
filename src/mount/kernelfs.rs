use super::{Composer, MountOps};
use crate::config;
use anyhow::Result;
use nix::mount::MsFlags;
use std::path::Path;
use tracing::{debug, warn};

/// `/proc` and `/sys`.
pub(super) fn mount<O: MountOps>(composer: &Composer<'_, O>) -> Result<()> {
    if composer.config.get_bool(config::MOUNT_PROC)? {
        mount_proc(composer)?;
    } else {
        debug!("not mounting /proc by configuration");
    }

    if composer.config.get_bool(config::MOUNT_SYS)? {
        mount_sys(composer)?;
    } else {
        debug!("not mounting /sys by configuration");
    }

    Ok(())
}

fn mount_proc<O: MountOps>(composer: &Composer<'_, O>) -> Result<()> {
    let Some(target) = composer.ensure_target(Path::new("/proc"), true)? else {
        warn!("container has no /proc directory");
        return Ok(());
    };

    let mounter = composer.mounter();
    let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;

    if composer.options.pid_namespace {
        debug!("mounting a new procfs for the PID namespace");
        mounter.mount(Some(Path::new("proc")), &target, Some("proc"), flags, None)?;
    } else {
        mounter.bind(Path::new("/proc"), &target, MsFlags::MS_REC | MsFlags::MS_NOSUID)?;
    }

    Ok(())
}

fn mount_sys<O: MountOps>(composer: &Composer<'_, O>) -> Result<()> {
    let Some(target) = composer.ensure_target(Path::new("/sys"), true)? else {
        warn!("container has no /sys directory");
        return Ok(());
    };

    let mounter = composer.mounter();

    if composer.options.userns {
        mounter.bind(Path::new("/sys"), &target, MsFlags::MS_REC | MsFlags::MS_NOSUID)?;
    } else {
        let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
        mounter.mount(Some(Path::new("sysfs")), &target, Some("sysfs"), flags, None)?;
    }

    Ok(())
}
