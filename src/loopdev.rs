//! Loop device allocation for image files.

use crate::{
    config::{self, Config},
    context::Escalation,
    error::Error,
};
use anyhow::{Context, Result, bail};
use nix::{
    errno::Errno,
    ioctl_none_bad, ioctl_read_bad, ioctl_write_int_bad, ioctl_write_ptr_bad,
    sys::stat::{Mode, SFlag, makedev, mknod},
};
use std::{
    fs::{File, OpenOptions},
    os::{
        fd::{AsRawFd, BorrowedFd},
        unix::fs::OpenOptionsExt,
    },
    path::{Path, PathBuf},
};
use tracing::{debug, trace, warn};

const LOOP_MAJOR: u64 = 7;

pub const LO_FLAGS_AUTOCLEAR: u32 = 4;

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

ioctl_write_int_bad!(loop_set_fd, 0x4C00);
ioctl_none_bad!(loop_clr_fd, 0x4C01);
ioctl_write_ptr_bad!(loop_set_status64, 0x4C04, LoopInfo64);
ioctl_read_bad!(loop_get_status64, 0x4C05, LoopInfo64);

/// `struct loop_info64` from `<linux/loop.h>`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LoopInfo64 {
    pub lo_device: u64,
    pub lo_inode: u64,
    pub lo_rdevice: u64,
    pub lo_offset: u64,
    pub lo_sizelimit: u64,
    pub lo_number: u32,
    pub lo_encrypt_type: u32,
    pub lo_encrypt_key_size: u32,
    pub lo_flags: u32,
    pub lo_file_name: [u8; LO_NAME_SIZE],
    pub lo_crypt_name: [u8; LO_NAME_SIZE],
    pub lo_encrypt_key: [u8; LO_KEY_SIZE],
    pub lo_init: [u64; 2],
}

impl LoopInfo64 {
    pub fn zeroed() -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }

    fn for_offset(offset: u64) -> Self {
        Self {
            lo_offset: offset,
            lo_flags: LO_FLAGS_AUTOCLEAR,
            ..Self::zeroed()
        }
    }
}

/// A bound `/dev/loopN`. The kernel releases it once the last user closes it.
#[derive(Debug)]
pub struct LoopDevice {
    path: PathBuf,
    file: File,
}

impl LoopDevice {
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self) -> Result<LoopInfo64> {
        let mut info = LoopInfo64::zeroed();
        // SAFETY: `info` is a valid, writable `loop_info64`.
        unsafe { loop_get_status64(self.file.as_raw_fd(), &mut info) }
            .with_context(|| format!("LOOP_GET_STATUS64 on {}", self.path.display()))?;
        Ok(info)
    }

    /// Opens a device bound by someone else and checks it still serves the
    /// expected backing file at the expected offset.
    pub fn open_existing(path: &Path, dev: u64, ino: u64, offset: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(nix::libc::O_CLOEXEC)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        let device = Self {
            path: path.to_path_buf(),
            file,
        };

        let info = device.status()?;
        if info.lo_device != dev || info.lo_inode != ino || info.lo_offset != offset {
            bail!(Error::Resource(format!(
                "{} no longer serves image {dev}.{ino} at offset {offset}",
                path.display()
            )));
        }

        Ok(device)
    }
}

#[derive(Debug, Clone)]
pub struct LoopManager {
    dev_dir: PathBuf,
    max_devices: u32,
}

impl LoopManager {
    pub fn new(max_devices: u32) -> Self {
        Self {
            dev_dir: PathBuf::from("/dev"),
            max_devices,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(config.get_parsed::<u32>(config::MAX_LOOP_DEVS)?))
    }

    fn device_path(&self, index: u32) -> PathBuf {
        self.dev_dir.join(format!("loop{index}"))
    }

    /// Binds `backing` at `offset` to the first free loop device.
    pub fn attach(
        &self,
        _escalation: &Escalation,
        backing: BorrowedFd<'_>,
        offset: u64,
        writable: bool,
    ) -> Result<LoopDevice> {
        for index in 0..self.max_devices {
            let path = self.device_path(index);

            if !path.exists() {
                trace!(path = %path.display(), "creating loop device node");
                if let Err(err) = mknod(
                    &path,
                    SFlag::S_IFBLK,
                    Mode::from_bits_truncate(0o660),
                    makedev(LOOP_MAJOR, u64::from(index)),
                ) {
                    warn!(path = %path.display(), "cannot create loop device: {err}");
                    continue;
                }
            }

            let file = match OpenOptions::new()
                .read(true)
                .write(writable)
                .custom_flags(nix::libc::O_CLOEXEC)
                .open(&path)
            {
                Ok(file) => file,
                Err(err) => {
                    warn!(path = %path.display(), "cannot open loop device: {err}");
                    continue;
                }
            };

            // SAFETY: both descriptors are open for the duration of the call.
            match unsafe { loop_set_fd(file.as_raw_fd(), backing.as_raw_fd()) } {
                Ok(_) => {}
                Err(Errno::EBUSY) => continue,
                Err(err) => {
                    warn!(path = %path.display(), "LOOP_SET_FD failed: {err}");
                    continue;
                }
            }

            let info = LoopInfo64::for_offset(offset);
            // SAFETY: `info` outlives the call.
            if let Err(err) = unsafe { loop_set_status64(file.as_raw_fd(), &info) } {
                // SAFETY: the device was bound above.
                let _ = unsafe { loop_clr_fd(file.as_raw_fd()) };
                bail!(Error::Resource(format!(
                    "failed to set loop status on {}: {err}",
                    path.display()
                )));
            }

            debug!(path = %path.display(), offset, writable, "loop device attached");
            return Ok(LoopDevice { path, file });
        }

        bail!(Error::Resource(format!(
            "no free loop device among the first {}",
            self.max_devices
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_info_layout() {
        assert_eq!(std::mem::size_of::<LoopInfo64>(), 232);
    }

    #[test]
    fn test_status_for_offset_sets_autoclear() {
        let info = LoopInfo64::for_offset(31);
        assert_eq!(info.lo_offset, 31);
        assert_eq!(info.lo_flags & LO_FLAGS_AUTOCLEAR, LO_FLAGS_AUTOCLEAR);
        // LO_FLAGS_READ_ONLY comes from the open mode, never from us.
        assert_eq!(info.lo_flags & 1, 0);
    }

    #[test]
    fn test_device_paths() {
        let manager = LoopManager::new(8);
        assert_eq!(manager.device_path(3), PathBuf::from("/dev/loop3"));
    }
}
