//! Per-image session directory: the shared-lock rendezvous between
//! concurrent invocations, the cached loop device and the cleanup watchdog.

use crate::{
    config::{self, Config},
    error::Error,
    image::Image,
    loopdev::LoopDevice,
    privilege::PrivilegeManager,
    registry::Registry,
    utils::{self, Lock, LockMode},
};
use anyhow::{Context, Result, bail};
use nix::{
    errno::Errno,
    fcntl::{Flock, OFlag},
    sys::signal::{SigHandler, Signal, signal},
    unistd::{ForkResult, Uid, fork, pipe2, read},
};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    os::{fd::OwnedFd, unix::fs::OpenOptionsExt},
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

pub const LOOP_LOCK: &str = "loop_lock";

const SESSION_DIR_NAME: &str = "singularity-session-";

/// Attempts at the loop lock before giving up on an unreadable record.
const LOOP_LOCK_ATTEMPTS: usize = 3;

/// What the binder leaves in `loop_lock` for the others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopRecord {
    pub device: PathBuf,
    pub offset: u64,
    pub image_id: String,
}

impl LoopRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .context("Failed to encode loop record")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .context("Failed to decode loop record")?;
        Ok(record)
    }
}

/// Session directory path for `uid` and the image identity.
///
/// `SESSIONDIR` names a directory that receives a `singularity-session-*`
/// child; the configured prefix is concatenated as is.
pub fn session_path(registry: &Registry, config: &Config, uid: Uid, image: &Image) -> Result<PathBuf> {
    let identity = format!("{}.{}.{}", uid, image.dev(), image.ino());

    if let Some(dir) = registry.get("SESSIONDIR") {
        return Ok(Path::new(dir).join(format!("{SESSION_DIR_NAME}{identity}")));
    }

    let prefix = config.get(config::SESSIONDIR_PREFIX)?;
    Ok(PathBuf::from(format!("{prefix}{identity}")))
}

/// A bound loop device as the session sees it.
pub trait CachedDevice: Sized {
    fn device_path(&self) -> &Path;

    /// Opens the device another participant bound and recorded.
    fn reopen(record: &LoopRecord, image: &Image) -> Result<Self>;
}

impl CachedDevice for LoopDevice {
    fn device_path(&self) -> &Path {
        self.path()
    }

    fn reopen(record: &LoopRecord, image: &Image) -> Result<Self> {
        LoopDevice::open_existing(&record.device, image.dev(), image.ino(), image.offset())
    }
}

#[derive(Debug)]
pub struct Session {
    path: PathBuf,
    lock: Option<Flock<File>>,
    loop_lock: Option<Flock<File>>,
    cleanup: bool,
    rundir: Option<PathBuf>,
    watchdog: Option<OwnedFd>,
}

impl Session {
    /// Creates (or joins) the session directory and takes the shared lock.
    /// Runs with the caller's current credentials.
    pub fn create(path: PathBuf, owner: Uid, registry: &Registry) -> Result<Self> {
        utils::create_directory_recursive(&path, 0o755)?;
        utils::ensure_owner(&path, owner.as_raw())?;

        let Lock::Held(dir) = utils::lock(open_directory(&path)?, LockMode::Shared, true)? else {
            bail!(Error::Resource(format!(
                "cannot take shared lock on {}",
                path.display()
            )));
        };

        let cleanup = !(registry.is_set("NO_SESSION_CLEANUP") || registry.is_set("NO_CLEANUP"));
        let rundir = registry.get("RUNDIR").map(PathBuf::from);

        info!(path = %path.display(), cleanup, "session ready");

        Ok(Self {
            path,
            lock: Some(dir),
            loop_lock: None,
            cleanup,
            rundir,
            watchdog: None,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Forks the cleanup watchdog.
    ///
    /// The watchdog blocks on a pipe whose write end stays with this process
    /// and every fork of it until exec. Once all of them are gone it tries an
    /// exclusive lock on the directory and removes it if nobody else holds
    /// a shared one.
    pub fn spawn_watchdog(&mut self, privileges: &PrivilegeManager) -> Result<()> {
        if !self.cleanup {
            debug!("session cleanup disabled");
            return Ok(());
        }

        let (reader, writer) =
            pipe2(OFlag::O_CLOEXEC).context("Failed to create watchdog pipe")?;

        // SAFETY: the runtime is single threaded at this point.
        match unsafe { fork() }.context("Failed to fork session watchdog")? {
            ForkResult::Parent { child } => {
                debug!(pid = %child, "session watchdog started");
                drop(reader);
                self.watchdog = Some(writer);
                Ok(())
            }
            ForkResult::Child => {
                drop(writer);
                let code = match watchdog_main(self, privileges, reader) {
                    Ok(()) => 0,
                    Err(err) => {
                        warn!("session watchdog: {err:#}");
                        1
                    }
                };
                std::process::exit(code);
            }
        }
    }

    /// Returns the loop device serving `image`, binding one via `attach`
    /// only if no other participant already did.
    ///
    /// The binder holds `loop_lock` exclusively while it attaches and writes
    /// the record, then downgrades. Everyone else waits on a shared lock and
    /// reads the record.
    pub fn bind_loop<D, F>(&mut self, image: &Image, attach: F) -> Result<D>
    where
        D: CachedDevice,
        F: FnOnce() -> Result<D>,
    {
        let path = self.path.join(LOOP_LOCK);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        let mut attach = Some(attach);

        for attempt in 1..=LOOP_LOCK_ATTEMPTS {
            let busy = match utils::lock(file, LockMode::Exclusive, true)? {
                Lock::Held(mut held) => {
                    let Some(attach) = attach.take() else {
                        bail!(Error::Resource("loop device binder ran twice".into()));
                    };

                    let device = attach()?;
                    let record = LoopRecord {
                        device: device.device_path().to_path_buf(),
                        offset: image.offset(),
                        image_id: image.id(),
                    };
                    write_record(&mut held, &record)?;
                    utils::relock(&held, LockMode::Shared)?;

                    debug!(device = %record.device.display(), "loop device bound and cached");
                    self.loop_lock = Some(held);
                    return Ok(device);
                }
                Lock::Busy(busy) => busy,
            };

            let Lock::Held(mut shared) = utils::lock(busy, LockMode::Shared, false)? else {
                bail!(Error::Resource(format!("blocking lock on {} refused", path.display())));
            };

            match read_record(&mut shared) {
                Ok(record) => {
                    if record.image_id != image.id() || record.offset != image.offset() {
                        bail!(Error::Resource(format!(
                            "{} describes image {} at offset {}, expected {} at {}",
                            path.display(),
                            record.image_id,
                            record.offset,
                            image.id(),
                            image.offset()
                        )));
                    }

                    let device = D::reopen(&record, image)?;
                    debug!(device = %record.device.display(), "reusing cached loop device");
                    self.loop_lock = Some(shared);
                    return Ok(device);
                }
                Err(err) => {
                    debug!(attempt, "loop record unreadable: {err:#}");
                    file = utils::unlock(shared)?;
                }
            }
        }

        bail!(Error::Resource(format!(
            "gave up waiting for a loop device record in {}",
            path.display()
        )))
    }
}

fn open_directory(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_DIRECTORY)
        .open(path)
        .with_context(|| format!("Failed to open session directory {}", path.display()))
}

fn write_record(file: &mut File, record: &LoopRecord) -> Result<()> {
    let bytes = record.encode()?;
    file.set_len(0).context("Failed to truncate loop record")?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&bytes).context("Failed to write loop record")?;
    file.sync_data().context("Failed to sync loop record")?;
    Ok(())
}

fn read_record(file: &mut File) -> Result<LoopRecord> {
    let mut bytes = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut bytes).context("Failed to read loop record")?;
    if bytes.is_empty() {
        bail!("loop record is empty");
    }
    LoopRecord::decode(&bytes)
}

fn watchdog_main(session: &mut Session, privileges: &PrivilegeManager, reader: OwnedFd) -> Result<()> {
    // Terminal-generated signals reach the whole process group; the
    // watchdog has to outlive the supervisor to clean up after it.
    for sig in [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGHUP, Signal::SIGTSTP] {
        // SAFETY: SIG_IGN installs no handler code.
        unsafe { signal(sig, SigHandler::SigIgn) }.context("Failed to ignore signal")?;
    }

    drop(session.watchdog.take());

    privileges.drop_perm()?;

    let mut buffer = [0u8; 16];
    loop {
        match read(&reader, &mut buffer) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err).context("Failed to wait on watchdog pipe"),
        }
    }

    // The inherited lock shares its open file description with the
    // supervisor's, so it is only released once the supervisor is gone.
    drop(session.lock.take());
    drop(session.loop_lock.take());

    if cleanup(&session.path, session.rundir.as_deref())? {
        debug!(path = %session.path.display(), "session directory removed");
    }
    Ok(())
}

/// Removes the session directory if no participant holds it anymore.
pub fn cleanup(path: &Path, rundir: Option<&Path>) -> Result<bool> {
    let dir = match open_directory(path) {
        Ok(dir) => dir,
        Err(_) => return Ok(false),
    };

    let Lock::Held(_exclusive) = utils::lock(dir, LockMode::Exclusive, true)? else {
        debug!(path = %path.display(), "session still in use");
        return Ok(false);
    };

    info!(path = %path.display(), "removing session directory");
    fs::remove_dir_all(path).with_context(|| format!("Failed to remove {}", path.display()))?;

    if let Some(rundir) = rundir {
        if rundir.starts_with("/tmp/") && rundir != Path::new("/tmp/") {
            fs::remove_dir_all(rundir)
                .with_context(|| format!("Failed to remove {}", rundir.display()))?;
        } else {
            warn!(rundir = %rundir.display(), "refusing to remove run directory outside /tmp");
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct RecordedDevice(PathBuf);

    impl CachedDevice for RecordedDevice {
        fn device_path(&self) -> &Path {
            &self.0
        }

        fn reopen(record: &LoopRecord, _image: &Image) -> Result<Self> {
            Ok(Self(record.device.clone()))
        }
    }

    fn session_in(dir: &Path) -> Result<Session> {
        Session::create(dir.join("session"), nix::unistd::geteuid(), &Registry::new())
    }

    #[test]
    fn test_session_path_precedence() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let image = Image::open(dir.path(), false)?;
        let uid = Uid::from_raw(1000);
        let identity = format!("1000.{}", image.id());

        let path = session_path(&Registry::new(), &Config::default(), uid, &image)?;
        assert_eq!(path, PathBuf::from(format!("/tmp/.singularity-session-{identity}")));

        let mut config = Config::default();
        config.set(config::SESSIONDIR_PREFIX, "/var/run/s-");
        let path = session_path(&Registry::new(), &config, uid, &image)?;
        assert_eq!(path, PathBuf::from(format!("/var/run/s-{identity}")));

        let registry = Registry::from_vars([("SINGULARITY_SESSIONDIR", "/scratch")])?;
        let path = session_path(&registry, &config, uid, &image)?;
        assert_eq!(path, PathBuf::from(format!("/scratch/singularity-session-{identity}")));
        Ok(())
    }

    #[test]
    fn test_cleanup_waits_for_last_holder() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let session = session_in(dir.path())?;
        let path = session.path().to_path_buf();

        assert!(!cleanup(&path, None)?);
        assert!(path.is_dir());

        drop(session);
        assert!(cleanup(&path, None)?);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_cleanup_flags() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = Registry::from_vars([("SINGULARITY_NO_SESSION_CLEANUP", "1")])?;
        let session = Session::create(dir.path().join("s"), nix::unistd::geteuid(), &registry)?;
        assert!(!session.cleanup);
        Ok(())
    }

    #[test]
    fn test_foreign_owner_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let other = Uid::from_raw(nix::unistd::geteuid().as_raw() + 1);
        assert!(Session::create(dir.path().join("s"), other, &Registry::new()).is_err());
        Ok(())
    }

    #[test]
    fn test_loop_record_codec() -> Result<()> {
        let record = LoopRecord {
            device: PathBuf::from("/dev/loop4"),
            offset: 31,
            image_id: "2049.1234".into(),
        };
        assert_eq!(LoopRecord::decode(&record.encode()?)?, record);
        assert!(LoopRecord::decode(&[]).is_err());
        Ok(())
    }

    #[test]
    fn test_stale_record_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let image = Image::open(dir.path(), false)?;
        let mut session = session_in(dir.path())?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(session.path().join(LOOP_LOCK))?;
        let record = LoopRecord {
            device: PathBuf::from("/dev/loop0"),
            offset: 0,
            image_id: "0.0".into(),
        };
        write_record(&mut file, &record)?;
        let Lock::Held(_reader) = utils::lock(file, LockMode::Shared, true)? else {
            panic!("shared lock refused");
        };

        let error = session
            .bind_loop::<RecordedDevice, _>(&image, || {
                bail!("binder must not run while a record is held")
            })
            .unwrap_err();
        assert!(matches!(error.downcast_ref::<Error>(), Some(Error::Resource(_))));
        Ok(())
    }

    #[test]
    fn test_second_participant_reuses_recorded_device() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let image = Image::open(dir.path(), false)?;
        let mut first = session_in(dir.path())?;
        let mut second = session_in(dir.path())?;

        let bound = first.bind_loop(&image, || Ok(RecordedDevice(PathBuf::from("/dev/loop7"))))?;
        assert_eq!(bound.0, PathBuf::from("/dev/loop7"));

        let record = read_record(&mut File::open(first.path().join(LOOP_LOCK))?)?;
        assert_eq!(record.device, PathBuf::from("/dev/loop7"));
        assert_eq!(record.image_id, image.id());

        let reused = second.bind_loop::<RecordedDevice, _>(&image, || {
            bail!("the device was already bound")
        })?;
        assert_eq!(reused, bound);
        Ok(())
    }
}
