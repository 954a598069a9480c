//! Container artifacts: opening, classification, admission and the rootfs
//! mount for each kind.

mod dir;
mod ext;
pub mod header;
mod squashfs;
pub mod verify;

use crate::{
    config::{self, Config},
    error::Error,
    loopdev::LoopDevice,
    mount::{MountOps, Mounter},
};
use anyhow::{Context, Result, bail};
use nix::unistd::User;
use std::{
    fmt,
    fs::{self, File, OpenOptions},
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd},
        unix::fs::{FileExt, MetadataExt},
    },
    path::{Path, PathBuf},
};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Directory,
    Squashfs,
    Ext,
}

impl ImageKind {
    #[inline]
    pub fn needs_loop(self) -> bool {
        !matches!(self, Self::Directory)
    }

    /// Admission switch for non-root invokers.
    fn admission_key(self) -> &'static str {
        match self {
            Self::Directory => config::ALLOW_CONTAINER_DIR,
            Self::Squashfs => config::ALLOW_CONTAINER_SQUASHFS,
            Self::Ext => config::ALLOW_CONTAINER_EXTFS,
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Directory => "directory",
            Self::Squashfs => "squashfs",
            Self::Ext => "ext",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct Image {
    path: PathBuf,
    name: String,
    kind: ImageKind,
    file: File,
    offset: u64,
    writable: bool,
    dev: u64,
    ino: u64,
    owner: u32,
    loop_device: Option<LoopDevice>,
}

impl Image {
    /// Opens and classifies the artifact with the caller's current
    /// credentials.
    pub fn open(path: &Path, writable: bool) -> Result<Self> {
        let path = fs::canonicalize(path)
            .map_err(|err| Error::Usage(format!("image {}: {err}", path.display())))?;

        let metadata =
            fs::metadata(&path).with_context(|| format!("Failed to stat {}", path.display()))?;

        let file = if metadata.is_dir() {
            File::open(&path)
        } else {
            OpenOptions::new().read(true).write(writable).open(&path)
        }
        .with_context(|| format!("Failed to open image {}", path.display()))?;

        let (kind, offset) = if metadata.is_dir() {
            (ImageKind::Directory, 0)
        } else {
            let mut prefix = vec![0u8; header::PROBE_LEN];
            let read = file
                .read_at(&mut prefix, 0)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            prefix.truncate(read);

            header::classify(&prefix, &path).ok_or_else(|| {
                Error::Usage(format!("{}: unknown image format", path.display()))
            })?
        };

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());

        debug!(path = %path.display(), %kind, offset, writable, "image opened");

        Ok(Self {
            name,
            kind,
            file,
            offset,
            writable,
            dev: metadata.dev(),
            ino: metadata.ino(),
            owner: metadata.uid(),
            loop_device: None,
            path,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn writable(&self) -> bool {
        self.writable
    }

    #[inline]
    pub fn dev(&self) -> u64 {
        self.dev
    }

    #[inline]
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Stable identity, `"<dev>.<ino>"`.
    pub fn id(&self) -> String {
        format!("{}.{}", self.dev, self.ino)
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn set_loop_device(&mut self, device: LoopDevice) {
        self.loop_device = Some(device);
    }

    /// Applies the per-format switches and the path/owner limits. Root is
    /// exempt from all of them.
    pub fn check_policy(&self, config: &Config, invoker_root: bool) -> Result<()> {
        if invoker_root {
            return Ok(());
        }

        if !config.get_bool(self.kind.admission_key())? {
            bail!(Error::Policy(format!(
                "{} images are not allowed by configuration",
                self.kind
            )));
        }

        if let Some(owners) = config.get_optional(config::LIMIT_CONTAINER_OWNERS)? {
            let allowed = split_list(owners)
                .filter_map(|name| User::from_name(name).ok().flatten())
                .any(|user| user.uid.as_raw() == self.owner);

            if !allowed {
                bail!(Error::Policy(format!(
                    "{} is owned by uid {}, which is not in 'limit container owners'",
                    self.path.display(),
                    self.owner
                )));
            }
        }

        if let Some(paths) = config.get_optional(config::LIMIT_CONTAINER_PATHS)? {
            let resolved = fs::read_link(format!("/proc/self/fd/{}", self.file.as_raw_fd()))
                .context("Failed to resolve image descriptor")?;

            if !path_within_any(&resolved, split_list(paths)) {
                bail!(Error::Policy(format!(
                    "{} is not below any of 'limit container paths'",
                    resolved.display()
                )));
            }
        }

        Ok(())
    }

    /// Mounts the root filesystem at the tree's `source` directory.
    pub fn mount<O: MountOps>(&self, mounter: &Mounter<'_, O>, invoker_root: bool) -> Result<()> {
        match self.kind {
            ImageKind::Directory => dir::mount(self, mounter, invoker_root)?,
            ImageKind::Squashfs => squashfs::mount(self, mounter)?,
            ImageKind::Ext => ext::mount(self, mounter, invoker_root)?,
        }

        info!(image = %self.name, kind = %self.kind, "rootfs mounted");
        Ok(())
    }

    fn require_loop_device(&self) -> Result<&LoopDevice> {
        self.loop_device.as_ref().ok_or_else(|| {
            Error::Resource(format!("no loop device bound for {}", self.path.display())).into()
        })
    }
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|item| !item.is_empty())
}

fn path_within_any<'a>(path: &Path, mut prefixes: impl Iterator<Item = &'a str>) -> bool {
    prefixes.any(|prefix| path.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_open_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let image = Image::open(dir.path(), false)?;

        assert_eq!(image.kind(), ImageKind::Directory);
        assert_eq!(image.offset(), 0);
        assert!(!image.kind().needs_loop());

        let metadata = fs::metadata(dir.path())?;
        assert_eq!(image.id(), format!("{}.{}", metadata.dev(), metadata.ino()));
        Ok(())
    }

    #[test]
    fn test_open_ext_with_header() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("demo.sif");
        let mut file = File::create(&path)?;
        file.write_all(header::LAUNCH_HEADER)?;
        file.write_all(&[0u8; 4096])?;

        let image = Image::open(&path, false)?;
        assert_eq!(image.kind(), ImageKind::Ext);
        assert_eq!(image.offset(), header::LAUNCH_HEADER.len() as u64);
        assert!(image.kind().needs_loop());
        Ok(())
    }

    #[test]
    fn test_unknown_format_is_usage_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("random.bin");
        fs::write(&path, b"not an image")?;

        let error = Image::open(&path, false).unwrap_err();
        assert!(matches!(error.downcast_ref::<Error>(), Some(Error::Usage(_))));
        Ok(())
    }

    #[test]
    fn test_format_admission_for_non_root() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("image.sqsh");
        fs::write(&path, b"hsqs")?;
        let image = Image::open(&path, false)?;

        let denied = Config::from_str_contents("allow container squashfs = no")?;
        let error = image.check_policy(&denied, false).unwrap_err();
        assert!(matches!(error.downcast_ref::<Error>(), Some(Error::Policy(_))));

        image.check_policy(&denied, true)?;
        image.check_policy(&Config::default(), false)?;
        Ok(())
    }

    #[test]
    fn test_limit_container_paths() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let image = Image::open(dir.path(), false)?;

        let outside = Config::from_str_contents("limit container paths = /nonexistent/a, /nonexistent/b")?;
        assert!(image.check_policy(&outside, false).is_err());

        let inside = Config::from_str_contents(&format!(
            "limit container paths = /nonexistent, {}",
            image.path().display()
        ))?;
        image.check_policy(&inside, false)?;
        Ok(())
    }

    #[test]
    fn test_path_prefix_matching_is_per_component() {
        let path = Path::new("/data/containers-old/x");
        assert!(!path_within_any(path, ["/data/containers"].into_iter()));
        assert!(path_within_any(path, ["/data"].into_iter()));
    }
}
