//! Container mount tree, the guarded `mount(2)` wrapper and the ordered
//! composition pipeline.

mod binds;
mod dev;
mod files;
mod home;
mod kernelfs;
pub mod mountinfo;
mod overlay;
mod tmp;

use crate::{
    config::Config,
    error::Error,
    hardener::FsUidGuard,
    image::Image,
    privilege::PrivilegeManager,
    registry::Registry,
    utils::{self, join_inside},
};
use anyhow::{Context, Result, bail};
use nix::{mount::MsFlags, unistd::Uid};
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

const SOURCE_DIR: &str = "source";
const OVERLAY_DIR: &str = "overlay";
pub const FINAL_DIR: &str = "final";

/// Raw mount syscall and mount table lookup.
pub trait MountOps {
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> nix::Result<()>;

    fn is_mounted(&self, target: &Path) -> Result<bool>;
}

impl<T: MountOps + ?Sized> MountOps for &T {
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> nix::Result<()> {
        (**self).mount(source, target, fstype, flags, data)
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        (**self).is_mounted(target)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct KernelMounts;

impl MountOps for KernelMounts {
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> nix::Result<()> {
        nix::mount::mount(source, target, fstype, flags, data)
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        mountinfo::is_mounted(target)
    }
}

/// Well-known directories every composed mount must land in.
#[derive(Debug, Clone)]
pub struct MountTree {
    base: PathBuf,
    source: PathBuf,
    overlay: PathBuf,
    final_dir: PathBuf,
    session: PathBuf,
}

impl MountTree {
    pub fn new(base: &Path, session: &Path) -> Self {
        let base = canonical_or_self(base);
        Self {
            source: base.join(SOURCE_DIR),
            overlay: base.join(OVERLAY_DIR),
            final_dir: base.join(FINAL_DIR),
            session: canonical_or_self(session),
            base,
        }
    }

    #[inline]
    pub fn source(&self) -> &Path {
        &self.source
    }

    #[inline]
    pub fn overlay(&self) -> &Path {
        &self.overlay
    }

    #[inline]
    pub fn final_dir(&self) -> &Path {
        &self.final_dir
    }

    #[inline]
    pub fn session(&self) -> &Path {
        &self.session
    }

    pub fn upper(&self) -> PathBuf {
        self.overlay.join("upper")
    }

    pub fn work(&self) -> PathBuf {
        self.overlay.join("work")
    }

    /// Host path of `inner` as seen from inside the container.
    pub fn in_container(&self, inner: &Path) -> PathBuf {
        join_inside(&self.final_dir, inner)
    }

    /// Whether a resolved path lies inside one of the four subtrees.
    pub fn allows(&self, resolved: &Path) -> bool {
        [&self.base, &self.final_dir, &self.overlay, &self.session]
            .iter()
            .any(|root| resolved.starts_with(root))
    }

    /// Creates `source`, `overlay` and `final`.
    pub fn prepare(&self) -> Result<()> {
        for dir in [&self.source, &self.overlay, &self.final_dir] {
            utils::create_directory_recursive(dir, 0o755)?;
        }
        Ok(())
    }
}

fn canonical_or_self(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Follows symlinks as far as the path exists.
fn resolve(target: &Path) -> PathBuf {
    if let Ok(resolved) = fs::canonicalize(target) {
        return resolved;
    }

    match (target.parent(), target.file_name()) {
        (Some(parent), Some(name)) => resolve(parent).join(name),
        _ => target.to_path_buf(),
    }
}

/// The single entry point to `mount(2)`.
///
/// Targets are resolved first and refused unless they land inside the
/// [`MountTree`]. Bind mounts run with the filesystem uid of the payload user.
pub struct Mounter<'a, O: MountOps = KernelMounts> {
    ops: O,
    tree: &'a MountTree,
    fsuid: Uid,
    privileges: Option<&'a PrivilegeManager>,
}

impl<'a, O: MountOps> Mounter<'a, O> {
    pub fn new(
        ops: O,
        tree: &'a MountTree,
        fsuid: Uid,
        privileges: Option<&'a PrivilegeManager>,
    ) -> Self {
        Self {
            ops,
            tree,
            fsuid,
            privileges,
        }
    }

    #[inline]
    pub fn tree(&self) -> &MountTree {
        self.tree
    }

    pub fn with_escalated<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        match self.privileges {
            Some(privileges) => privileges.with_escalated(f),
            None => f(),
        }
    }

    /// Returns `Ok(false)` when the target was refused, `Ok(true)` once it is
    /// mounted (including when it already was).
    pub fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<bool> {
        let resolved = resolve(target);

        if !self.tree.allows(&resolved) {
            warn!(
                target = %target.display(),
                resolved = %resolved.display(),
                "refusing mount outside the container tree"
            );
            return Ok(false);
        }

        let remount = flags.contains(MsFlags::MS_REMOUNT);
        if !remount && self.ops.is_mounted(&resolved)? {
            debug!(target = %resolved.display(), "already mounted");
            return Ok(true);
        }

        self.with_escalated(|| {
            self.repair_mount_point(&resolved)?;

            let _fsuid = if flags.contains(MsFlags::MS_BIND) && !remount {
                Some(FsUidGuard::restrict(self.fsuid)?)
            } else {
                None
            };

            self.ops
                .mount(source, &resolved, fstype, flags, data)
                .with_context(|| {
                    format!(
                        "Failed to mount {} on {} ({})",
                        source.map(|s| s.display().to_string()).unwrap_or_else(|| "none".into()),
                        resolved.display(),
                        fstype.unwrap_or("bind")
                    )
                })
        })?;

        debug!(target = %resolved.display(), ?flags, "mounted");
        Ok(true)
    }

    pub fn bind(&self, source: &Path, target: &Path, flags: MsFlags) -> Result<bool> {
        self.mount(Some(source), target, None, MsFlags::MS_BIND | flags, None)
    }

    pub fn remount(&self, target: &Path, flags: MsFlags) -> Result<bool> {
        self.mount(None, target, None, MsFlags::MS_REMOUNT | flags, None)
    }

    /// Turns a refused mandatory mount into an error.
    pub fn require(&self, mounted: bool, target: &Path) -> Result<()> {
        if !mounted {
            bail!(Error::Policy(format!(
                "mount target {} is outside the container tree",
                target.display()
            )));
        }
        Ok(())
    }

    fn repair_mount_point(&self, resolved: &Path) -> Result<()> {
        let Ok(metadata) = fs::metadata(resolved) else {
            return Ok(());
        };

        if metadata.is_dir() && metadata.permissions().mode() & 0o022 != 0 {
            warn!(path = %resolved.display(), "repairing mount point permissions to 0755");
            fs::set_permissions(resolved, fs::Permissions::from_mode(0o755))
                .with_context(|| format!("Failed to chmod {}", resolved.display()))?;
        }

        Ok(())
    }
}

/// Per-invocation facts the pipeline steps branch on.
#[derive(Debug, Clone, Default)]
pub struct ComposeOptions {
    pub invoker_root: bool,
    pub pid_namespace: bool,
    pub userns: bool,
    pub contain: bool,
    pub cwd: Option<PathBuf>,
}

/// Runs the ordered mount pipeline inside the container's mount namespace.
pub struct Composer<'a, O: MountOps = KernelMounts> {
    mounter: Mounter<'a, O>,
    registry: &'a Registry,
    config: &'a Config,
    privileges: &'a PrivilegeManager,
    image: &'a Image,
    options: ComposeOptions,
    overlay: bool,
}

impl<'a, O: MountOps> Composer<'a, O> {
    pub fn new(
        mounter: Mounter<'a, O>,
        registry: &'a Registry,
        config: &'a Config,
        privileges: &'a PrivilegeManager,
        image: &'a Image,
        options: ComposeOptions,
    ) -> Self {
        Self {
            mounter,
            registry,
            config,
            privileges,
            image,
            options,
            overlay: false,
        }
    }

    pub fn compose(&mut self) -> Result<()> {
        self.mounter
            .with_escalated(|| self.mounter.tree().prepare())?;

        self.image.mount(&self.mounter, self.options.invoker_root)?;
        self.overlay = overlay::setup(self)?;

        kernelfs::mount(self)?;
        dev::mount(self)?;
        home::mount(self)?;
        tmp::mount(self)?;
        tmp::mount_scratch(self)?;
        binds::mount_user(self)?;
        binds::mount_admin(self)?;
        self.optional("working directory", binds::mount_cwd);
        files::stage(self)?;

        info!(root = %self.mounter.tree().final_dir().display(), "container root composed");
        Ok(())
    }

    fn optional(&self, step: &str, f: fn(&Self) -> Result<()>) {
        if let Err(err) = f(self) {
            warn!("skipping {step}: {err:#}");
        }
    }

    #[inline]
    pub fn mounter(&self) -> &Mounter<'a, O> {
        &self.mounter
    }

    #[inline]
    fn tree(&self) -> &MountTree {
        self.mounter.tree()
    }

    #[inline]
    fn overlay_active(&self) -> bool {
        self.overlay
    }

    /// `MS_NOSUID`, plus `MS_NODEV` unless the invoker is root.
    fn restrictive_flags(&self) -> MsFlags {
        if self.options.invoker_root {
            MsFlags::MS_NOSUID
        } else {
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV
        }
    }

    /// Host path of a container location, created when missing and the
    /// overlay makes that possible. `None` means the target cannot exist.
    fn ensure_target(&self, inner: &Path, directory: bool) -> Result<Option<PathBuf>> {
        let target = self.tree().in_container(inner);
        if target.exists() {
            return Ok(Some(target));
        }

        if !self.overlay_active() {
            debug!(path = %inner.display(), "missing in container and no overlay to create it");
            return Ok(None);
        }

        self.mounter.with_escalated(|| {
            if directory {
                utils::create_directory_recursive(&target, 0o755)
            } else {
                utils::create_file(&target)
            }
        })?;

        Ok(Some(target))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Call {
        pub source: Option<PathBuf>,
        pub target: PathBuf,
        pub fstype: Option<String>,
        pub flags: MsFlags,
    }

    /// Records mounts instead of performing them.
    #[derive(Debug, Default)]
    pub struct RecordingMounts {
        pub calls: RefCell<Vec<Call>>,
    }

    impl MountOps for RecordingMounts {
        fn mount(
            &self,
            source: Option<&Path>,
            target: &Path,
            fstype: Option<&str>,
            flags: MsFlags,
            _data: Option<&str>,
        ) -> nix::Result<()> {
            self.calls.borrow_mut().push(Call {
                source: source.map(Path::to_path_buf),
                target: target.to_path_buf(),
                fstype: fstype.map(str::to_string),
                flags,
            });
            Ok(())
        }

        fn is_mounted(&self, target: &Path) -> Result<bool> {
            Ok(self
                .calls
                .borrow()
                .iter()
                .any(|call| call.target == target && !call.flags.contains(MsFlags::MS_REMOUNT)))
        }
    }

    fn tree() -> Result<(tempfile::TempDir, MountTree)> {
        let dir = tempfile::tempdir()?;
        let base = dir.path().join("mnt");
        let session = dir.path().join("session");
        fs::create_dir_all(&session)?;
        let tree = MountTree::new(&base, &session);
        tree.prepare()?;
        Ok((dir, tree))
    }

    #[test]
    fn test_tree_layout() -> Result<()> {
        let (_dir, tree) = tree()?;
        assert!(tree.source().is_dir());
        assert!(tree.final_dir().is_dir());
        assert_eq!(tree.upper(), tree.overlay().join("upper"));
        assert_eq!(tree.in_container(Path::new("/etc/hosts")), tree.final_dir().join("etc/hosts"));
        Ok(())
    }

    #[test]
    fn test_target_outside_tree_never_reaches_syscall() -> Result<()> {
        let (dir, tree) = tree()?;
        let ops = RecordingMounts::default();
        let mounter = Mounter::new(&ops, &tree, nix::unistd::getuid(), None);

        let outside = dir.path().join("elsewhere");
        fs::create_dir(&outside)?;
        assert!(!mounter.bind(Path::new("/tmp"), &outside, MsFlags::empty())?);
        assert!(ops.calls.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn test_symlink_escaping_the_tree_is_refused() -> Result<()> {
        let (dir, tree) = tree()?;
        let outside = dir.path().join("host-etc");
        fs::create_dir(&outside)?;
        std::os::unix::fs::symlink(&outside, tree.final_dir().join("etc"))?;

        let ops = RecordingMounts::default();
        let mounter = Mounter::new(&ops, &tree, nix::unistd::getuid(), None);

        assert!(!mounter.bind(Path::new("/etc"), &tree.in_container(Path::new("/etc")), MsFlags::empty())?);
        assert!(ops.calls.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn test_inside_tree_mounts_once() -> Result<()> {
        let (_dir, tree) = tree()?;
        let ops = RecordingMounts::default();
        let mounter = Mounter::new(&ops, &tree, nix::unistd::getuid(), None);

        assert!(mounter.bind(Path::new("/tmp"), tree.source(), MsFlags::MS_REC)?);
        assert!(mounter.bind(Path::new("/tmp"), tree.source(), MsFlags::MS_REC)?);
        assert!(mounter.remount(tree.source(), MsFlags::MS_BIND | MsFlags::MS_RDONLY)?);

        let calls = ops.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].flags.contains(MsFlags::MS_BIND | MsFlags::MS_REC));
        assert!(calls[1].flags.contains(MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY));
        Ok(())
    }

    #[test]
    fn test_world_writable_mount_point_is_repaired() -> Result<()> {
        let (_dir, tree) = tree()?;
        let target = tree.final_dir().join("data");
        fs::create_dir(&target)?;
        fs::set_permissions(&target, fs::Permissions::from_mode(0o777))?;

        let ops = RecordingMounts::default();
        let mounter = Mounter::new(&ops, &tree, nix::unistd::getuid(), None);
        mounter.bind(Path::new("/tmp"), &target, MsFlags::empty())?;

        assert_eq!(fs::metadata(&target)?.permissions().mode() & 0o777, 0o755);
        Ok(())
    }

    #[test]
    fn test_refused_mandatory_mount_is_an_error() -> Result<()> {
        let (_dir, tree) = tree()?;
        let ops = RecordingMounts::default();
        let mounter = Mounter::new(&ops, &tree, nix::unistd::getuid(), None);
        assert!(mounter.require(false, Path::new("/x")).is_err());
        mounter.require(true, Path::new("/x"))?;
        Ok(())
    }
}
