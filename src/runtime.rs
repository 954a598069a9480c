//! One invocation, start to finish.
//!
//! The invoked process opens the image, sets up the session and the loop
//! device, unshares namespaces and forks the container init. The init
//! composes the root, chroots, restricts capabilities, drops privileges for
//! good and either execs the payload or, as PID 1 of a new PID namespace,
//! forks and supervises it.

use crate::{
    capabilities::{CapabilityConfig, CapabilityManager, CapabilityRequest, CapabilitySet},
    config::{self, Config},
    error::Error,
    hardener,
    image::{Image, verify},
    loopdev::LoopManager,
    mount::{self, ComposeOptions, Composer, KernelMounts, MountTree, Mounter},
    namespace::{self, NamespaceRequest, NamespaceSource},
    privilege::PrivilegeManager,
    registry::Registry,
    session::{self, Session},
    supervisor::{self, ParentLink, SupervisorBuilder},
    utils,
};
use anyhow::{Context, Result, bail};
use nix::{sched::CloneFlags, unistd::execvp};
use std::{
    convert::Infallible,
    env,
    ffi::CString,
    fs::File,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

/// Command run when none was given.
pub const DEFAULT_COMMAND: &str = "/bin/sh";

pub struct Runtime {
    registry: Registry,
    config: Config,
    privileges: PrivilegeManager,
    /// Held open so automounted paths stay mounted while we run.
    _autofs: Vec<File>,
}

impl Runtime {
    pub fn new(registry: Registry, config: Config, privileges: PrivilegeManager) -> Self {
        Self {
            registry,
            config,
            privileges,
            _autofs: Vec::new(),
        }
    }

    /// Runs `argv` in the container and returns the payload's exit status.
    pub fn run(&mut self, argv: Vec<String>) -> Result<i32> {
        let argv = payload_argv(argv)?;
        self.hold_autofs();

        if let Some(source) = NamespaceSource::from_registry(&self.registry)? {
            return self.join(&source, &argv);
        }

        let mut image = self.open_image()?;
        self.check_workdir()?;

        let owner = self.privileges.effective_identity().uid;
        let path = session::session_path(&self.registry, &self.config, owner, &image)?;
        let mut session = Session::create(path, owner, &self.registry)?;
        session.spawn_watchdog(&self.privileges)?;

        if image.kind().needs_loop() {
            self.bind_loop(&mut session, &mut image)?;
        }

        if self.privileges.is_userns() {
            self.privileges.userns()?;
        }

        let request = NamespaceRequest::from_registry(&self.registry, &self.config)?;
        let slave = self.config.get_bool(config::MOUNT_SLAVE)?;
        self.privileges.with_escalated(|| {
            namespace::unshare_namespaces(request.flags())?;
            hardener::set_mount_propagation(slave)
        })?;

        if request.pid {
            self.registry.set("PIDNS_ENABLED", "1")?;
        }

        let tree = MountTree::new(&self.container_dir()?, session.path());
        let (guard, link) = supervisor::parent_link()?;

        let handle = SupervisorBuilder::new()
            .hold(guard)
            .build()?
            .spawn(|| self.container_init(&image, &tree, request, link, &argv))?;

        info!(pid = %handle.pid(), "container init started");
        handle.supervise()
    }

    /// Enters a running instance instead of building a new container.
    fn join(&self, source: &NamespaceSource, argv: &[CString]) -> Result<i32> {
        let flags = CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWNET
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWNS;

        if !self.privileges.uid().is_root() {
            source.ensure_owned_by(self.privileges.effective_identity().uid)?;
        }

        self.privileges
            .with_escalated(|| namespace::join_namespaces(source, flags))?;

        let root = self.container_dir()?.join(mount::FINAL_DIR);
        let (guard, link) = supervisor::parent_link()?;

        let handle = SupervisorBuilder::new().hold(guard).build()?.spawn(|| {
            drop(link);
            let target = self.capability_target()?;
            self.enter(&root, env::current_dir().ok().as_deref())?;
            self.restrict(target)?;
            hardener::kill_on_parent_death()?;
            exec(argv)
        })?;

        info!(pid = %handle.pid(), "joined instance");
        handle.supervise()
    }

    /// Body of the container init, run in the forked child.
    fn container_init(
        &self,
        image: &Image,
        tree: &MountTree,
        request: NamespaceRequest,
        link: ParentLink,
        argv: &[CString],
    ) -> Result<Infallible> {
        let cwd = env::current_dir().ok();
        let options = ComposeOptions {
            invoker_root: self.privileges.uid().is_root(),
            pid_namespace: request.pid,
            userns: self.privileges.is_userns(),
            contain: self.registry.is_set("CONTAIN"),
            cwd: cwd.clone(),
        };

        // Binds run under the payload's fsuid so root_squash applies to it.
        let payload = self.privileges.effective_identity().uid;
        let mounter = Mounter::new(KernelMounts, tree, payload, Some(&self.privileges));
        let mut composer = Composer::new(
            mounter,
            &self.registry,
            &self.config,
            &self.privileges,
            image,
            options,
        );
        composer.compose()?;

        // The capability files live on the host, so read them before chroot.
        let target = self.capability_target()?;
        self.enter(tree.final_dir(), cwd.as_deref())?;
        self.restrict(target)?;

        if !request.pid {
            drop(link);
            hardener::kill_on_parent_death()?;
            return exec(argv);
        }

        let handle = SupervisorBuilder::new()
            .watch_parent(link)
            .build()?
            .spawn(|| exec(argv))?;
        std::process::exit(handle.supervise()?)
    }

    fn open_image(&self) -> Result<Image> {
        let Some(path) = self.registry.get("IMAGE") else {
            bail!(Error::Usage("no container image given (SINGULARITY_IMAGE)".into()));
        };

        let image = Image::open(Path::new(path), self.registry.is_set("WRITABLE"))?;

        if self.registry.is_set("VERIFY") {
            if image.kind().needs_loop() {
                verify::verify(image.file())?;
            } else {
                bail!(Error::Usage(format!(
                    "{} is a directory and carries no verification block",
                    image.path().display()
                )));
            }
        }

        image.check_policy(&self.config, self.privileges.uid().is_root())?;
        info!(image = image.name(), kind = %image.kind(), "image opened");
        Ok(image)
    }

    fn bind_loop(&self, session: &mut Session, image: &mut Image) -> Result<()> {
        if self.privileges.is_userns() {
            bail!(Error::Policy(format!(
                "{} images need a loop device, which requires setuid",
                image.kind()
            )));
        }

        let escalation = self.privileges.escalation()?;
        let manager = LoopManager::from_config(&self.config)?;

        let shared: &Image = image;
        let device = self.privileges.with_escalated(|| {
            session.bind_loop(shared, || {
                manager.attach(escalation, shared.fd(), shared.offset(), shared.writable())
            })
        })?;

        info!(device = %device.path().display(), "image bound to loop device");
        image.set_loop_device(device);
        Ok(())
    }

    fn hold_autofs(&mut self) {
        let held: Vec<File> = self
            .config
            .get_multi(config::AUTOFS_BUG_PATH)
            .into_iter()
            .filter_map(|path| match File::open(path) {
                Ok(file) => {
                    debug!(path, "holding autofs path");
                    Some(file)
                }
                Err(err) => {
                    warn!(path, "cannot open autofs path: {err}");
                    None
                }
            })
            .collect();
        self._autofs = held;
    }

    /// `WORKDIR` backs contained directories and must belong to the invoker.
    fn check_workdir(&self) -> Result<()> {
        let Some(workdir) = self.registry.get("WORKDIR") else {
            return Ok(());
        };

        let uid = self.privileges.uid();
        if !uid.is_root() {
            utils::ensure_owner(Path::new(workdir), uid.as_raw())?;
        }
        Ok(())
    }

    fn container_dir(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.config.get(config::CONTAINER_DIR)?))
    }

    fn capability_target(&self) -> Result<(CapabilitySet, bool)> {
        let identity = self.privileges.effective_identity();
        let request = CapabilityRequest::gather(
            &self.registry,
            &self.config,
            identity.uid.is_root(),
            self.privileges.username(),
            &identity.groups,
        )?;

        let target = request.compute();
        debug!(%target, "capability target computed");
        Ok((target, request.wants_ambient()))
    }

    /// Chroots into `root` and picks a working directory: the invoker's
    /// when it exists in the container, then home, then `/`.
    fn enter(&self, root: &Path, cwd: Option<&Path>) -> Result<()> {
        self.privileges
            .with_escalated(|| hardener::change_root(root))?;

        let home = self.privileges.home().as_path();
        for dir in cwd.into_iter().chain([home]) {
            match hardener::chdir(dir) {
                Ok(()) => return Ok(()),
                Err(err) => debug!("{err:#}"),
            }
        }

        warn!("staying in / inside the container");
        Ok(())
    }

    fn restrict(&self, (target, ambient): (CapabilitySet, bool)) -> Result<()> {
        let manager = CapabilityManager::with_config(CapabilityConfig {
            ambient,
            latch_securebits: true,
        });

        self.privileges.with_escalated(|| manager.apply(target))?;
        self.privileges.drop_perm_keeping(target)
    }
}

/// Converts the payload command, defaulting to a shell.
pub fn payload_argv(argv: Vec<String>) -> Result<Vec<CString>> {
    let argv = if argv.is_empty() {
        vec![DEFAULT_COMMAND.to_string()]
    } else {
        argv
    };

    argv.into_iter()
        .map(|arg| {
            CString::new(arg)
                .map_err(|err| anyhow::Error::from(Error::Usage(format!("invalid argument: {err}"))))
        })
        .collect()
}

fn exec(argv: &[CString]) -> Result<Infallible> {
    let Some(program) = argv.first() else {
        bail!(Error::Usage("empty command".into()));
    };

    debug!(program = ?program, "exec");
    execvp(program, argv).with_context(|| format!("Failed to exec {}", program.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_defaults_to_shell() -> Result<()> {
        let argv = payload_argv(Vec::new())?;
        assert_eq!(argv, [CString::new(DEFAULT_COMMAND)?]);
        Ok(())
    }

    #[test]
    fn test_payload_keeps_arguments() -> Result<()> {
        let argv = payload_argv(vec!["/bin/echo".into(), "hi there".into()])?;
        assert_eq!(argv.len(), 2);
        assert_eq!(argv[1].to_str()?, "hi there");
        Ok(())
    }

    #[test]
    fn test_payload_rejects_interior_nul() {
        let error = payload_argv(vec!["a\0b".into()]).expect_err("nul byte accepted");
        assert!(matches!(error.downcast_ref::<Error>(), Some(Error::Usage(_))));
    }
}
