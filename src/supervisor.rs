//! Forks a child behind a start gate and stays with it until it exits:
//! forwarding signals, reaping orphans and tearing the child down when the
//! process above goes away.

use crate::{
    error::ExitCode,
    notifier::Notifier,
    report::{ChildErrorWriter, ErrorReporter, ParentErrorReader},
};
use anyhow::{Context, Result, bail};
use nix::{
    errno::Errno,
    fcntl::OFlag,
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sys::{
        signal::{
            SaFlags, SigAction, SigHandler, SigSet,
            Signal::{self, SIGCHLD, SIGKILL},
            kill, sigaction,
        },
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::{ForkResult, Pid, fork, pipe2, read},
};
use std::{
    cell::Cell,
    convert::Infallible,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    sync::atomic::{AtomicI32, Ordering},
};
use tracing::{debug, error, info, warn};

/// Signals relayed from the supervisor to its child.
pub const FORWARDED: [Signal; 6] = [
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

static SIGNAL_WRITER: AtomicI32 = AtomicI32::new(-1);
static SIGCHLD_WRITER: AtomicI32 = AtomicI32::new(-1);

extern "C" fn relay_signal(signo: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
    let fd = if signo == libc::SIGCHLD {
        SIGCHLD_WRITER.load(Ordering::Relaxed)
    } else {
        SIGNAL_WRITER.load(Ordering::Relaxed)
    };
    if fd < 0 {
        return;
    }

    let byte = signo as u8;
    unsafe {
        let errno = *libc::__errno_location();
        libc::write(fd, (&byte as *const u8).cast(), 1);
        *libc::__errno_location() = errno;
    }
}

/// Exit code reported for a child that terminated the given way.
pub fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
        _ => None,
    }
}

/// Creates the pipe a supervised process watches to notice that the process
/// above it died. The writer stays above, the reader travels down.
pub fn parent_link() -> Result<(ParentGuard, ParentLink)> {
    let (reader, writer) =
        pipe2(OFlag::O_CLOEXEC).context("Failed to create parent watchdog pipe")?;
    Ok((ParentGuard { writer }, ParentLink { reader }))
}

/// Write end of a parent link. Never written; its closing is the message.
#[derive(Debug)]
pub struct ParentGuard {
    writer: OwnedFd,
}

/// Read end of a parent link. Hangs up once every `ParentGuard` copy is gone.
#[derive(Debug)]
pub struct ParentLink {
    reader: OwnedFd,
}

#[derive(Debug, Default)]
pub struct SupervisorBuilder {
    guard: Option<ParentGuard>,
    parent: Option<ParentLink>,
}

impl SupervisorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the write end of a link in the supervisor only; the child
    /// closes its copy right after the fork.
    pub fn hold(mut self, guard: ParentGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Kills the child once `link` hangs up.
    pub fn watch_parent(mut self, link: ParentLink) -> Self {
        self.parent = Some(link);
        self
    }

    pub fn build(self) -> Result<Supervisor> {
        let (signal_reader, signal_writer) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
            .context("Failed to create signal pipe")?;
        let (sigchld_reader, sigchld_writer) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
            .context("Failed to create SIGCHLD pipe")?;

        Ok(Supervisor {
            notifier: Notifier::new()?,
            report: ErrorReporter::new()?,
            signals: (signal_reader, signal_writer),
            sigchld: (sigchld_reader, sigchld_writer),
            guard: self.guard,
            parent: self.parent,
        })
    }
}

#[derive(Debug)]
pub struct Supervisor {
    notifier: Notifier,
    report: ErrorReporter,
    signals: (OwnedFd, OwnedFd),
    sigchld: (OwnedFd, OwnedFd),
    guard: Option<ParentGuard>,
    parent: Option<ParentLink>,
}

impl Supervisor {
    /// Forks and runs `child` once the parent side is ready. The child only
    /// comes back through exec; a setup error travels up the error pipe and
    /// the child exits with the matching code.
    pub fn spawn<F>(self, child: F) -> Result<ChildHandle>
    where
        F: FnOnce() -> Result<Infallible>,
    {
        let Self {
            notifier,
            report,
            signals,
            sigchld,
            guard,
            parent,
        } = self;

        install_handlers(signals.1.as_fd(), sigchld.1.as_fd())?;
        let (errors, reporter) = report.split();

        match unsafe { fork() }.context("Failed to fork")? {
            ForkResult::Child => {
                drop((signals, sigchld, guard, parent, errors));
                std::process::exit(child_main(&notifier, &reporter, child))
            }
            ForkResult::Parent { child: pid } => {
                drop((child, reporter));
                debug!(%pid, "child forked");

                let handle = ChildHandle {
                    pid,
                    signals: signals.0,
                    sigchld: sigchld.0,
                    errors,
                    _signal_writer: signals.1,
                    _sigchld_writer: sigchld.1,
                    _guard: guard,
                    parent,
                    waited: Cell::new(false),
                };

                notifier.release().context("Failed to release child")?;
                Ok(handle)
            }
        }
    }
}

fn child_main<F>(notifier: &Notifier, reporter: &ChildErrorWriter, child: F) -> i32
where
    F: FnOnce() -> Result<Infallible>,
{
    let outcome = restore_default_handlers()
        .and_then(|()| notifier.wait())
        .and_then(|()| child());

    match outcome {
        Ok(never) => match never {},
        Err(err) => {
            if let Err(report_err) = reporter.report(&err) {
                error!("{err:#} ({report_err})");
            }
            ExitCode::from_error(&err).into()
        }
    }
}

fn install_handlers(signal_writer: BorrowedFd<'_>, sigchld_writer: BorrowedFd<'_>) -> Result<()> {
    use std::os::fd::AsRawFd;

    SIGNAL_WRITER.store(signal_writer.as_raw_fd(), Ordering::Relaxed);
    SIGCHLD_WRITER.store(sigchld_writer.as_raw_fd(), Ordering::Relaxed);

    let action = SigAction::new(
        SigHandler::SigAction(relay_signal),
        SaFlags::SA_SIGINFO | SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );

    for signal in FORWARDED.iter().chain([SIGCHLD].iter()) {
        unsafe { sigaction(*signal, &action) }
            .with_context(|| format!("Failed to install {signal} handler"))?;
    }
    Ok(())
}

fn restore_default_handlers() -> Result<()> {
    SIGNAL_WRITER.store(-1, Ordering::Relaxed);
    SIGCHLD_WRITER.store(-1, Ordering::Relaxed);

    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in FORWARDED.iter().chain([SIGCHLD].iter()) {
        unsafe { sigaction(*signal, &action) }
            .with_context(|| format!("Failed to restore {signal} handler"))?;
    }
    Ok(())
}

/// Drains a non-blocking pipe, returning every byte read.
fn drain(fd: BorrowedFd<'_>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buffer = [0u8; 64];
    loop {
        match read(fd, &mut buffer) {
            Ok(0) | Err(Errno::EAGAIN) => return Ok(out),
            Ok(n) => out.extend_from_slice(&buffer[..n]),
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err).context("Failed to drain pipe"),
        }
    }
}

pub struct ChildHandle {
    /// PID of the supervised child
    pid: Pid,

    signals: OwnedFd,
    sigchld: OwnedFd,
    errors: ParentErrorReader,

    // Kept open for the handler until the handle goes away
    _signal_writer: OwnedFd,
    _sigchld_writer: OwnedFd,
    _guard: Option<ParentGuard>,

    parent: Option<ParentLink>,

    // Track if the process has been waited on
    waited: Cell<bool>,
}

impl ChildHandle {
    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Runs the event loop until the child is reaped and returns its exit
    /// code. A setup error reported by the child is logged here.
    pub fn supervise(&self) -> Result<i32> {
        loop {
            let (child_ready, signals_ready, parent_gone) = self.poll_events()?;

            if signals_ready {
                for signo in drain(self.signals.as_fd())? {
                    self.forward(signo);
                }
            }

            if child_ready {
                drain(self.sigchld.as_fd())?;
                if let Some(code) = self.reap()? {
                    return self.finish(code);
                }
            }

            if parent_gone {
                warn!(pid = %self.pid, "parent went away, killing child");
                self.terminate()?;
                let status = waitpid(self.pid, None)
                    .with_context(|| format!("Failed to wait for process {}", self.pid))?;
                self.waited.set(true);
                return self.finish(exit_code(status).unwrap_or(128 + SIGKILL as i32));
            }
        }
    }

    fn poll_events(&self) -> Result<(bool, bool, bool)> {
        let wake = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        let mut fds = vec![
            PollFd::new(self.sigchld.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.signals.as_fd(), PollFlags::POLLIN),
        ];
        if let Some(link) = &self.parent {
            fds.push(PollFd::new(link.reader.as_fd(), PollFlags::POLLIN));
        }

        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("Failed to poll supervisor events"),
            }
        }

        let ready = |index: usize| {
            fds.get(index)
                .and_then(PollFd::revents)
                .is_some_and(|revents| revents.intersects(wake))
        };
        Ok((ready(0), ready(1), ready(2)))
    }

    fn forward(&self, signo: u8) {
        let Ok(signal) = Signal::try_from(i32::from(signo)) else {
            return;
        };

        debug!(pid = %self.pid, %signal, "forwarding");
        match kill(self.pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!(pid = %self.pid, %signal, "failed to forward signal: {err}"),
        }
    }

    /// Reaps every exited child without blocking. Returns the tracked child's
    /// exit code once it is among them.
    fn reap(&self) -> Result<Option<i32>> {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(status) if status.pid() == Some(self.pid) => {
                    if let Some(code) = exit_code(status) {
                        self.waited.set(true);
                        return Ok(Some(code));
                    }
                }
                Ok(status) => debug!(?status, "reaped"),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => bail!("process {} vanished before being reaped", self.pid),
                Err(err) => return Err(err).context("Failed to reap children"),
            }
        }
    }

    fn finish(&self, code: i32) -> Result<i32> {
        if let Some(message) = self.errors.take_message()? {
            error!("{message}");
        }
        info!(pid = %self.pid, code, "child exited");
        Ok(code)
    }

    pub fn terminate(&self) -> Result<()> {
        if self.waited.get() {
            return Ok(());
        }

        match kill(self.pid, SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("Failed to terminate process {} with SIGKILL", self.pid)),
        }
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        // The writers close with the handle; a late signal must not land on
        // a recycled descriptor.
        SIGNAL_WRITER.store(-1, Ordering::Relaxed);
        SIGCHLD_WRITER.store(-1, Ordering::Relaxed);

        if self.waited.get() {
            return;
        }

        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                warn!(pid = %self.pid, "handle dropped while child still running, killing it");
                let _ = kill(self.pid, SIGKILL);
                let _ = waitpid(self.pid, None);
            }
            Ok(status) => debug!(?status, "child exited during drop"),
            Err(err) => warn!(pid = %self.pid, "failed to check child during drop: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        let pid = Pid::from_raw(1);
        assert_eq!(exit_code(WaitStatus::Exited(pid, 3)), Some(3));
        assert_eq!(
            exit_code(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some(137)
        );
        assert_eq!(
            exit_code(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            Some(143)
        );
        assert_eq!(exit_code(WaitStatus::StillAlive), None);
    }

    #[test]
    fn test_forwarded_set() {
        assert!(FORWARDED.contains(&Signal::SIGTERM));
        assert!(!FORWARDED.contains(&Signal::SIGKILL));
        assert!(!FORWARDED.contains(&Signal::SIGCHLD));
    }

    #[test]
    fn test_drain_empty_pipe() -> Result<()> {
        let (reader, writer) = pipe2(OFlag::O_NONBLOCK)?;
        assert!(drain(reader.as_fd())?.is_empty());

        nix::unistd::write(&writer, &[2, 15])?;
        assert_eq!(drain(reader.as_fd())?, vec![2, 15]);
        Ok(())
    }

    /// Runs `body` in a forked process so handlers and reaping stay there.
    fn in_child(body: impl FnOnce() -> Result<()>) -> Result<()> {
        match unsafe { fork() }? {
            ForkResult::Child => {
                let code = match body() {
                    Ok(()) => 0,
                    Err(err) => {
                        eprintln!("{err:#}");
                        1
                    }
                };
                std::process::exit(code);
            }
            ForkResult::Parent { child } => {
                assert_eq!(waitpid(child, None)?, WaitStatus::Exited(child, 0));
                Ok(())
            }
        }
    }

    fn sleeper() -> Result<Infallible> {
        nix::unistd::execvp(c"sleep", &[c"sleep", c"30"]).context("Failed to exec sleep")
    }

    #[test]
    fn test_terminate_is_forwarded_to_child() -> Result<()> {
        in_child(|| {
            let handle = SupervisorBuilder::new().build()?.spawn(sleeper)?;

            // Let the child reset its handlers and exec.
            std::thread::sleep(std::time::Duration::from_millis(300));
            kill(nix::unistd::getpid(), Signal::SIGTERM)?;

            let code = handle.supervise()?;
            anyhow::ensure!(code == 128 + Signal::SIGTERM as i32, "exit code {code}");
            Ok(())
        })
    }

    #[test]
    fn test_child_killed_when_parent_link_hangs_up() -> Result<()> {
        in_child(|| {
            let (guard, link) = parent_link()?;
            let handle = SupervisorBuilder::new()
                .watch_parent(link)
                .build()?
                .spawn(sleeper)?;

            drop(guard);

            let code = handle.supervise()?;
            anyhow::ensure!(code == 128 + SIGKILL as i32, "exit code {code}");
            Ok(())
        })
    }

    #[test]
    fn test_setup_error_exit_code() -> Result<()> {
        in_child(|| {
            let handle = SupervisorBuilder::new()
                .build()?
                .spawn(|| bail!(crate::error::Error::Usage("bad argument".into())))?;

            let code = handle.supervise()?;
            anyhow::ensure!(code == 1, "exit code {code}");
            Ok(())
        })
    }
}
