use std::{
    io,
    iter,
    os::{
        fd::{AsFd, AsRawFd, RawFd},
        unix::process::CommandExt,
    },
    process::{Child, Command},
    thread,
    time::{Duration, Instant},
};

use nix::{
    fcntl::{fcntl, FcntlArg},
    unistd::{dup2, getpid},
};

use crate::{
    control::{ControlChannel, Message, Received},
    handle::HandoffFd,
    handoff,
    options::Options,
    utils::{CONTROL_FD, ENV_FD_INDEX, ENV_PARENT_PID, ENV_UPGRADE, UPGRADE_TRUE_VAL},
};

// How often a child that keeps quiet is checked for having exited.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, derive_more::From, derive_more::Display)]
pub enum UpgradeError {
    #[display("an upgrade is already in progress")]
    InProgress,

    #[display("this process has already handed off to a new generation")]
    AlreadyUpgraded,

    #[display("this process is stopping")]
    Stopped,

    #[display("the previous generation has not exited yet")]
    ParentStillRunning,

    #[display("cannot start the new generation: {_0}")]
    #[from]
    Spawn(io::Error),

    #[display("new generation failed: {_0}")]
    Failed(String),

    #[display("new generation not ready after {_0:?}")]
    Timeout(Duration),

    #[display("the upgrade worker went away without a result")]
    WorkerLost,
}

impl std::error::Error for UpgradeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

/// A child that reported ready. The parent keeps its end of the control channel until it
/// exits, which is how the child learns that its parent is gone.
#[derive(Debug)]
pub(crate) struct Successor {
    pub(crate) pid: u32,
    _control: ControlChannel,
}

/// Start the next generation and wait for it to report ready. On any failure the parent's
/// state is as before: nothing in `fds` is shared with the registry except the sockets
/// themselves.
pub(crate) fn upgrade(fds: Vec<HandoffFd>, options: &Options) -> Result<Successor, UpgradeError> {
    let cmd = options.child_command()?;
    let (mut child, control) = spawn_child(cmd, &fds)?;
    // The child has its own copies now.
    drop(fds);

    let pid = child.id();
    log::info!("Started new generation, pid {pid}");

    match wait_ready(&mut child, &control, options.upgrade_timeout) {
        Ok(()) => {
            log::info!("New generation {pid} is ready");
            Ok(Successor {
                pid,
                _control: control,
            })
        }
        Err(e) => {
            log::warn!("Upgrade to {pid} failed: {e}");
            drain(child, control, options.stop_child_on_failure);
            Err(e)
        }
    }
}

// Setup environment and launch the upgraded process
pub(crate) fn spawn_child(mut cmd: Command, fds: &[HandoffFd]) -> io::Result<(Child, ControlChannel)> {
    let (parent_end, child_end) = ControlChannel::pair()?;

    cmd.env(ENV_UPGRADE, UPGRADE_TRUE_VAL)
        .env(ENV_FD_INDEX, handoff::encode(fds))
        .env(ENV_PARENT_PID, getpid().to_string());

    // Source i lands on CONTROL_FD + i: the control channel at 3, ordinal n at 4 + n.
    let sources: Vec<RawFd> = iter::once(child_end.as_fd().as_raw_fd())
        .chain(fds.iter().map(|f| f.as_fd().as_raw_fd()))
        .collect();
    let count = RawFd::try_from(sources.len())
        .map_err(|_| io::Error::other("too many descriptors to hand off"))?;
    let targets: Vec<RawFd> = (CONTROL_FD..CONTROL_FD + count).collect();
    let mut temps: Vec<RawFd> = vec![-1; sources.len()];
    let floor = CONTROL_FD + count;

    // This runs after fork, before exec, so it must not allocate. Sources may already sit
    // on a target slot, so everything is first moved above the highest target, then placed.
    // The temporaries are CLOEXEC; dup2 clears CLOEXEC on the placed copies, so only the
    // targets survive exec. CLOEXEC belongs to the descriptor, not the socket, so nothing
    // leaks into the parent's other subprocesses.
    unsafe {
        cmd.pre_exec(move || {
            for (temp, &source) in temps.iter_mut().zip(&sources) {
                *temp = fcntl(source, FcntlArg::F_DUPFD_CLOEXEC(floor))?;
            }
            for (&temp, &target) in temps.iter().zip(&targets) {
                dup2(temp, target)?;
            }
            Ok(())
        });
    }

    let child = cmd.spawn()?;
    drop(child_end);
    Ok((child, parent_end))
}

fn describe_exit(child: &mut Child) -> String {
    match child.try_wait() {
        Ok(Some(status)) => format!("exited ({status}) before it was ready"),
        _ => "closed the control channel before it was ready".to_string(),
    }
}

/// Wait for `READY` until `timeout`. The channel is read in short slices so that a child
/// that dies without closing the channel (because a grandchild inherited it) is noticed.
pub(crate) fn wait_ready(
    child: &mut Child,
    control: &ControlChannel,
    timeout: Duration,
) -> Result<(), UpgradeError> {
    let deadline = Instant::now() + timeout;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(UpgradeError::Timeout(timeout));
        }

        match control.recv(Some((deadline - now).min(POLL_INTERVAL))) {
            Ok(Received::Message(Message::Ready)) => return Ok(()),
            Ok(Received::Message(other)) => {
                if let Err(e) = control.send(Message::Stop) {
                    log::debug!("Cannot stop misbehaving child: {e}");
                }
                return Err(UpgradeError::Failed(format!(
                    "child sent {other:?} instead of ready"
                )));
            }
            Ok(Received::Closed) => return Err(UpgradeError::Failed(describe_exit(child))),
            Ok(Received::TimedOut) => (),
            Err(e) => {
                return Err(UpgradeError::Failed(format!("control channel broke: {e}")));
            }
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(UpgradeError::Failed(format!(
                    "exited ({status}) before it was ready"
                )))
            }
            Ok(None) => (),
            Err(e) => return Err(UpgradeError::Failed(format!("cannot check on child: {e}"))),
        }
    }
}

/// Take over a child whose upgrade was abandoned: swallow whatever it still sends, then
/// reap it. A late `READY` is logged and otherwise ignored.
pub(crate) fn drain(mut child: Child, control: ControlChannel, stop_child: bool) {
    let pid = child.id();
    let spawned = thread::Builder::new()
        .name("moult-drain".to_string())
        .spawn(move || {
            if stop_child {
                if let Err(e) = control.send(Message::Stop) {
                    log::debug!("Cannot stop abandoned child {pid}: {e}");
                }
            }
            loop {
                match control.recv(None) {
                    Ok(Received::Message(Message::Ready)) => {
                        log::warn!("Abandoned child {pid} reported ready too late, ignoring it")
                    }
                    Ok(Received::Message(other)) => {
                        log::debug!("Abandoned child {pid} sent {other:?}")
                    }
                    Ok(Received::TimedOut) => (),
                    Ok(Received::Closed) | Err(_) => break,
                }
            }
            match child.wait() {
                Ok(status) => log::info!("Abandoned child {pid} exited ({status})"),
                Err(e) => log::warn!("Cannot reap abandoned child {pid}: {e}"),
            }
        });
    if let Err(e) = spawned {
        log::error!("Cannot watch abandoned child {pid}: {e}");
    }
}
