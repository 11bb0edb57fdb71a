#![doc = include_str!("../README.md")]

#[cfg(feature = "tokio_moult")]
pub mod tokio_moult;

mod control;
mod executioner;
mod handle;
mod handoff;
mod inheriter;
mod listener;
mod network;
mod notify;
mod options;
mod registry;
mod utils;

use std::{
    io,
    sync::{mpsc, Arc, Weak},
    thread,
    time::Duration,
};

use nix::unistd::Pid;
use parking_lot::Mutex;

use control::{ControlChannel, Message, Received};
use executioner::Successor;
use inheriter::{init_child, Inheritance};

// reexports
pub use crate::{
    executioner::UpgradeError,
    handle::{Cleanup, FdKind, HandoffFd, Origin},
    handoff::HandoffError,
    inheriter::InheritError,
    listener::{Listener, PacketConn, Registrable},
    notify::Notification,
    options::{ChildCommand, Options},
    registry::{FdRegistry, RegistryError},
};

/// Where this process stands as a parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Serving; an upgrade may be requested.
    Idle,
    /// A new generation has been started and has not reported ready yet.
    Upgrading,
    /// The new generation reported ready; this process is releasing its descriptors.
    ChildReady,
    /// Handoff complete. This process should drain and exit.
    Retiring,
    /// Shut down without a successor, or abandoned by its own parent.
    Stopped,
}

/// Where this process stands as a child. Generation zero starts here too.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    AwaitingSelf,
    Ready,
}

struct ParentLink {
    pid: Pid,
    control: Arc<ControlChannel>,
}

struct State {
    phase: Phase,
    readiness: Readiness,
    stop_requested: bool,
    successor: Option<Successor>,
}

struct Shared {
    fds: FdRegistry,
    options: Options,
    state: Mutex<State>,
    parent: Option<ParentLink>,
    ready: Notification,
    exit: Notification,
    parent_exited: Notification,
}

/// Upgrade manager and entry point for graceful upgrades.
///
/// An `Upgrader` manages upgrades by:
/// 1. Tracking every listening socket, datagram socket and file that should survive an
///    upgrade, in its [`FdRegistry`].
/// 2. Handling the fork/exec cycle in a correct and recoverable way.
///
/// The combined result of these behaviors is that:
/// * During an upgrade, managed sockets keep accepting new connections.
/// * Errors in the child process do not interrupt anything using the sockets.
/// * Once a child reports ready it takes over, and the parent is asked to exit. The parent
///   can drain existing connections first; none are closed prematurely.
///
/// Clones refer to the same upgrader.
#[derive(Clone)]
pub struct Upgrader {
    shared: Arc<Shared>,
}

/// The result of [`Upgrader::request_upgrade`], delivered by the upgrade worker.
#[must_use = "an upgrade result is only available through wait"]
#[derive(Debug)]
pub struct PendingUpgrade {
    rx: mpsc::Receiver<Result<(), UpgradeError>>,
}

impl PendingUpgrade {
    fn finished(result: Result<(), UpgradeError>) -> Self {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Block until the upgrade succeeded or failed.
    pub fn wait(self) -> Result<(), UpgradeError> {
        self.rx.recv().unwrap_or(Err(UpgradeError::WorkerLost))
    }
}

impl Shared {
    fn write_pid_file(&self) -> io::Result<()> {
        match &self.options.pid_file {
            Some(pid_file) => utils::write_pid_file(pid_file),
            None => Ok(()),
        }
    }

    fn begin_upgrade(&self) -> Result<(), UpgradeError> {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Idle => (),
            Phase::Upgrading => return Err(UpgradeError::InProgress),
            Phase::ChildReady | Phase::Retiring => return Err(UpgradeError::AlreadyUpgraded),
            Phase::Stopped => return Err(UpgradeError::Stopped),
        }
        if self.parent.is_some() && !self.parent_exited.is_fired() {
            return Err(UpgradeError::ParentStillRunning);
        }
        state.phase = Phase::Upgrading;
        Ok(())
    }

    fn run_upgrade(&self) -> Result<(), UpgradeError> {
        log::info!("Starting upgrade");
        let result = self
            .fds
            .copy()
            .map_err(UpgradeError::Spawn)
            .and_then(|fds| executioner::upgrade(fds, &self.options));

        match result {
            Ok(successor) => {
                self.retire(successor);
                Ok(())
            }
            Err(e) => {
                self.upgrade_failed();
                Err(e)
            }
        }
    }

    // The successor owns every socket now, paths included, so nothing is unlinked here.
    fn retire(&self, successor: Successor) {
        let pid = successor.pid;
        {
            let mut state = self.state.lock();
            state.phase = Phase::ChildReady;
            state.successor = Some(successor);
        }
        let closed = self.fds.close_used();
        log::info!("Handed off to generation {pid}, released {closed} descriptors");

        self.state.lock().phase = Phase::Retiring;
        self.exit.fire();
    }

    fn upgrade_failed(&self) {
        let stop = {
            let mut state = self.state.lock();
            if state.stop_requested {
                state.phase = Phase::Stopped;
            } else {
                state.phase = Phase::Idle;
            }
            state.stop_requested
        };

        if stop {
            self.shut_down();
        } else if let Err(e) = self.write_pid_file() {
            log::warn!("Cannot restore pid file after failed upgrade: {e}");
        }
    }

    // Until this process reports ready, a live parent keeps serving on the same paths.
    fn parent_owns_paths(&self) -> bool {
        self.parent.is_some()
            && self.state.lock().readiness == Readiness::AwaitingSelf
            && !self.parent_exited.is_fired()
    }

    fn shut_down(&self) {
        if self.parent_owns_paths() {
            let closed = self.fds.close_used();
            log::info!("Stopped before taking over: closed {closed} descriptors, unlinked nothing");
        } else {
            let cleanup = self.fds.close_and_remove_used();
            log::info!(
                "Stopped: closed {} descriptors, unlinked {:?}",
                cleanup.closed,
                cleanup.unlinked
            );
        }
        self.exit.fire();
    }

    fn superseded(&self) {
        {
            let mut state = self.state.lock();
            if state.phase == Phase::Idle {
                state.phase = Phase::Stopped;
            }
        }
        self.exit.fire();
    }
}

fn watch_parent(shared: Weak<Shared>, control: Arc<ControlChannel>, pid: Pid) {
    loop {
        match control.recv(None) {
            Ok(Received::Message(Message::Stop)) => {
                log::info!("Parent {pid} asked this generation to stop");
                match shared.upgrade() {
                    Some(shared) => shared.superseded(),
                    None => return,
                }
            }
            Ok(Received::Message(other)) => log::warn!("Unexpected {other:?} from parent {pid}"),
            Ok(Received::TimedOut) => (),
            Ok(Received::Closed) => break,
            Err(e) => {
                log::warn!("Lost the control channel to parent {pid}: {e}");
                break;
            }
        }
    }

    let Some(shared) = shared.upgrade() else {
        return;
    };
    if shared.ready.is_fired() {
        log::info!("Parent {pid} exited");
    } else {
        log::warn!("Parent {pid} went away before this process was ready");
    }
    shared.parent_exited.fire();
}

impl Upgrader {
    /// Set up the upgrader for this process. If this process was started by an upgrade, the
    /// descriptors handed over by the parent are waiting in [`Upgrader::fds`]; otherwise
    /// this is generation zero and the registry starts empty.
    ///
    /// Fails if the upgrade environment is present but unusable.
    pub fn new(options: Options) -> Result<Self, InheritError> {
        match init_child() {
            Ok(Inheritance {
                fds,
                control,
                parent_pid,
            }) => Self::from_parts(options, fds, Some((parent_pid, control))),
            Err(InheritError::NotAnUpgrade) => Self::from_parts(options, Vec::new(), None),
            Err(e) => {
                log::error!("Upgrade environment problem - {e}");
                Err(e)
            }
        }
    }

    fn from_parts(
        options: Options,
        inherited: Vec<HandoffFd>,
        parent: Option<(Pid, ControlChannel)>,
    ) -> Result<Self, InheritError> {
        let fds = FdRegistry::from_inherited(inherited).with_listen_backlog(options.listen_backlog);
        let parent = parent.map(|(pid, control)| ParentLink {
            pid,
            control: Arc::new(control),
        });

        let shared = Arc::new(Shared {
            fds,
            options,
            state: Mutex::new(State {
                phase: Phase::Idle,
                readiness: Readiness::AwaitingSelf,
                stop_requested: false,
                successor: None,
            }),
            parent,
            ready: Notification::new(),
            exit: Notification::new(),
            parent_exited: Notification::new(),
        });

        if let Some(parent) = &shared.parent {
            let weak = Arc::downgrade(&shared);
            let control = parent.control.clone();
            let pid = parent.pid;
            thread::Builder::new()
                .name("moult-parent".to_string())
                .spawn(move || watch_parent(weak, control, pid))
                .map_err(InheritError::ControlChannel)?;
        }

        Ok(Self { shared })
    }

    /// If this process was started by an upgrade, this returns true.
    pub fn has_parent(&self) -> bool {
        self.shared.parent.is_some()
    }

    /// The descriptors this process hands to, and inherited from, other generations.
    pub fn fds(&self) -> &FdRegistry {
        &self.shared.fds
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase
    }

    pub fn readiness(&self) -> Readiness {
        self.shared.state.lock().readiness
    }

    /// Pid of the generation this process handed off to, once it reported ready.
    pub fn successor_pid(&self) -> Option<u32> {
        self.shared.state.lock().successor.as_ref().map(|s| s.pid)
    }

    /// Signal that this process is set up and serving. Call it once every listener has been
    /// claimed from [`Upgrader::fds`].
    ///
    /// Tells the parent (if any) to retire, closes inherited descriptors nobody claimed,
    /// writes the pid file and runs the [`Upgrader::on_ready`] callbacks. If this is never
    /// called the parent keeps serving and eventually gives up on this process. Only the
    /// first call does anything.
    ///
    /// A parent that is already gone is logged, not an error. The error is the pid file's.
    pub fn ready(&self) -> io::Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.readiness == Readiness::Ready {
                log::debug!("Already reported ready");
                return Ok(());
            }
            state.readiness = Readiness::Ready;
        }

        if let Some(parent) = &self.shared.parent {
            match parent.control.send(Message::Ready) {
                Ok(()) => log::info!("Told parent {} this generation is ready", parent.pid),
                Err(e) => log::warn!("Cannot tell parent {} we are ready: {e}", parent.pid),
            }
        }

        let cleanup = self.shared.fds.close_inherited();
        log::debug!(
            "Closed {} unclaimed inherited descriptors, unlinked {:?}",
            cleanup.closed,
            cleanup.unlinked
        );

        let pid_file = self.shared.write_pid_file();
        self.shared.ready.fire();
        pid_file
    }

    /// Run `callback` once this process is ready, or now if it already is.
    pub fn on_ready(&self, callback: impl FnOnce() + Send + 'static) {
        self.shared.ready.subscribe(callback);
    }

    pub fn ready_signal(&self) -> Notification {
        self.shared.ready.clone()
    }

    /// Run `callback` once this process should exit: it handed off to a new generation,
    /// was stopped, or was told to stop by its parent.
    pub fn on_exit_requested(&self, callback: impl FnOnce() + Send + 'static) {
        self.shared.exit.subscribe(callback);
    }

    pub fn exit_requested(&self) -> Notification {
        self.shared.exit.clone()
    }

    /// Begin the upgrade procedure without blocking. The new generation is started and
    /// waited on by a worker thread; the returned [`PendingUpgrade`] yields the outcome.
    ///
    /// On success this process retires: its registry is released and the exit notification
    /// fires. On failure nothing changes and another upgrade may be requested.
    pub fn request_upgrade(&self) -> PendingUpgrade {
        if let Err(e) = self.shared.begin_upgrade() {
            log::warn!("Upgrade refused: {e}");
            return PendingUpgrade::finished(Err(e));
        }

        let (tx, rx) = mpsc::channel();
        let worker_tx = tx.clone();
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("moult-upgrade".to_string())
            .spawn(move || {
                let _ = worker_tx.send(shared.run_upgrade());
            });
        if let Err(e) = spawned {
            log::error!("Cannot start upgrade worker: {e}");
            self.shared.upgrade_failed();
            let _ = tx.send(Err(UpgradeError::Spawn(e)));
        }
        PendingUpgrade { rx }
    }

    /// [`Upgrader::request_upgrade`], waiting for the outcome.
    pub fn upgrade(&self) -> Result<(), UpgradeError> {
        self.request_upgrade().wait()
    }

    /// Shut down for good, without a successor. Upgrades are refused from now on, every
    /// used descriptor is closed and unlinked, and the exit notification fires.
    ///
    /// A child that has not called [`Upgrader::ready`] while its parent is alive closes its
    /// descriptors without unlinking: the parent is still serving on those paths.
    ///
    /// During an upgrade this takes effect once the upgrade fails; if it succeeds the
    /// process retires instead. Note that the application _also_ needs to close its own
    /// copies of each listener for the system to actually stop listening.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        match state.phase {
            Phase::Idle => {
                state.phase = Phase::Stopped;
                drop(state);
                self.shared.shut_down();
            }
            Phase::Upgrading => {
                log::info!("Stop requested during an upgrade, deferring it");
                state.stop_requested = true;
            }
            Phase::ChildReady | Phase::Retiring | Phase::Stopped => {
                log::debug!("Stop requested while {:?}, nothing to do", state.phase);
            }
        }
    }

    /// Block until the parent generation has exited, or `timeout` passes. Returns whether
    /// it exited; a process without a parent returns true right away.
    pub fn wait_for_parent(&self, timeout: Duration) -> bool {
        match &self.shared.parent {
            Some(_) => self.shared.parent_exited.wait_timeout(timeout),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::TcpStream,
        os::unix::net::{UnixListener, UnixStream},
        sync::atomic::{AtomicBool, Ordering},
    };

    use super::*;

    const WAIT: Duration = Duration::from_secs(10);

    fn sh(script: &str) -> Options {
        Options::new()
            .with_upgrade_timeout(WAIT)
            .with_command(ChildCommand::new("/bin/sh", ["-c", script]))
    }

    fn generation_zero(options: Options) -> Upgrader {
        Upgrader::from_parts(options, Vec::new(), None).unwrap()
    }

    /// A child of `parent`, as if it had just been exec'd, plus the parent's end of the
    /// control channel.
    fn child_of(parent: &FdRegistry) -> (Upgrader, ControlChannel) {
        let (parent_end, child_end) = ControlChannel::pair().unwrap();
        let child = Upgrader::from_parts(
            Options::new(),
            parent.copy().unwrap(),
            Some((Pid::this(), child_end)),
        )
        .unwrap();
        (child, parent_end)
    }

    #[test]
    fn generation_zero_becomes_ready_once() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("moult.pid");
        let upgrader = generation_zero(Options::new().with_pid_file(&pid_file));
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        upgrader.on_ready(move || f.store(true, Ordering::SeqCst));

        assert!(!upgrader.has_parent());
        assert!(upgrader.wait_for_parent(Duration::ZERO));
        assert_eq!(upgrader.readiness(), Readiness::AwaitingSelf);

        upgrader.ready().unwrap();
        assert_eq!(upgrader.readiness(), Readiness::Ready);
        assert!(fired.load(Ordering::SeqCst));
        assert!(upgrader.ready_signal().is_fired());
        assert_eq!(
            std::fs::read_to_string(&pid_file).unwrap(),
            std::process::id().to_string()
        );

        std::fs::remove_file(&pid_file).unwrap();
        upgrader.ready().unwrap();
        assert!(!pid_file.exists(), "second ready() did something");
    }

    #[test]
    fn child_reports_ready_and_reconciles() {
        let dir = tempfile::tempdir().unwrap();
        let claimed = dir.path().join("claimed");
        let unclaimed = dir.path().join("unclaimed");
        let parent = FdRegistry::new();
        drop(parent.listen("unix", claimed.to_str().unwrap()).unwrap());
        drop(parent.listen("unix", unclaimed.to_str().unwrap()).unwrap());

        let (child, parent_end) = child_of(&parent);
        assert!(child.has_parent());
        let _listener = child.fds().listen("unix", claimed.to_str().unwrap()).unwrap();
        child.ready().unwrap();

        assert_eq!(
            parent_end.recv(Some(WAIT)).unwrap(),
            Received::Message(Message::Ready)
        );
        assert!(claimed.exists());
        assert!(!unclaimed.exists());
        assert!(child.fds().inherited_names().is_empty());
    }

    #[test]
    fn child_waits_for_parent_exit() {
        let (child, parent_end) = child_of(&FdRegistry::new());

        assert!(!child.wait_for_parent(Duration::from_millis(20)));
        assert!(matches!(
            child.upgrade(),
            Err(UpgradeError::ParentStillRunning)
        ));

        drop(parent_end);
        assert!(child.wait_for_parent(WAIT));
        assert_eq!(child.phase(), Phase::Idle);
    }

    #[test]
    fn stop_from_parent_requests_exit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("socket");
        let parent = FdRegistry::new();
        drop(parent.listen("unix", path.to_str().unwrap()).unwrap());

        let (child, parent_end) = child_of(&parent);
        let _listener = child.fds().listen("unix", path.to_str().unwrap()).unwrap();
        parent_end.send(Message::Stop).unwrap();

        assert!(child.exit_requested().wait_timeout(WAIT));
        assert_eq!(child.phase(), Phase::Stopped);
        // The parent still owns the path.
        assert!(path.exists());
    }

    #[test]
    fn child_stopped_before_ready_leaves_paths_to_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("socket");
        let parent = FdRegistry::new();
        let parent_listener = parent.listen("unix", path.to_str().unwrap()).unwrap();

        let (child, _parent_end) = child_of(&parent);
        drop(child.fds().listen("unix", path.to_str().unwrap()).unwrap());
        child.stop();

        assert_eq!(child.phase(), Phase::Stopped);
        assert!(child.exit_requested().is_fired());
        assert!(child.fds().names().is_empty());
        assert!(path.exists());
        let _client = UnixStream::connect(&path).unwrap();
        parent_listener.as_unix().unwrap().accept().unwrap();

        let cleanup = parent.close_and_remove_used();
        assert_eq!(cleanup.unlinked, vec![path.clone()]);
        assert!(cleanup.errors.is_empty());
    }

    #[test]
    fn ready_child_unlinks_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("socket");
        let parent = FdRegistry::new();
        drop(parent.listen("unix", path.to_str().unwrap()).unwrap());

        let (child, _parent_end) = child_of(&parent);
        drop(child.fds().listen("unix", path.to_str().unwrap()).unwrap());
        child.ready().unwrap();
        parent.close_used();

        child.stop();
        assert_eq!(child.phase(), Phase::Stopped);
        assert!(!path.exists());
    }

    #[test]
    fn parent_gone_before_ready_is_not_fatal() {
        let (child, parent_end) = child_of(&FdRegistry::new());
        drop(parent_end);
        assert!(child.wait_for_parent(WAIT));
        child.ready().unwrap();
        assert_eq!(child.readiness(), Readiness::Ready);
    }

    #[test]
    fn failed_upgrade_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("moult.pid");
        let upgrader = generation_zero(sh("exit 3").with_pid_file(&pid_file));
        let listener = upgrader.fds().listen("tcp", "127.0.0.1:0").unwrap();
        let addr = listener.as_tcp().unwrap().local_addr().unwrap();

        let err = upgrader.upgrade().unwrap_err();
        assert!(matches!(err, UpgradeError::Failed(_)), "{err}");
        assert_eq!(upgrader.phase(), Phase::Idle);
        assert!(!upgrader.exit_requested().is_fired());
        assert_eq!(
            std::fs::read_to_string(&pid_file).unwrap(),
            std::process::id().to_string()
        );

        let again = upgrader.fds().listen("tcp", "127.0.0.1:0").unwrap();
        assert_eq!(again.as_tcp().unwrap().local_addr().unwrap(), addr);
        let _client = TcpStream::connect(addr).unwrap();
        again.as_tcp().unwrap().accept().unwrap();
    }

    #[test]
    fn spawn_failure_is_reported() {
        let options = Options::new()
            .with_command(ChildCommand::new("/nonexistent/moult-child", Vec::<String>::new()));
        let upgrader = generation_zero(options);
        assert!(matches!(upgrader.upgrade(), Err(UpgradeError::Spawn(_))));
        assert_eq!(upgrader.phase(), Phase::Idle);
    }

    #[test]
    fn stop_during_upgrade_is_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("socket");
        let upgrader = generation_zero(sh("sleep 1"));
        drop(upgrader.fds().listen("unix", path.to_str().unwrap()).unwrap());

        let pending = upgrader.request_upgrade();
        assert!(matches!(
            upgrader.request_upgrade().wait(),
            Err(UpgradeError::InProgress)
        ));

        upgrader.stop();
        assert_eq!(upgrader.phase(), Phase::Upgrading);
        assert!(path.exists());

        assert!(matches!(pending.wait(), Err(UpgradeError::Failed(_))));
        assert_eq!(upgrader.phase(), Phase::Stopped);
        assert!(upgrader.exit_requested().is_fired());
        assert!(!path.exists());
        assert!(matches!(upgrader.upgrade(), Err(UpgradeError::Stopped)));
    }

    #[test]
    fn successful_upgrade_retires_without_unlinking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("socket");
        let upgrader = generation_zero(sh("printf R >&3"));
        drop(upgrader.fds().listen("unix", path.to_str().unwrap()).unwrap());

        upgrader.upgrade().unwrap();
        assert_eq!(upgrader.phase(), Phase::Retiring);
        assert!(upgrader.exit_requested().is_fired());
        assert!(upgrader.fds().names().is_empty());
        assert!(upgrader.successor_pid().is_some());
        assert!(path.exists());

        assert!(matches!(
            upgrader.upgrade(),
            Err(UpgradeError::AlreadyUpgraded)
        ));
        upgrader.stop();
        assert_eq!(upgrader.phase(), Phase::Retiring);
        assert!(path.exists());
    }

    #[test]
    fn stop_when_idle_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("socket");
        let upgrader = generation_zero(Options::new());
        drop(upgrader.fds().listen("unix", path.to_str().unwrap()).unwrap());

        upgrader.stop();
        assert_eq!(upgrader.phase(), Phase::Stopped);
        assert!(upgrader.exit_requested().is_fired());
        assert!(!path.exists());
        assert!(matches!(upgrader.upgrade(), Err(UpgradeError::Stopped)));

        // A fresh bind works again: the path is free.
        UnixListener::bind(&path).unwrap();
    }
}
