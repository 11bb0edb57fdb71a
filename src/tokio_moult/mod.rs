//! Tokio wrappers for moult

use std::{
    future::Future,
    io, mem,
    net::SocketAddr,
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
    task::{Context, Poll},
};

use futures::StreamExt;
use parking_lot::RwLock;
use socket2::Socket;
use tokio::{
    net::{TcpListener, UdpSocket, UnixDatagram, UnixListener},
    signal::unix::signal,
    sync::Notify,
};
use tokio_stream::wrappers::{SignalStream, TcpListenerStream, UnixListenerStream};

use crate::{Phase, UpgradeError, Upgrader};

use supervisor::Supervisor;
use trigger::{Trigger, TriggerReason};

pub mod supervisor;
mod trigger;

// re-export
pub use supervisor::{StopOnShutdown, Stoppable, StoppableStream};
pub use tokio::signal::unix::SignalKind;

/// [`ExitMode`] represents how monitoring ended.
#[derive(Debug, PartialEq, Eq)]
pub enum ExitMode {
    /// A new generation took over.
    Upgrade,
    /// This process stopped without a successor.
    Stop,
}

/// Holds relevant information relating to the reason why a shutdown or upgrade was initiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Signal(SignalKind),
    UnixListener(PathBuf),
    /// The upgrader asked this process to exit outside of the triggers: its parent abandoned
    /// it, or it was upgraded or stopped through [`TokioMoult::upgrader`].
    Requested,
}

#[derive(Debug, Copy, Clone)]
pub(crate) enum ExitCondition {
    Upgrade,
    Stop,
}

pub type TokioMoultResult = Result<(ExitMode, ExitReason), String>;

fn path_address(path: &Path) -> io::Result<&str> {
    path.to_str().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{path:?} is not valid UTF-8"),
        )
    })
}

fn wrong_variant(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("registry did not return a {what}"))
}

pub struct TokioMoultBuilder {
    tokio_moult: TokioMoult,
    triggers: Vec<(Trigger, ExitCondition)>,
}

/// Allows methods to be called on TokioMoult in order to build and inherit sockets before
/// ready() is called.
impl Deref for TokioMoultBuilder {
    type Target = TokioMoult;

    fn deref(&self) -> &Self::Target {
        &self.tokio_moult
    }
}

impl TokioMoultBuilder {
    pub fn new(upgrader: Upgrader, upgrade_signal_kind: SignalKind) -> io::Result<Self> {
        let triggers: Vec<(Trigger, ExitCondition)> = vec![(
            Trigger::Signal(
                upgrade_signal_kind,
                SignalStream::new(signal(upgrade_signal_kind)?),
            ),
            ExitCondition::Upgrade,
        )];

        Ok(Self {
            tokio_moult: TokioMoult::new(upgrader),
            triggers,
        })
    }

    /// Set TokioMoult to cleanly shutdown the process when it receives `signal_kind`. This
    /// registers a signal handler for it along with the upgrade signal given at construction
    /// time. The stop signal should not be the upgrade signal; if they are the same, the
    /// signal results in an upgrade. Multiple, distinct stop signals can be registered
    /// through repeated calls to this method.
    pub fn stop_on_signal(&mut self, signal_kind: SignalKind) -> io::Result<()> {
        self.triggers.push((
            Trigger::Signal(signal_kind, SignalStream::new(signal(signal_kind)?)),
            ExitCondition::Stop,
        ));
        Ok(())
    }

    fn trigger_on_socket<P>(
        &mut self,
        listen_path: P,
        trigger_action: ExitCondition,
    ) -> io::Result<()>
    where
        P: AsRef<Path> + std::fmt::Debug,
    {
        self.triggers.push((
            Trigger::Uds(
                listen_path.as_ref().to_path_buf(),
                self.tokio_moult
                    .listen_unix(StopOnShutdown::Yes, listen_path)?,
            ),
            trigger_action,
        ));
        Ok(())
    }

    /// Set TokioMoult to listen on a unix domain socket at `listen_path` and trigger an upgrade
    /// when a connection is made to this socket. This connection remains open until the upgrade
    /// has been completed.
    pub fn upgrade_on_socket<P>(&mut self, listen_path: P) -> io::Result<()>
    where
        P: AsRef<Path> + std::fmt::Debug,
    {
        self.trigger_on_socket(listen_path, ExitCondition::Upgrade)
    }

    /// Set TokioMoult to listen on a unix domain socket at `listen_path` and trigger a graceful
    /// shutdown when a connection is made to this socket. This connection remains open until
    /// the process exits.
    pub fn stop_on_socket<P>(&mut self, listen_path: P) -> io::Result<()>
    where
        P: AsRef<Path> + std::fmt::Debug,
    {
        self.trigger_on_socket(listen_path, ExitCondition::Stop)
    }

    /// Consume this builder and signal readiness. Returns an `Arc<TokioMoult>`, with which
    /// further sockets may optionally be created, and a future to await for the upgrade or
    /// shutdown.
    pub fn ready(
        self,
    ) -> io::Result<(Arc<TokioMoult>, impl Future<Output = TokioMoultResult>)> {
        let Self {
            tokio_moult,
            triggers,
        } = self;

        let exit_requested = Arc::new(Notify::new());
        let notify = exit_requested.clone();
        tokio_moult
            .inner
            .on_exit_requested(move || notify.notify_one());

        tokio_moult.inner.ready()?;

        let tokio_moult_arc = Arc::new(tokio_moult);
        let monitor = TokioMoultMonitor {
            tokio_moult: tokio_moult_arc.clone(),
            triggers,
            exit_requested,
        };

        Ok((tokio_moult_arc, monitor.monitor()))
    }
}

/// Tokio-ready upgrader wrapper
///
/// This both wraps [`Upgrader`] and provides a bit of extra functionality that is non-obvious to
/// implement in tokio. The future returned by [`TokioMoultBuilder::ready`] waits for a unix
/// signal (set at initialization) or a connection on a trigger socket. Once triggered, it
/// runs the upgrade and on success stops all supervised listeners, so the process can wait
/// for ongoing connections to drain before returning from the tokio runtime.
///
/// The streams returned by `listen_*` and `build_listen_tcp` are [`StoppableStream`]s, thin
/// wrappers around [`TcpListener`] and [`UnixListener`] that allow the stream of new connections
/// to be stopped by the supervisor, closing the listening socket. Connections that were already
/// established are maintained until they end naturally.
pub struct TokioMoult {
    supervisor: RwLock<Supervisor>,
    inner: Upgrader,
}

impl TokioMoult {
    fn new(upgrader: Upgrader) -> Self {
        Self {
            supervisor: RwLock::new(Supervisor::new()),
            inner: upgrader,
        }
    }

    /// Determine if this is the first run of the program, or an upgraded child.
    pub fn has_parent(&self) -> bool {
        self.inner.has_parent()
    }

    /// The wrapped upgrader, for blocking sockets and direct registry access.
    pub fn upgrader(&self) -> &Upgrader {
        &self.inner
    }

    /// Listen on a unix domain socket. Returns a [`StoppableStream`] ready for the tokio reactor
    pub fn listen_unix<P>(
        &self,
        stop_on_shutdown: StopOnShutdown,
        path: P,
    ) -> io::Result<StoppableStream<UnixListenerStream>>
    where
        P: AsRef<Path> + std::fmt::Debug,
    {
        log::debug!("Creating unix listener at: {path:?}");
        let listener = self
            .inner
            .fds()
            .listen("unix", path_address(path.as_ref())?)?
            .into_unix()
            .ok_or_else(|| wrong_variant("unix listener"))?;
        listener.set_nonblocking(true)?;
        let listener = UnixListenerStream::new(UnixListener::from_std(listener)?);
        Ok(self
            .supervisor
            .read()
            .supervise_stream(listener, stop_on_shutdown))
    }

    /// Listen on a TCP socket. Returns a StoppableStream ready for the tokio reactor
    pub fn listen_tcp(
        &self,
        stop_on_shutdown: StopOnShutdown,
        addr: SocketAddr,
    ) -> io::Result<StoppableStream<TcpListenerStream>> {
        log::debug!("Creating TCP listener on: {addr:?}");
        let listener = self
            .inner
            .fds()
            .listen("tcp", &addr.to_string())?
            .into_tcp()
            .ok_or_else(|| wrong_variant("tcp listener"))?;
        self.supervise_tcp(listener, stop_on_shutdown)
    }

    /// Listen on a TCP socket. Returns a [`StoppableStream`] ready for the tokio reactor. See
    /// [`crate::FdRegistry::build_listen_tcp()`] for details about the closure argument.
    pub fn build_listen_tcp<F>(
        &self,
        stop_on_shutdown: StopOnShutdown,
        addr: SocketAddr,
        sock_build: F,
    ) -> io::Result<StoppableStream<TcpListenerStream>>
    where
        F: FnOnce(Socket, SocketAddr) -> io::Result<std::net::TcpListener>,
    {
        let listener = self
            .inner
            .fds()
            .build_listen_tcp(&addr.to_string(), sock_build)?;
        self.supervise_tcp(listener, stop_on_shutdown)
    }

    fn supervise_tcp(
        &self,
        listener: std::net::TcpListener,
        stop_on_shutdown: StopOnShutdown,
    ) -> io::Result<StoppableStream<TcpListenerStream>> {
        listener.set_nonblocking(true)?;
        let listener = TcpListenerStream::new(TcpListener::from_std(listener)?);
        Ok(self
            .supervisor
            .read()
            .supervise_stream(listener, stop_on_shutdown))
    }

    /// A UDP socket bound to `addr`. Returns [`Stoppable<UdpSocket>`].
    pub fn socket_udp(
        &self,
        stop_on_shutdown: StopOnShutdown,
        addr: SocketAddr,
    ) -> io::Result<Stoppable<UdpSocket>> {
        log::debug!("Creating UDP socket on: {addr:?}");
        let socket = self
            .inner
            .fds()
            .conn("udp", &addr.to_string())?
            .into_udp()
            .ok_or_else(|| wrong_variant("udp socket"))?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket)?;
        Ok(self.supervisor.read().supervise(socket, stop_on_shutdown))
    }

    /// A unix datagram socket bound to `path`. Returns [`Stoppable<UnixDatagram>`].
    pub fn socket_unixgram<P>(
        &self,
        stop_on_shutdown: StopOnShutdown,
        path: P,
    ) -> io::Result<Stoppable<UnixDatagram>>
    where
        P: AsRef<Path> + std::fmt::Debug,
    {
        log::debug!("Creating unix datagram socket at: {path:?}");
        let socket = self
            .inner
            .fds()
            .conn("unixgram", path_address(path.as_ref())?)?
            .into_unix()
            .ok_or_else(|| wrong_variant("unix datagram socket"))?;
        socket.set_nonblocking(true)?;
        let socket = UnixDatagram::from_std(socket)?;
        Ok(self.supervisor.read().supervise(socket, stop_on_shutdown))
    }
}

struct TokioMoultMonitor {
    tokio_moult: Arc<TokioMoult>,
    triggers: Vec<(Trigger, ExitCondition)>,
    exit_requested: Arc<Notify>,
}

/// Wait for an upgrade on a blocking worker. See [`Upgrader::request_upgrade()`] for details.
async fn upgrade(upgrader: &Upgrader) -> Result<Result<(), UpgradeError>, String> {
    let pending = upgrader.request_upgrade();
    tokio::task::spawn_blocking(move || pending.wait())
        .await
        .map_err(|e| e.to_string())
}

impl TokioMoultMonitor {
    async fn monitor_triggers(&mut self) -> io::Result<(TriggerReason, ExitCondition)> {
        fn poll_triggers(
            triggers: &mut [(Trigger, ExitCondition)],
            cx: &mut Context,
        ) -> Poll<io::Result<(TriggerReason, ExitCondition)>> {
            for (trigger, ec) in triggers {
                match trigger.poll_next_unpin(cx) {
                    Poll::Ready(Some(result)) => return Poll::Ready(result.map(|o| (o, *ec))),
                    Poll::Ready(None) => {
                        return Poll::Ready(Err(io::Error::other("trigger ended")));
                    }
                    Poll::Pending => (),
                }
            }

            Poll::Pending
        }

        std::future::poll_fn(|cx| poll_triggers(&mut self.triggers, cx)).await
    }

    fn stop_supervised(&self, ec: ExitCondition) -> Result<(), String> {
        self.tokio_moult
            .supervisor
            .write()
            .stop_all(ec)
            .map_err(|_| "Cannot stop supervised listeners!".into())
    }

    fn quit(&self) -> Result<(), String> {
        self.tokio_moult.inner.stop();
        self.stop_supervised(ExitCondition::Stop)
    }

    /// [`TokioMoultMonitor::monitor()`] consumes the monitor, starts watching the triggers,
    /// and executes the upgrade once it is triggered.
    async fn monitor(mut self) -> TokioMoultResult {
        loop {
            let exit_requested = self.exit_requested.clone();
            let reason_condition = tokio::select! {
                result = self.monitor_triggers() => match result {
                    Ok(reason_condition) => reason_condition,
                    Err(e) => {
                        self.quit()?;
                        return Err(format!("Encountered error while polling triggers: {e}"));
                    }
                },
                () = exit_requested.notified() => {
                    let phase = self.tokio_moult.inner.phase();
                    log::warn!("Exit requested outside of the triggers while {phase:?}");
                    let (mode, ec) = match phase {
                        Phase::ChildReady | Phase::Retiring => {
                            (ExitMode::Upgrade, ExitCondition::Upgrade)
                        }
                        _ => (ExitMode::Stop, ExitCondition::Stop),
                    };
                    self.stop_supervised(ec)?;
                    return Ok((mode, ExitReason::Requested));
                }
            };

            let upgrade_reason = match reason_condition {
                (reason, ExitCondition::Upgrade) => reason,
                (reason, ExitCondition::Stop) => {
                    log::warn!("Stopping (reason: {reason:?})");

                    let exit_reason = match reason {
                        TriggerReason::Signal(kind) => ExitReason::Signal(kind),
                        TriggerReason::UnixStream(path, stream) => {
                            // We mem::forget the open stream here so that the stream is not
                            // dropped until the whole process shuts down.
                            mem::forget(stream);
                            ExitReason::UnixListener(path)
                        }
                    };

                    self.quit()?;
                    return Ok((ExitMode::Stop, exit_reason));
                }
            };

            // at this point, we know we need to upgrade
            log::warn!("Starting upgrade (reason: {upgrade_reason:?})");
            let upgrader = self.tokio_moult.inner.clone();
            match upgrade(&upgrader).await {
                Ok(Ok(())) => {
                    log::info!("Upgrade successful");
                    self.stop_supervised(ExitCondition::Upgrade)?;
                    return Ok((
                        ExitMode::Upgrade,
                        match upgrade_reason {
                            TriggerReason::Signal(kind) => ExitReason::Signal(kind),
                            TriggerReason::UnixStream(path, _stream) => {
                                ExitReason::UnixListener(path)
                            }
                        },
                    ));
                }
                Ok(Err(e)) => {
                    // something went wrong during the upgrade, try again
                    log::warn!("Upgrade failed: {e}");
                    log::warn!("Returning to listening state!");
                    continue;
                }
                Err(err_str) => {
                    // the worker panicked or was cancelled
                    // Die and let any external process supervisors take over
                    self.quit()?;
                    return Err(format!("Encountered a problem during upgrade: {err_str}"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nix::{sys::signal::Signal, unistd::Pid};
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::{
        control::{ControlChannel, Message, Received},
        ChildCommand, Options,
    };

    const WAIT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn stop_on_signal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.sock");

        let upgrader = Upgrader::new(Options::new()).unwrap();
        let mut builder = TokioMoultBuilder::new(upgrader, SignalKind::hangup()).unwrap();
        builder.stop_on_signal(SignalKind::user_defined2()).unwrap();
        let mut incoming = builder.listen_unix(StopOnShutdown::Yes, &path).unwrap();
        let (moult, monitor) = builder.ready().unwrap();
        let monitor = tokio::spawn(monitor);

        nix::sys::signal::raise(Signal::SIGUSR2).unwrap();
        let (mode, reason) = tokio::time::timeout(WAIT, monitor)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(mode, ExitMode::Stop);
        assert_eq!(reason, ExitReason::Signal(SignalKind::user_defined2()));
        assert!(incoming.next().await.is_none());
        assert_eq!(moult.upgrader().phase(), Phase::Stopped);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn failed_upgrade_keeps_monitoring() {
        let dir = tempfile::tempdir().unwrap();
        let upgrade_path = dir.path().join("upgrade.sock");
        let stop_path = dir.path().join("stop.sock");

        let options = Options::new()
            .with_upgrade_timeout(WAIT)
            .with_command(ChildCommand::new("/bin/sh", ["-c", "exit 1"]));
        let upgrader = Upgrader::new(options).unwrap();
        let mut builder = TokioMoultBuilder::new(upgrader, SignalKind::window_change()).unwrap();
        builder.upgrade_on_socket(&upgrade_path).unwrap();
        builder.stop_on_socket(&stop_path).unwrap();
        let (moult, monitor) = builder.ready().unwrap();
        let monitor = tokio::spawn(monitor);

        // The trigger connection is dropped once the failed upgrade has been handled.
        let mut trigger = tokio::net::UnixStream::connect(&upgrade_path).await.unwrap();
        let mut buf = [0; 1];
        let n = tokio::time::timeout(WAIT, trigger.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(moult.upgrader().phase(), Phase::Idle);

        let _stop = tokio::net::UnixStream::connect(&stop_path).await.unwrap();
        let (mode, reason) = tokio::time::timeout(WAIT, monitor)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(mode, ExitMode::Stop);
        assert_eq!(reason, ExitReason::UnixListener(stop_path.clone()));
        assert!(!upgrade_path.exists());
        assert!(!stop_path.exists());
    }

    #[tokio::test]
    async fn parent_stop_supersedes() {
        let (parent_end, child_end) = ControlChannel::pair().unwrap();
        let upgrader =
            Upgrader::from_parts(Options::new(), Vec::new(), Some((Pid::this(), child_end)))
                .unwrap();
        let builder = TokioMoultBuilder::new(upgrader, SignalKind::window_change()).unwrap();
        let (moult, monitor) = builder.ready().unwrap();

        assert_eq!(
            parent_end.recv(Some(WAIT)).unwrap(),
            Received::Message(Message::Ready)
        );
        parent_end.send(Message::Stop).unwrap();

        let (mode, reason) = tokio::time::timeout(WAIT, monitor).await.unwrap().unwrap();
        assert_eq!(mode, ExitMode::Stop);
        assert_eq!(reason, ExitReason::Requested);
        assert_eq!(moult.upgrader().phase(), Phase::Stopped);
    }
}
