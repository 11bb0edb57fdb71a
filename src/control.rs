//! The private channel between a parent and the child it spawned. It is a connected unix
//! stream pair: the child's end sits at [`CONTROL_FD`](crate::utils::CONTROL_FD) after
//! exec, outside the handoff index. Messages are single bytes.

use std::{
    io::{self, Read},
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
        unix::net::UnixStream,
    },
    time::Duration,
};

use nix::sys::socket::{send, MsgFlags};

const READY: u8 = b'R';
const STOP: u8 = b'S';

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    /// Child to parent: every listener is claimed and serving.
    Ready,
    /// Parent to child: shut down, this generation is being abandoned.
    Stop,
    Unknown(u8),
}

impl Message {
    fn from_byte(byte: u8) -> Self {
        match byte {
            READY => Self::Ready,
            STOP => Self::Stop,
            other => Self::Unknown(other),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::Ready => READY,
            Self::Stop => STOP,
            Self::Unknown(byte) => byte,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Received {
    Message(Message),
    /// The other end is gone: the peer process exited or dropped the channel.
    Closed,
    TimedOut,
}

#[derive(Debug)]
pub(crate) struct ControlChannel {
    stream: UnixStream,
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn send_flags() -> MsgFlags {
    MsgFlags::MSG_NOSIGNAL
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn send_flags() -> MsgFlags {
    MsgFlags::empty()
}

impl ControlChannel {
    /// A connected pair: `(parent end, child end)`. Both ends are CLOEXEC; the spawner moves
    /// the child end into place.
    pub(crate) fn pair() -> io::Result<(Self, Self)> {
        let (parent, child) = UnixStream::pair()?;
        Ok((Self { stream: parent }, Self { stream: child }))
    }

    pub(crate) fn from_fd(fd: OwnedFd) -> Self {
        Self { stream: fd.into() }
    }

    /// Send one message. A peer that already went away shows up as `BrokenPipe`, never as
    /// `SIGPIPE`.
    pub(crate) fn send(&self, message: Message) -> io::Result<()> {
        loop {
            match send(self.stream.as_raw_fd(), &[message.to_byte()], send_flags()) {
                Ok(1) => return Ok(()),
                Ok(_) => return Err(io::ErrorKind::WriteZero.into()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Wait for the next message. With a timeout, [`Received::TimedOut`] leaves the channel
    /// intact: a message arriving later is returned by the next call.
    pub(crate) fn recv(&self, timeout: Option<Duration>) -> io::Result<Received> {
        // A zero read timeout is rejected by the OS; treat it as the shortest wait instead.
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        self.stream.set_read_timeout(timeout)?;

        let mut buf = [0; 1];
        loop {
            match (&self.stream).read(&mut buf) {
                Ok(0) => return Ok(Received::Closed),
                Ok(_) => return Ok(Received::Message(Message::from_byte(buf[0]))),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(Received::TimedOut)
                }
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    return Ok(Received::Closed)
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl AsFd for ControlChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl From<ControlChannel> for OwnedFd {
    fn from(channel: ControlChannel) -> Self {
        channel.stream.into()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn messages_cross_both_ways() {
        let (parent, child) = ControlChannel::pair().unwrap();

        child.send(Message::Ready).unwrap();
        assert_eq!(parent.recv(None).unwrap(), Received::Message(Message::Ready));

        parent.send(Message::Stop).unwrap();
        assert_eq!(child.recv(None).unwrap(), Received::Message(Message::Stop));
    }

    #[test]
    fn timeout_leaves_channel_intact() {
        let (parent, child) = ControlChannel::pair().unwrap();

        let start = Instant::now();
        let received = parent.recv(Some(Duration::from_millis(50))).unwrap();
        assert_eq!(received, Received::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(40));

        child.send(Message::Ready).unwrap();
        assert_eq!(
            parent.recv(Some(Duration::from_secs(5))).unwrap(),
            Received::Message(Message::Ready)
        );
    }

    #[test]
    fn dropped_peer_reads_as_closed() {
        let (parent, child) = ControlChannel::pair().unwrap();
        drop(child);
        assert_eq!(parent.recv(Some(Duration::ZERO)).unwrap(), Received::Closed);
    }

    #[test]
    fn send_to_dropped_peer_is_broken_pipe() {
        let (parent, child) = ControlChannel::pair().unwrap();
        drop(parent);
        let err = child.send(Message::Ready).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn unknown_bytes_are_surfaced() {
        let (parent, child) = ControlChannel::pair().unwrap();
        child.send(Message::Unknown(b'?')).unwrap();
        assert_eq!(
            parent.recv(None).unwrap(),
            Received::Message(Message::Unknown(b'?'))
        );
    }

    #[test]
    fn adopted_descriptor_keeps_talking() {
        let (parent, child) = ControlChannel::pair().unwrap();
        let child = ControlChannel::from_fd(OwnedFd::from(child));
        child.send(Message::Ready).unwrap();
        assert_eq!(parent.recv(None).unwrap(), Received::Message(Message::Ready));
    }
}
