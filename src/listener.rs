use std::{
    io,
    net::{TcpListener, UdpSocket},
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
        unix::net::{SocketAddr, UnixDatagram, UnixListener},
    },
};

use crate::{handle::FdKind, network::Network};

/// A listening socket handed out by the registry.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    pub(crate) fn from_fd(network: Network, fd: OwnedFd) -> Self {
        if network.is_unix() {
            Self::Unix(fd.into())
        } else {
            Self::Tcp(fd.into())
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Self::Tcp(l) => l.set_nonblocking(nonblocking),
            Self::Unix(l) => l.set_nonblocking(nonblocking),
        }
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(match self {
            Self::Tcp(l) => Self::Tcp(l.try_clone()?),
            Self::Unix(l) => Self::Unix(l.try_clone()?),
        })
    }

    pub fn as_tcp(&self) -> Option<&TcpListener> {
        match self {
            Self::Tcp(l) => Some(l),
            Self::Unix(_) => None,
        }
    }

    pub fn as_unix(&self) -> Option<&UnixListener> {
        match self {
            Self::Unix(l) => Some(l),
            Self::Tcp(_) => None,
        }
    }

    pub fn into_tcp(self) -> Option<TcpListener> {
        match self {
            Self::Tcp(l) => Some(l),
            Self::Unix(_) => None,
        }
    }

    pub fn into_unix(self) -> Option<UnixListener> {
        match self {
            Self::Unix(l) => Some(l),
            Self::Tcp(_) => None,
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Tcp(l) => l.as_fd(),
            Self::Unix(l) => l.as_fd(),
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

/// A datagram socket handed out by the registry.
#[derive(Debug)]
pub enum PacketConn {
    Udp(UdpSocket),
    Unix(UnixDatagram),
}

impl PacketConn {
    pub(crate) fn from_fd(network: Network, fd: OwnedFd) -> Self {
        if network.is_unix() {
            Self::Unix(fd.into())
        } else {
            Self::Udp(fd.into())
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Self::Udp(s) => s.set_nonblocking(nonblocking),
            Self::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    pub fn as_udp(&self) -> Option<&UdpSocket> {
        match self {
            Self::Udp(s) => Some(s),
            Self::Unix(_) => None,
        }
    }

    pub fn as_unix(&self) -> Option<&UnixDatagram> {
        match self {
            Self::Unix(s) => Some(s),
            Self::Udp(_) => None,
        }
    }

    pub fn into_udp(self) -> Option<UdpSocket> {
        match self {
            Self::Udp(s) => Some(s),
            Self::Unix(_) => None,
        }
    }

    pub fn into_unix(self) -> Option<UnixDatagram> {
        match self {
            Self::Unix(s) => Some(s),
            Self::Udp(_) => None,
        }
    }
}

impl AsFd for PacketConn {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Udp(s) => s.as_fd(),
            Self::Unix(s) => s.as_fd(),
        }
    }
}

impl AsRawFd for PacketConn {
    fn as_raw_fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

/// Sockets that know the `(network, address)` pair they should be registered under. See
/// [`crate::FdRegistry::register`].
pub trait Registrable: AsFd {
    const KIND: FdKind;

    fn registration(&self) -> io::Result<(&'static str, String)>;
}

fn unix_address(addr: &SocketAddr) -> String {
    if let Some(path) = addr.as_pathname() {
        return path.to_string_lossy().into_owned();
    }
    #[cfg(target_os = "linux")]
    {
        use std::os::linux::net::SocketAddrExt;
        if let Some(name) = addr.as_abstract_name() {
            return format!("@{}", String::from_utf8_lossy(name));
        }
    }
    String::new()
}

impl Registrable for TcpListener {
    const KIND: FdKind = FdKind::Listener;

    fn registration(&self) -> io::Result<(&'static str, String)> {
        Ok(("tcp", self.local_addr()?.to_string()))
    }
}

impl Registrable for UnixListener {
    const KIND: FdKind = FdKind::Listener;

    fn registration(&self) -> io::Result<(&'static str, String)> {
        Ok(("unix", unix_address(&self.local_addr()?)))
    }
}

impl Registrable for UdpSocket {
    const KIND: FdKind = FdKind::PacketConn;

    fn registration(&self) -> io::Result<(&'static str, String)> {
        Ok(("udp", self.local_addr()?.to_string()))
    }
}

impl Registrable for UnixDatagram {
    const KIND: FdKind = FdKind::PacketConn;

    fn registration(&self) -> io::Result<(&'static str, String)> {
        Ok(("unixgram", unix_address(&self.local_addr()?)))
    }
}
