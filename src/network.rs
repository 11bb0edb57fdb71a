//! Network names, address resolution and the fresh-create path of the registry.

use std::{
    env,
    io,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    os::{fd::OwnedFd, unix::net::UnixDatagram},
    path::{Path, PathBuf},
};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::{handle::FdKind, registry::RegistryError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
    Udp,
    Udp4,
    Udp6,
    Unixgram,
}

impl Network {
    pub(crate) fn parse(network: &str) -> Option<Self> {
        Some(match network {
            "tcp" => Self::Tcp,
            "tcp4" => Self::Tcp4,
            "tcp6" => Self::Tcp6,
            "unix" => Self::Unix,
            "udp" => Self::Udp,
            "udp4" => Self::Udp4,
            "udp6" => Self::Udp6,
            "unixgram" => Self::Unixgram,
            _ => return None,
        })
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
            Self::Unix => "unix",
            Self::Udp => "udp",
            Self::Udp4 => "udp4",
            Self::Udp6 => "udp6",
            Self::Unixgram => "unixgram",
        }
    }

    pub(crate) fn kind(self) -> FdKind {
        match self {
            Self::Tcp | Self::Tcp4 | Self::Tcp6 | Self::Unix => FdKind::Listener,
            Self::Udp | Self::Udp4 | Self::Udp6 | Self::Unixgram => FdKind::PacketConn,
        }
    }

    pub(crate) fn is_unix(self) -> bool {
        matches!(self, Self::Unix | Self::Unixgram)
    }

    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Tcp4 | Self::Udp4 => addr.is_ipv4(),
            Self::Tcp6 | Self::Udp6 => addr.is_ipv6(),
            _ => true,
        }
    }
}

/// Name under which a `(network, address)` pair is registered.
pub(crate) fn fd_name(network: &str, address: &str) -> String {
    format!("{network}:{address}")
}

fn invalid(network: Network, address: &str, reason: impl Into<String>) -> RegistryError {
    RegistryError::InvalidAddress {
        name: fd_name(network.as_str(), address),
        reason: reason.into(),
    }
}

pub(crate) fn bind_error(network: Network, address: &str, e: io::Error) -> RegistryError {
    match e.kind() {
        io::ErrorKind::AddrInUse => RegistryError::AddressInUse {
            name: fd_name(network.as_str(), address),
        },
        io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => {
            invalid(network, address, e.to_string())
        }
        _ => RegistryError::Io(e),
    }
}

/// Resolve `host:port` for an inet network. An empty host means the unspecified address,
/// so `":8080"` listens on every interface.
pub(crate) fn resolve_inet(network: Network, address: &str) -> Result<SocketAddr, RegistryError> {
    let expanded;
    let address_to_resolve = if address.starts_with(':') {
        let host = match network {
            Network::Tcp6 | Network::Udp6 => "[::]",
            _ => "0.0.0.0",
        };
        expanded = format!("{host}{address}");
        expanded.as_str()
    } else {
        address
    };

    let mut candidates = address_to_resolve
        .to_socket_addrs()
        .map_err(|e| invalid(network, address, e.to_string()))?;
    candidates
        .find(|addr| network.accepts(addr))
        .ok_or_else(|| invalid(network, address, "no address of the requested family"))
}

enum UnixAddress<'a> {
    Unnamed,
    Path(&'a Path),
    #[cfg(target_os = "linux")]
    Abstract(&'a [u8]),
}

fn unix_address(address: &str) -> UnixAddress<'_> {
    if address.is_empty() {
        return UnixAddress::Unnamed;
    }
    #[cfg(target_os = "linux")]
    if let Some(name) = address.strip_prefix('@') {
        return UnixAddress::Abstract(name.as_bytes());
    }
    UnixAddress::Path(Path::new(address))
}

#[cfg(target_os = "linux")]
fn abstract_addr(name: &[u8]) -> io::Result<std::os::unix::net::SocketAddr> {
    use std::os::linux::net::SocketAddrExt;
    std::os::unix::net::SocketAddr::from_abstract_name(name)
}

/// Socket paths are bound absolute. The bound path is what gets unlinked later, possibly
/// by a generation running in another directory.
fn absolute(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}

fn unix_listener_addr(address: &str) -> io::Result<Option<SockAddr>> {
    match unix_address(address) {
        UnixAddress::Unnamed => Ok(None),
        UnixAddress::Path(path) => SockAddr::unix(absolute(path)?).map(Some),
        #[cfg(target_os = "linux")]
        UnixAddress::Abstract(name) => {
            use std::{ffi::OsStr, os::unix::ffi::OsStrExt};
            let mut raw = Vec::with_capacity(name.len() + 1);
            raw.push(0);
            raw.extend_from_slice(name);
            SockAddr::unix(OsStr::from_bytes(&raw)).map(Some)
        }
    }
}

pub(crate) fn tcp_socket(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    Ok(socket)
}

/// Bind and listen on a fresh socket for `network`/`address`.
pub(crate) fn fresh_listener(
    network: Network,
    address: &str,
    backlog: i32,
) -> Result<OwnedFd, RegistryError> {
    match network {
        Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
            let addr = resolve_inet(network, address)?;
            let socket = tcp_socket(addr)?;
            socket
                .bind(&addr.into())
                .and_then(|()| socket.listen(backlog))
                .map_err(|e| bind_error(network, address, e))?;
            Ok(socket.into())
        }
        Network::Unix => {
            let addr = unix_listener_addr(address)
                .map_err(|e| bind_error(network, address, e))?
                .ok_or_else(|| invalid(network, address, "a unix listener needs an address"))?;
            let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
            socket
                .bind(&addr)
                .and_then(|()| socket.listen(backlog))
                .map_err(|e| bind_error(network, address, e))?;
            Ok(socket.into())
        }
        _ => Err(invalid(network, address, "not a listener network")),
    }
}

/// Bind a fresh datagram socket for `network`/`address`. An empty `unixgram` address yields
/// an unbound socket.
pub(crate) fn fresh_packet_conn(network: Network, address: &str) -> Result<OwnedFd, RegistryError> {
    match network {
        Network::Udp | Network::Udp4 | Network::Udp6 => {
            let addr = resolve_inet(network, address)?;
            let socket = UdpSocket::bind(addr).map_err(|e| bind_error(network, address, e))?;
            Ok(socket.into())
        }
        Network::Unixgram => {
            let socket = match unix_address(address) {
                UnixAddress::Unnamed => UnixDatagram::unbound(),
                UnixAddress::Path(path) => absolute(path).and_then(UnixDatagram::bind),
                #[cfg(target_os = "linux")]
                UnixAddress::Abstract(name) => {
                    abstract_addr(name).and_then(|addr| UnixDatagram::bind_addr(&addr))
                }
            }
            .map_err(|e| bind_error(network, address, e))?;
            Ok(socket.into())
        }
        _ => Err(invalid(network, address, "not a packet network")),
    }
}
