use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    io,
    net::{SocketAddr, TcpListener},
    os::fd::{AsFd, BorrowedFd, OwnedFd},
};

use parking_lot::Mutex;
use socket2::{SockRef, Socket, Type};

use crate::{
    handle::{Cleanup, FdHandle, FdKind, HandoffFd, Origin},
    listener::{Listener, PacketConn, Registrable},
    network::{
        bind_error, fd_name, fresh_listener, fresh_packet_conn, resolve_inet, tcp_socket, Network,
    },
};

pub(crate) const DEFAULT_BACKLOG: i32 = 128;

#[derive(Debug, derive_more::Display, derive_more::From)]
pub enum RegistryError {
    #[display("invalid address {name:?}: {reason}")]
    InvalidAddress { name: String, reason: String },

    #[display("address already in use: {name:?}")]
    AddressInUse { name: String },

    #[display("nothing inherited under {name:?}")]
    NotFound { name: String },

    #[display("{name:?} is already registered")]
    DuplicateName { name: String },

    #[display("{name:?} is registered as a {found}, not a {expected}")]
    KindMismatch {
        name: String,
        expected: FdKind,
        found: FdKind,
    },

    #[display("cannot register {name:?}: {reason}")]
    InvalidDescriptor { name: String, reason: String },

    #[display("I/O error: {_0}")]
    #[from]
    Io(io::Error),
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RegistryError> for io::Error {
    fn from(e: RegistryError) -> Self {
        let kind = match e {
            RegistryError::Io(inner) => return inner,
            RegistryError::AddressInUse { .. } => io::ErrorKind::AddrInUse,
            RegistryError::NotFound { .. } => io::ErrorKind::NotFound,
            RegistryError::DuplicateName { .. } => io::ErrorKind::AlreadyExists,
            RegistryError::InvalidAddress { .. }
            | RegistryError::KindMismatch { .. }
            | RegistryError::InvalidDescriptor { .. } => io::ErrorKind::InvalidInput,
        };
        io::Error::new(kind, e)
    }
}

/// File descriptor tracking. This maintains two maps keyed by name.
///
/// `inherited` holds what the parent generation handed over. It is filled once, at
/// construction, and only ever shrinks: a claim moves the entry into `used`, and
/// [`FdRegistry::close_inherited`] drops whatever is left.
///
/// `used` holds everything this process has claimed or registered. It is what
/// [`FdRegistry::copy`] hands to the next generation.
///
/// Claims return a duplicate of the registry's descriptor, so the caller is free to drop
/// (close) what it received: that ends the caller's use, not the registry's. Unix socket
/// paths are only unlinked by [`FdRegistry::close_inherited`] and
/// [`FdRegistry::close_and_remove_used`], never by a close. Socket state such as the
/// blocking mode is shared by every duplicate and every generation.
pub struct FdRegistry {
    fds: Mutex<Fds>,
    backlog: i32,
}

#[derive(Default)]
struct Fds {
    inherited: BTreeMap<String, FdHandle>,
    used: BTreeMap<String, FdHandle>,
}

fn check_kind(handle: &FdHandle, expected: FdKind) -> Result<(), RegistryError> {
    if handle.kind() == expected {
        Ok(())
    } else {
        Err(RegistryError::KindMismatch {
            name: handle.name().to_owned(),
            expected,
            found: handle.kind(),
        })
    }
}

impl Fds {
    /// Resolve `name` against the used set, then the inherited set. An inherited hit moves
    /// into `used`. `Ok(None)` means the caller has to create the descriptor itself.
    fn lookup(&mut self, name: &str, kind: FdKind) -> Result<Option<OwnedFd>, RegistryError> {
        if let Some(handle) = self.used.get(name) {
            check_kind(handle, kind)?;
            log::debug!("{name:?} is already in use, sharing it");
            return Ok(Some(handle.duplicate()?));
        }

        let Some(mut handle) = self.inherited.remove(name) else {
            return Ok(None);
        };
        let claimed = check_kind(&handle, kind)
            .and_then(|()| handle.duplicate().map_err(RegistryError::from));
        match claimed {
            Ok(fd) => {
                log::debug!("Found inherited {name:?}, reusing it");
                handle.mark_used();
                self.used.insert(name.to_owned(), handle);
                Ok(Some(fd))
            }
            Err(e) => {
                self.inherited.insert(name.to_owned(), handle);
                Err(e)
            }
        }
    }

    /// Track a descriptor this process just created and hand the caller its own copy. If
    /// the copy cannot be made the new descriptor is torn down again, path included, so
    /// nothing leaks.
    fn insert_created(
        &mut self,
        name: String,
        kind: FdKind,
        fd: OwnedFd,
    ) -> Result<OwnedFd, RegistryError> {
        let handle = FdHandle::new(name, kind, Origin::Created, fd);
        match handle.duplicate() {
            Ok(dup) => {
                self.insert(handle);
                Ok(dup)
            }
            Err(e) => {
                handle.close_and_unlink(&mut Cleanup::default());
                Err(e.into())
            }
        }
    }

    fn insert(&mut self, handle: FdHandle) {
        let name = handle.name().to_owned();
        if let Some(superseded) = self.inherited.remove(&name) {
            log::debug!("{name:?} registered explicitly, dropping the inherited one");
            superseded.close();
        }
        log::debug!("Tracking {name:?} ({:?})", handle.origin());
        self.used.insert(name, handle);
    }
}

fn parse_network(network: &str, address: &str, kind: FdKind) -> Result<Network, RegistryError> {
    match Network::parse(network) {
        Some(net) if net.kind() == kind => Ok(net),
        Some(_) => Err(RegistryError::InvalidAddress {
            name: fd_name(network, address),
            reason: format!("{network} does not produce a {kind}"),
        }),
        None => Err(RegistryError::InvalidAddress {
            name: fd_name(network, address),
            reason: format!("unknown network {network:?}"),
        }),
    }
}

fn check_socket_type(name: &str, kind: FdKind, fd: BorrowedFd<'_>) -> Result<(), RegistryError> {
    let expected = match kind {
        FdKind::Listener => Type::STREAM,
        FdKind::PacketConn => Type::DGRAM,
        FdKind::RawFile => return Ok(()),
    };
    let invalid = |reason: String| RegistryError::InvalidDescriptor {
        name: name.to_owned(),
        reason,
    };
    let actual = SockRef::from(&fd)
        .r#type()
        .map_err(|e| invalid(format!("not a socket ({e})")))?;
    if actual != expected {
        return Err(invalid(format!("wrong socket type for a {kind}")));
    }
    Ok(())
}

impl Default for FdRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FdRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fds = self.fds.lock();
        f.debug_struct("FdRegistry")
            .field("inherited", &fds.inherited.keys().collect::<Vec<_>>())
            .field("used", &fds.used.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FdRegistry {
    /// An empty registry, as in the first generation of a lineage.
    pub fn new() -> Self {
        Self {
            fds: Mutex::new(Fds::default()),
            backlog: DEFAULT_BACKLOG,
        }
    }

    /// A registry seeded with descriptors handed over by a previous generation.
    pub fn from_inherited(inherited: Vec<HandoffFd>) -> Self {
        let mut fds = Fds::default();
        for HandoffFd { name, kind, fd } in inherited {
            let handle = FdHandle::new(name.clone(), kind, Origin::Inherited, fd);
            if fds.inherited.insert(name.clone(), handle).is_some() {
                log::warn!("Inherited {name:?} twice, keeping the last one");
            }
        }
        Self {
            fds: Mutex::new(fds),
            backlog: DEFAULT_BACKLOG,
        }
    }

    /// Backlog used when a listener has to be created from scratch.
    pub fn with_listen_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Return a listener for `network` (`tcp`, `tcp4`, `tcp6`, `unix`) and `address`.
    ///
    /// If this name is already in use the same socket is returned again. If it was
    /// inherited, the inherited socket is reused without rebinding, so its backlog and
    /// pending connections survive. Otherwise a new socket is bound.
    ///
    /// The blocking mode belongs to the socket, not to the descriptor, so an inherited socket
    /// arrives in whatever mode the parent left it. A parent running an async runtime leaves
    /// it non-blocking. Call `set_nonblocking` with the mode you need after every claim.
    pub fn listen(&self, network: &str, address: &str) -> Result<Listener, RegistryError> {
        let net = parse_network(network, address, FdKind::Listener)?;
        let name = fd_name(network, address);

        let mut fds = self.fds.lock();
        if let Some(fd) = fds.lookup(&name, FdKind::Listener)? {
            return Ok(Listener::from_fd(net, fd));
        }

        log::debug!("{name:?} does not exist, creating new listener");
        let fd = fresh_listener(net, address, self.backlog)?;
        let fd = fds.insert_created(name, FdKind::Listener, fd)?;
        Ok(Listener::from_fd(net, fd))
    }

    /// Like [`FdRegistry::listen`], but never creates anything.
    pub fn listener(&self, network: &str, address: &str) -> Result<Option<Listener>, RegistryError> {
        let net = parse_network(network, address, FdKind::Listener)?;
        let fd = self.fds.lock().lookup(&fd_name(network, address), FdKind::Listener)?;
        Ok(fd.map(|fd| Listener::from_fd(net, fd)))
    }

    /// [`FdRegistry::listen`] for TCP, with control over how a new socket is set up. The
    /// closure receives an unbound `socket2::Socket` and the resolved address and must return
    /// a listening socket. It only runs when nothing is inherited or in use under this
    /// address.
    pub fn build_listen_tcp<F>(&self, address: &str, sock_build: F) -> Result<TcpListener, RegistryError>
    where
        F: FnOnce(Socket, SocketAddr) -> io::Result<TcpListener>,
    {
        let name = fd_name("tcp", address);

        let mut fds = self.fds.lock();
        if let Some(fd) = fds.lookup(&name, FdKind::Listener)? {
            return Ok(fd.into());
        }

        log::debug!("{name:?} does not exist, building new listener");
        let addr = resolve_inet(Network::Tcp, address)?;
        let listener = sock_build(tcp_socket(addr)?, addr)
            .map_err(|e| bind_error(Network::Tcp, address, e))?;
        let fd = fds.insert_created(name, FdKind::Listener, listener.into())?;
        Ok(fd.into())
    }

    /// Return a datagram socket for `network` (`udp`, `udp4`, `udp6`, `unixgram`) and
    /// `address`, resolved the same way as [`FdRegistry::listen`]. An empty `unixgram`
    /// address creates an unbound socket. As with `listen`, set the blocking mode after
    /// claiming.
    pub fn conn(&self, network: &str, address: &str) -> Result<PacketConn, RegistryError> {
        let net = parse_network(network, address, FdKind::PacketConn)?;
        let name = fd_name(network, address);

        let mut fds = self.fds.lock();
        if let Some(fd) = fds.lookup(&name, FdKind::PacketConn)? {
            return Ok(PacketConn::from_fd(net, fd));
        }

        log::debug!("{name:?} does not exist, creating new socket");
        let fd = fresh_packet_conn(net, address)?;
        let fd = fds.insert_created(name, FdKind::PacketConn, fd)?;
        Ok(PacketConn::from_fd(net, fd))
    }

    /// Like [`FdRegistry::conn`], but never creates anything.
    pub fn packet_conn(
        &self,
        network: &str,
        address: &str,
    ) -> Result<Option<PacketConn>, RegistryError> {
        let net = parse_network(network, address, FdKind::PacketConn)?;
        let fd = self.fds.lock().lookup(&fd_name(network, address), FdKind::PacketConn)?;
        Ok(fd.map(|fd| PacketConn::from_fd(net, fd)))
    }

    /// Return the file registered under `name`. Files cannot be created here, so a name
    /// that was neither inherited nor added fails with [`RegistryError::NotFound`].
    pub fn file(&self, name: &str) -> Result<File, RegistryError> {
        match self.fds.lock().lookup(name, FdKind::RawFile)? {
            Some(fd) => Ok(fd.into()),
            None => Err(RegistryError::NotFound {
                name: name.to_owned(),
            }),
        }
    }

    /// Track a listener the application created itself.
    pub fn add_listener(
        &self,
        network: &str,
        address: &str,
        listener: &impl AsFd,
    ) -> Result<(), RegistryError> {
        parse_network(network, address, FdKind::Listener)?;
        self.add(fd_name(network, address), FdKind::Listener, listener.as_fd())
    }

    /// Track a datagram socket the application created itself.
    pub fn add_conn(
        &self,
        network: &str,
        address: &str,
        conn: &impl AsFd,
    ) -> Result<(), RegistryError> {
        parse_network(network, address, FdKind::PacketConn)?;
        self.add(fd_name(network, address), FdKind::PacketConn, conn.as_fd())
    }

    /// Track an arbitrary descriptor under `name`.
    pub fn add_file(&self, name: &str, file: &impl AsFd) -> Result<(), RegistryError> {
        self.add(name.to_owned(), FdKind::RawFile, file.as_fd())
    }

    /// Track a socket under the name its own local address implies.
    pub fn register<R: Registrable>(&self, socket: &R) -> Result<(), RegistryError> {
        let (network, address) = socket.registration()?;
        self.add(fd_name(network, &address), R::KIND, socket.as_fd())
    }

    fn add(&self, name: String, kind: FdKind, fd: BorrowedFd<'_>) -> Result<(), RegistryError> {
        check_socket_type(&name, kind, fd)?;

        let mut fds = self.fds.lock();
        if fds.used.contains_key(&name) {
            return Err(RegistryError::DuplicateName { name });
        }
        let fd = fd.try_clone_to_owned()?;
        fds.insert(FdHandle::new(name, kind, Origin::Created, fd));
        Ok(())
    }

    /// Duplicate every used descriptor for the next generation, ordered by name. The
    /// registry itself is left untouched.
    pub fn copy(&self) -> io::Result<Vec<HandoffFd>> {
        let fds = self.fds.lock();
        fds.used
            .values()
            .map(|handle| {
                Ok(HandoffFd {
                    name: handle.name().to_owned(),
                    kind: handle.kind(),
                    fd: handle.duplicate()?,
                })
            })
            .collect()
    }

    /// Close every inherited descriptor nobody claimed and unlink the unix socket paths
    /// among them. Claimed descriptors are not affected.
    pub fn close_inherited(&self) -> Cleanup {
        let inherited = std::mem::take(&mut self.fds.lock().inherited);
        let mut cleanup = Cleanup::default();
        for (_, handle) in inherited {
            debug_assert!(!handle.is_used());
            handle.close_and_unlink(&mut cleanup);
        }
        cleanup
    }

    /// Close every used descriptor and unlink the unix socket paths among them. This is
    /// for a process that gives up its sockets for good, with no successor.
    pub fn close_and_remove_used(&self) -> Cleanup {
        let used = std::mem::take(&mut self.fds.lock().used);
        let mut cleanup = Cleanup::default();
        for (_, handle) in used {
            handle.close_and_unlink(&mut cleanup);
        }
        cleanup
    }

    /// Close every used descriptor but leave socket paths alone, because a successor
    /// now owns them. Returns how many descriptors were closed.
    pub fn close_used(&self) -> usize {
        let used = std::mem::take(&mut self.fds.lock().used);
        let closed = used.len();
        for (_, handle) in used {
            handle.close();
        }
        closed
    }

    /// Names currently in use, ordered.
    pub fn names(&self) -> Vec<String> {
        self.fds.lock().used.keys().cloned().collect()
    }

    /// Inherited names nobody has claimed yet, ordered.
    pub fn inherited_names(&self) -> Vec<String> {
        self.fds.lock().inherited.keys().cloned().collect()
    }
}
