//! Owning wrappers around the descriptors the registry tracks.

use std::{
    io,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::PathBuf,
};

use crate::utils::{unix_socket_path, unlink_unix_socket};

/// What a descriptor was registered as. The set is closed: every descriptor that crosses an
/// upgrade is exactly one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::Display)]
pub enum FdKind {
    /// A stream socket in the listening state (`tcp`, `unix`).
    #[display("listener")]
    Listener,
    /// A datagram socket (`udp`, `unixgram`).
    #[display("packet-conn")]
    PacketConn,
    /// Any other descriptor, e.g. a pipe end or a regular file.
    #[display("raw-file")]
    RawFile,
}

impl FdKind {
    pub(crate) fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "listener" => Some(Self::Listener),
            "packet-conn" => Some(Self::PacketConn),
            "raw-file" => Some(Self::RawFile),
            _ => None,
        }
    }
}

/// Whether a descriptor came from the parent generation or was opened by this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Inherited,
    Created,
}

/// One tracked descriptor. The handle owns the descriptor: dropping it closes the
/// descriptor but never unlinks anything. Unlinking a socket path only happens through
/// [`FdHandle::close_and_unlink`], which the registry calls from its reconciliation methods.
#[derive(Debug)]
pub(crate) struct FdHandle {
    name: String,
    kind: FdKind,
    origin: Origin,
    used: bool,
    fd: OwnedFd,
    unix_path: Option<PathBuf>,
}

impl FdHandle {
    pub(crate) fn new(name: String, kind: FdKind, origin: Origin, fd: OwnedFd) -> Self {
        // Files never carry an unlink obligation, even if they happen to be sockets.
        let unix_path = match kind {
            FdKind::RawFile => None,
            FdKind::Listener | FdKind::PacketConn => unix_socket_path(fd.as_fd()),
        };
        if let Some(path) = unix_path.as_deref().filter(|p| p.is_relative()) {
            log::warn!(
                "{name:?} is bound to the relative path {path:?}, unlinking it depends on the \
                 working directory"
            );
        }
        Self {
            name,
            kind,
            origin,
            used: origin == Origin::Created,
            fd,
            unix_path,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn kind(&self) -> FdKind {
        self.kind
    }

    pub(crate) fn origin(&self) -> Origin {
        self.origin
    }

    pub(crate) fn is_used(&self) -> bool {
        self.used
    }

    pub(crate) fn mark_used(&mut self) {
        self.used = true;
    }

    /// A second descriptor for the same open file description (`F_DUPFD_CLOEXEC`).
    pub(crate) fn duplicate(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }

    pub(crate) fn close(self) {
        log::debug!("Closing {:?} ({})", self.name, self.kind);
    }

    pub(crate) fn close_and_unlink(self, cleanup: &mut Cleanup) {
        let Self {
            name,
            fd,
            unix_path,
            ..
        } = self;
        drop(fd);
        cleanup.closed += 1;

        let Some(path) = unix_path else {
            return;
        };
        match unlink_unix_socket(&path) {
            Ok(true) => {
                log::debug!("Unlinked {path:?} for {name:?}");
                cleanup.unlinked.push(path);
            }
            Ok(false) => (),
            Err(e) => {
                log::warn!("Failed to unlink {path:?} for {name:?}: {e}");
                cleanup.errors.push((path, e));
            }
        }
    }
}

impl AsFd for FdHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// A descriptor on its way to, or just arrived from, another generation.
#[derive(Debug)]
pub struct HandoffFd {
    pub(crate) name: String,
    pub(crate) kind: FdKind,
    pub(crate) fd: OwnedFd,
}

impl HandoffFd {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FdKind {
        self.kind
    }
}

impl AsFd for HandoffFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// What a reconciliation pass did. Unlink failures do not stop the pass; they are collected
/// here instead.
#[derive(Debug, Default)]
pub struct Cleanup {
    pub closed: usize,
    pub unlinked: Vec<PathBuf>,
    pub errors: Vec<(PathBuf, io::Error)>,
}
