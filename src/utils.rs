use std::{
    fs,
    io::{self, Write},
    os::{
        fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
        unix::fs::FileTypeExt,
    },
    path::{Path, PathBuf},
};

use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag},
    sys::socket::{getsockname, SockaddrStorage},
    unistd,
};

pub(crate) const ENV_UPGRADE: &str = "MOULT_UPGRADE";
pub(crate) const ENV_FD_INDEX: &str = "MOULT_FD_INDEX";
pub(crate) const ENV_PARENT_PID: &str = "MOULT_PARENT_PID";
pub(crate) const UPGRADE_TRUE_VAL: &str = "yes";

/// Where the control channel lands in a freshly exec'd child.
pub(crate) const CONTROL_FD: RawFd = 3;

/// Where handoff ordinal 0 lands in a freshly exec'd child; ordinal `n` is at
/// `INHERITED_FDS_START + n`.
pub(crate) const INHERITED_FDS_START: RawFd = 4;

pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    fcntl(fd, FcntlArg::F_SETFD(flags | FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// Take ownership of a descriptor the parent left open across exec. Fails with `EBADF` if
/// nothing is open at `fd`. The descriptor is marked CLOEXEC so it does not leak into
/// unrelated subprocesses.
///
/// # Safety
///
/// Nothing else in this process may own `fd`.
pub(crate) unsafe fn adopt_fd(fd: RawFd) -> io::Result<OwnedFd> {
    set_cloexec(fd)?;
    Ok(OwnedFd::from_raw_fd(fd))
}

/// Filesystem path a unix domain socket is bound to. `None` for non-unix sockets, unbound
/// sockets, abstract-namespace sockets and anything that is not a socket at all.
pub(crate) fn unix_socket_path(fd: BorrowedFd<'_>) -> Option<PathBuf> {
    let addr: SockaddrStorage = getsockname(fd.as_raw_fd()).ok()?;
    addr.as_unix_addr()?.path().map(Path::to_path_buf)
}

/// Remove a unix socket from the filesystem. Returns `Ok(false)` without touching the path
/// if something other than a socket now lives there.
pub(crate) fn unlink_unix_socket(path: &Path) -> io::Result<bool> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.file_type().is_socket() {
        log::warn!("Not unlinking {path:?}: no longer a socket");
        return Ok(false);
    }
    fs::remove_file(path)?;
    Ok(true)
}

// The pid file is replaced atomically: supervisors reading it must never see a partial
// write, so the temp file lives in the same directory (and filesystem) as the target.
pub(crate) fn write_pid_file(path: &Path) -> io::Result<()> {
    let pid = unistd::getpid().as_raw();
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut tmp_pidfile = tempfile::Builder::new()
        .prefix(".moult-pid")
        .tempfile_in(dir)?;
    write!(tmp_pidfile, "{pid}")?;
    tmp_pidfile.persist(path).map_err(|e| e.error)?;
    Ok(())
}
