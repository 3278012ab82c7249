use std::{
    io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use tracing::info;

use crate::server::ServerError;

/// Pending-connection queue depth for `listen(2)`.
const LISTEN_BACKLOG: libc::c_int = 511;

/// A listening socket opened by the master before fork.
///
/// Bound to 0.0.0.0 with `SO_REUSEADDR`, non-blocking. Workers don't take
/// the fd itself; they `dup` it, so each owner closes its copy exactly
/// once.
pub struct ListenSock {
    port: u16,
    fd: OwnedFd,
}

impl ListenSock {
    pub fn open(port: u16) -> Result<Self, ServerError> {
        Self::open_raw(port).map_err(|source| ServerError::Listen { port, source })
    }

    pub fn open_all(ports: &[u16]) -> Result<Vec<Self>, ServerError> {
        ports.iter().map(|&port| Self::open(port)).collect()
    }

    fn open_raw(port: u16) -> io::Result<Self> {
        let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let on: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                raw,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &on as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        set_nonblocking(raw)?;

        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
        let rc = unsafe {
            libc::bind(
                raw,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        if unsafe { libc::listen(raw, LISTEN_BACKLOG) } != 0 {
            return Err(io::Error::last_os_error());
        }

        // Resolve the kernel-picked port when the caller asked for 0.
        let port = local_port(raw)?;
        info!(port, "listening socket ready");
        Ok(Self { port, fd })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Duplicates the fd for a worker-side `mio` listener.
    pub fn dup(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }
}

impl AsRawFd for ListenSock {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn local_port(fd: RawFd) -> io::Result<u16> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(u16::from_be(addr.sin_port))
}
