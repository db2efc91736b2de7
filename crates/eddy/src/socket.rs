use std::{
    io,
    mem::size_of,
    os::fd::RawFd,
    sync::atomic::{AtomicI32, Ordering},
};

use thiserror::Error;
use tracing::debug;

const LISTEN_BACKLOG: libc::c_int = 1024;

/// Environment failures while standing up the listening side.
/// There is no recovery from these; callers log and abort.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("couldn't create socket: {0}")]
    Socket(#[source] io::Error),
    #[error("couldn't bind port {port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error("couldn't listen: {0}")]
    Listen(#[source] io::Error),
}

/// Transient conditions are "nothing happened this call"; the reactor
/// retries on the next readiness notification.
#[inline]
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

/// Thin wrapper over a nonblocking stream socket.
///
/// Holds the descriptor with a `-1` sentinel meaning closed; the fd is
/// closed exactly once, by [`close`](Self::close) or by Drop, whichever
/// comes first. Ownership of the fd is exclusive.
pub struct Socket {
    fd: AtomicI32,
}

impl Socket {
    /// Wraps an already-open descriptor, taking ownership.
    pub fn from_fd(fd: RawFd) -> Self {
        Self { fd: AtomicI32::new(fd) }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Relaxed)
    }

    /// Creates a nonblocking listening socket on `0.0.0.0:port` with
    /// address and port reuse enabled.
    pub fn listener(port: u16) -> Result<Self, SetupError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(SetupError::Socket(io::Error::last_os_error()));
        }
        let sock = Self::from_fd(fd);
        sock.enable_address_reuse();
        sock.bind(port).map_err(|source| SetupError::Bind { port, source })?;
        sock.listen().map_err(SetupError::Listen)?;
        debug!(fd, port, "listening socket ready");
        Ok(sock)
    }

    fn bind(&self, port: u16) -> io::Result<()> {
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr { s_addr: libc::INADDR_ANY },
            sin_zero: [0; 8],
        };
        let ret = unsafe {
            libc::bind(
                self.fd(),
                std::ptr::from_ref(&addr).cast::<libc::sockaddr>(),
                size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
    }

    fn listen(&self) -> io::Result<()> {
        let ret = unsafe { libc::listen(self.fd(), LISTEN_BACKLOG) };
        if ret < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
    }

    /// Sets `SO_REUSEADDR` and `SO_REUSEPORT`.
    pub fn enable_address_reuse(&self) {
        let on: libc::c_int = 1;
        for opt in [libc::SO_REUSEADDR, libc::SO_REUSEPORT] {
            unsafe {
                libc::setsockopt(
                    self.fd(),
                    libc::SOL_SOCKET,
                    opt,
                    std::ptr::from_ref(&on).cast::<libc::c_void>(),
                    size_of::<libc::c_int>() as libc::socklen_t,
                );
            }
        }
    }

    pub fn set_nonblocking(&self) {
        unsafe {
            let flags = libc::fcntl(self.fd(), libc::F_GETFL, 0);
            libc::fcntl(self.fd(), libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }

    /// Accepts one pending connection; the returned fd is born
    /// nonblocking. Callers drain until the error is transient.
    pub fn accept(&self) -> io::Result<RawFd> {
        let fd = unsafe {
            libc::accept4(
                self.fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 { Err(io::Error::last_os_error()) } else { Ok(fd) }
    }

    /// Nonblocking read. `Ok(0)` on a nonempty `buf` means the peer
    /// closed its half of the connection.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::recv(self.fd(), buf.as_mut_ptr().cast::<libc::c_void>(), buf.len(), libc::MSG_DONTWAIT)
        };
        if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
    }

    /// Nonblocking write. `MSG_NOSIGNAL` keeps a write to a dead peer an
    /// error instead of a process signal.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = unsafe {
            libc::send(
                self.fd(),
                buf.as_ptr().cast::<libc::c_void>(),
                buf.len(),
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
    }

    /// Closes the descriptor; later calls are no-ops.
    pub fn close(&self) {
        let fd = self.fd.swap(-1, Ordering::Relaxed);
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}
