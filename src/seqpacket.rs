//! Unix-domain sequenced-packet sockets
//!
//! `SOCK_SEQPACKET` gives a connection-oriented channel that preserves
//! message boundaries: every `send` is delivered to exactly one `recv`, and a
//! receive buffer smaller than the message truncates it. That is the
//! message-mode duplex channel the pipe transport expects. The standard
//! library has no wrapper for it, so this module goes to `libc` directly.

use crate::completion::cvt;
use crate::pipe::MessageChannel;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

fn cvt_int(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn new_socket() -> io::Result<OwnedFd> {
    let fd = cvt_int(unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0) })?;
    // SAFETY: `fd` was just returned by socket(2) and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn socket_addr(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    // SAFETY: sockaddr_un is plain old data; all-zero is a valid value.
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    if bytes.contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path contains a NUL byte",
        ));
    }
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("socket path longer than {} bytes", addr.sun_path.len() - 1),
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let path_offset = addr.sun_path.as_ptr() as usize - (&addr as *const libc::sockaddr_un as usize);
    let len = path_offset + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let flags = cvt_int(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    cvt_int(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) })?;
    Ok(())
}

/// Whether a connect failure means the listener exists but cannot take
/// another connection right now
pub fn is_busy(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// One end of a connected sequenced-packet socket
#[derive(Debug)]
pub struct SeqPacketChannel {
    fd: OwnedFd,
}

impl SeqPacketChannel {
    /// Connect to a listening socket at `path`
    ///
    /// The connect is attempted without blocking so that a full listen
    /// backlog surfaces as `WouldBlock` (see [`is_busy`]) instead of hanging.
    /// The returned channel is in blocking mode.
    pub fn connect<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let (addr, len) = socket_addr(path.as_ref())?;
        let fd = new_socket()?;
        set_nonblocking(fd.as_raw_fd(), true)?;
        cvt_int(unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len,
            )
        })?;
        set_nonblocking(fd.as_raw_fd(), false)?;
        Ok(SeqPacketChannel { fd })
    }

    /// Create a connected pair of channels
    pub fn pair() -> io::Result<(Self, Self)> {
        let mut fds: [libc::c_int; 2] = [-1, -1];
        cvt_int(unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0, fds.as_mut_ptr()) })?;
        // SAFETY: socketpair(2) succeeded, both descriptors are fresh and unowned.
        let (a, b) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok((SeqPacketChannel { fd: a }, SeqPacketChannel { fd: b }))
    }
}

impl MessageChannel for SeqPacketChannel {
    fn send_message(&mut self, buf: &[u8]) -> io::Result<usize> {
        cvt(unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                SEND_FLAGS,
            )
        })
    }

    fn recv_message(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        cvt(unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        })
    }

    fn close(self) -> io::Result<()> {
        let fd = self.fd.into_raw_fd();
        cvt_int(unsafe { libc::close(fd) })?;
        Ok(())
    }
}

/// A listening sequenced-packet socket
///
/// The client never listens; storage services and test doubles use this to
/// accept pipe transport connections.
#[derive(Debug)]
pub struct SeqPacketListener {
    fd: OwnedFd,
}

impl SeqPacketListener {
    /// Bind to `path` and start listening with the given backlog
    pub fn bind<P: AsRef<Path>>(path: P, backlog: i32) -> io::Result<Self> {
        let (addr, len) = socket_addr(path.as_ref())?;
        let fd = new_socket()?;
        cvt_int(unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len,
            )
        })?;
        cvt_int(unsafe { libc::listen(fd.as_raw_fd(), backlog) })?;
        Ok(SeqPacketListener { fd })
    }

    /// Block until a client connects
    pub fn accept(&self) -> io::Result<SeqPacketChannel> {
        loop {
            let ret = unsafe { libc::accept(self.fd.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut()) };
            match cvt_int(ret) {
                // SAFETY: accept(2) returned a fresh descriptor.
                Ok(fd) => return Ok(SeqPacketChannel { fd: unsafe { OwnedFd::from_raw_fd(fd) } }),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
