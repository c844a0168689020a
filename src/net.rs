//! The privileged TCP listener and the descriptors it owns.

use crate::error::Error;
use derive_more::From;
use nix::{
    sys::socket::{
        accept, bind, getpeername, listen, setsockopt, socket, sockopt, AddressFamily,
        SockFlag, SockProtocol, SockType, SockaddrIn,
    },
    unistd::close,
};
use std::{
    mem,
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
};

/// Maximum backlog of connections waiting to be accepted.
const BACKLOG: usize = 128;

/// Wrapper for `RawFd` that closes the file descriptor when dropped.
///
/// Holds the listening socket, the duplicated standard streams while they
/// are being relocated, and each accepted connection until its worker
/// takes over.
#[derive(Debug, From)]
pub struct Fd(RawFd);

impl Drop for Fd {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

impl IntoRawFd for Fd {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.0;
        mem::forget(self);
        fd
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// One accepted client connection.
#[derive(Debug)]
pub struct Connection {
    /// The connected socket.
    pub fd: Fd,
    /// Address of the connecting peer.
    pub peer: SockaddrIn,
}

impl Connection {
    /// The peer's IPv4 address in dotted-quad form.
    pub fn peer_quad(&self) -> String {
        dotted_quad(self.peer.ip())
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// A bound, listening TCP endpoint on the wildcard address.
#[derive(Debug)]
pub struct Listener {
    fd: Fd,
    port: u16,
}

impl Listener {
    /// Create the listening socket: socket, address reuse, bind to the
    /// wildcard address, listen.
    pub fn bind(port: u16) -> Result<Self, Error> {
        let fd = socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::empty(),
            SockProtocol::Tcp,
        )
        .map(Fd::from)
        .map_err(|err| Error::ListenerSetup("socket", err))?;

        setsockopt(fd.as_raw_fd(), sockopt::ReuseAddr, &true)
            .map_err(|err| Error::ListenerSetup("setsockopt", err))?;

        let addr = SockaddrIn::new(0, 0, 0, 0, port);
        bind(fd.as_raw_fd(), &addr).map_err(|err| Error::ListenerSetup("bind", err))?;

        listen(fd.as_raw_fd(), BACKLOG).map_err(|err| Error::ListenerSetup("listen", err))?;

        Ok(Self { fd, port })
    }

    /// The port the listener is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for a client connection.  Failures are transient; the caller
    /// logs them and keeps accepting.
    pub fn accept(&self) -> Result<Connection, Error> {
        let fd = accept(self.fd.as_raw_fd()).map(Fd::from)?;
        let peer = getpeername::<SockaddrIn>(fd.as_raw_fd())?;
        Ok(Connection { fd, peer })
    }

    /// Forcefully close the listening socket without dropping it.
    ///
    /// Used on the child side of `fork`, where the parent's `Listener`
    /// value stays alive in a stack frame that never resumes.
    pub fn shutdown(&self) {
        let _ = close(self.fd.as_raw_fd());
    }
}

/// Render a host-order IPv4 address as `A.B.C.D`.
fn dotted_quad(ip: u32) -> String {
    format!(
        "{}.{}.{}.{}",
        ip >> 24,
        (ip >> 16) & 255,
        (ip >> 8) & 255,
        ip & 255
    )
}

#[cfg(test)]
mod tests {
    use super::dotted_quad;

    #[test]
    fn test_dotted_quad() {
        assert_eq!(dotted_quad(0x7f000001), "127.0.0.1");
        assert_eq!(dotted_quad(0xc0a80a01), "192.168.10.1");
        assert_eq!(dotted_quad(0), "0.0.0.0");
        assert_eq!(dotted_quad(u32::MAX), "255.255.255.255");
    }
}
