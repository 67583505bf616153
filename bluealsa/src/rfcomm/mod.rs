//! RFCOMM stream wrapper and the AT/SLC machinery built on top of it.
//!
//! Unlike the L2CAP media path, BlueALSA never originates RFCOMM connections itself: the system
//! Bluetooth daemon owns the listening socket and hands over an already-connected file
//! descriptor through `Profile1.NewConnection` (see [crate::profile::hfp_profile]). [Stream]
//! only wraps that fd for async read/write; there is no `Listener`, `bind`, or `connect` here.

pub mod at;
pub mod slc;

use libc::{sa_family_t, AF_BLUETOOTH, MSG_PEEK};
use std::{
    fmt,
    io::{Error, ErrorKind, Result},
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
    pin::Pin,
    str::FromStr,
    task::{Context, Poll},
};
use tokio::io::{unix::AsyncFd, AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    sock::{self, OwnedFd},
    sys::sockaddr_rc,
    Address,
};

/// An RFCOMM socket address: `[addr]:channel`, used only for diagnostics (e.g. logging which
/// device an accepted connection belongs to).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketAddr {
    pub addr: Address,
    pub channel: u8,
}

impl fmt::Display for SocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]:{}", self.addr, self.channel)
    }
}

/// Invalid RFCOMM socket address error.
#[derive(Debug, Clone)]
pub struct InvalidSocketAddr(pub String);

impl fmt::Display for InvalidSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid RFCOMM socket address: {}", &self.0)
    }
}

impl std::error::Error for InvalidSocketAddr {}

impl FromStr for SocketAddr {
    type Err = InvalidSocketAddr;
    fn from_str(s: &str) -> std::result::Result<Self, InvalidSocketAddr> {
        let err = || InvalidSocketAddr(s.to_string());
        let (addr, channel) = s.rsplit_once(':').ok_or_else(err)?;
        let addr = addr.strip_prefix('[').and_then(|s| s.strip_suffix(']')).ok_or_else(err)?;
        Ok(Self { addr: addr.parse().map_err(|_| err())?, channel: channel.parse().map_err(|_| err())? })
    }
}

impl sock::SysSockAddr for SocketAddr {
    type SysSockAddr = sockaddr_rc;

    fn into_sys_sock_addr(self) -> Self::SysSockAddr {
        sockaddr_rc { rc_family: AF_BLUETOOTH as _, rc_bdaddr: self.addr.into(), rc_channel: self.channel }
    }

    fn try_from_sys_sock_addr(saddr: Self::SysSockAddr) -> Result<Self> {
        if saddr.rc_family != AF_BLUETOOTH as sa_family_t {
            return Err(Error::new(ErrorKind::InvalidInput, "sockaddr_rc::rc_family is not AF_BLUETOOTH"));
        }
        Ok(Self { addr: Address::from(saddr.rc_bdaddr), channel: saddr.rc_channel })
    }
}

/// Whether an I/O error on an RFCOMM (or SCO) socket represents the peer going away, per §7's
/// "peer disconnect" taxonomy (`ECONNRESET`/`ECONNABORTED`/`ENOTCONN`/`ETIMEDOUT`/`EPIPE`).
pub fn is_peer_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ECONNRESET) | Some(libc::ECONNABORTED) | Some(libc::ENOTCONN) | Some(libc::ETIMEDOUT) | Some(libc::EPIPE)
    )
}

/// An RFCOMM stream wrapping a file descriptor handed over by `Profile1.NewConnection`.
#[derive(Debug)]
pub struct Stream {
    fd: AsyncFd<OwnedFd>,
}

impl Stream {
    /// Adopts an already-connected RFCOMM fd.
    ///
    /// # Safety
    /// `fd` must be a valid, non-blocking, connected RFCOMM socket descriptor not owned
    /// elsewhere.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Result<Self> {
        Ok(Self { fd: AsyncFd::new(OwnedFd::new(fd))? })
    }

    /// Gets the peer address of this stream.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        sock::getpeername(self.fd.get_ref())
    }

    /// Number of bytes queued for transmission but not yet sent (`TIOCOUTQ`), used by the
    /// controller's Drain implementation to wait for a transport's buffers to empty.
    pub fn output_queue_len(&self) -> Result<u32> {
        let value: libc::c_int = sock::ioctl_read(self.fd.get_ref(), libc::TIOCOUTQ)?;
        Ok(value as u32)
    }

    async fn peek_priv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut buf = ReadBuf::new(buf);
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| sock::recv(inner.get_ref(), &mut buf, MSG_PEEK)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Peeks at pending input without consuming it, used by the AT reader to detect a complete
    /// line before committing to a read.
    pub async fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        self.peek_priv(buf).await
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for Stream {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_inner().into_raw_fd()
    }
}

impl AsyncRead for Stream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context, buf: &mut ReadBuf) -> Poll<Result<()>> {
        loop {
            let mut guard = match self.fd.poll_read_ready(cx) {
                Poll::Ready(result) => result?,
                Poll::Pending => return Poll::Pending,
            };
            match guard.try_io(|inner| sock::recv(inner.get_ref(), buf, 0)) {
                Ok(result) => return Poll::Ready(result.map(|_| ())),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<Result<usize>> {
        loop {
            let mut guard = match self.fd.poll_write_ready(cx) {
                Poll::Ready(result) => result?,
                Poll::Pending => return Poll::Pending,
            };
            match guard.try_io(|inner| sock::send(inner.get_ref(), buf, 0)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<Result<()>> {
        let _ = sock::shutdown(self.fd.get_ref(), libc::SHUT_WR);
        Poll::Ready(Ok(()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let _ = sock::shutdown(self.fd.get_ref(), libc::SHUT_RDWR);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_peer_disconnect_errors() {
        assert!(is_peer_disconnect(&std::io::Error::from_raw_os_error(libc::ECONNRESET)));
        assert!(is_peer_disconnect(&std::io::Error::from_raw_os_error(libc::EPIPE)));
        assert!(!is_peer_disconnect(&std::io::Error::from_raw_os_error(libc::EAGAIN)));
    }

    #[test]
    fn socket_addr_round_trips_through_display_and_from_str() {
        let addr = SocketAddr { addr: Address::new([0, 1, 2, 3, 4, 5]), channel: 13 };
        let s = addr.to_string();
        assert_eq!(s.parse::<SocketAddr>().unwrap(), addr);
    }
}
