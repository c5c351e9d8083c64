//! Non-blocking UDP socket behind [`DatagramSocket`].

use std::io;
use std::net::{SocketAddr, UdpSocket};

use anyhow::Context;
use quic_egress::batch::DatagramSocket;
use tracing::{debug, trace};

pub struct UdpDatagramSocket {
    socket: UdpSocket,
    read_paused: bool,
}

impl UdpDatagramSocket {
    /// Bind a non-blocking socket at `addr`.
    pub fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let socket =
            UdpSocket::bind(addr).with_context(|| format!("failed to bind UDP socket to {addr}"))?;
        socket
            .set_nonblocking(true)
            .context("failed to make UDP socket non-blocking")?;
        debug!(local = %socket.local_addr()?, "udp socket bound");
        Ok(UdpDatagramSocket {
            socket,
            read_paused: false,
        })
    }

    pub fn from_std(socket: UdpSocket) -> anyhow::Result<Self> {
        socket
            .set_nonblocking(true)
            .context("failed to make UDP socket non-blocking")?;
        Ok(UdpDatagramSocket {
            socket,
            read_paused: false,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.socket
            .local_addr()
            .context("failed to read local address")
    }

    /// True once the pipeline gave up on this path. The owner stops polling
    /// it for reads.
    pub fn is_read_paused(&self) -> bool {
        self.read_paused
    }

    pub fn resume_read(&mut self) {
        self.read_paused = false;
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Set `SO_SNDBUF`. The kernel may round or double the value.
    #[cfg(unix)]
    pub fn set_send_buffer_size(&self, bytes: usize) -> anyhow::Result<()> {
        use std::os::unix::io::AsRawFd;

        let size = libc::c_int::try_from(bytes).context("send buffer size out of range")?;
        let fd = self.socket.as_raw_fd();
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &size as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error()).context("setsockopt(SO_SNDBUF) failed");
        }
        Ok(())
    }

    #[cfg(unix)]
    pub fn send_buffer_size(&self) -> anyhow::Result<usize> {
        use std::os::unix::io::AsRawFd;

        let mut size: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &mut size as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error()).context("getsockopt(SO_SNDBUF) failed");
        }
        usize::try_from(size).context("negative send buffer size")
    }
}

impl DatagramSocket for UdpDatagramSocket {
    fn write(&mut self, peer: &SocketAddr, buf: &[u8]) -> io::Result<usize> {
        let sent = self.socket.send_to(buf, peer)?;
        trace!(%peer, size = sent, "udp send");
        Ok(sent)
    }

    fn pause_read(&mut self) {
        if !self.read_paused {
            debug!(local = ?self.socket.local_addr().ok(), "pausing reads");
        }
        self.read_paused = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn bound_socket_is_non_blocking() {
        let sock = UdpDatagramSocket::bind(loopback()).unwrap();
        let mut buf = [0u8; 16];
        let err = sock.socket().recv_from(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(err.raw_os_error(), Some(libc::EAGAIN));
    }

    #[test]
    fn pause_and_resume() {
        let mut sock = UdpDatagramSocket::bind(loopback()).unwrap();
        assert!(!sock.is_read_paused());
        sock.pause_read();
        assert!(sock.is_read_paused());
        sock.resume_read();
        assert!(!sock.is_read_paused());
    }

    #[cfg(unix)]
    #[test]
    fn send_buffer_size_round_trips_through_kernel() {
        let sock = UdpDatagramSocket::bind(loopback()).unwrap();
        sock.set_send_buffer_size(64 * 1024).unwrap();
        assert!(sock.send_buffer_size().unwrap() >= 64 * 1024);
    }

    #[test]
    fn bind_failure_has_context() {
        let taken = UdpDatagramSocket::bind(loopback()).unwrap();
        let addr = taken.local_addr().unwrap();
        let err = UdpDatagramSocket::bind(addr).err().unwrap();
        assert!(format!("{err:#}").contains("failed to bind UDP socket"));
    }
}
