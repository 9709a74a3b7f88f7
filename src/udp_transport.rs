use crate::transport::{PacketTransport, RawHandle};
use async_trait::async_trait;
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{info, trace};

/// [PacketTransport] implementation for a plain UDP socket.
///
/// UDP sockets have no notion of a write deadline, so it is emulated by giving up on a pending
///  send operation once the deadline has passed.
pub struct UdpTransport {
    socket: UdpSocket,
    write_deadline: Mutex<Option<Instant>>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<UdpTransport> {
        let socket = UdpSocket::bind(addr).await?;
        info!("bound UDP socket to {:?}", socket.local_addr()?);
        Ok(UdpTransport::new(socket))
    }

    pub fn new(socket: UdpSocket) -> UdpTransport {
        UdpTransport {
            socket,
            write_deadline: Mutex::new(None),
        }
    }

    fn deadline_exceeded() -> io::Error {
        io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded")
    }
}

#[async_trait]
impl PacketTransport for UdpTransport {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        trace!("UDP socket: sending packet to {:?}", to);

        let deadline = *self.write_deadline.lock().unwrap();
        match deadline {
            None => self.socket.send_to(buf, to).await,
            Some(deadline) if deadline <= Instant::now() => Err(Self::deadline_exceeded()),
            Some(deadline) => timeout_at(deadline, self.socket.send_to(buf, to)).await
                .unwrap_or_else(|_| Err(Self::deadline_exceeded())),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        *self.write_deadline.lock().unwrap() = deadline;
        Ok(())
    }

    fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        SockRef::from(&self.socket).set_recv_buffer_size(size)
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> io::Result<RawHandle> {
        use std::os::fd::AsRawFd;
        Ok(self.socket.as_raw_fd())
    }

    #[cfg(windows)]
    fn raw_fd(&self) -> io::Result<RawHandle> {
        use std::os::windows::io::AsRawSocket;
        Ok(self.socket.as_raw_socket())
    }
}
