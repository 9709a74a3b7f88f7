use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::time::Instant;

/// Result of reading a single datagram with ancillary data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportRecv {
    pub len: usize,
    pub ancillary_len: usize,
    pub flags: i32,
    pub from: SocketAddr,
}

/// The OS level handle of a socket
#[cfg(unix)]
pub type RawHandle = std::os::fd::RawFd;
#[cfg(windows)]
pub type RawHandle = std::os::windows::io::RawSocket;
#[cfg(not(any(unix, windows)))]
pub type RawHandle = i64;

pub(crate) fn unsupported(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, what.to_string())
}

/// This is the abstraction over the real datagram socket that is shared by all virtual
///  connections. Implementations must support concurrent calls of `send_to` with one (and only
///  one) pending `recv_from` / `recv_msg` call.
///
/// Everything apart from the basic send and receive operations is optional, and the default
///  implementations either degrade gracefully or report [io::ErrorKind::Unsupported].
#[async_trait]
pub trait PacketTransport: Send + Sync + 'static {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Reads a datagram together with its ancillary data. Transports without support for
    ///  ancillary data read the payload only.
    async fn recv_msg(&self, buf: &mut [u8], _ancillary: &mut [u8]) -> io::Result<TransportRecv> {
        let (len, from) = self.recv_from(buf).await?;
        Ok(TransportRecv {
            len,
            ancillary_len: 0,
            flags: 0,
            from,
        })
    }

    /// Sends a datagram with ancillary data. Without ancillary data, this is the same as `send_to`.
    async fn send_msg(&self, buf: &[u8], ancillary: &[u8], to: SocketAddr) -> io::Result<usize> {
        if ancillary.is_empty() {
            self.send_to(buf, to).await
        }
        else {
            Err(unsupported("transport does not support sending ancillary data"))
        }
    }

    /// `None` means no deadline
    fn set_write_deadline(&self, _deadline: Option<Instant>) -> io::Result<()> {
        Err(unsupported("transport does not support write deadlines"))
    }

    fn set_recv_buffer_size(&self, _size: usize) -> io::Result<()> {
        Err(unsupported("transport does not support setting the receive buffer size"))
    }

    fn raw_fd(&self) -> io::Result<RawHandle> {
        Err(unsupported("transport has no raw socket handle"))
    }
}
