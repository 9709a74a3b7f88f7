use std::io;
use std::net::SocketAddr;
use crate::buffer_pool::PooledBuf;
use crate::error::MuxError;

/// Metadata of a received packet, as reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvMeta {
    /// number of payload bytes copied into the destination buffer
    pub len: usize,
    /// number of ancillary data bytes copied into the destination buffer
    pub ancillary_len: usize,
    /// protocol specific flags as reported by the transport (e.g. `MSG_TRUNC`)
    pub flags: i32,
    pub addr: SocketAddr,
}

/// One datagram as it travels from the dispatch loop to the virtual connection claiming it.
///
/// The payload (and ancillary data, if any) live in pooled buffers that are returned to their
///  pool when the envelope is dropped.
#[derive(Debug)]
pub struct Envelope {
    payload: PooledBuf,
    ancillary: Option<PooledBuf>,
    flags: i32,
    /// the sender on success, the read error otherwise
    source: io::Result<SocketAddr>,
}

impl Envelope {
    pub fn new(payload: PooledBuf, ancillary: Option<PooledBuf>, flags: i32, from: SocketAddr) -> Envelope {
        Envelope {
            payload,
            ancillary,
            flags,
            source: Ok(from),
        }
    }

    /// An envelope for a failed read: this is passed on to virtual connections (rather than
    ///  swallowed) so that consumers can observe transport failures.
    pub fn failed(mut payload: PooledBuf, error: io::Error) -> Envelope {
        payload.clear();
        Envelope {
            payload,
            ancillary: None,
            flags: 0,
            source: Err(error),
        }
    }

    pub fn payload(&self) -> &[u8] {
        self.payload.as_ref()
    }

    /// the sender's address, or `None` for an envelope carrying a read error
    pub fn from_addr(&self) -> Option<SocketAddr> {
        self.source.as_ref().ok().copied()
    }

    pub fn is_error(&self) -> bool {
        self.source.is_err()
    }

    /// Separates received datagrams from failed reads. A read error is passed on as
    ///  [MuxError::Transport] regardless of its kind: e.g. a `TimedOut` from the transport is not
    ///  a read deadline of the virtual connection.
    pub fn into_packet(self) -> Result<Packet, MuxError> {
        match self.source {
            Ok(addr) => Ok(Packet {
                payload: self.payload,
                ancillary: self.ancillary,
                flags: self.flags,
                addr,
            }),
            Err(e) => Err(MuxError::Transport(e)),
        }
    }
}

/// An envelope that is known to carry a datagram rather than an error
#[derive(Debug)]
pub struct Packet {
    payload: PooledBuf,
    ancillary: Option<PooledBuf>,
    flags: i32,
    addr: SocketAddr,
}

impl Packet {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Copies the payload into `buf`, truncating it if `buf` is too small, and the ancillary data
    ///  into `ancillary`, silently truncating it. Truncation of the payload is reported as
    ///  [MuxError::ShortBuffer]. The packet's buffers go back to the pool either way.
    pub fn copy_to(self, buf: &mut [u8], ancillary: &mut [u8]) -> Result<RecvMeta, MuxError> {
        let packet_len = self.payload.len();
        let len = packet_len.min(buf.len());
        buf[..len].copy_from_slice(&self.payload[..len]);

        let ancillary_len = match &self.ancillary {
            Some(src) => {
                let n = src.len().min(ancillary.len());
                ancillary[..n].copy_from_slice(&src[..n]);
                n
            }
            None => 0,
        };

        let meta = RecvMeta {
            len,
            ancillary_len,
            flags: self.flags,
            addr: self.addr,
        };

        if len < packet_len {
            Err(MuxError::ShortBuffer { packet_len, meta })
        }
        else {
            Ok(meta)
        }
    }
}
