use crate::envelope::RecvMeta;
use crate::error::MuxResult;
use crate::transport::RawHandle;
use crate::virtual_conn::VirtualConn;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::ops::Deref;

/// A virtual connection with access to per-packet ancillary data (control messages such as ECN
///  bits) and to the underlying socket, for protocols that need OS level packet metadata.
///
/// Ancillary data is only received if the multiplexer is configured with a non-zero
///  `ancillary_capacity` and the transport supports it; otherwise received packets simply have
///  no ancillary data.
#[derive(Clone)]
pub struct AncillaryConn {
    conn: VirtualConn,
}

impl Debug for AncillaryConn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ancillary{:?}", self.conn)
    }
}

impl Deref for AncillaryConn {
    type Target = VirtualConn;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl AncillaryConn {
    pub(crate) fn new(conn: VirtualConn) -> AncillaryConn {
        AncillaryConn { conn }
    }

    /// Sends a packet with ancillary data, through the multiplexer's side channel if it has one.
    ///  The filter's outgoing hook sees the packet just like for regular sends.
    pub async fn send_msg(&self, buf: &[u8], ancillary: &[u8], to: SocketAddr) -> MuxResult<usize> {
        self.conn.before_send(buf, to)?;
        Ok(self.conn.mux().write_msg(buf, ancillary, to).await?)
    }

    /// Like [VirtualConn::recv_from], additionally copying the packet's ancillary data into
    ///  `ancillary` (truncating it silently if it does not fit) and reporting protocol flags.
    pub async fn recv_msg(&self, buf: &mut [u8], ancillary: &mut [u8]) -> MuxResult<RecvMeta> {
        let envelope = self.conn.receive_envelope().await?;
        envelope.into_packet()?
            .copy_to(buf, ancillary)
    }

    /// The raw handle of the side channel if there is one, or of the regular transport otherwise.
    ///  [crate::MuxError::Unsupported] if that transport has no raw handle, e.g. on platforms without
    ///  socket handles.
    pub fn raw_fd(&self) -> MuxResult<RawHandle> {
        let mux = self.conn.mux();
        let fd = match mux.side_channel() {
            Some(side_channel) => side_channel.raw_fd()?,
            None => mux.transport().raw_fd()?,
        };
        Ok(fd)
    }
}
