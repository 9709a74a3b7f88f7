//! Shares a single datagram transport (typically a UDP socket) between several independent
//!  protocols, each of which sees its own *virtual connection* with the familiar packet socket
//!  operations (send, receive, deadlines, close).
//!
//! ## Dispatch
//!
//! A single dispatch loop per [Multiplexer] reads packets from the transport into pooled buffers
//!  and offers each packet to the live connections in ascending priority order (lower value
//!  is asked first, ties in order of registration). The first connection whose filter claims the
//!  packet gets it, and no other connection ever sees it. A connection without a filter claims
//!  everything, so it is typically registered last as a catch-all. Packets that no connection
//!  claims are counted and dropped.
//!
//! Every connection has a bounded FIFO queue. If a claimant's queue is full, the dispatch loop
//!  waits: a slow reader applies backpressure to the shared transport rather than losing packets.
//!  If the connection closes while the dispatch loop waits, the packet is dropped.
//!
//! Transport read errors are delivered (as error envelopes with an empty payload) to whichever
//!  connection claims them, so filters must be prepared to see an empty buffer without a source
//!  address.
//!
//! ## Sending
//!
//! Writes go straight to the shared transport without any filtering; a connection's filter only
//!  gets a notification through its outgoing hook, e.g. to track peers.
//!
//! ## Variants
//!
//! * [VirtualConn::recv_batch] receives several queued packets in a single call
//! * [AncillaryConn] additionally transports per-packet ancillary data (control messages) and
//!    protocol flags, optionally sending through a separate side channel
//!
//! ```ascii
//!                    +-----------------+
//!  transport  --->   |  dispatch loop  |  ---> claim? conn prio 0 ---> queue ---> recv_from
//!                    |  (buffer pool)  |  ---> claim? conn prio 1 ---> queue ---> recv_batch
//!                    +-----------------+  ---> claim? catch-all   ---> queue ---> recv_msg
//! ```

pub mod ancillary_conn;
pub mod batch;
pub mod buffer_pool;
pub mod config;
pub mod envelope;
pub mod error;
pub mod filter;
pub mod multiplexer;
pub mod transport;
pub mod udp_transport;
pub mod virtual_conn;

#[cfg(test)]
mod test_util;

pub use ancillary_conn::AncillaryConn;
pub use batch::BatchSlot;
pub use config::MuxConfig;
pub use envelope::RecvMeta;
pub use error::{MuxError, MuxResult};
pub use filter::{ClaimFn, PacketFilter};
pub use multiplexer::Multiplexer;
pub use transport::{PacketTransport, RawHandle, TransportRecv};
pub use udp_transport::UdpTransport;
pub use virtual_conn::VirtualConn;
