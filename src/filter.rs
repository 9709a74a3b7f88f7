#[cfg(test)] use mockall::automock;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

/// A filter decides which incoming packets a virtual connection wants to receive, and it gets to
///  see all packets that the virtual connection sends.
///
/// `claim_incoming` is called on the dispatch loop for every packet that was not claimed by a
///  virtual connection with higher priority, so it should be cheap and must not block.
#[cfg_attr(test, automock)]
pub trait PacketFilter: Send + Sync + 'static {
    /// Called synchronously for every packet sent through the virtual connection, before it is
    ///  handed to the transport. This allows filters to learn e.g. about peers or connection ids
    ///  that replies will refer to.
    fn outgoing(&self, buf: &[u8], to: SocketAddr);

    /// Returns `true` if the virtual connection wants to receive the packet. `from` is `None` if
    ///  the 'packet' is a failed read, in which case `buf` is empty.
    fn claim_incoming(&self, buf: &[u8], from: Option<SocketAddr>) -> bool;
}

/// Adapter for using a closure as a claim predicate, without any outgoing side effect
pub struct ClaimFn<F>(pub F);

impl<F> Debug for ClaimFn<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClaimFn")
    }
}

impl<F> PacketFilter for ClaimFn<F>
where F: Fn(&[u8], Option<SocketAddr>) -> bool + Send + Sync + 'static
{
    fn outgoing(&self, _buf: &[u8], _to: SocketAddr) {}

    fn claim_incoming(&self, buf: &[u8], from: Option<SocketAddr>) -> bool {
        (self.0)(buf, from)
    }
}
