use crate::ancillary_conn::AncillaryConn;
use crate::buffer_pool::BufferPool;
use crate::config::MuxConfig;
use crate::envelope::Envelope;
use crate::filter::PacketFilter;
use crate::transport::{PacketTransport, TransportRecv};
use crate::virtual_conn::VirtualConn;
use std::fmt::{Debug, Formatter};
use std::io;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, trace_span, warn, Instrument};

/// Everything the dispatch loop needs to know about a virtual connection.
pub(crate) struct ConnEntry {
    pub(crate) id: u64,
    pub(crate) priority: i32,
    pub(crate) filter: Option<Arc<dyn PacketFilter>>,
    pub(crate) sender: mpsc::Sender<Envelope>,
    /// flips to `true` exactly once, *after* the entry was removed from the registry
    pub(crate) closed: watch::Sender<bool>,
}

impl ConnEntry {
    /// A filter that panics does not claim the packet. The panic must not escape into the
    ///  dispatch loop, which would end delivery for all connections.
    fn claims(&self, envelope: &Envelope) -> bool {
        let filter = match &self.filter {
            None => return true,
            Some(filter) => filter,
        };

        match catch_unwind(AssertUnwindSafe(|| filter.claim_incoming(envelope.payload(), envelope.from_addr()))) {
            Ok(claimed) => claimed,
            Err(_) => {
                error!("filter of virtual connection #{} panicked - treating packet as not claimed", self.id);
                false
            }
        }
    }
}

type Registry = Arc<Vec<Arc<ConnEntry>>>;

/// The Multiplexer owns a datagram transport and shares it between any number of virtual
///  connections.
///
/// A single dispatch loop reads packets from the transport and offers each of them to the
///  virtual connections in priority order (lowest value first). The first connection whose
///  filter claims the packet gets it; if no connection claims it, the packet is dropped.
///
/// Each virtual connection has a bounded queue of received packets. If the claiming
///  connection's queue is full, the dispatch loop waits for room rather than dropping the packet,
///  which means that a slow consumer stalls delivery to *all* virtual connections.
///
/// Connections without a filter claim everything, so they should be registered with a higher
///  priority value than all connections with filters.
///
/// NB: There is no way to stop the dispatch loop once it is started; it runs as long as the
///      tokio runtime it was spawned on.
pub struct Multiplexer {
    transport: Arc<dyn PacketTransport>,
    side_channel: Option<Arc<dyn PacketTransport>>,
    config: MuxConfig,
    /// copy-on-write: the dispatch loop works on snapshots, registration replaces the vec
    registry: Mutex<Registry>,
    next_conn_id: AtomicU64,
    dropped: AtomicU64,
    payload_pool: Arc<BufferPool>,
    ancillary_pool: Arc<BufferPool>,
    started: AtomicBool,
}

impl Debug for Multiplexer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Multiplexer{{local_addr: {:?}, connections: {}}}", self.transport.local_addr().ok(), self.live_connection_count())
    }
}

impl Multiplexer {
    /// Creates a multiplexer without starting its dispatch loop, see [Multiplexer::start]. This
    ///  allows registering virtual connections before the first packet is dispatched.
    pub fn new(transport: Arc<dyn PacketTransport>, config: MuxConfig) -> anyhow::Result<Arc<Multiplexer>> {
        Self::create(transport, None, config)
    }

    /// Like [Multiplexer::new], with an additional transport that is used for sending packets
    ///  with ancillary data and for raw socket access through [AncillaryConn]. This is useful if
    ///  the primary transport is a wrapper that hides the underlying socket.
    pub fn new_with_side_channel(
        transport: Arc<dyn PacketTransport>,
        side_channel: Arc<dyn PacketTransport>,
        config: MuxConfig,
    ) -> anyhow::Result<Arc<Multiplexer>> {
        Self::create(transport, Some(side_channel), config)
    }

    /// Creates a multiplexer and starts its dispatch loop right away. This must be called from
    ///  within a tokio runtime.
    pub fn spawn(transport: Arc<dyn PacketTransport>, config: MuxConfig) -> anyhow::Result<Arc<Multiplexer>> {
        let result = Self::new(transport, config)?;
        result.start();
        Ok(result)
    }

    fn create(
        transport: Arc<dyn PacketTransport>,
        side_channel: Option<Arc<dyn PacketTransport>>,
        config: MuxConfig,
    ) -> anyhow::Result<Arc<Multiplexer>> {
        config.validate()?;

        Ok(Arc::new(Multiplexer {
            transport,
            side_channel,
            payload_pool: Arc::new(BufferPool::new(config.max_packet_size, config.buffer_pool_size)),
            ancillary_pool: Arc::new(BufferPool::new(config.ancillary_capacity, config.buffer_pool_size)),
            config,
            registry: Default::default(),
            next_conn_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            started: AtomicBool::new(false),
        }))
    }

    /// Spawns the dispatch loop on the current tokio runtime. Calling this more than once has no
    ///  effect, and the return value indicates if this call started the loop.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            return false;
        }

        let mux = self.clone();
        tokio::spawn(async move {
            mux.dispatch_loop().await
        });
        true
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// number of packets that no virtual connection claimed, or that were claimed by a
    ///  connection that was closed before the packet could be delivered
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    pub fn live_connection_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Registers a new virtual connection. Connections with lower `priority` values get to claim
    ///  packets first; connections with equal priority are asked in registration order.
    ///
    /// `None` as a filter means that the connection claims all packets offered to it.
    pub fn register_connection(self: &Arc<Self>, priority: i32, filter: Option<Arc<dyn PacketFilter>>) -> VirtualConn {
        let (sender, receiver) = mpsc::channel(self.config.queue_capacity);
        let (closed, _) = watch::channel(false);

        let entry = Arc::new(ConnEntry {
            id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            priority,
            filter,
            sender,
            closed,
        });

        {
            let mut registry = self.registry.lock().unwrap();
            let mut conns = registry.as_ref().clone();
            conns.push(entry.clone());
            // stable sort: equal priorities stay in registration order
            conns.sort_by_key(|c| c.priority);
            *registry = Arc::new(conns);
        }
        info!("registered virtual connection #{} with priority {}", entry.id, priority);

        VirtualConn::new(self.clone(), entry, receiver)
    }

    /// Registers a virtual connection that supports ancillary data, see [Multiplexer::register_connection]
    pub fn register_ancillary_connection(self: &Arc<Self>, priority: i32, filter: Option<Arc<dyn PacketFilter>>) -> AncillaryConn {
        AncillaryConn::new(self.register_connection(priority, filter))
    }

    /// Returns `true` if a connection was actually removed
    pub(crate) fn deregister(&self, conn_id: u64) -> bool {
        let mut registry = self.registry.lock().unwrap();
        if !registry.iter().any(|c| c.id == conn_id) {
            return false;
        }

        let conns = registry.iter()
            .filter(|c| c.id != conn_id)
            .cloned()
            .collect::<Vec<_>>();
        *registry = Arc::new(conns);

        debug!("deregistered virtual connection #{}", conn_id);
        true
    }

    /// Sends a packet through the transport, bypassing all filters
    pub async fn write(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.transport.send_to(buf, to).await
    }

    /// Sends a packet with ancillary data through the side channel if there is one, and through
    ///  the regular transport otherwise
    pub async fn write_msg(&self, buf: &[u8], ancillary: &[u8], to: SocketAddr) -> io::Result<usize> {
        match &self.side_channel {
            Some(side_channel) => side_channel.send_msg(buf, ancillary, to).await,
            None => self.transport.send_msg(buf, ancillary, to).await,
        }
    }

    pub(crate) fn transport(&self) -> &Arc<dyn PacketTransport> {
        &self.transport
    }

    pub(crate) fn side_channel(&self) -> Option<&Arc<dyn PacketTransport>> {
        self.side_channel.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn payload_pool(&self) -> &Arc<BufferPool> {
        &self.payload_pool
    }

    fn snapshot(&self) -> Registry {
        self.registry.lock().unwrap().clone()
    }

    async fn dispatch_loop(&self) {
        info!("starting dispatch loop on {:?}", self.transport.local_addr());

        let mut packet_counter: u64 = 0;
        loop {
            let envelope = self.read_envelope().await;
            let is_error = envelope.is_error();

            packet_counter += 1;
            let span = trace_span!("dispatch", packet = packet_counter);
            self.dispatch(envelope).instrument(span).await;

            if is_error {
                // a broken transport may fail without ever suspending
                tokio::task::yield_now().await;
            }
        }
    }

    async fn read_envelope(&self) -> Envelope {
        let mut payload = self.payload_pool.get_from_pool();
        payload.maximize_len();

        let mut ancillary = if self.config.ancillary_capacity > 0 {
            let mut buf = self.ancillary_pool.get_from_pool();
            buf.maximize_len();
            Some(buf)
        }
        else {
            None
        };

        let received = match &mut ancillary {
            Some(ancillary) => self.transport.recv_msg(&mut payload[..], &mut ancillary[..]).await,
            None => self.transport.recv_from(&mut payload[..]).await
                .map(|(len, from)| TransportRecv { len, ancillary_len: 0, flags: 0, from }),
        };

        match received {
            Ok(received) => {
                trace!("received packet from {:?}, len {}", received.from, received.len);
                payload.truncate(received.len);
                if let Some(ancillary) = &mut ancillary {
                    ancillary.truncate(received.ancillary_len);
                }
                Envelope::new(payload, ancillary, received.flags, received.from)
            }
            Err(e) => {
                warn!("error receiving from transport: {}", e);
                Envelope::failed(payload, e)
            }
        }
    }

    async fn dispatch(&self, envelope: Envelope) {
        let registry = self.snapshot();

        match registry.iter().find(|conn| conn.claims(&envelope)) {
            Some(conn) => {
                trace!("packet claimed by virtual connection #{}", conn.id);
                self.deliver(conn, envelope).await;
            }
            None => {
                self.dropped.fetch_add(1, Ordering::AcqRel);
                debug!("no virtual connection claimed packet from {:?} - dropping", envelope.from_addr());
            }
        }
    }

    /// Waits for room in the connection's queue, giving up if the connection is closed meanwhile
    async fn deliver(&self, conn: &ConnEntry, envelope: Envelope) {
        let mut closed = conn.closed.subscribe();

        let delivered = select! {
            biased;
            _ = closed.wait_for(|c| *c) => false,
            result = conn.sender.send(envelope) => result.is_ok(),
        };

        if !delivered {
            self.dropped.fetch_add(1, Ordering::AcqRel);
            debug!("virtual connection #{} was closed before packet could be delivered - dropping", conn.id);
        }
    }
}
