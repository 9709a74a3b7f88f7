use crate::envelope::Envelope;
use crate::error::{MuxError, MuxResult};
use crate::multiplexer::{ConnEntry, Multiplexer};
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::select;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

type Queue = mpsc::Receiver<Envelope>;

/// Exclusive access to a connection's queue. If the connection was closed while the guard was
///  held, releasing the guard drains the queue.
pub(crate) struct QueueGuard<'a> {
    guard: Option<MutexGuard<'a, Queue>>,
    conn: &'a VirtualConn,
}

impl Deref for QueueGuard<'_> {
    type Target = Queue;

    fn deref(&self) -> &Queue {
        self.guard.as_ref().expect("guard is only released on drop")
    }
}

impl DerefMut for QueueGuard<'_> {
    fn deref_mut(&mut self) -> &mut Queue {
        self.guard.as_mut().expect("guard is only released on drop")
    }
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        // release first: a concurrent close() either sees the queue unlocked, or closed before
        //  the check below
        self.guard.take();
        if self.conn.is_closed() {
            self.conn.try_drain_queue();
        }
    }
}

struct ConnInner {
    mux: Arc<Multiplexer>,
    entry: Arc<ConnEntry>,
    /// concurrent readers take turns
    queue: Mutex<Queue>,
    read_deadline: std::sync::Mutex<Option<Instant>>,
    closing: AtomicBool,
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            debug!("virtual connection #{} dropped without being closed", self.entry.id);
            self.mux.deregister(self.entry.id);
            self.entry.closed.send_replace(true);
        }
    }
}

/// A virtual connection on a [Multiplexer], behaving like a datagram socket that receives the
///  packets its filter claims. Handles are cheap to clone and share the same connection.
///
/// Dropping the last handle closes the connection.
#[derive(Clone)]
pub struct VirtualConn {
    inner: Arc<ConnInner>,
}

impl Debug for VirtualConn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "VirtualConn{{id: {}, priority: {}, closed: {}}}", self.inner.entry.id, self.inner.entry.priority, self.is_closed())
    }
}

impl VirtualConn {
    pub(crate) fn new(mux: Arc<Multiplexer>, entry: Arc<ConnEntry>, queue: Queue) -> VirtualConn {
        VirtualConn {
            inner: Arc::new(ConnInner {
                mux,
                entry,
                queue: Mutex::new(queue),
                read_deadline: Default::default(),
                closing: AtomicBool::new(false),
            }),
        }
    }

    pub fn priority(&self) -> i32 {
        self.inner.entry.priority
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> MuxResult<SocketAddr> {
        Ok(self.inner.mux.local_addr()?)
    }

    pub(crate) fn mux(&self) -> &Arc<Multiplexer> {
        &self.inner.mux
    }

    /// Sets the deadline for receive operations, `None` meaning 'no deadline'.
    ///
    /// NB: The deadline is evaluated when a receive operation starts. Changing it has no effect on
    ///      receive operations that are already waiting.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.inner.read_deadline.lock().unwrap() = deadline;
    }

    /// Sets the write deadline of the underlying transport.
    ///
    /// NB: The transport is shared, so this affects *all* virtual connections of the multiplexer.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> MuxResult<()> {
        Ok(self.inner.mux.transport().set_write_deadline(deadline)?)
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) -> MuxResult<()> {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline)
    }

    /// Pass-through to the underlying transport's receive buffer size, affecting all virtual
    ///  connections of the multiplexer.
    pub fn set_recv_buffer_size(&self, size: usize) -> MuxResult<()> {
        Ok(self.inner.mux.transport().set_recv_buffer_size(size)?)
    }

    pub async fn send_to(&self, buf: &[u8], to: SocketAddr) -> MuxResult<usize> {
        self.before_send(buf, to)?;
        Ok(self.inner.mux.write(buf, to).await?)
    }

    /// Checks that the connection is open, and gives the filter the chance to see the packet
    pub(crate) fn before_send(&self, buf: &[u8], to: SocketAddr) -> MuxResult<()> {
        if self.is_closed() {
            return Err(MuxError::Closed);
        }
        if let Some(filter) = &self.inner.entry.filter {
            filter.outgoing(buf, to);
        }
        Ok(())
    }

    /// Waits for the next packet and copies it into `buf`, returning its length and sender.
    ///
    /// If `buf` is too small, the packet is truncated and [MuxError::ShortBuffer] is returned
    ///  with the number of bytes that were copied. A failed read on the transport is reported as
    ///  [MuxError::Transport] by whichever connection claimed it.
    pub async fn recv_from(&self, buf: &mut [u8]) -> MuxResult<(usize, SocketAddr)> {
        let envelope = self.receive_envelope().await?;
        let meta = envelope.into_packet()?
            .copy_to(buf, &mut [])?;
        Ok((meta.len, meta.addr))
    }

    /// Closes the connection: it is removed from the multiplexer, and pending or future receive
    ///  operations fail with [MuxError::Closed]. Packets that were received but not yet read are
    ///  discarded.
    ///
    /// Closing a connection that is already closed is an error.
    pub fn close(&self) -> MuxResult<()> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Err(MuxError::Closed);
        }

        // deregister *before* signalling, so nothing is dispatched to this connection afterwards
        self.inner.mux.deregister(self.inner.entry.id);
        self.inner.entry.closed.send_replace(true);

        self.try_drain_queue();
        Ok(())
    }

    /// Releases packets that were queued but never read. If a reader holds the queue right now,
    ///  the queue is drained when that reader releases it.
    fn try_drain_queue(&self) {
        if let Ok(mut queue) = self.inner.queue.try_lock() {
            Self::drain(&mut queue);
        }
    }

    fn drain(queue: &mut Queue) {
        queue.close();
        let mut num_discarded = 0;
        while queue.try_recv().is_ok() {
            num_discarded += 1;
        }
        if num_discarded > 0 {
            debug!("discarded {} unread packets of closed connection", num_discarded);
        }
    }

    pub(crate) async fn receive_envelope(&self) -> MuxResult<Envelope> {
        let (envelope, _queue) = self.receive_locked().await?;
        Ok(envelope)
    }

    /// Waits for the next envelope, returning it together with the lock on the queue so that
    ///  callers can keep on reading without interleaving with other readers.
    pub(crate) async fn receive_locked(&self) -> MuxResult<(Envelope, QueueGuard<'_>)> {
        match self.do_receive_locked().await {
            Ok((envelope, guard)) => Ok((envelope, QueueGuard { guard: Some(guard), conn: self })),
            Err(MuxError::Closed) => {
                self.try_drain_queue();
                Err(MuxError::Closed)
            }
            Err(e) => Err(e),
        }
    }

    async fn do_receive_locked(&self) -> MuxResult<(Envelope, MutexGuard<'_, Queue>)> {
        let deadline = *self.inner.read_deadline.lock().unwrap();

        let mut closed = self.inner.entry.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(MuxError::Closed);
        }
        if let Some(deadline) = deadline {
            if deadline <= Instant::now() {
                trace!("read deadline passed before receive");
                return Err(MuxError::DeadlineExceeded);
            }
        }

        let receive = async {
            let mut queue = self.inner.queue.lock().await;
            let envelope = queue.recv().await;
            envelope.map(|envelope| (envelope, queue))
        };

        let timeout = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        select! {
            biased;
            _ = closed.wait_for(|c| *c) => Err(MuxError::Closed),
            received = receive => received.ok_or(MuxError::Closed),
            _ = timeout => Err(MuxError::DeadlineExceeded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MuxConfig;
    use crate::test_util::{addr, wait_until, ChannelTransport, TransportHandle};
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn setup() -> (Arc<Multiplexer>, TransportHandle) {
        let (transport, handle) = ChannelTransport::new(addr(1));
        (Multiplexer::spawn(transport, MuxConfig::default_ipv4()).unwrap(), handle)
    }

    #[tokio::test]
    async fn test_truncation() {
        let (mux, handle) = setup();
        let conn = mux.register_connection(0, None);

        let payload = (0..1000).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        handle.inject(&payload, addr(2));

        let mut small = [0u8; 32];
        match conn.recv_from(&mut small).await {
            Err(MuxError::ShortBuffer { packet_len, meta }) => {
                assert_eq!(packet_len, 1000);
                assert_eq!(meta.len, 32);
                assert_eq!(meta.addr, addr(2));
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(&small[..], &payload[..32]);
    }

    #[tokio::test]
    async fn test_deadline_in_the_past() {
        let (mux, handle) = setup();
        let conn = mux.register_connection(0, None);

        conn.set_read_deadline(Some(Instant::now() - Duration::from_millis(50)));

        let started = Instant::now();
        let mut buf = [0u8; 16];
        assert!(matches!(conn.recv_from(&mut buf).await, Err(MuxError::DeadlineExceeded)));
        assert!(started.elapsed() < Duration::from_millis(50));

        // even with data available
        handle.inject(b"x", addr(2));
        wait_until(|| handle.pending() == 0).await;
        assert!(matches!(conn.recv_from(&mut buf).await, Err(MuxError::DeadlineExceeded)));

        conn.set_read_deadline(None);
        assert_eq!(conn.recv_from(&mut buf).await.unwrap(), (1, addr(2)));
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let (mux, _handle) = setup();
        let conn = mux.register_connection(0, None);

        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(30)));

        let started = Instant::now();
        let mut buf = [0u8; 16];
        assert!(matches!(conn.recv_from(&mut buf).await, Err(MuxError::DeadlineExceeded)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_no_deadline_blocks_until_data() {
        let (mux, handle) = setup();
        let conn = mux.register_connection(0, None);

        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                conn.recv_from(&mut buf).await
                    .map(|(n, from)| (buf[..n].to_vec(), from))
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());

        handle.inject(b"late", addr(2));
        let (data, from) = reader.await.unwrap().unwrap();
        assert_eq!(data, b"late");
        assert_eq!(from, addr(2));
    }

    #[tokio::test]
    async fn test_changing_deadline_does_not_affect_waiting_reader() {
        let (mux, _handle) = setup();
        let conn = mux.register_connection(0, None);

        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(300)));
        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                conn.recv_from(&mut buf).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.set_read_deadline(Some(Instant::now() - Duration::from_millis(1)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());

        assert!(matches!(reader.await.unwrap(), Err(MuxError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_close_unblocks_readers() {
        let (mux, _handle) = setup();
        let conn = mux.register_connection(0, None);

        let readers = (0..3)
            .map(|_| {
                let conn = conn.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 16];
                    conn.recv_from(&mut buf).await
                })
            })
            .collect::<Vec<_>>();

        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close().unwrap();

        for reader in readers {
            let result = tokio::time::timeout(Duration::from_millis(500), reader).await
                .expect("reader was not unblocked by close")
                .unwrap();
            assert!(matches!(result, Err(MuxError::Closed)));
        }
    }

    #[tokio::test]
    async fn test_double_close() {
        let (mux, _handle) = setup();
        let conn = mux.register_connection(0, None);

        assert!(!conn.is_closed());
        conn.close().unwrap();
        assert!(conn.is_closed());
        assert!(matches!(conn.close(), Err(MuxError::Closed)));
        assert!(matches!(conn.clone().close(), Err(MuxError::Closed)));
    }

    #[tokio::test]
    async fn test_send_after_close() {
        let (mux, handle) = setup();
        let conn = mux.register_connection(0, None);
        conn.close().unwrap();

        assert!(matches!(conn.send_to(b"x", addr(2)).await, Err(MuxError::Closed)));
        assert!(handle.sent().is_empty());

        let mut buf = [0u8; 16];
        assert!(matches!(conn.recv_from(&mut buf).await, Err(MuxError::Closed)));
    }

    #[tokio::test]
    async fn test_no_delivery_after_close() {
        let (mux, handle) = setup();
        let first = mux.register_connection(0, None);
        let fallback = mux.register_connection(1, None);

        first.close().unwrap();
        handle.inject(b"x", addr(2));

        let mut buf = [0u8; 16];
        assert_eq!(fallback.recv_from(&mut buf).await.unwrap(), (1, addr(2)));
        assert_eq!(mux.live_connection_count(), 1);
    }

    #[tokio::test]
    async fn test_close_releases_queued_buffers() {
        let (mux, handle) = setup();
        let conn = mux.register_connection(0, None);

        for _ in 0..5 {
            handle.inject(b"queued", addr(2));
        }
        wait_until(|| handle.pending() == 0).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let pooled_before = mux.payload_pool().num_pooled();

        conn.close().unwrap();
        assert_eq!(mux.payload_pool().num_pooled(), pooled_before + 5);
    }

    #[tokio::test]
    async fn test_close_while_queue_is_held() {
        let (mux, handle) = setup();
        let conn = mux.register_connection(0, None);

        for _ in 0..4 {
            handle.inject(b"queued", addr(2));
        }
        wait_until(|| handle.pending() == 0).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let pooled_before = mux.payload_pool().num_pooled();

        let (first, guard) = conn.receive_locked().await.unwrap();
        conn.close().unwrap();
        assert_eq!(mux.payload_pool().num_pooled(), pooled_before);

        drop(guard);
        assert_eq!(mux.payload_pool().num_pooled(), pooled_before + 3);

        drop(first);
        assert_eq!(mux.payload_pool().num_pooled(), pooled_before + 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_readers() {
        let (mux, handle) = setup();
        let conn = mux.register_connection(0, None);
        let num_received = Arc::new(AtomicUsize::new(0));

        let readers = (0..4)
            .map(|_| {
                let conn = conn.clone();
                let num_received = num_received.clone();
                tokio::spawn(async move {
                    let mut received = Vec::new();
                    let mut buf = [0u8; 16];
                    loop {
                        match conn.recv_from(&mut buf).await {
                            Ok((1, _)) => {
                                received.push(buf[0]);
                                num_received.fetch_add(1, Ordering::SeqCst);
                            }
                            Err(MuxError::Closed) => return received,
                            other => panic!("unexpected result {:?}", other),
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        for i in 0..200u8 {
            handle.inject(&[i], addr(2));
        }
        wait_until(|| num_received.load(Ordering::SeqCst) == 200).await;
        conn.close().unwrap();

        let mut all = Vec::new();
        for reader in readers {
            let received = reader.await.unwrap();
            // each reader sees its packets in queue order
            assert!(received.windows(2).all(|w| w[0] < w[1]));
            all.extend(received);
        }
        all.sort();
        assert_eq!(all, (0..200u8).collect::<Vec<_>>());
        assert_eq!(mux.dropped_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_closes() {
        let (mux, handle) = setup();
        let dropped = mux.register_connection(0, None);
        let fallback = mux.register_connection(1, None);

        drop(dropped);
        assert_eq!(mux.live_connection_count(), 1);

        handle.inject(b"x", addr(2));
        let mut buf = [0u8; 16];
        assert_eq!(fallback.recv_from(&mut buf).await.unwrap(), (1, addr(2)));
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (mux, handle) = setup();
        let conn = mux.register_connection(0, None);

        for i in 0..100u8 {
            handle.inject(&[i], addr(2));
        }

        let mut buf = [0u8; 16];
        for i in 0..100u8 {
            conn.recv_from(&mut buf).await.unwrap();
            assert_eq!(buf[0], i);
        }
    }

    #[tokio::test]
    async fn test_deadlines_and_socket_options() {
        let (mux, handle) = setup();
        let conn = mux.register_connection(0, None);

        let deadline = Instant::now() + Duration::from_secs(1);
        conn.set_deadline(Some(deadline)).unwrap();
        assert_eq!(handle.write_deadline(), Some(deadline));

        conn.set_write_deadline(None).unwrap();
        assert_eq!(handle.write_deadline(), None);

        assert!(matches!(conn.set_recv_buffer_size(4096), Err(MuxError::Unsupported(_))));
        assert_eq!(conn.local_addr().unwrap(), addr(1));
    }

    #[tokio::test]
    async fn test_send_error_is_propagated() {
        let (mux, handle) = setup();
        let conn = mux.register_connection(0, None);

        handle.fail_sends(io::ErrorKind::PermissionDenied);
        match conn.send_to(b"x", addr(2)).await {
            Err(MuxError::Transport(e)) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
            other => panic!("unexpected result {:?}", other),
        }
    }
}
