use crate::transport::{PacketTransport, TransportRecv};
use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// convenience for unit test code: a localhost address with the given port
pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Polls `condition` until it holds, failing the test if that takes more than a few seconds
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition was not met in time");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

struct Incoming {
    payload: Vec<u8>,
    ancillary: Vec<u8>,
    flags: i32,
    from: SocketAddr,
}

type SentPacket = (Vec<u8>, Vec<u8>, SocketAddr);

#[derive(Default)]
struct Shared {
    pending: AtomicUsize,
    sent: Mutex<Vec<SentPacket>>,
    write_deadline: Mutex<Option<Instant>>,
    send_error: Mutex<Option<io::ErrorKind>>,
}

/// In-memory [PacketTransport]: tests inject incoming packets (and read errors) through the
///  [TransportHandle], and inspect what was sent.
pub struct ChannelTransport {
    local_addr: SocketAddr,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<io::Result<Incoming>>>,
    shared: Arc<Shared>,
}

pub struct TransportHandle {
    sender: mpsc::UnboundedSender<io::Result<Incoming>>,
    shared: Arc<Shared>,
}

impl ChannelTransport {
    pub fn new(local_addr: SocketAddr) -> (Arc<ChannelTransport>, TransportHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());

        let transport = ChannelTransport {
            local_addr,
            incoming: tokio::sync::Mutex::new(receiver),
            shared: shared.clone(),
        };
        (Arc::new(transport), TransportHandle { sender, shared })
    }

    fn record_send(&self, buf: &[u8], ancillary: &[u8], to: SocketAddr) -> io::Result<usize> {
        if let Some(kind) = *self.shared.send_error.lock().unwrap() {
            return Err(io::Error::from(kind));
        }
        self.shared.sent.lock().unwrap()
            .push((buf.to_vec(), ancillary.to_vec(), to));
        Ok(buf.len())
    }
}

impl TransportHandle {
    pub fn inject(&self, payload: &[u8], from: SocketAddr) {
        self.inject_with_ancillary(payload, &[], 0, from);
    }

    pub fn inject_with_ancillary(&self, payload: &[u8], ancillary: &[u8], flags: i32, from: SocketAddr) {
        self.push(Ok(Incoming {
            payload: payload.to_vec(),
            ancillary: ancillary.to_vec(),
            flags,
            from,
        }));
    }

    pub fn inject_error(&self, kind: io::ErrorKind) {
        self.push(Err(io::Error::new(kind, "injected error")));
    }

    fn push(&self, incoming: io::Result<Incoming>) {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        self.sender.send(incoming)
            .expect("transport was dropped");
    }

    /// number of injected packets that were not read from the transport yet
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn sent(&self) -> Vec<SentPacket> {
        self.shared.sent.lock().unwrap().clone()
    }

    pub fn write_deadline(&self) -> Option<Instant> {
        *self.shared.write_deadline.lock().unwrap()
    }

    /// all further send operations fail with the given error
    pub fn fail_sends(&self, kind: io::ErrorKind) {
        *self.shared.send_error.lock().unwrap() = Some(kind);
    }
}

#[async_trait]
impl PacketTransport for ChannelTransport {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let received = self.recv_msg(buf, &mut []).await?;
        Ok((received.len, received.from))
    }

    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.record_send(buf, &[], to)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn recv_msg(&self, buf: &mut [u8], ancillary: &mut [u8]) -> io::Result<TransportRecv> {
        let mut incoming = self.incoming.lock().await;
        let packet = match incoming.recv().await {
            Some(packet) => packet,
            // the test dropped its handle: behave like a socket that receives nothing
            None => std::future::pending().await,
        };
        self.shared.pending.fetch_sub(1, Ordering::AcqRel);

        let packet = packet?;
        let len = packet.payload.len().min(buf.len());
        buf[..len].copy_from_slice(&packet.payload[..len]);
        let ancillary_len = packet.ancillary.len().min(ancillary.len());
        ancillary[..ancillary_len].copy_from_slice(&packet.ancillary[..ancillary_len]);

        Ok(TransportRecv {
            len,
            ancillary_len,
            flags: packet.flags,
            from: packet.from,
        })
    }

    async fn send_msg(&self, buf: &[u8], ancillary: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.record_send(buf, ancillary, to)
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        *self.shared.write_deadline.lock().unwrap() = deadline;
        Ok(())
    }
}
