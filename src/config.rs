use anyhow::bail;

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// This is the size of the buffer each datagram is read into, i.e. the biggest payload that
    ///  can be received without truncation. The underlying transport decides what happens to
    ///  datagrams exceeding this size (for UDP sockets, the excess is silently discarded).
    ///
    /// With full Ethernet frames and no optional IP headers, UDP payload is `1500 - 20 - 8 = 1472`
    ///  for IPV4 and `1500 - 40 - 8 = 1452` for IPV6. The default is somewhat bigger to leave room
    ///  for jumbo frames and loopback traffic without making buffers excessively big.
    pub max_packet_size: usize,

    /// Capacity of the per-packet buffer for ancillary data (control messages, e.g. ECN bits).
    ///  Zero disables reading ancillary data from the transport altogether.
    pub ancillary_capacity: usize,

    /// This is the number of received packets that can be queued for a single virtual connection
    ///  before the dispatcher blocks. A slow consumer throttles delivery to *all* virtual
    ///  connections once its queue is full.
    pub queue_capacity: usize,

    /// This is the number of buffers that will be pooled at a given time - buffers in excess of
    ///  this number are discarded when they are returned.
    pub buffer_pool_size: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self::default_ipv4()
    }
}

impl MuxConfig {
    pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

    /// Buffer sizes suitable for regular UDP traffic over IPV4 or IPV6, no ancillary data
    pub fn default_ipv4() -> MuxConfig {
        MuxConfig {
            max_packet_size: 2048,
            ancillary_capacity: 0,
            queue_capacity: Self::DEFAULT_QUEUE_CAPACITY,
            buffer_pool_size: 4096,
        }
    }

    /// Like [MuxConfig::default_ipv4], but with room for per-packet control messages
    pub fn with_ancillary(ancillary_capacity: usize) -> MuxConfig {
        MuxConfig {
            ancillary_capacity,
            ..Self::default_ipv4()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_packet_size == 0 {
            bail!("max packet size must not be zero");
        }
        if self.max_packet_size > 65536 {
            bail!("max packet size {} exceeds the maximum datagram size", self.max_packet_size);
        }
        if self.queue_capacity == 0 {
            bail!("queue capacity must not be zero");
        }
        Ok(())
    }
}
