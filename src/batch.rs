use crate::envelope::{Packet, RecvMeta};
use crate::error::{MuxError, MuxResult};
use crate::virtual_conn::VirtualConn;
use tracing::trace;

/// Destination for one packet of a batched receive: a payload buffer, an optional buffer for
///  ancillary data, and the received packet's metadata once it is filled.
pub struct BatchSlot<'a> {
    segments: Vec<&'a mut [u8]>,
    ancillary: &'a mut [u8],
    meta: Option<RecvMeta>,
}

impl<'a> BatchSlot<'a> {
    pub fn new(buf: &'a mut [u8]) -> BatchSlot<'a> {
        Self::with_ancillary(buf, &mut [])
    }

    pub fn with_ancillary(buf: &'a mut [u8], ancillary: &'a mut [u8]) -> BatchSlot<'a> {
        BatchSlot {
            segments: vec![buf],
            ancillary,
            meta: None,
        }
    }

    /// A slot with a payload buffer made up of several segments.
    ///
    /// NB: Batched receive does not support scattering payload across segments, so using such a
    ///      slot causes [MuxError::Unsupported].
    pub fn scattered(segments: Vec<&'a mut [u8]>, ancillary: &'a mut [u8]) -> BatchSlot<'a> {
        BatchSlot {
            segments,
            ancillary,
            meta: None,
        }
    }

    /// the received packet's metadata, or `None` if the slot was not filled
    pub fn meta(&self) -> Option<&RecvMeta> {
        self.meta.as_ref()
    }

    /// the received payload, empty if the slot was not filled
    pub fn payload(&self) -> &[u8] {
        match (&self.meta, self.segments.first()) {
            (Some(meta), Some(buf)) => &buf[..meta.len],
            _ => &[],
        }
    }

    pub fn ancillary(&self) -> &[u8] {
        match &self.meta {
            Some(meta) => &self.ancillary[..meta.ancillary_len],
            None => &[],
        }
    }

    fn fill(&mut self, packet: Packet) -> MuxResult<()> {
        let meta = packet.copy_to(&mut self.segments[0], &mut self.ancillary)?;
        self.meta = Some(meta);
        Ok(())
    }
}

impl VirtualConn {
    /// Receives up to `slots.len()` packets, returning the number of slots that were filled.
    ///
    /// This waits (subject to the read deadline) for the first packet, and then takes whatever
    ///  further packets are queued for this connection without waiting any longer. Each packet's
    ///  payload must fit into its slot - otherwise [MuxError::ShortBuffer] is returned - while
    ///  ancillary data is truncated silently.
    ///
    /// If a read error on the transport is encountered, the batch is aborted and the error
    ///  returned; slots that were filled before are reset.
    pub async fn recv_batch(&self, slots: &mut [BatchSlot<'_>]) -> MuxResult<usize> {
        if slots.iter().any(|slot| slot.segments.len() != 1) {
            return Err(MuxError::unsupported("batched receive into non-contiguous buffers"));
        }
        for slot in slots.iter_mut() {
            slot.meta = None;
        }
        if slots.is_empty() {
            return Ok(0);
        }

        let (first, mut queue) = self.receive_locked().await?;
        let mut packet = first.into_packet()?;

        let mut num_filled = 0;
        loop {
            if let Err(e) = slots[num_filled].fill(packet) {
                Self::reset(&mut slots[..=num_filled]);
                return Err(e);
            }
            num_filled += 1;

            if num_filled == slots.len() {
                break;
            }

            packet = match queue.try_recv() {
                Ok(envelope) => match envelope.into_packet() {
                    Ok(packet) => packet,
                    Err(e) => {
                        Self::reset(&mut slots[..num_filled]);
                        return Err(e);
                    }
                },
                Err(_) => break,
            };
        }

        trace!("received batch of {} packets", num_filled);
        Ok(num_filled)
    }

    fn reset(slots: &mut [BatchSlot<'_>]) {
        for slot in slots {
            slot.meta = None;
        }
    }
}
