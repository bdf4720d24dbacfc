//! Outbound frame queue with partial-write support.

use heapless::{Deque, Vec};

use crate::error::{MqttError, PacketResult};
use crate::packet::{EncodePacket, MqttVersion, QoS};
use crate::transport::MqttTransport;

/// An encoded frame waiting to be written.
#[derive(Debug)]
pub struct OutboundFrame<const B: usize> {
    header: u8,
    mid: u16,
    qos: QoS,
    buf: Vec<u8, B>,
    pos: usize,
}

impl<const B: usize> OutboundFrame<B> {
    fn remaining(&self) -> &[u8] {
        &self.buf[self.pos..]
    }
}

/// What was on the wire once a frame is completely written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flushed {
    /// Command nibble of the frame (`PUBLISH`, `DISCONNECT`, ...).
    pub command: u8,
    pub mid: u16,
    pub qos: QoS,
}

/// FIFO of frames plus the one currently being flushed.
pub struct PacketWriter<const N: usize, const B: usize> {
    queue: Deque<OutboundFrame<B>, N>,
    current: Option<OutboundFrame<B>>,
}

impl<const N: usize, const B: usize> Default for PacketWriter<N, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, const B: usize> PacketWriter<N, B> {
    pub fn new() -> Self {
        Self {
            queue: Deque::new(),
            current: None,
        }
    }

    /// Encodes `packet` and appends it to the queue.
    ///
    /// Never writes to the transport.
    pub fn enqueue<P: EncodePacket>(
        &mut self,
        packet: &P,
        mid: u16,
        qos: QoS,
        version: MqttVersion,
    ) -> PacketResult<()> {
        if self.queue.is_full() {
            return Err(MqttError::QueueFull);
        }
        let mut buf = Vec::new();
        packet.encode(&mut buf, version)?;
        let frame = OutboundFrame {
            header: packet.header(),
            mid,
            qos,
            buf,
            pos: 0,
        };
        self.queue.push_back(frame).map_err(|_| MqttError::QueueFull)
    }

    /// `true` if another frame can be queued.
    pub fn has_room(&self) -> bool {
        !self.queue.is_full()
    }

    /// `true` while anything is left to write.
    pub fn is_pending(&self) -> bool {
        self.current.is_some() || !self.queue.is_empty()
    }

    /// Drops the queue and any partially written frame.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.current = None;
    }

    /// Writes from the current frame's cursor.
    ///
    /// Returns `Ok(Some(_))` each time a frame completes, `Ok(None)` once the
    /// queue is empty and would-block after a partial write.
    pub fn write<T: MqttTransport>(
        &mut self,
        transport: &mut T,
    ) -> nb::Result<Option<Flushed>, MqttError<T::Error>> {
        if self.current.is_none() {
            self.current = self.queue.pop_front();
        }
        let Some(frame) = self.current.as_mut() else {
            return Ok(None);
        };

        match transport.send(frame.remaining()) {
            Ok(0) | Err(nb::Error::WouldBlock) => return Err(nb::Error::WouldBlock),
            Ok(n) => frame.pos += n,
            Err(nb::Error::Other(e)) => return Err(nb::Error::Other(MqttError::Transport(e))),
        }
        if frame.pos < frame.buf.len() {
            return Err(nb::Error::WouldBlock);
        }

        let flushed = Flushed {
            command: frame.header & 0xF0,
            mid: frame.mid,
            qos: frame.qos,
        };
        self.current = None;
        Ok(Some(flushed))
    }
}
