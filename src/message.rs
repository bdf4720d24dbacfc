//! Bookkeeping for QoS 1/2 messages in flight.
//!
//! Outgoing messages keep the order in which they were published, which is
//! also the order they are (re)transmitted in. Incoming messages are only
//! stored for the QoS 2 handshake, until the broker's PUBREL arrives.

use embassy_time::{Duration, Instant};
use heapless::Vec;

use crate::error::{MqttError, PacketResult};
use crate::packet::{Publish, QoS};

/// Where a tracked message is in its acknowledgement handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MessageState {
    /// Ready to be (re)sent as PUBLISH.
    Publish,
    /// QoS 1 PUBLISH sent, waiting for PUBACK.
    WaitPuback,
    /// QoS 2 PUBLISH sent, waiting for PUBREC.
    WaitPubrec,
    /// PUBREC received before a reconnect, PUBREL must be sent again.
    ResendPubrel,
    /// Incoming QoS 2 PUBLISH acknowledged with PUBREC, waiting for PUBREL.
    WaitPubrel,
    /// PUBREL sent, waiting for PUBCOMP.
    WaitPubcomp,
    /// Held back until an inflight slot frees up.
    Queued,
}

/// A message with its delivery state.
///
/// Topic and payload share one buffer, so any PUBLISH that fits a frame
/// buffer of `B` bytes can be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedMessage<const B: usize> {
    pub mid: u16,
    data: Vec<u8, B>,
    topic_len: usize,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// When the last packet for this message was sent. `None` after a reconnect.
    pub timestamp: Option<Instant>,
    pub state: MessageState,
}

impl<const B: usize> TrackedMessage<B> {
    pub fn new(
        mid: u16,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        state: MessageState,
    ) -> PacketResult<Self> {
        let mut data = Vec::new();
        data.extend_from_slice(topic.as_bytes())
            .and_then(|()| data.extend_from_slice(payload))
            .map_err(|_| MqttError::BufferTooSmall)?;
        Ok(Self {
            mid,
            data,
            topic_len: topic.len(),
            qos,
            retain,
            dup: false,
            timestamp: None,
            state,
        })
    }

    pub fn topic(&self) -> &str {
        core::str::from_utf8(&self.data[..self.topic_len]).unwrap_or_default()
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.topic_len..]
    }

    pub fn as_publish(&self) -> Publish<'_> {
        Publish {
            topic: self.topic(),
            qos: self.qos,
            retain: self.retain,
            dup: self.dup,
            payload: self.payload(),
            packet_id: (self.qos != QoS::AtMostOnce).then_some(self.mid),
        }
    }

    /// `true` if the last transmission is older than `retry`.
    pub fn is_stale(&self, now: Instant, retry: Duration) -> bool {
        self.timestamp
            .is_some_and(|sent| sent + retry < now)
    }

    fn counts_inflight(&self) -> bool {
        self.qos != QoS::AtMostOnce && self.state != MessageState::Queued
    }
}

/// Outgoing and incoming tracked messages, `N` of each.
pub struct MessageStore<const N: usize, const B: usize> {
    outgoing: Vec<TrackedMessage<B>, N>,
    incoming: Vec<TrackedMessage<B>, N>,
    max_inflight: usize,
    last_mid: u16,
}

impl<const N: usize, const B: usize> MessageStore<N, B> {
    /// `max_inflight == 0` means no limit besides the store capacity.
    pub fn new(max_inflight: usize) -> Self {
        Self {
            outgoing: Vec::new(),
            incoming: Vec::new(),
            max_inflight,
            last_mid: 0,
        }
    }

    /// Allocates the next message id.
    ///
    /// Ids run from 1 to 65535 and wrap, skipping ids still held by an
    /// outgoing message.
    pub fn next_mid(&mut self) -> u16 {
        loop {
            self.last_mid = self.last_mid.wrapping_add(1);
            if self.last_mid == 0 {
                self.last_mid = 1;
            }
            let mid = self.last_mid;
            if !self.outgoing.iter().any(|m| m.mid == mid) {
                return mid;
            }
        }
    }

    /// Number of outgoing QoS>0 messages occupying an inflight slot.
    pub fn inflight(&self) -> usize {
        self.outgoing.iter().filter(|m| m.counts_inflight()).count()
    }

    pub fn has_free_slot(&self) -> bool {
        self.max_inflight == 0 || self.inflight() < self.max_inflight
    }

    pub fn is_full(&self) -> bool {
        self.outgoing.is_full()
    }

    pub fn push_outgoing(&mut self, message: TrackedMessage<B>) -> PacketResult<()> {
        self.outgoing.push(message).map_err(|_| MqttError::QueueFull)
    }

    pub fn outgoing(&self) -> &[TrackedMessage<B>] {
        &self.outgoing
    }

    pub fn outgoing_mut(&mut self) -> &mut Vec<TrackedMessage<B>, N> {
        &mut self.outgoing
    }

    pub fn find_outgoing_mut(&mut self, mid: u16) -> Option<&mut TrackedMessage<B>> {
        self.outgoing.iter_mut().find(|m| m.mid == mid)
    }

    /// Removes the outgoing message of the given QoS whose handshake completed.
    pub fn remove_outgoing(&mut self, mid: u16, qos: QoS) -> Option<TrackedMessage<B>> {
        let index = self
            .outgoing
            .iter()
            .position(|m| m.mid == mid && m.qos == qos)?;
        Some(self.outgoing.remove(index))
    }

    /// Stores an incoming QoS 2 message until its PUBREL arrives.
    ///
    /// A retransmitted PUBLISH for an id already stored is not stored twice.
    pub fn push_incoming(&mut self, message: TrackedMessage<B>) -> PacketResult<()> {
        if self.incoming.iter().any(|m| m.mid == message.mid) {
            return Ok(());
        }
        self.incoming.push(message).map_err(|_| MqttError::QueueFull)
    }

    pub fn incoming(&self) -> &[TrackedMessage<B>] {
        &self.incoming
    }

    pub fn incoming_mut(&mut self) -> &mut Vec<TrackedMessage<B>, N> {
        &mut self.incoming
    }

    pub fn remove_incoming(&mut self, mid: u16) -> Option<TrackedMessage<B>> {
        let index = self.incoming.iter().position(|m| m.mid == mid)?;
        Some(self.incoming.remove(index))
    }

    pub fn state_of(&self, mid: u16) -> Option<MessageState> {
        self.outgoing.iter().find(|m| m.mid == mid).map(|m| m.state)
    }

    /// Moves the oldest queued messages into `Publish` while slots are free.
    pub fn promote_queued(&mut self) {
        while self.has_free_slot() {
            let Some(message) = self
                .outgoing
                .iter_mut()
                .find(|m| m.state == MessageState::Queued)
            else {
                break;
            };
            message.state = MessageState::Publish;
        }
    }

    /// Rewinds every message so that the handshakes resume on a new connection.
    ///
    /// A QoS 2 message whose PUBREC was already received always resumes with
    /// PUBREL, even when the inflight window is full. The remaining slots go to
    /// the other messages in publish order, the rest are queued.
    pub fn reconnect_reset(&mut self) {
        let mut inflight = 0;
        for message in self.outgoing.iter_mut() {
            message.timestamp = None;
            if message.qos == QoS::ExactlyOnce
                && matches!(
                    message.state,
                    MessageState::WaitPubcomp | MessageState::ResendPubrel
                )
            {
                message.dup = true;
                message.state = MessageState::ResendPubrel;
                inflight += 1;
            }
        }

        let max_inflight = self.max_inflight;
        for message in self.outgoing.iter_mut() {
            match (message.qos, message.state) {
                (QoS::AtMostOnce, _) => message.state = MessageState::Publish,
                (_, MessageState::ResendPubrel) => {}
                (_, state) if max_inflight == 0 || inflight < max_inflight => {
                    if matches!(state, MessageState::WaitPuback | MessageState::WaitPubrec) {
                        message.dup = true;
                    }
                    message.state = MessageState::Publish;
                    inflight += 1;
                }
                _ => message.state = MessageState::Queued,
            }
        }

        self.incoming.retain(|m| m.qos == QoS::ExactlyOnce);
    }

    /// Drops every tracked message.
    pub fn clear(&mut self) {
        self.outgoing.clear();
        self.incoming.clear();
    }
}
