//! Publish requests from other tasks.
//!
//! The client is owned by whichever loop drives its step functions. Other
//! tasks (or interrupt glue such as a button handler) hold a
//! [`PublisherHandle`] and queue [`PublishRequest`]s on a channel; the
//! driving loop hands the receiver to [`crate::MqttClient::publish_requests`].

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};

use crate::packet::QoS;

/// A request to publish a message, sent via channel to the client's loop.
///
/// This struct holds references to the topic and payload, which must outlive
/// the request. For static topics/payloads (common in embedded), use `'static`.
#[derive(Debug, Clone)]
pub struct PublishRequest<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
}

pub type PublishRequestChannel<'a, M, const DEPTH: usize> = Channel<M, PublishRequest<'a>, DEPTH>;

pub type PublishRequestReceiver<'c, 'a, M, const DEPTH: usize> =
    Receiver<'c, M, PublishRequest<'a>, DEPTH>;

/// A cloneable handle for queueing publishes without access to the client.
pub struct PublisherHandle<'c, 'a, M: RawMutex, const DEPTH: usize> {
    tx: Sender<'c, M, PublishRequest<'a>, DEPTH>,
}

impl<M: RawMutex, const DEPTH: usize> Clone for PublisherHandle<'_, '_, M, DEPTH> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: RawMutex, const DEPTH: usize> Copy for PublisherHandle<'_, '_, M, DEPTH> {}

impl<'c, 'a, M: RawMutex, const DEPTH: usize> PublisherHandle<'c, 'a, M, DEPTH> {
    pub fn new(channel: &'c PublishRequestChannel<'a, M, DEPTH>) -> Self {
        Self {
            tx: channel.sender(),
        }
    }

    /// Queues a publish, waiting while the channel is full.
    pub async fn publish(&self, topic: &'a str, payload: &'a [u8], qos: QoS, retain: bool) {
        let req = PublishRequest {
            topic,
            payload,
            qos,
            retain,
        };
        self.tx.send(req).await;
    }

    /// Queues a publish without waiting.
    ///
    /// Returns `false` if the channel is full.
    pub fn try_publish(&self, topic: &'a str, payload: &'a [u8], qos: QoS, retain: bool) -> bool {
        let req = PublishRequest {
            topic,
            payload,
            qos,
            retain,
        };
        self.tx.try_send(req).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use super::*;

    #[test]
    fn try_publish_reports_a_full_channel() {
        let channel: PublishRequestChannel<'static, NoopRawMutex, 2> = Channel::new();
        let handle = PublisherHandle::new(&channel);
        let copy = handle;

        assert!(handle.try_publish("a", b"1", QoS::AtMostOnce, false));
        assert!(copy.try_publish("b", b"2", QoS::AtLeastOnce, true));
        assert!(!handle.try_publish("c", b"3", QoS::AtMostOnce, false));

        let receiver: PublishRequestReceiver<'_, 'static, NoopRawMutex, 2> = channel.receiver();
        let first = receiver.try_receive().unwrap();
        assert_eq!((first.topic, first.payload), ("a", &b"1"[..]));
        let second = receiver.try_receive().unwrap();
        assert_eq!((second.qos, second.retain), (QoS::AtLeastOnce, true));
    }
}
