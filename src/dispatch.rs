//! Event dispatch.
//!
//! Application code receives events through the [`MqttHandler`] trait. Every
//! callback gets an [`Outbox`] to react with: it can publish, subscribe or
//! disconnect, but only queues the packets. Nothing is written to the socket
//! until the callback has returned and the engine flushes on its next step.
//!
//! Incoming messages are routed to the callbacks registered for matching
//! filters with [`crate::MqttClient::message_callback_add`]; messages that
//! match none of them go to [`MqttHandler::on_message`].

use heapless::{String, Vec};

use crate::error::{ArgumentError, ConnectReasonCode, DisconnectReason, MqttError, PacketResult};
use crate::packet::{Publish, QoS, SubAck};
use crate::topic::{self, MAX_TOPIC_LEN};

/// Maximum number of per-filter message callbacks.
pub const MAX_ROUTES: usize = 8;

/// Enqueue-only access to the connection from inside a callback.
///
/// The operations validate their arguments and register message state
/// exactly like the corresponding [`crate::MqttClient`] methods.
pub trait Outbox {
    /// Queues a PUBLISH and returns its message id.
    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> PacketResult<u16>;

    /// Queues a SUBSCRIBE for all `filters` and returns its message id.
    fn subscribe(&mut self, filters: &[(&str, QoS)]) -> PacketResult<u16>;

    /// Queues an UNSUBSCRIBE for all `filters` and returns its message id.
    fn unsubscribe(&mut self, filters: &[&str]) -> PacketResult<u16>;

    /// Queues a DISCONNECT.
    fn disconnect(&mut self) -> PacketResult<()>;
}

/// Receives the client's events.
///
/// All methods default to doing nothing, so implementors only override the
/// events they care about.
///
/// # Example
///
/// ```ignore
/// struct Lamp {
///     on: bool,
/// }
///
/// impl MqttHandler for Lamp {
///     fn on_connect(&mut self, out: &mut dyn Outbox, _session_present: bool, code: ConnectReasonCode) {
///         if code == ConnectReasonCode::Success {
///             let _ = out.subscribe(&[("lamp/set", QoS::AtLeastOnce)]);
///         }
///     }
///
///     fn on_message(&mut self, out: &mut dyn Outbox, msg: &Publish<'_>) {
///         self.on = msg.payload == b"ON";
///         let _ = out.publish("lamp/state", msg.payload, QoS::AtMostOnce, true);
///     }
/// }
/// ```
pub trait MqttHandler {
    /// A CONNACK arrived. Called for refusals too.
    fn on_connect(&mut self, _out: &mut dyn Outbox, _session_present: bool, _code: ConnectReasonCode) {}

    /// A message arrived that no per-filter callback matched.
    fn on_message(&mut self, _out: &mut dyn Outbox, _msg: &Publish<'_>) {}

    /// An outgoing message completed: written (QoS 0), PUBACK (QoS 1) or
    /// PUBCOMP (QoS 2).
    fn on_publish(&mut self, _out: &mut dyn Outbox, _mid: u16) {}

    fn on_subscribe(&mut self, _out: &mut dyn Outbox, _ack: &SubAck) {}

    fn on_unsubscribe(&mut self, _out: &mut dyn Outbox, _mid: u16) {}

    /// The connection is gone. `reason.is_clean()` tells a requested
    /// disconnect apart from a lost connection.
    fn on_disconnect(&mut self, _reason: DisconnectReason) {}
}

/// A handler that ignores every event.
pub struct NoopHandler;

impl MqttHandler for NoopHandler {}

impl<M: MqttHandler + ?Sized> MqttHandler for &mut M {
    fn on_connect(&mut self, out: &mut dyn Outbox, session_present: bool, code: ConnectReasonCode) {
        (**self).on_connect(out, session_present, code)
    }

    fn on_message(&mut self, out: &mut dyn Outbox, msg: &Publish<'_>) {
        (**self).on_message(out, msg)
    }

    fn on_publish(&mut self, out: &mut dyn Outbox, mid: u16) {
        (**self).on_publish(out, mid)
    }

    fn on_subscribe(&mut self, out: &mut dyn Outbox, ack: &SubAck) {
        (**self).on_subscribe(out, ack)
    }

    fn on_unsubscribe(&mut self, out: &mut dyn Outbox, mid: u16) {
        (**self).on_unsubscribe(out, mid)
    }

    fn on_disconnect(&mut self, reason: DisconnectReason) {
        (**self).on_disconnect(reason)
    }
}

/// Callback for messages matching a registered filter.
pub type MessageCallback<H> = fn(&mut H, &mut dyn Outbox, &Publish<'_>);

/// The handler plus the per-filter message routes.
pub struct Dispatcher<H> {
    handler: H,
    routes: Vec<(String<MAX_TOPIC_LEN>, MessageCallback<H>), MAX_ROUTES>,
}

impl<H: MqttHandler> Dispatcher<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            routes: Vec::new(),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Registers `callback` for `filter`, replacing a previous callback for
    /// the same filter.
    pub fn add_route(&mut self, filter: &str, callback: MessageCallback<H>) -> PacketResult<()> {
        topic::validate_filter(filter)?;
        if let Some(route) = self.routes.iter_mut().find(|(f, _)| f.as_str() == filter) {
            route.1 = callback;
            return Ok(());
        }
        let filter = String::try_from(filter).map_err(|_| ArgumentError::InvalidTopic)?;
        self.routes
            .push((filter, callback))
            .map_err(|_| MqttError::QueueFull)
    }

    /// Returns `false` if no callback was registered for `filter`.
    pub fn remove_route(&mut self, filter: &str) -> bool {
        match self.routes.iter().position(|(f, _)| f.as_str() == filter) {
            Some(index) => {
                self.routes.remove(index);
                true
            }
            None => false,
        }
    }

    /// Delivers an incoming message to every matching route, or to the
    /// handler if none matches.
    pub fn dispatch_message(&mut self, out: &mut dyn Outbox, msg: &Publish<'_>) {
        let mut matched = false;
        for (filter, callback) in self.routes.iter() {
            if topic::matches(filter, msg.topic) {
                matched = true;
                callback(&mut self.handler, out, msg);
            }
        }
        if !matched {
            self.handler.on_message(out, msg);
        }
    }

    pub fn on_connect(&mut self, out: &mut dyn Outbox, session_present: bool, code: ConnectReasonCode) {
        self.handler.on_connect(out, session_present, code);
    }

    pub fn on_publish(&mut self, out: &mut dyn Outbox, mid: u16) {
        self.handler.on_publish(out, mid);
    }

    pub fn on_subscribe(&mut self, out: &mut dyn Outbox, ack: &SubAck) {
        self.handler.on_subscribe(out, ack);
    }

    pub fn on_unsubscribe(&mut self, out: &mut dyn Outbox, mid: u16) {
        self.handler.on_unsubscribe(out, mid);
    }

    pub fn on_disconnect(&mut self, reason: DisconnectReason) {
        self.handler.on_disconnect(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        temperature: usize,
        any_sensor: usize,
        fallback: usize,
    }

    impl MqttHandler for Recorder {
        fn on_message(&mut self, _out: &mut dyn Outbox, _msg: &Publish<'_>) {
            self.fallback += 1;
        }
    }

    struct NullOutbox;

    impl Outbox for NullOutbox {
        fn publish(&mut self, _: &str, _: &[u8], _: QoS, _: bool) -> PacketResult<u16> {
            Ok(1)
        }
        fn subscribe(&mut self, _: &[(&str, QoS)]) -> PacketResult<u16> {
            Ok(1)
        }
        fn unsubscribe(&mut self, _: &[&str]) -> PacketResult<u16> {
            Ok(1)
        }
        fn disconnect(&mut self) -> PacketResult<()> {
            Ok(())
        }
    }

    fn publish(topic: &str) -> Publish<'_> {
        Publish {
            topic,
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            payload: b"21.5",
            packet_id: None,
        }
    }

    fn on_temperature(h: &mut Recorder, _: &mut dyn Outbox, _: &Publish<'_>) {
        h.temperature += 1;
    }

    fn on_any_sensor(h: &mut Recorder, _: &mut dyn Outbox, _: &Publish<'_>) {
        h.any_sensor += 1;
    }

    #[test]
    fn routes_all_matching_filters_before_falling_back() {
        let mut dispatcher = Dispatcher::new(Recorder::default());
        dispatcher.add_route("home/+/temperature", on_temperature).unwrap();
        dispatcher.add_route("home/#", on_any_sensor).unwrap();

        dispatcher.dispatch_message(&mut NullOutbox, &publish("home/kitchen/temperature"));
        dispatcher.dispatch_message(&mut NullOutbox, &publish("home/kitchen/humidity"));
        dispatcher.dispatch_message(&mut NullOutbox, &publish("garden/soil"));

        let h = dispatcher.handler();
        assert_eq!((h.temperature, h.any_sensor, h.fallback), (1, 2, 1));
    }

    #[test]
    fn adding_same_filter_replaces_and_remove_restores_fallback() {
        let mut dispatcher = Dispatcher::new(Recorder::default());
        dispatcher.add_route("home/#", on_temperature).unwrap();
        dispatcher.add_route("home/#", on_any_sensor).unwrap();
        dispatcher.dispatch_message(&mut NullOutbox, &publish("home/a"));
        assert_eq!(dispatcher.handler().temperature, 0);
        assert_eq!(dispatcher.handler().any_sensor, 1);

        assert!(dispatcher.remove_route("home/#"));
        assert!(!dispatcher.remove_route("home/#"));
        dispatcher.dispatch_message(&mut NullOutbox, &publish("home/a"));
        assert_eq!(dispatcher.handler().fallback, 1);
    }

    #[test]
    fn invalid_filters_are_rejected() {
        let mut dispatcher = Dispatcher::new(Recorder::default());
        assert_eq!(
            dispatcher.add_route("home/#/x", on_temperature),
            Err(MqttError::Argument(ArgumentError::InvalidTopic))
        );
    }
}
