//! # MQTT Client
//!
//! [`MqttClient`] is the facade over the engine. It never blocks: the host
//! calls [`MqttClient::on_readable`], [`MqttClient::on_writable`] and
//! [`MqttClient::on_tick`] (or just [`MqttClient::poll`]) when its reactor
//! reports the socket ready or a timer fires.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Receiver;
use embassy_time::Duration;

use crate::clock::Clock;
use crate::dispatch::{Dispatcher, MessageCallback, MqttHandler, Outbox};
use crate::error::{ArgumentError, DisconnectReason, MqttError};
use crate::keepalive::KeepaliveAction;
use crate::message::{MessageState, TrackedMessage};
use crate::packet::{MqttVersion, QoS, Will};
use crate::publisher::PublishRequest;
use crate::session::{disconnect_reason, Connection, ConnectionState};
use crate::topic;
use crate::transport::MqttTransport;

/// Client id sent when none is configured.
pub const DEFAULT_CLIENT_ID: &str = "nbmqtt";

/// Configuration options for the MQTT client.
#[derive(Debug, Clone)]
pub struct MqttOptions<'a> {
    client_id: &'a str,
    clean_session: bool,
    username: Option<&'a str>,
    password: Option<&'a [u8]>,
    will: Option<Will<'a>>,
    protocol: MqttVersion,
    max_inflight: usize,
    message_retry: Duration,
}

impl<'a> MqttOptions<'a> {
    /// Creates options with a clean session, MQTT 3.1.1, 20 messages in
    /// flight and a 20 second retry interval.
    ///
    /// An empty `client_id` selects [`DEFAULT_CLIENT_ID`].
    pub fn new(client_id: &'a str) -> Self {
        Self {
            client_id,
            clean_session: true,
            username: None,
            password: None,
            will: None,
            protocol: MqttVersion::V311,
            max_inflight: 20,
            message_retry: Duration::from_secs(20),
        }
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    /// A password is only sent together with a username.
    pub fn with_credentials(mut self, username: &'a str, password: Option<&'a [u8]>) -> Self {
        self.username = Some(username);
        self.password = password;
        self
    }

    pub fn with_will(mut self, will: Will<'a>) -> Self {
        self.will = Some(will);
        self
    }

    pub fn with_protocol(mut self, protocol: MqttVersion) -> Self {
        self.protocol = protocol;
        self
    }

    /// `0` removes the limit; the message store capacity still applies.
    pub fn with_max_inflight(mut self, max_inflight: usize) -> Self {
        self.max_inflight = max_inflight;
        self
    }

    pub fn with_message_retry(mut self, retry: Duration) -> Self {
        self.message_retry = retry;
        self
    }

    pub fn client_id(&self) -> &'a str {
        if self.client_id.is_empty() {
            DEFAULT_CLIENT_ID
        } else {
            self.client_id
        }
    }

    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    pub fn username(&self) -> Option<&'a str> {
        self.username
    }

    pub fn password(&self) -> Option<&'a [u8]> {
        self.password
    }

    pub fn will(&self) -> Option<Will<'a>> {
        self.will
    }

    pub fn protocol(&self) -> MqttVersion {
        self.protocol
    }

    pub fn max_inflight(&self) -> usize {
        self.max_inflight
    }

    pub fn message_retry(&self) -> Duration {
        self.message_retry
    }

    /// Checks the combination of options.
    pub fn validate(&self) -> Result<(), ArgumentError> {
        if self.client_id.is_empty() && !self.clean_session {
            return Err(ArgumentError::InvalidClientId);
        }
        if let Some(will) = &self.will {
            topic::validate_publish_topic(will.topic)?;
        }
        Ok(())
    }
}

/// A non-blocking MQTT v3.1/v3.1.1 client.
///
/// # Type Parameters
///
/// - `T`: the transport.
/// - `H`: the event handler.
/// - `C`: the clock driving keepalive and retries.
/// - `MAX_MESSAGES`: capacity of the outbound frame queue and of each
///   tracked-message store (outgoing and incoming).
/// - `BUF_SIZE`: largest frame, in bytes, that can be sent or received.
pub struct MqttClient<'a, T, H, C, const MAX_MESSAGES: usize, const BUF_SIZE: usize>
where
    T: MqttTransport,
    H: MqttHandler,
    C: Clock,
{
    conn: Connection<'a, T, C, MAX_MESSAGES, BUF_SIZE>,
    dispatcher: Dispatcher<H>,
}

impl<'a, T, H, C, const MAX_MESSAGES: usize, const BUF_SIZE: usize>
    MqttClient<'a, T, H, C, MAX_MESSAGES, BUF_SIZE>
where
    T: MqttTransport,
    H: MqttHandler,
    C: Clock,
{
    /// Creates a new client. No I/O happens until [`MqttClient::connect`].
    pub fn new(
        transport: T,
        handler: H,
        clock: C,
        options: MqttOptions<'a>,
    ) -> Result<Self, ArgumentError> {
        options.validate()?;
        Ok(Self {
            conn: Connection::new(transport, clock, options),
            dispatcher: Dispatcher::new(handler),
        })
    }

    /// Connects to `host:port` and sends CONNECT.
    ///
    /// Success means the CONNECT is on its way; the result arrives through
    /// [`MqttHandler::on_connect`].
    pub fn connect(
        &mut self,
        host: &'a str,
        port: u16,
        keepalive: Duration,
    ) -> Result<(), MqttError<T::Error>> {
        self.connect_async(host, port, keepalive)?;
        self.reconnect()
    }

    /// Records the broker address; the socket is opened by
    /// [`MqttClient::reconnect`].
    pub fn connect_async(
        &mut self,
        host: &'a str,
        port: u16,
        keepalive: Duration,
    ) -> Result<(), MqttError<T::Error>> {
        self.conn.connect_async(host, port, keepalive)?;
        Ok(())
    }

    /// Opens a fresh socket to the recorded broker and resumes the session.
    pub fn reconnect(&mut self) -> Result<(), MqttError<T::Error>> {
        self.conn.reconnect()?;
        self.flush()
    }

    /// Closes the socket and forgets every tracked message and queued frame.
    pub fn reset(&mut self) {
        self.conn.reset();
    }

    /// Publishes a message and returns its message id.
    ///
    /// QoS>0 messages are kept until acknowledged, even without a
    /// connection; they go out once a session is established.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<u16, MqttError<T::Error>> {
        let mid = self
            .conn
            .publish(topic, payload, qos, retain)
            .map_err(MqttError::cast_transport_error)?;
        self.flush()?;
        Ok(mid)
    }

    /// Subscribes to one filter.
    pub fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<u16, MqttError<T::Error>> {
        self.subscribe_many(&[(filter, qos)])
    }

    /// Subscribes to several filters with one SUBSCRIBE.
    pub fn subscribe_many(&mut self, filters: &[(&str, QoS)]) -> Result<u16, MqttError<T::Error>> {
        let mid = self
            .conn
            .subscribe(filters)
            .map_err(MqttError::cast_transport_error)?;
        self.flush()?;
        Ok(mid)
    }

    pub fn unsubscribe(&mut self, filter: &str) -> Result<u16, MqttError<T::Error>> {
        self.unsubscribe_many(&[filter])
    }

    pub fn unsubscribe_many(&mut self, filters: &[&str]) -> Result<u16, MqttError<T::Error>> {
        let mid = self
            .conn
            .unsubscribe(filters)
            .map_err(MqttError::cast_transport_error)?;
        self.flush()?;
        Ok(mid)
    }

    /// Sends DISCONNECT. The socket is closed and
    /// [`MqttHandler::on_disconnect`] fires once it is written.
    pub fn disconnect(&mut self) -> Result<(), MqttError<T::Error>> {
        self.conn
            .disconnect()
            .map_err(MqttError::cast_transport_error)?;
        self.flush()
    }

    /// Routes messages matching `filter` to `callback` instead of
    /// [`MqttHandler::on_message`].
    pub fn message_callback_add(
        &mut self,
        filter: &str,
        callback: MessageCallback<H>,
    ) -> Result<(), MqttError<T::Error>> {
        self.dispatcher
            .add_route(filter, callback)
            .map_err(MqttError::cast_transport_error)
    }

    /// Returns `false` if no callback was registered for `filter`.
    pub fn message_callback_remove(&mut self, filter: &str) -> bool {
        self.dispatcher.remove_route(filter)
    }

    /// Publishes every request waiting in a publisher channel.
    ///
    /// Stops at the first request that fails and returns its error. That
    /// request has already left the channel and is dropped; the ones behind
    /// it stay queued for the next call.
    pub fn publish_requests<M: RawMutex, const DEPTH: usize>(
        &mut self,
        requests: &Receiver<'_, M, PublishRequest<'_>, DEPTH>,
    ) -> Result<usize, MqttError<T::Error>> {
        let mut published = 0;
        while let Ok(request) = requests.try_receive() {
            self.conn
                .publish(request.topic, request.payload, request.qos, request.retain)
                .map_err(MqttError::cast_transport_error)?;
            published += 1;
        }
        if published > 0 {
            self.flush()?;
        }
        Ok(published)
    }

    // --- Step functions ---

    /// Reads and handles every frame the transport has available.
    pub fn on_readable(&mut self) -> Result<(), MqttError<T::Error>> {
        if !self.conn.has_socket() {
            return Err(MqttError::NotConnected);
        }
        while self.conn.has_socket() {
            // Every frame may need an acknowledgement.
            if !self.conn.writer_has_room() {
                self.flush()?;
                if !self.conn.writer_has_room() {
                    break;
                }
            }
            match self.conn.read_frame() {
                Ok(frame) => {
                    if let Err(e) = self.conn.handle_frame(frame, &mut self.dispatcher) {
                        return Err(self.fail(e));
                    }
                }
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(self.fail(e)),
            }
        }
        self.flush()
    }

    /// Writes queued frames.
    pub fn on_writable(&mut self) -> Result<(), MqttError<T::Error>> {
        if !self.conn.has_socket() {
            return Err(MqttError::NotConnected);
        }
        self.flush()
    }

    /// Keepalive, then retries (at most once per second), then flush.
    pub fn on_tick(&mut self) -> Result<(), MqttError<T::Error>> {
        if !self.conn.has_socket() {
            return Err(MqttError::NotConnected);
        }
        let now = self.conn.now();
        if self.conn.check_keepalive(now) == KeepaliveAction::TimedOut {
            self.conn
                .connection_lost(&mut self.dispatcher, DisconnectReason::KeepaliveTimeout);
            return Err(MqttError::ConnectionLost);
        }
        if self.conn.retry_due(now) {
            self.conn.retry(now);
        }
        self.flush()
    }

    /// One round of `on_readable`, `on_writable` (when needed) and `on_tick`.
    pub fn poll(&mut self) -> Result<(), MqttError<T::Error>> {
        self.on_readable()?;
        if self.want_write() {
            self.on_writable()?;
        }
        self.on_tick()
    }

    fn flush(&mut self) -> Result<(), MqttError<T::Error>> {
        if !self.conn.has_socket() {
            return Ok(());
        }
        match self.conn.flush(&mut self.dispatcher) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, err: MqttError<T::Error>) -> MqttError<T::Error> {
        self.conn
            .connection_lost(&mut self.dispatcher, disconnect_reason(&err));
        err
    }

    // --- Inspection ---

    /// `true` while frames are waiting to be written.
    pub fn want_write(&self) -> bool {
        self.conn.want_write()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.has_socket() && self.conn.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// The protocol in use; may have been downgraded to 3.1 by the broker.
    pub fn protocol(&self) -> MqttVersion {
        self.conn.protocol()
    }

    /// Outgoing messages not yet completed, in publish order.
    pub fn pending_messages(&self) -> &[TrackedMessage<BUF_SIZE>] {
        self.conn.messages().outgoing()
    }

    /// Incoming QoS 2 messages acknowledged with PUBREC, waiting for PUBREL.
    pub fn pending_incoming(&self) -> &[TrackedMessage<BUF_SIZE>] {
        self.conn.messages().incoming()
    }

    pub fn message_state(&self, mid: u16) -> Option<MessageState> {
        self.conn.message_state(mid)
    }

    /// Number of outgoing messages holding an inflight slot.
    pub fn inflight(&self) -> usize {
        self.conn.messages().inflight()
    }

    pub fn handler(&self) -> &H {
        self.dispatcher.handler()
    }

    pub fn handler_mut(&mut self) -> &mut H {
        self.dispatcher.handler_mut()
    }

    pub fn transport(&self) -> &T {
        self.conn.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.conn.transport_mut()
    }
}
