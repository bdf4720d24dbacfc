//! # Connection and Session State Machine
//!
//! [`Connection`] owns everything with a lifetime longer than one socket: the
//! options, the tracked messages and the keepalive scheduler. The socket and
//! the partial read and write state are rebuilt on every `reconnect`.
//!
//! Handlers get the connection as a `&mut dyn Outbox`. Its methods only
//! queue frames, so a callback can never start a write while the engine is in
//! the middle of handling a frame.

use embassy_time::{Duration, Instant};

use crate::client::MqttOptions;
use crate::clock::Clock;
use crate::dispatch::{Dispatcher, MqttHandler, Outbox};
use crate::error::{
    ArgumentError, ConnectReasonCode, DisconnectReason, MqttError, PacketResult, ProtocolError,
};
use crate::keepalive::{Keepalive, KeepaliveAction};
use crate::message::{MessageState, MessageStore, TrackedMessage};
use crate::packet::{
    self, command_name, Ack, ConnAck, Connect, MqttPacket, MqttVersion, Publish,
    QoS, Simple, Subscribe, Unsubscribe, DISCONNECT, MAX_FILTERS, PUBLISH,
};
use crate::reader::{InboundFrame, PacketReader};
use crate::topic;
use crate::transport::MqttTransport;
use crate::util::variable_byte_integer_len;
use crate::writer::{Flushed, PacketWriter};

/// Top-level client state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionState {
    /// Socket opened (or about to be) and CONNECT sent, waiting for CONNACK.
    New,
    /// Broker address recorded, no socket yet.
    ConnectAsync,
    /// CONNACK accepted.
    Connected,
    /// DISCONNECT queued.
    Disconnecting,
}

pub struct Connection<'a, T, C, const N: usize, const B: usize>
where
    T: MqttTransport,
    C: Clock,
{
    transport: T,
    clock: C,
    options: MqttOptions<'a>,
    host: &'a str,
    port: u16,
    state: ConnectionState,
    has_socket: bool,
    protocol: MqttVersion,
    reader: PacketReader<B>,
    writer: PacketWriter<N, B>,
    messages: MessageStore<N, B>,
    keepalive: Keepalive,
}

impl<'a, T, C, const N: usize, const B: usize> Connection<'a, T, C, N, B>
where
    T: MqttTransport,
    C: Clock,
{
    pub fn new(transport: T, clock: C, options: MqttOptions<'a>) -> Self {
        let now = clock.now();
        Self {
            transport,
            protocol: options.protocol(),
            messages: MessageStore::new(options.max_inflight()),
            keepalive: Keepalive::new(Duration::from_secs(60), now),
            clock,
            options,
            host: "",
            port: 0,
            state: ConnectionState::New,
            has_socket: false,
            reader: PacketReader::new(),
            writer: PacketWriter::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn has_socket(&self) -> bool {
        self.has_socket
    }

    pub fn protocol(&self) -> MqttVersion {
        self.protocol
    }

    pub fn messages(&self) -> &MessageStore<N, B> {
        &self.messages
    }

    pub fn message_state(&self, mid: u16) -> Option<MessageState> {
        self.messages.state_of(mid)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn want_write(&self) -> bool {
        self.has_socket && self.writer.is_pending()
    }

    pub fn writer_has_room(&self) -> bool {
        self.writer.has_room()
    }

    /// Records the broker address without touching the network.
    pub fn connect_async(
        &mut self,
        host: &'a str,
        port: u16,
        keepalive: Duration,
    ) -> Result<(), ArgumentError> {
        if host.is_empty() {
            return Err(ArgumentError::InvalidHost);
        }
        if port == 0 {
            return Err(ArgumentError::InvalidPort);
        }
        if keepalive.as_secs() > u16::MAX as u64 {
            return Err(ArgumentError::InvalidKeepalive);
        }
        self.host = host;
        self.port = port;
        self.keepalive.set_interval(Duration::from_secs(keepalive.as_secs()));
        self.state = ConnectionState::ConnectAsync;
        Ok(())
    }

    /// Tears the socket down, rewinds the message handshakes and queues a
    /// fresh CONNECT on a new socket.
    pub fn reconnect(&mut self) -> Result<(), MqttError<T::Error>> {
        if self.host.is_empty() {
            return Err(ArgumentError::InvalidHost.into());
        }
        if self.port == 0 {
            return Err(ArgumentError::InvalidPort.into());
        }

        self.reader.reset();
        self.writer.reset();
        self.keepalive.reset(self.clock.now());
        self.state = ConnectionState::New;
        self.close_socket();
        self.messages.reconnect_reset();

        info!("Connecting to {}:{}", self.host, self.port);
        self.transport
            .open(self.host, self.port)
            .map_err(MqttError::Transport)?;
        self.has_socket = true;
        self.send_connect().map_err(MqttError::cast_transport_error)
    }

    /// Closes the socket and drops all tracked messages.
    pub fn reset(&mut self) {
        self.close_socket();
        self.reader.reset();
        self.writer.reset();
        self.messages.clear();
        self.keepalive.reset(self.clock.now());
        self.protocol = self.options.protocol();
        self.state = ConnectionState::New;
    }

    fn close_socket(&mut self) {
        if self.has_socket {
            self.transport.close();
            self.has_socket = false;
        }
    }

    /// Closes the socket after a failure and reports it to the handler.
    ///
    /// A failure while disconnecting is reported as a requested disconnect.
    pub fn connection_lost<H: MqttHandler>(
        &mut self,
        dispatcher: &mut Dispatcher<H>,
        reason: DisconnectReason,
    ) {
        self.close_socket();
        self.reader.reset();
        self.writer.reset();
        let reason = if self.state == ConnectionState::Disconnecting {
            DisconnectReason::Requested
        } else {
            warn!("Connection lost: {:?}", reason);
            reason
        };
        dispatcher.on_disconnect(reason);
    }

    fn send_connect(&mut self) -> PacketResult<()> {
        let mut connect = Connect::new(
            self.options.client_id(),
            self.keepalive.interval().as_secs() as u16,
            self.options.clean_session(),
        );
        connect.will = self.options.will();
        connect.username = self.options.username();
        connect.password = self.options.password();
        debug!(
            "Sending CONNECT (u{}, p{}, wr{}, wq{}, wf{}, c{}, k{}) client_id={}",
            connect.username.is_some(),
            connect.password.is_some(),
            connect.will.is_some_and(|w| w.retain),
            connect.will.map_or(0, |w| w.qos as u8),
            connect.will.is_some(),
            connect.clean_session,
            connect.keep_alive,
            connect.client_id
        );
        self.writer
            .enqueue(&connect, 0, QoS::AtMostOnce, self.protocol)
    }

    // --- Outbound ---

    /// Writes queued frames until the transport would block or the queue is
    /// empty, firing the completion effects of each flushed frame.
    pub fn flush<H: MqttHandler>(
        &mut self,
        dispatcher: &mut Dispatcher<H>,
    ) -> Result<(), MqttError<T::Error>> {
        while self.has_socket {
            self.pump();
            match self.writer.write(&mut self.transport) {
                Ok(Some(flushed)) => {
                    self.keepalive.record_outbound(self.clock.now());
                    self.on_flushed(flushed, dispatcher);
                }
                Ok(None) | Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(e),
            }
        }
        Ok(())
    }

    fn on_flushed<H: MqttHandler>(&mut self, flushed: Flushed, dispatcher: &mut Dispatcher<H>) {
        match flushed.command {
            PUBLISH if flushed.qos == QoS::AtMostOnce => dispatcher.on_publish(self, flushed.mid),
            DISCONNECT => {
                debug!("DISCONNECT flushed, closing socket");
                self.close_socket();
                self.writer.reset();
                dispatcher.on_disconnect(DisconnectReason::Requested);
            }
            _ => {}
        }
    }

    /// Moves tracked messages onto the wire while the writer has room.
    ///
    /// Messages go out in publish order, so retransmissions after a
    /// reconnect precede anything published later.
    fn pump(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        self.messages.promote_queued();

        let now = self.clock.now();
        let version = self.protocol;
        let outgoing = self.messages.outgoing_mut();
        let mut index = 0;
        while index < outgoing.len() && self.writer.has_room() {
            let message = &mut outgoing[index];
            match message.state {
                MessageState::Publish => {
                    let publish = message.as_publish();
                    log_publish("Sending", &publish);
                    let queued = self.writer.enqueue(&publish, message.mid, message.qos, version);
                    if let Err(e) = queued {
                        warn!("Dropping message {}: {:?}", message.mid, e);
                        outgoing.remove(index);
                        continue;
                    }
                    let qos = message.qos;
                    match qos {
                        QoS::AtMostOnce => {
                            outgoing.remove(index);
                            continue;
                        }
                        QoS::AtLeastOnce => message.state = MessageState::WaitPuback,
                        QoS::ExactlyOnce => message.state = MessageState::WaitPubrec,
                    }
                    message.timestamp = Some(now);
                }
                MessageState::ResendPubrel => {
                    debug!("Sending PUBREL (Mid: {})", message.mid);
                    let pubrel = Ack::pubrel(message.mid, pubrel_dup(message.dup, version));
                    if self
                        .writer
                        .enqueue(&pubrel, message.mid, message.qos, version)
                        .is_ok()
                    {
                        message.timestamp = Some(now);
                        message.state = MessageState::WaitPubcomp;
                    }
                }
                _ => {}
            }
            index += 1;
        }
    }

    /// Resends every handshake step older than the retry interval.
    pub fn retry(&mut self, now: Instant) {
        let retry = self.options.message_retry();
        let version = self.protocol;

        for message in self.messages.outgoing_mut().iter_mut() {
            if !message.is_stale(now, retry) {
                continue;
            }
            if !self.writer.has_room() {
                return;
            }
            let queued = match message.state {
                MessageState::WaitPuback | MessageState::WaitPubrec => {
                    message.dup = true;
                    log_publish("Resending", &message.as_publish());
                    self.writer
                        .enqueue(&message.as_publish(), message.mid, message.qos, version)
                }
                MessageState::WaitPubcomp => {
                    message.dup = true;
                    debug!("Resending PUBREL (Mid: {})", message.mid);
                    let pubrel = Ack::pubrel(message.mid, pubrel_dup(true, version));
                    self.writer.enqueue(&pubrel, message.mid, message.qos, version)
                }
                _ => continue,
            };
            match queued {
                Ok(()) => message.timestamp = Some(now),
                Err(e) => warn!("Retry of message {} failed: {:?}", message.mid, e),
            }
        }

        for message in self.messages.incoming_mut().iter_mut() {
            if message.state != MessageState::WaitPubrel || !message.is_stale(now, retry) {
                continue;
            }
            if !self.writer.has_room() {
                return;
            }
            message.dup = true;
            debug!("Resending PUBREC (Mid: {})", message.mid);
            if self
                .writer
                .enqueue(&Ack::pubrec(message.mid), message.mid, message.qos, version)
                .is_ok()
            {
                message.timestamp = Some(now);
            }
        }
    }

    /// Runs the keepalive check, queueing PINGREQ when due.
    pub fn check_keepalive(&mut self, now: Instant) -> KeepaliveAction {
        if !self.has_socket {
            return KeepaliveAction::Idle;
        }
        let connected = self.state == ConnectionState::Connected;
        let action = self.keepalive.check(now, connected);
        if action == KeepaliveAction::SendPing {
            debug!("Sending PINGREQ");
            match self
                .writer
                .enqueue(&Simple::PING_REQ, 0, QoS::AtMostOnce, self.protocol)
            {
                Ok(()) => self.keepalive.ping_sent(now),
                Err(e) => warn!("PINGREQ not queued: {:?}", e),
            }
        }
        action
    }

    pub fn retry_due(&mut self, now: Instant) -> bool {
        self.keepalive.retry_due(now)
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    // --- Inbound ---

    pub fn read_frame(&mut self) -> nb::Result<InboundFrame<B>, MqttError<T::Error>> {
        self.reader.read(&mut self.transport)
    }

    /// Applies one received frame to the session and reports it to the handler.
    pub fn handle_frame<H: MqttHandler>(
        &mut self,
        frame: InboundFrame<B>,
        dispatcher: &mut Dispatcher<H>,
    ) -> Result<(), MqttError<T::Error>> {
        let now = self.clock.now();
        self.keepalive.record_inbound(now);

        let decoded = packet::decode(frame.header, &frame.body).map_err(|e| {
            error!(
                "Invalid {} frame from broker: {:?}",
                command_name(frame.header),
                e
            );
            MqttError::cast_transport_error(e)
        })?;

        let handled = match decoded {
            MqttPacket::ConnAck(ack) => return self.handle_connack(ack, dispatcher),
            MqttPacket::Publish(publish) => self.handle_publish(&publish, now, dispatcher),
            MqttPacket::PubAck(mid) => {
                debug!("Received PUBACK (Mid: {})", mid);
                self.complete_outgoing(mid, QoS::AtLeastOnce, dispatcher);
                Ok(())
            }
            MqttPacket::PubRec(mid) => {
                debug!("Received PUBREC (Mid: {})", mid);
                self.handle_pubrec(mid, now)
            }
            MqttPacket::PubRel(mid) => {
                debug!("Received PUBREL (Mid: {})", mid);
                self.handle_pubrel(mid, dispatcher)
            }
            MqttPacket::PubComp(mid) => {
                debug!("Received PUBCOMP (Mid: {})", mid);
                self.complete_outgoing(mid, QoS::ExactlyOnce, dispatcher);
                Ok(())
            }
            MqttPacket::SubAck(ack) => {
                debug!("Received SUBACK (Mid: {})", ack.packet_id);
                dispatcher.on_subscribe(self, &ack);
                Ok(())
            }
            MqttPacket::UnsubAck(mid) => {
                debug!("Received UNSUBACK (Mid: {})", mid);
                dispatcher.on_unsubscribe(self, mid);
                Ok(())
            }
            MqttPacket::PingReq => {
                debug!("Received PINGREQ");
                self.writer
                    .enqueue(&Simple::PING_RESP, 0, QoS::AtMostOnce, self.protocol)
            }
            MqttPacket::PingResp => {
                debug!("Received PINGRESP");
                self.keepalive.pong_received();
                Ok(())
            }
        };
        handled.map_err(MqttError::cast_transport_error)
    }

    fn handle_connack<H: MqttHandler>(
        &mut self,
        ack: ConnAck,
        dispatcher: &mut Dispatcher<H>,
    ) -> Result<(), MqttError<T::Error>> {
        if ack.return_code == 1 && self.protocol == MqttVersion::V311 {
            info!(
                "Received CONNACK ({}, {}), attempting downgrade to MQTT v3.1",
                ack.session_present as u8,
                ack.return_code
            );
            self.protocol = MqttVersion::V31;
            return self.reconnect();
        }

        debug!(
            "Received CONNACK ({}, {})",
            ack.session_present as u8,
            ack.return_code
        );
        let code = ConnectReasonCode::from(ack.return_code);
        if code == ConnectReasonCode::Success {
            self.state = ConnectionState::Connected;
        }
        dispatcher.on_connect(self, ack.session_present, code);

        match code {
            ConnectReasonCode::Success => {
                let now = self.clock.now();
                for message in self.messages.outgoing_mut().iter_mut() {
                    message.timestamp = Some(now);
                }
                Ok(())
            }
            ConnectReasonCode::Other(raw) => {
                Err(MqttError::Protocol(ProtocolError::InvalidConnAckCode(raw)))
            }
            refused => Err(MqttError::ConnectionRefused(refused)),
        }
    }

    fn handle_publish<H: MqttHandler>(
        &mut self,
        publish: &Publish<'_>,
        now: Instant,
        dispatcher: &mut Dispatcher<H>,
    ) -> PacketResult<()> {
        log_publish("Received", publish);
        let mid = publish.mid();
        match publish.qos {
            QoS::AtMostOnce => dispatcher.dispatch_message(self, publish),
            QoS::AtLeastOnce => {
                debug!("Sending PUBACK (Mid: {})", mid);
                self.writer
                    .enqueue(&Ack::puback(mid), mid, QoS::AtLeastOnce, self.protocol)?;
                dispatcher.dispatch_message(self, publish);
            }
            QoS::ExactlyOnce => {
                // Without PUBREC the broker retransmits the message later.
                let stored = TrackedMessage::new(
                    mid,
                    publish.topic,
                    publish.payload,
                    publish.qos,
                    publish.retain,
                    MessageState::WaitPubrel,
                )
                .and_then(|mut message| {
                    message.timestamp = Some(now);
                    self.messages.push_incoming(message)
                });
                if let Err(e) = stored {
                    warn!("Cannot store incoming message {}, not acknowledged: {:?}", mid, e);
                    return Ok(());
                }
                debug!("Sending PUBREC (Mid: {})", mid);
                self.writer
                    .enqueue(&Ack::pubrec(mid), mid, QoS::ExactlyOnce, self.protocol)?;
            }
        }
        Ok(())
    }

    fn handle_pubrec(&mut self, mid: u16, now: Instant) -> PacketResult<()> {
        let version = self.protocol;
        let Some(message) = self
            .messages
            .find_outgoing_mut(mid)
            .filter(|m| m.qos == QoS::ExactlyOnce)
        else {
            debug!("PUBREC for unknown message {}", mid);
            return Ok(());
        };
        message.timestamp = Some(now);
        if self.writer.has_room() {
            debug!("Sending PUBREL (Mid: {})", mid);
            self.writer
                .enqueue(&Ack::pubrel(mid, false), mid, QoS::ExactlyOnce, version)?;
            message.state = MessageState::WaitPubcomp;
        } else {
            message.state = MessageState::ResendPubrel;
        }
        Ok(())
    }

    fn handle_pubrel<H: MqttHandler>(
        &mut self,
        mid: u16,
        dispatcher: &mut Dispatcher<H>,
    ) -> PacketResult<()> {
        // PUBCOMP also answers a PUBREL the session no longer knows, so the
        // broker can finish its side of the handshake.
        debug!("Sending PUBCOMP (Mid: {})", mid);
        self.writer
            .enqueue(&Ack::pubcomp(mid), mid, QoS::ExactlyOnce, self.protocol)?;
        if let Some(message) = self.messages.remove_incoming(mid) {
            dispatcher.dispatch_message(self, &message.as_publish());
        }
        Ok(())
    }

    fn complete_outgoing<H: MqttHandler>(
        &mut self,
        mid: u16,
        qos: QoS,
        dispatcher: &mut Dispatcher<H>,
    ) {
        if self.messages.remove_outgoing(mid, qos).is_some() {
            dispatcher.on_publish(self, mid);
        } else {
            debug!("Acknowledgement for unknown message {}", mid);
        }
    }
}

impl<'a, T, C, const N: usize, const B: usize> Outbox for Connection<'a, T, C, N, B>
where
    T: MqttTransport,
    C: Clock,
{
    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> PacketResult<u16> {
        topic::validate_publish_topic(topic)?;
        let id_len = if qos == QoS::AtMostOnce { 0 } else { 2 };
        let remaining_len = 2 + topic.len() + id_len + payload.len();
        if 1 + variable_byte_integer_len(remaining_len) + remaining_len > B {
            return Err(MqttError::BufferTooSmall);
        }

        let mid = self.messages.next_mid();
        if qos == QoS::AtMostOnce {
            if self.state == ConnectionState::Connected && self.writer.has_room() {
                let publish = Publish {
                    topic,
                    qos,
                    retain,
                    dup: false,
                    payload,
                    packet_id: None,
                };
                log_publish("Sending", &publish);
                self.writer.enqueue(&publish, mid, qos, self.protocol)?;
                return Ok(mid);
            }
            if !self.has_socket {
                return Err(MqttError::NotConnected);
            }
        } else if self.messages.is_full() {
            return Err(MqttError::QueueFull);
        }

        let state = if qos == QoS::AtMostOnce || self.messages.has_free_slot() {
            MessageState::Publish
        } else {
            MessageState::Queued
        };
        let message = TrackedMessage::new(mid, topic, payload, qos, retain, state)?;
        self.messages.push_outgoing(message)?;
        self.pump();
        Ok(mid)
    }

    fn subscribe(&mut self, filters: &[(&str, QoS)]) -> PacketResult<u16> {
        if filters.is_empty() {
            return Err(ArgumentError::InvalidTopic.into());
        }
        if filters.len() > MAX_FILTERS {
            return Err(ArgumentError::TooManyFilters.into());
        }
        for (filter, _) in filters {
            topic::validate_filter(filter)?;
        }
        if !self.has_socket {
            return Err(MqttError::NotConnected);
        }
        let mid = self.messages.next_mid();
        debug!("Sending SUBSCRIBE (Mid: {}, {} filters)", mid, filters.len());
        self.writer
            .enqueue(&Subscribe::new(mid, filters), mid, QoS::AtLeastOnce, self.protocol)?;
        Ok(mid)
    }

    fn unsubscribe(&mut self, filters: &[&str]) -> PacketResult<u16> {
        if filters.is_empty() {
            return Err(ArgumentError::InvalidTopic.into());
        }
        if filters.len() > MAX_FILTERS {
            return Err(ArgumentError::TooManyFilters.into());
        }
        for filter in filters {
            topic::validate_filter(filter)?;
        }
        if !self.has_socket {
            return Err(MqttError::NotConnected);
        }
        let mid = self.messages.next_mid();
        debug!("Sending UNSUBSCRIBE (Mid: {}, {} filters)", mid, filters.len());
        let unsubscribe = Unsubscribe {
            packet_id: mid,
            topics: filters,
        };
        self.writer
            .enqueue(&unsubscribe, mid, QoS::AtLeastOnce, self.protocol)?;
        Ok(mid)
    }

    fn disconnect(&mut self) -> PacketResult<()> {
        if !self.has_socket {
            return Err(MqttError::NotConnected);
        }
        debug!("Sending DISCONNECT");
        self.state = ConnectionState::Disconnecting;
        self.writer
            .enqueue(&Simple::DISCONNECT, 0, QoS::AtMostOnce, self.protocol)
    }
}

/// MQTT 3.1.1 requires the PUBREL flags to be exactly `0b0010`; only 3.1
/// carries the dup bit.
fn pubrel_dup(dup: bool, version: MqttVersion) -> bool {
    dup && version == MqttVersion::V31
}

fn log_publish(direction: &str, publish: &Publish<'_>) {
    debug!(
        "{} PUBLISH (d{}, q{}, r{}, m{}, '{}', ... ({} bytes))",
        direction,
        publish.dup as u8,
        publish.qos as u8,
        publish.retain as u8,
        publish.mid(),
        publish.topic,
        publish.payload.len()
    );
}

/// How a failed step is reported to the disconnect callback.
pub fn disconnect_reason<E>(err: &MqttError<E>) -> DisconnectReason {
    match err {
        MqttError::Transport(_) => DisconnectReason::Transport,
        MqttError::ConnectionRefused(code) => DisconnectReason::Refused(*code),
        MqttError::ConnectionLost => DisconnectReason::ConnectionClosed,
        _ => DisconnectReason::ProtocolViolation,
    }
}
