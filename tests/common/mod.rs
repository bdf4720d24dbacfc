#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use embassy_time::{Duration, Instant};
use nbmqtt::{
    Clock, ConnectReasonCode, DisconnectReason, MqttClient, MqttHandler, MqttOptions,
    MqttTransport, Outbox, Publish, QoS, SubAck,
};

pub const T0: Instant = Instant::from_secs(1_000);

pub type TestClient<'a> = MqttClient<'a, MockTransport, Recorder, ManualClock, 8, 256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockError {
    NotOpen,
}

/// Broker side of the mock socket.
#[derive(Debug)]
pub struct Wire {
    pub inbound: VecDeque<u8>,
    pub outbound: Vec<u8>,
    /// Bytes `send` accepts before reporting would-block.
    pub write_budget: usize,
    pub open: bool,
    pub opens: usize,
    pub closes: usize,
    pub peer_closed: bool,
}

/// An in-memory transport shared between the client and the test.
#[derive(Debug, Clone)]
pub struct MockTransport(Rc<RefCell<Wire>>);

impl MockTransport {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(Wire {
            inbound: VecDeque::new(),
            outbound: Vec::new(),
            write_budget: usize::MAX,
            open: false,
            opens: 0,
            closes: 0,
            peer_closed: false,
        })))
    }

    pub fn wire(&self) -> std::cell::RefMut<'_, Wire> {
        self.0.borrow_mut()
    }

    /// Queues bytes for the client to read.
    pub fn inject(&self, bytes: &[u8]) {
        self.wire().inbound.extend(bytes.iter().copied());
    }

    pub fn set_write_budget(&self, budget: usize) {
        self.wire().write_budget = budget;
    }

    /// Takes every complete frame the client wrote so far.
    pub fn take_frames(&self) -> Vec<Frame> {
        let mut wire = self.wire();
        let mut frames = Vec::new();
        let mut pos = 0;
        while let Some((frame, len)) = Frame::parse(&wire.outbound[pos..]) {
            frames.push(frame);
            pos += len;
        }
        wire.outbound.drain(..pos);
        frames
    }

    pub fn is_open(&self) -> bool {
        self.0.borrow().open
    }

    pub fn opens(&self) -> usize {
        self.0.borrow().opens
    }

    pub fn closes(&self) -> usize {
        self.0.borrow().closes
    }
}

impl MqttTransport for MockTransport {
    type Error = MockError;

    fn open(&mut self, _host: &str, _port: u16) -> Result<(), MockError> {
        let mut wire = self.wire();
        wire.open = true;
        wire.opens += 1;
        wire.peer_closed = false;
        Ok(())
    }

    fn send(&mut self, buf: &[u8]) -> nb::Result<usize, MockError> {
        let mut wire = self.wire();
        if !wire.open {
            return Err(nb::Error::Other(MockError::NotOpen));
        }
        let n = buf.len().min(wire.write_budget);
        if n == 0 {
            return Err(nb::Error::WouldBlock);
        }
        wire.write_budget -= n;
        wire.outbound.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn recv(&mut self, buf: &mut [u8]) -> nb::Result<usize, MockError> {
        let mut wire = self.wire();
        if !wire.open {
            return Err(nb::Error::Other(MockError::NotOpen));
        }
        if wire.inbound.is_empty() {
            return if wire.peer_closed {
                Ok(0)
            } else {
                Err(nb::Error::WouldBlock)
            };
        }
        let n = buf.len().min(wire.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(wire.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn close(&mut self) {
        let mut wire = self.wire();
        if wire.open {
            wire.open = false;
            wire.closes += 1;
        }
    }
}

/// One frame as written by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: u8,
    pub body: Vec<u8>,
}

impl Frame {
    fn parse(buf: &[u8]) -> Option<(Frame, usize)> {
        let header = *buf.first()?;
        let mut len = 0usize;
        let mut shift = 0;
        let mut pos = 1;
        loop {
            let byte = *buf.get(pos)?;
            len |= ((byte & 0x7F) as usize) << shift;
            pos += 1;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let body = buf.get(pos..pos + len)?.to_vec();
        Some((Frame { header, body }, pos + len))
    }

    pub fn command(&self) -> u8 {
        self.header & 0xF0
    }

    /// Packet id of an ack, SUBSCRIBE or UNSUBSCRIBE frame.
    pub fn packet_id(&self) -> u16 {
        u16::from_be_bytes([self.body[0], self.body[1]])
    }

    pub fn publish_topic(&self) -> &str {
        let len = u16::from_be_bytes([self.body[0], self.body[1]]) as usize;
        std::str::from_utf8(&self.body[2..2 + len]).unwrap()
    }

    pub fn publish_mid(&self) -> u16 {
        let len = u16::from_be_bytes([self.body[0], self.body[1]]) as usize;
        u16::from_be_bytes([self.body[2 + len], self.body[3 + len]])
    }
}

/// A clock that only moves when the test says so.
#[derive(Debug, Clone)]
pub struct ManualClock(Rc<Cell<Instant>>);

impl ManualClock {
    pub fn new() -> Self {
        Self(Rc::new(Cell::new(T0)))
    }

    pub fn advance(&self, by: Duration) {
        self.0.set(self.0.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.0.get()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect(bool, ConnectReasonCode),
    Message(String, Vec<u8>, QoS),
    Published(u16),
    Subscribed(u16, Vec<u8>),
    Unsubscribed(u16),
    Disconnect(DisconnectReason),
}

/// Records every callback.
#[derive(Debug, Default)]
pub struct Recorder {
    pub events: Vec<Event>,
    pub routed: Vec<String>,
    /// Publishes the payload of every message to this topic from inside the callback.
    pub echo_to: Option<&'static str>,
}

impl Recorder {
    pub fn take(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }
}

impl MqttHandler for Recorder {
    fn on_connect(&mut self, _out: &mut dyn Outbox, session_present: bool, code: ConnectReasonCode) {
        self.events.push(Event::Connect(session_present, code));
    }

    fn on_message(&mut self, out: &mut dyn Outbox, msg: &Publish<'_>) {
        self.events.push(Event::Message(
            msg.topic.to_string(),
            msg.payload.to_vec(),
            msg.qos,
        ));
        if let Some(topic) = self.echo_to {
            out.publish(topic, msg.payload, QoS::AtMostOnce, false).unwrap();
        }
    }

    fn on_publish(&mut self, _out: &mut dyn Outbox, mid: u16) {
        self.events.push(Event::Published(mid));
    }

    fn on_subscribe(&mut self, _out: &mut dyn Outbox, ack: &SubAck) {
        self.events
            .push(Event::Subscribed(ack.packet_id, ack.granted_qos.to_vec()));
    }

    fn on_unsubscribe(&mut self, _out: &mut dyn Outbox, mid: u16) {
        self.events.push(Event::Unsubscribed(mid));
    }

    fn on_disconnect(&mut self, reason: DisconnectReason) {
        self.events.push(Event::Disconnect(reason));
    }
}

pub const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

/// A client that completed CONNECT/CONNACK, with the outbound wire drained.
pub fn connected_client(
    options: MqttOptions<'static>,
    keepalive: Duration,
) -> (TestClient<'static>, MockTransport, ManualClock) {
    let transport = MockTransport::new();
    let clock = ManualClock::new();
    let mut client =
        TestClient::new(transport.clone(), Recorder::default(), clock.clone(), options).unwrap();
    client.connect("broker", 1883, keepalive).unwrap();

    let frames = transport.take_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].command(), 0x10);

    transport.inject(&CONNACK_ACCEPTED);
    client.on_readable().unwrap();
    assert!(client.is_connected());
    assert_eq!(
        client.handler_mut().take(),
        vec![Event::Connect(false, ConnectReasonCode::Success)]
    );
    (client, transport, clock)
}

pub fn ack(command: u8, mid: u16) -> [u8; 4] {
    let [hi, lo] = mid.to_be_bytes();
    [command, 0x02, hi, lo]
}

/// Encodes a broker PUBLISH.
pub fn publish_frame(topic: &str, payload: &[u8], qos: QoS, mid: u16) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    body.extend_from_slice(topic.as_bytes());
    if qos != QoS::AtMostOnce {
        body.extend_from_slice(&mid.to_be_bytes());
    }
    body.extend_from_slice(payload);

    let mut frame = vec![0x30 | ((qos as u8) << 1)];
    let mut len = body.len();
    loop {
        let byte = (len % 128) as u8;
        len /= 128;
        if len == 0 {
            frame.push(byte);
            break;
        }
        frame.push(byte | 0x80);
    }
    frame.extend_from_slice(&body);
    frame
}
