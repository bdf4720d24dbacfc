//! # Non-blocking MQTT Client for Embedded Systems
//!
//! `nbmqtt` is a `no_std`, allocation-free MQTT v3.1/v3.1.1 client engine that
//! runs over a single non-blocking socket. It never waits: the host drives it
//! from whatever reactor it already has (a bare poll loop, an Embassy task,
//! `epoll`) by calling its step functions.
//!
//! ## Core Features
//!
//! - **`no_std` & `no_alloc`:** Frames, queues and tracked messages live in
//!   `heapless` collections sized by const generics.
//! - **Partial I/O:** frames are read and written incrementally; a
//!   would-block at any byte resumes exactly where it stopped.
//! - **QoS 0, 1 & 2:** with retries, an inflight window and session resume
//!   across reconnects.
//! - **Keepalive:** PINGREQ on idle connections and loss detection.
//! - **MQTT 3.1.1 and 3.1:** automatic downgrade when the broker refuses 3.1.1.
//! - **Transport Agnostic:** `MqttTransport` is implemented for `embassy-net`
//!   TCP sockets and, with the `std` feature, for `std::net::TcpStream`.
//!
//! ## Usage
//!
//! ```ignore
//! struct App;
//!
//! impl MqttHandler for App {
//!     fn on_connect(&mut self, out: &mut dyn Outbox, _: bool, code: ConnectReasonCode) {
//!         if code == ConnectReasonCode::Success {
//!             let _ = out.subscribe(&[("device/cmd", QoS::AtLeastOnce)]);
//!         }
//!     }
//!
//!     fn on_message(&mut self, out: &mut dyn Outbox, msg: &Publish<'_>) {
//!         let _ = out.publish("device/ack", msg.payload, QoS::AtMostOnce, false);
//!     }
//! }
//!
//! let options = MqttOptions::new("sensor-1");
//! let mut client = MqttClient::<_, _, _, 8, 512>::new(transport, App, EmbassyClock, options)?;
//! client.connect("192.168.1.10", 1883, Duration::from_secs(60))?;
//! loop {
//!     client.poll()?;
//!     Timer::after_millis(50).await;
//! }
//! ```
//!
//! ## Logging
//!
//! Packet traffic is logged at debug level through `log`, `defmt` or
//! `esp-println`, selected with the features of the same names.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
mod fmt;

pub mod client;
pub mod clock;
pub mod dispatch;
pub mod error;
pub mod keepalive;
pub mod message;
pub mod packet;
pub mod publisher;
pub mod reader;
pub mod session;
pub mod topic;
pub mod transport;
pub mod util;
pub mod writer;

// Re-export key types for easier access at the crate root.
pub use client::{MqttClient, MqttOptions};
pub use clock::{Clock, EmbassyClock};
pub use dispatch::{MessageCallback, MqttHandler, NoopHandler, Outbox};
pub use error::{ConnectReasonCode, DisconnectReason, MqttError};
pub use message::MessageState;
pub use packet::{MqttVersion, Publish, QoS, SubAck, Will};
pub use publisher::{PublishRequest, PublisherHandle};
pub use session::ConnectionState;
pub use transport::{MqttTransport, TcpTransport};
#[cfg(feature = "std")]
pub use transport::StdTcpTransport;
