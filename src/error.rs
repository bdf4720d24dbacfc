//! # Error Types
//!
//! This module defines the error types used throughout the MQTT engine. Errors
//! fall into four groups: transport failures (wrapped from the socket layer),
//! protocol violations (fatal for the connection), connection-level results
//! (no socket, refused, lost) and argument validation failures that are
//! reported synchronously before any network I/O happens.

use core::fmt;

/// A placeholder transport error used by code paths that never touch the
/// socket, such as packet encoding or queueing a frame.
///
/// The type is uninhabited, so an `MqttError<ErrorPlaceHolder>` can be cast to
/// any concrete `MqttError<T>` without a fallible step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorPlaceHolder {}

/// Result of codec and enqueue-only operations.
pub type PacketResult<T> = Result<T, MqttError<ErrorPlaceHolder>>;

/// The primary error enum for the MQTT engine.
///
/// It is generic over the transport error type `T`, allowing it to wrap
/// specific errors from the underlying socket (embassy-net TCP, std TCP, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MqttError<T> {
    /// An error occurred in the underlying transport layer.
    Transport(T),
    /// The peer violated the MQTT protocol. The connection is torn down.
    Protocol(ProtocolError),
    /// A caller-supplied argument was rejected before any I/O happened.
    Argument(ArgumentError),
    /// The broker refused the connection. The enclosed code provides the reason.
    ConnectionRefused(ConnectReasonCode),
    /// There is no socket to talk to the broker.
    NotConnected,
    /// The connection went away (peer closed it or the keepalive expired).
    ConnectionLost,
    /// A frame does not fit into the configured frame buffer.
    BufferTooSmall,
    /// The outbound frame queue or a tracked-message store is full.
    QueueFull,
}

impl<T> From<ProtocolError> for MqttError<T> {
    fn from(err: ProtocolError) -> Self {
        MqttError::Protocol(err)
    }
}

impl<T> From<ArgumentError> for MqttError<T> {
    fn from(err: ArgumentError) -> Self {
        MqttError::Argument(err)
    }
}

impl<T> MqttError<T> {
    /// Converts an error produced by a socket-free code path into an error
    /// carrying the concrete transport error type `T`.
    pub fn cast_transport_error(other: MqttError<ErrorPlaceHolder>) -> MqttError<T> {
        match other {
            MqttError::Transport(never) => match never {},
            MqttError::Protocol(p) => MqttError::Protocol(p),
            MqttError::Argument(a) => MqttError::Argument(a),
            MqttError::ConnectionRefused(c) => MqttError::ConnectionRefused(c),
            MqttError::NotConnected => MqttError::NotConnected,
            MqttError::ConnectionLost => MqttError::ConnectionLost,
            MqttError::BufferTooSmall => MqttError::BufferTooSmall,
            MqttError::QueueFull => MqttError::QueueFull,
        }
    }
}

impl<T: fmt::Debug> fmt::Display for MqttError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MqttError::Transport(e) => write!(f, "transport error: {:?}", e),
            MqttError::Protocol(p) => write!(f, "protocol error: {}", p),
            MqttError::Argument(a) => write!(f, "invalid argument: {}", a),
            MqttError::ConnectionRefused(c) => write!(f, "connection refused: {}", c),
            MqttError::NotConnected => write!(f, "the client is not currently connected"),
            MqttError::ConnectionLost => write!(f, "the connection was lost"),
            MqttError::BufferTooSmall => write!(f, "frame does not fit the buffer"),
            MqttError::QueueFull => write!(f, "outbound queue is full"),
        }
    }
}

impl<T: fmt::Debug> core::error::Error for MqttError<T> {}

/// Represents the result codes carried by a `CONNACK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectReasonCode {
    /// The connection was accepted.
    Success,
    /// The broker does not support the requested MQTT protocol version.
    UnacceptableProtocolVersion,
    /// The client identifier is not valid.
    IdentifierRejected,
    /// The broker is unavailable.
    ServerUnavailable,
    /// The username or password is not valid.
    BadUserNameOrPassword,
    /// The client is not authorized to connect.
    NotAuthorized,
    /// A result code outside the range defined by MQTT 3.1.1.
    Other(u8),
}

impl From<u8> for ConnectReasonCode {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::Success,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUserNameOrPassword,
            5 => Self::NotAuthorized,
            _ => Self::Other(val),
        }
    }
}

impl From<ConnectReasonCode> for u8 {
    fn from(code: ConnectReasonCode) -> u8 {
        match code {
            ConnectReasonCode::Success => 0,
            ConnectReasonCode::UnacceptableProtocolVersion => 1,
            ConnectReasonCode::IdentifierRejected => 2,
            ConnectReasonCode::ServerUnavailable => 3,
            ConnectReasonCode::BadUserNameOrPassword => 4,
            ConnectReasonCode::NotAuthorized => 5,
            ConnectReasonCode::Other(val) => val,
        }
    }
}

impl fmt::Display for ConnectReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectReasonCode::Success => "Connection Accepted.",
            ConnectReasonCode::UnacceptableProtocolVersion => {
                "Connection Refused: unacceptable protocol version."
            }
            ConnectReasonCode::IdentifierRejected => "Connection Refused: identifier rejected.",
            ConnectReasonCode::ServerUnavailable => "Connection Refused: broker unavailable.",
            ConnectReasonCode::BadUserNameOrPassword => {
                "Connection Refused: bad user name or password."
            }
            ConnectReasonCode::NotAuthorized => "Connection Refused: not authorised.",
            ConnectReasonCode::Other(_) => "Connection Refused: unknown reason.",
        };
        f.write_str(text)
    }
}

/// Enumerates specific MQTT protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// An invalid packet type was received.
    InvalidPacketType(u8),
    /// A packet was received that was not correctly formed.
    MalformedPacket,
    /// The remaining-length field used more than four bytes.
    MalformedRemainingLength,
    /// The frame is larger than what MQTT (or the frame buffer) can carry.
    PayloadTooLarge,
    /// A string was not valid UTF-8.
    InvalidUtf8String,
    /// A PUBLISH arrived with a zero-length topic.
    EmptyTopic,
    /// A PUBLISH carried the reserved QoS value 3.
    InvalidQos(u8),
    /// The CONNACK result code is outside 0..=5.
    InvalidConnAckCode(u8),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidPacketType(t) => write!(f, "unrecognised command {}", t),
            ProtocolError::MalformedPacket => write!(f, "malformed packet"),
            ProtocolError::MalformedRemainingLength => write!(f, "malformed remaining length"),
            ProtocolError::PayloadTooLarge => write!(f, "payload too large"),
            ProtocolError::InvalidUtf8String => write!(f, "invalid UTF-8 string"),
            ProtocolError::EmptyTopic => write!(f, "zero-length topic in PUBLISH"),
            ProtocolError::InvalidQos(q) => write!(f, "invalid QoS {}", q),
            ProtocolError::InvalidConnAckCode(c) => write!(f, "invalid CONNACK result {}", c),
        }
    }
}

impl core::error::Error for ProtocolError {}

/// Errors raised by argument validation at the public API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ArgumentError {
    /// Empty topic, wildcard in a publish topic, or a topic that is too long.
    InvalidTopic,
    /// QoS outside 0..=2.
    InvalidQos(u8),
    /// Empty or unset broker host.
    InvalidHost,
    /// Port 0.
    InvalidPort,
    /// Keepalive interval rejected.
    InvalidKeepalive,
    /// An empty client id was combined with a persistent session.
    InvalidClientId,
    /// More topic filters than fit into one SUBSCRIBE/UNSUBSCRIBE.
    TooManyFilters,
}

impl fmt::Display for ArgumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgumentError::InvalidTopic => write!(f, "invalid topic"),
            ArgumentError::InvalidQos(q) => write!(f, "invalid QoS level {}", q),
            ArgumentError::InvalidHost => write!(f, "invalid host"),
            ArgumentError::InvalidPort => write!(f, "invalid port number"),
            ArgumentError::InvalidKeepalive => write!(f, "invalid keepalive"),
            ArgumentError::InvalidClientId => {
                write!(f, "a client id must be provided if clean session is false")
            }
            ArgumentError::TooManyFilters => write!(f, "too many topic filters"),
        }
    }
}

impl core::error::Error for ArgumentError {}

/// Why the connection ended, as reported to the disconnect callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DisconnectReason {
    /// The caller asked for the disconnect and it completed.
    Requested,
    /// The broker refused the connection in its CONNACK.
    Refused(ConnectReasonCode),
    /// The broker sent something that violates the protocol.
    ProtocolViolation,
    /// No PINGRESP (or CONNACK) arrived within the keepalive interval.
    KeepaliveTimeout,
    /// The peer closed the socket.
    ConnectionClosed,
    /// The transport reported an error.
    Transport,
}

impl DisconnectReason {
    /// `true` for a caller-initiated disconnect, `false` for any unexpected loss.
    pub fn is_clean(&self) -> bool {
        matches!(self, DisconnectReason::Requested)
    }
}
