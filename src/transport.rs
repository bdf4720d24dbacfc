//! # MQTT Transport Abstraction
//!
//! This module defines the `MqttTransport` trait, which abstracts the underlying
//! byte stream, allowing the engine to stay network-stack agnostic.
//!
//! Transports are strictly non-blocking: every operation either makes progress
//! right away or reports `nb::Error::WouldBlock`, and the engine retries on the
//! next readiness notification.

use embassy_futures::poll_once;
use embassy_net::tcp::{ConnectError, State, TcpSocket};
use embassy_net::{IpAddress, IpEndpoint};
use embedded_io_async::{Read, Write};

/// A non-blocking, stream-oriented transport for MQTT frames.
pub trait MqttTransport {
    /// The error type returned by the transport.
    type Error: core::fmt::Debug;

    /// Starts connecting to `host:port`.
    ///
    /// The connection does not have to be established when this returns;
    /// `send` and `recv` report would-block until it is.
    fn open(&mut self, host: &str, port: u16) -> Result<(), Self::Error>;

    /// Writes as many bytes of `buf` as possible and returns how many were taken.
    fn send(&mut self, buf: &[u8]) -> nb::Result<usize, Self::Error>;

    /// Reads into `buf` and returns the number of bytes read.
    ///
    /// `Ok(0)` means the peer closed the connection.
    fn recv(&mut self, buf: &mut [u8]) -> nb::Result<usize, Self::Error>;

    /// Closes the connection. Closing an already closed transport is a no-op.
    fn close(&mut self);
}

impl<M: MqttTransport + ?Sized> MqttTransport for &mut M {
    type Error = M::Error;

    fn open(&mut self, host: &str, port: u16) -> Result<(), Self::Error> {
        (**self).open(host, port)
    }

    fn send(&mut self, buf: &[u8]) -> nb::Result<usize, Self::Error> {
        (**self).send(buf)
    }

    fn recv(&mut self, buf: &mut [u8]) -> nb::Result<usize, Self::Error> {
        (**self).recv(buf)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Errors reported by [`TcpTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TcpError {
    /// The host is not an IPv4 literal.
    InvalidAddress,
    /// The socket was not closed when a new connection was started.
    InvalidState,
    /// The connection was reset by the peer.
    ConnectionReset,
    /// The connection attempt timed out.
    TimedOut,
    /// No route to the host.
    NoRoute,
}

impl From<ConnectError> for TcpError {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::InvalidState => TcpError::InvalidState,
            ConnectError::ConnectionReset => TcpError::ConnectionReset,
            ConnectError::TimedOut => TcpError::TimedOut,
            ConnectError::NoRoute => TcpError::NoRoute,
        }
    }
}

impl From<embassy_net::tcp::Error> for TcpError {
    fn from(_: embassy_net::tcp::Error) -> Self {
        TcpError::ConnectionReset
    }
}

/// TCP transport implementation using `embassy-net`.
///
/// The socket's async operations are polled exactly once per call, so the
/// transport never waits on the network stack.
pub struct TcpTransport<'a> {
    socket: TcpSocket<'a>,
}

impl<'a> TcpTransport<'a> {
    /// Creates a new `TcpTransport` over an unconnected socket.
    pub fn new(socket: TcpSocket<'a>) -> Self {
        Self { socket }
    }

    fn handshaking(&self) -> bool {
        matches!(self.socket.state(), State::SynSent | State::SynReceived)
    }
}

impl<'a> MqttTransport for TcpTransport<'a> {
    type Error = TcpError;

    fn open(&mut self, host: &str, port: u16) -> Result<(), Self::Error> {
        let addr: core::net::Ipv4Addr = host.parse().map_err(|_| TcpError::InvalidAddress)?;
        let endpoint = IpEndpoint::new(IpAddress::Ipv4(addr), port);
        debug!("TCP connecting to {}:{}", host, port);
        // The first poll sends the SYN, the handshake then completes in the stack.
        match poll_once(self.socket.connect(endpoint)) {
            core::task::Poll::Ready(result) => result.map_err(TcpError::from),
            core::task::Poll::Pending => Ok(()),
        }
    }

    fn send(&mut self, buf: &[u8]) -> nb::Result<usize, Self::Error> {
        if self.handshaking() {
            return Err(nb::Error::WouldBlock);
        }
        match poll_once(Write::write(&mut self.socket, buf)) {
            core::task::Poll::Ready(Ok(n)) => {
                trace!("TCP TX {} bytes", n);
                Ok(n)
            }
            core::task::Poll::Ready(Err(e)) => Err(nb::Error::Other(e.into())),
            core::task::Poll::Pending => Err(nb::Error::WouldBlock),
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> nb::Result<usize, Self::Error> {
        if self.handshaking() {
            return Err(nb::Error::WouldBlock);
        }
        match poll_once(Read::read(&mut self.socket, buf)) {
            core::task::Poll::Ready(Ok(n)) => {
                trace!("TCP RX {} bytes", n);
                Ok(n)
            }
            core::task::Poll::Ready(Err(e)) => Err(nb::Error::Other(e.into())),
            core::task::Poll::Pending => Err(nb::Error::WouldBlock),
        }
    }

    fn close(&mut self) {
        if self.socket.state() != State::Closed {
            self.socket.close();
        }
    }
}

#[cfg(feature = "std")]
pub use self::std_tcp::StdTcpTransport;

#[cfg(feature = "std")]
mod std_tcp {
    use std::io::{self, Read, Write};
    use std::net::TcpStream;

    use super::MqttTransport;

    /// Non-blocking `std::net::TcpStream` transport for hosted targets.
    #[derive(Debug, Default)]
    pub struct StdTcpTransport {
        stream: Option<TcpStream>,
    }

    impl StdTcpTransport {
        pub fn new() -> Self {
            Self::default()
        }

        fn stream(&mut self) -> io::Result<&mut TcpStream> {
            self.stream
                .as_mut()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
        }
    }

    fn nb_io<T>(result: io::Result<T>) -> nb::Result<T, io::Error> {
        result.map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock => nb::Error::WouldBlock,
            _ => nb::Error::Other(e),
        })
    }

    impl MqttTransport for StdTcpTransport {
        type Error = io::Error;

        fn open(&mut self, host: &str, port: u16) -> Result<(), Self::Error> {
            let stream = TcpStream::connect((host, port))?;
            stream.set_nonblocking(true)?;
            stream.set_nodelay(true)?;
            self.stream = Some(stream);
            Ok(())
        }

        fn send(&mut self, buf: &[u8]) -> nb::Result<usize, Self::Error> {
            let stream = self.stream().map_err(nb::Error::Other)?;
            nb_io(stream.write(buf))
        }

        fn recv(&mut self, buf: &mut [u8]) -> nb::Result<usize, Self::Error> {
            let stream = self.stream().map_err(nb::Error::Other)?;
            nb_io(stream.read(buf))
        }

        fn close(&mut self) {
            if let Some(stream) = self.stream.take() {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
        }
    }
}
