//! Incremental packet reader.
//!
//! A frame is assembled in three resumable steps: the fixed header byte, the
//! remaining-length field (one byte at a time) and the body. A would-block at
//! any step leaves the partial state untouched for the next call.

use heapless::Vec;

use crate::error::{MqttError, ProtocolError};
use crate::transport::MqttTransport;
use crate::util::RemainingLength;

/// A complete frame as read from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame<const B: usize> {
    pub header: u8,
    pub body: Vec<u8, B>,
}

/// Partial state of the frame currently being read.
#[derive(Debug, Default)]
pub struct PacketReader<const B: usize> {
    command: Option<u8>,
    length: RemainingLength,
    remaining: Option<usize>,
    payload: Vec<u8, B>,
    pos: usize,
}

impl<const B: usize> PacketReader<B> {
    pub fn new() -> Self {
        Self {
            command: None,
            length: RemainingLength::new(),
            remaining: None,
            payload: Vec::new(),
            pos: 0,
        }
    }

    /// Drops any partially read frame.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// `true` while a frame has been started but not completed.
    pub fn in_progress(&self) -> bool {
        self.command.is_some()
    }

    /// Makes as much progress as the transport allows.
    ///
    /// Returns the frame once its last byte has arrived, leaving the reader
    /// empty for the next one.
    pub fn read<T: MqttTransport>(
        &mut self,
        transport: &mut T,
    ) -> nb::Result<InboundFrame<B>, MqttError<T::Error>> {
        let header = match self.command {
            Some(header) => header,
            None => {
                let mut byte = [0u8; 1];
                recv(transport, &mut byte)?;
                self.command = Some(byte[0]);
                byte[0]
            }
        };

        let remaining = match self.remaining {
            Some(remaining) => remaining,
            None => loop {
                let mut byte = [0u8; 1];
                recv(transport, &mut byte)?;
                let decoded = self
                    .length
                    .feed(byte[0])
                    .map_err(|e| nb::Error::Other(MqttError::Protocol(e)))?;
                if let Some(remaining) = decoded {
                    self.payload.clear();
                    self.payload.resize(remaining, 0).map_err(|_| {
                        nb::Error::Other(MqttError::Protocol(ProtocolError::PayloadTooLarge))
                    })?;
                    self.remaining = Some(remaining);
                    break remaining;
                }
            },
        };

        while self.pos < remaining {
            let n = recv(transport, &mut self.payload[self.pos..remaining])?;
            self.pos += n;
        }

        let frame = InboundFrame {
            header,
            body: core::mem::take(&mut self.payload),
        };
        self.reset();
        Ok(frame)
    }
}

fn recv<T: MqttTransport>(
    transport: &mut T,
    buf: &mut [u8],
) -> nb::Result<usize, MqttError<T::Error>> {
    match transport.recv(buf) {
        Ok(0) => Err(nb::Error::Other(MqttError::ConnectionLost)),
        Ok(n) => Ok(n),
        Err(nb::Error::WouldBlock) => Err(nb::Error::WouldBlock),
        Err(nb::Error::Other(e)) => Err(nb::Error::Other(MqttError::Transport(e))),
    }
}
