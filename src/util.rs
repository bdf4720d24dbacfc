//! # MQTT Serialization Utilities
//!
//! This module provides helper functions for reading and writing MQTT-specific data types
//! from and to byte buffers, such as variable-byte integers and length-prefixed strings.

use heapless::Vec;

use crate::error::{MqttError, PacketResult, ProtocolError};

/// Largest value a remaining-length field can carry (four 7-bit groups).
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Incremental decoder for the remaining-length field.
///
/// Bytes are fed one at a time so that decoding can pause on a would-block
/// read and pick up exactly where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemainingLength {
    value: usize,
    multiplier: usize,
    count: u8,
}

impl Default for RemainingLength {
    fn default() -> Self {
        Self {
            value: 0,
            multiplier: 1,
            count: 0,
        }
    }
}

impl RemainingLength {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one encoded byte.
    ///
    /// Returns `Ok(Some(len))` once the terminating byte has been seen,
    /// `Ok(None)` while more bytes are needed.
    pub fn feed(&mut self, byte: u8) -> Result<Option<usize>, ProtocolError> {
        self.count += 1;
        self.value += (byte & 127) as usize * self.multiplier;
        if byte & 128 == 0 {
            return Ok(Some(self.value));
        }
        if self.count >= 4 {
            return Err(ProtocolError::MalformedRemainingLength);
        }
        self.multiplier *= 128;
        Ok(None)
    }

    /// Number of bytes consumed so far.
    pub fn bytes_read(&self) -> usize {
        self.count as usize
    }
}

/// Reads a variable-byte integer from the buffer, advancing the cursor.
///
/// This is a common encoding scheme in MQTT for packet lengths.
pub fn read_variable_byte_integer(cursor: &mut usize, buf: &[u8]) -> PacketResult<usize> {
    let mut decoder = RemainingLength::new();
    loop {
        let byte = *buf
            .get(*cursor)
            .ok_or(MqttError::Protocol(ProtocolError::MalformedPacket))?;
        *cursor += 1;
        if let Some(value) = decoder.feed(byte)? {
            return Ok(value);
        }
    }
}

/// Appends a variable-byte integer using the minimal number of bytes.
pub fn write_variable_byte_integer<const N: usize>(
    buf: &mut Vec<u8, N>,
    mut val: usize,
) -> PacketResult<()> {
    if val > MAX_REMAINING_LENGTH {
        return Err(MqttError::Protocol(ProtocolError::PayloadTooLarge));
    }
    loop {
        let mut encoded_byte = (val % 128) as u8;
        val /= 128;
        if val > 0 {
            encoded_byte |= 128;
        }
        put_u8(buf, encoded_byte)?;
        if val == 0 {
            return Ok(());
        }
    }
}

/// Number of bytes `write_variable_byte_integer` produces for `val`.
pub fn variable_byte_integer_len(val: usize) -> usize {
    match val {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

pub fn put_u8<const N: usize>(buf: &mut Vec<u8, N>, byte: u8) -> PacketResult<()> {
    buf.push(byte).map_err(|_| MqttError::BufferTooSmall)
}

pub fn put_u16<const N: usize>(buf: &mut Vec<u8, N>, val: u16) -> PacketResult<()> {
    put_slice(buf, &val.to_be_bytes())
}

pub fn put_slice<const N: usize>(buf: &mut Vec<u8, N>, data: &[u8]) -> PacketResult<()> {
    buf.extend_from_slice(data)
        .map_err(|_| MqttError::BufferTooSmall)
}

/// Writes a byte string prefixed with its 2-byte big-endian length ("str16").
pub fn put_str16<const N: usize>(buf: &mut Vec<u8, N>, data: &[u8]) -> PacketResult<()> {
    let len = u16::try_from(data.len())
        .map_err(|_| MqttError::Protocol(ProtocolError::PayloadTooLarge))?;
    put_u16(buf, len)?;
    put_slice(buf, data)
}

/// Reads a big-endian `u16`, advancing the cursor.
pub fn read_u16(cursor: &mut usize, buf: &[u8]) -> PacketResult<u16> {
    let bytes = buf
        .get(*cursor..*cursor + 2)
        .ok_or(MqttError::Protocol(ProtocolError::MalformedPacket))?;
    *cursor += 2;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Reads a UTF-8 encoded string (prefixed with a 2-byte length) from the buffer.
pub fn read_utf8_string<'a>(cursor: &mut usize, buf: &'a [u8]) -> PacketResult<&'a str> {
    let len = read_u16(cursor, buf)? as usize;
    let bytes = buf
        .get(*cursor..*cursor + len)
        .ok_or(MqttError::Protocol(ProtocolError::MalformedPacket))?;
    let s = core::str::from_utf8(bytes)
        .map_err(|_| MqttError::Protocol(ProtocolError::InvalidUtf8String))?;
    *cursor += len;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(val: usize) -> Vec<u8, 8> {
        let mut buf = Vec::new();
        write_variable_byte_integer(&mut buf, val).unwrap();
        buf
    }

    fn decode(bytes: &[u8]) -> PacketResult<usize> {
        let mut cursor = 0;
        let value = read_variable_byte_integer(&mut cursor, bytes)?;
        assert_eq!(cursor, bytes.len());
        Ok(value)
    }

    #[test]
    fn remaining_length_boundaries_use_minimal_bytes() {
        let cases: [(usize, &[u8]); 8] = [
            (0, &[0x00]),
            (127, &[0x7F]),
            (128, &[0x80, 0x01]),
            (16_383, &[0xFF, 0x7F]),
            (16_384, &[0x80, 0x80, 0x01]),
            (2_097_151, &[0xFF, 0xFF, 0x7F]),
            (2_097_152, &[0x80, 0x80, 0x80, 0x01]),
            (MAX_REMAINING_LENGTH, &[0xFF, 0xFF, 0xFF, 0x7F]),
        ];
        for (value, bytes) in cases {
            let encoded = encode(value);
            assert_eq!(encoded.as_slice(), bytes, "encoding {}", value);
            assert_eq!(encoded.len(), variable_byte_integer_len(value));
            assert_eq!(decode(bytes), Ok(value));
        }
    }

    #[test]
    fn remaining_length_sampled_values_decode_back() {
        let mut value = 1usize;
        while value <= MAX_REMAINING_LENGTH {
            assert_eq!(decode(&encode(value)), Ok(value));
            value = value * 3 + 7;
        }
    }

    #[test]
    fn remaining_length_rejects_fifth_byte() {
        assert_eq!(
            decode(&[0x80, 0x80, 0x80, 0x80, 0x01]),
            Err(MqttError::Protocol(ProtocolError::MalformedRemainingLength))
        );
        let mut decoder = RemainingLength::new();
        for _ in 0..3 {
            assert_eq!(decoder.feed(0xFF), Ok(None));
        }
        assert_eq!(
            decoder.feed(0xFF),
            Err(ProtocolError::MalformedRemainingLength)
        );
    }

    #[test]
    fn remaining_length_above_max_is_rejected() {
        let mut buf: Vec<u8, 8> = Vec::new();
        assert_eq!(
            write_variable_byte_integer(&mut buf, MAX_REMAINING_LENGTH + 1),
            Err(MqttError::Protocol(ProtocolError::PayloadTooLarge))
        );
    }

    #[test]
    fn str16_is_length_prefixed() {
        let mut buf: Vec<u8, 16> = Vec::new();
        put_str16(&mut buf, b"MQTT").unwrap();
        assert_eq!(buf.as_slice(), &[0x00, 0x04, b'M', b'Q', b'T', b'T']);

        let mut cursor = 0;
        assert_eq!(read_utf8_string(&mut cursor, &buf), Ok("MQTT"));
        assert_eq!(cursor, 6);
    }

    #[test]
    fn truncated_string_is_malformed() {
        let mut cursor = 0;
        assert_eq!(
            read_utf8_string(&mut cursor, &[0x00, 0x05, b'a']),
            Err(MqttError::Protocol(ProtocolError::MalformedPacket))
        );
    }

    #[test]
    fn put_fails_when_buffer_is_full() {
        let mut buf: Vec<u8, 2> = Vec::new();
        assert_eq!(put_slice(&mut buf, &[1, 2, 3]), Err(MqttError::BufferTooSmall));
    }
}
