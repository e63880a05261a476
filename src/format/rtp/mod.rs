//! # Real-time Transport Protocol (RTP) packets
//!
//! The RTSP engine treats payloads as opaque: packets are parsed far enough
//! to read the payload type used for callback routing, and marshaled back
//! unchanged when relayed to readers.
//!
//! ```rust
//! use rtspio::format::rtp::RTPPacket;
//! use bytes::Bytes;
//!
//! let packet = RTPPacket::new(96, 1000, 90000, 0x12345678, true, Bytes::from(vec![1, 2, 3, 4]));
//! let raw = packet.marshal().unwrap();
//! let parsed = RTPPacket::parse(&raw).unwrap();
//! assert_eq!(parsed.sequence_number, 1000);
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors that can occur during RTP operations
#[derive(Debug, Error)]
pub enum RTPError {
    /// The packet data is malformed or incomplete
    #[error("Invalid RTP packet")]
    InvalidPacket,
    /// The CSRC count field holds at most 15 entries
    #[error("{0} CSRCs don't fit an RTP header")]
    TooManyCsrc(usize),
    /// Extension data must be a whole number of 32-bit words
    #[error("RTP header extension of {0} bytes")]
    InvalidExtension(usize),
}

/// Largest number of contributing sources in one header.
pub const MAX_CSRC: usize = 15;

/// Specialized Result type for RTP operations
pub type Result<T> = std::result::Result<T, RTPError>;

/// Fixed RTP header size without CSRCs or extension.
pub const HEADER_SIZE: usize = 12;

/// An RTP packet containing media data and metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RTPPacket {
    /// RTP version (should be 2)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Header extension flag
    pub extension: bool,
    /// CSRC count
    pub csrc_count: u8,
    /// Marker bit
    pub marker: bool,
    /// Payload type identifier
    pub payload_type: u8,
    /// Packet sequence number
    pub sequence_number: u16,
    /// Media timestamp
    pub timestamp: u32,
    /// Synchronization source identifier
    pub ssrc: u32,
    /// Contributing source identifiers
    pub csrc: Vec<u32>,
    /// Optional header extension (profile-specific ID, data)
    pub extension_data: Option<(u16, Bytes)>,
    /// Packet payload data
    pub payload: Bytes,
}

impl RTPPacket {
    /// Creates a new RTP packet with the specified parameters
    ///
    /// # Arguments
    ///
    /// * `payload_type` - RTP payload type number
    /// * `sequence_number` - 16-bit sequence number
    /// * `timestamp` - 32-bit timestamp
    /// * `ssrc` - 32-bit synchronization source identifier
    /// * `marker` - Marker bit
    /// * `payload` - Media payload data
    pub fn new(
        payload_type: u8,
        sequence_number: u16,
        timestamp: u32,
        ssrc: u32,
        marker: bool,
        payload: Bytes,
    ) -> Self {
        Self {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            extension_data: None,
            payload,
        }
    }

    /// Parses an RTP packet from raw bytes
    ///
    /// # Errors
    ///
    /// Returns `RTPError` if:
    /// - The packet is shorter than 12 bytes
    /// - The version is not 2
    /// - The CSRC list, extension or padding overruns the packet
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(RTPError::InvalidPacket);
        }

        let first_byte = data[0];
        let second_byte = data[1];

        let version = (first_byte >> 6) & 0x03;
        if version != 2 {
            return Err(RTPError::InvalidPacket);
        }

        let padding = (first_byte & 0x20) != 0;
        let extension = (first_byte & 0x10) != 0;
        let csrc_count = first_byte & 0x0f;

        let marker = (second_byte & 0x80) != 0;
        let payload_type = second_byte & 0x7f;

        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = HEADER_SIZE;

        let mut csrc = Vec::with_capacity(csrc_count as usize);
        for _ in 0..csrc_count {
            if offset + 4 > data.len() {
                return Err(RTPError::InvalidPacket);
            }
            csrc.push(u32::from_be_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]));
            offset += 4;
        }

        let extension_data = if extension {
            if offset + 4 > data.len() {
                return Err(RTPError::InvalidPacket);
            }
            let ext_header = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let ext_length = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize * 4;
            offset += 4;

            if offset + ext_length > data.len() {
                return Err(RTPError::InvalidPacket);
            }
            let ext_data = Bytes::copy_from_slice(&data[offset..offset + ext_length]);
            offset += ext_length;
            Some((ext_header, ext_data))
        } else {
            None
        };

        let payload = if padding {
            let padding_len = data[data.len() - 1] as usize;
            if padding_len == 0 || offset + padding_len > data.len() {
                return Err(RTPError::InvalidPacket);
            }
            Bytes::copy_from_slice(&data[offset..data.len() - padding_len])
        } else {
            Bytes::copy_from_slice(&data[offset..])
        };

        Ok(Self {
            version: 2,
            padding,
            extension,
            csrc_count,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension_data,
            payload,
        })
    }

    /// Serializes the packet. Padding is not reproduced; the payload is
    /// written as parsed.
    ///
    /// # Errors
    ///
    /// Fails when there are more than [`MAX_CSRC`] CSRCs or the extension
    /// data can't be expressed in 32-bit words.
    pub fn marshal(&self) -> Result<Bytes> {
        if self.csrc.len() > MAX_CSRC {
            return Err(RTPError::TooManyCsrc(self.csrc.len()));
        }
        if let Some((_, data)) = &self.extension_data {
            if data.len() % 4 != 0 || data.len() / 4 > u16::MAX as usize {
                return Err(RTPError::InvalidExtension(data.len()));
            }
        }

        let ext_len = self
            .extension_data
            .as_ref()
            .map(|(_, data)| 4 + data.len())
            .unwrap_or(0);
        let mut buf =
            BytesMut::with_capacity(HEADER_SIZE + self.csrc.len() * 4 + ext_len + self.payload.len());

        let mut first_byte = 2 << 6 | self.csrc.len() as u8;
        if self.extension_data.is_some() {
            first_byte |= 0x10;
        }
        buf.put_u8(first_byte);
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7f));
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }

        if let Some((profile, data)) = &self.extension_data {
            buf.put_u16(*profile);
            buf.put_u16((data.len() / 4) as u16);
            buf.put_slice(data);
        }

        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests;
