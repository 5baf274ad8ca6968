// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Protocol constants, packet framing and session configuration

use std::time::Duration;

use crate::checksum::ChecksumMode;
use crate::error::TransferError;
use crate::serial::TransportKind;

// ============================================================================
// Control Bytes
// ============================================================================

/// Start of header - begins a packet with a 128-byte block and one length byte
pub const SOH: u8 = 0x01;

/// Start of text - begins a packet with an 8192-byte block and two length bytes
pub const STX: u8 = 0x02;

/// End of transmission - sender has no more packets
pub const EOT: u8 = 0x04;

/// Acknowledge - packet accepted, or final EOT accepted
pub const ACK: u8 = 0x06;

/// Negative acknowledge - resend the same packet, or request the additive checksum
pub const NAK: u8 = 0x15;

/// Cancel - abort the session. The controller uses SYN here, not the classic 0x18.
pub const CAN: u8 = 0x16;

/// Receiver requests CRC16 mode
pub const CRC_REQUEST: u8 = b'C';

/// Filler for the unused tail of a block
pub const PAD: u8 = 0x1A;

/// Packet number reserved for the identity (digest) packet
pub const IDENTITY_PACKET: u8 = 0;

/// Length of the hex digest carried by the identity packet
pub const IDENTITY_LEN: usize = 32;

/// Largest encoded header: start byte, number, complement, two length bytes
pub const MAX_HEADER_SIZE: usize = 5;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Consecutive zero-byte reads tolerated before a read is declared failed
pub const DEFAULT_ZERO_READ_RETRIES: u32 = 1000;

// ============================================================================
// Framing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// SOH start byte, 128-byte block, one length byte
    Soh,
    /// STX start byte, 8192-byte block, two length bytes (high first)
    Stx,
}

impl Framing {
    pub fn from_start_byte(byte: u8) -> Option<Self> {
        match byte {
            SOH => Some(Framing::Soh),
            STX => Some(Framing::Stx),
            _ => None,
        }
    }

    /// Constrained transports get the small block; everything else the large one.
    pub fn for_transport(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Serial => Framing::Soh,
            TransportKind::Network => Framing::Stx,
        }
    }

    pub fn start_byte(self) -> u8 {
        match self {
            Framing::Soh => SOH,
            Framing::Stx => STX,
        }
    }

    pub fn block_size(self) -> usize {
        match self {
            Framing::Soh => 128,
            Framing::Stx => 8192,
        }
    }

    pub fn length_field_size(self) -> usize {
        match self {
            Framing::Soh => 1,
            Framing::Stx => 2,
        }
    }

    /// Bytes that follow the start byte: number, complement and length field(s).
    pub fn header_size(self) -> usize {
        2 + self.length_field_size()
    }
}

// ============================================================================
// Packet Header
// ============================================================================

/// A decoded and validated packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub framing: Framing,
    pub number: u8,
    /// Bytes of the block that carry file content; the rest is pad.
    pub length: usize,
}

/// Wire form of a [`PacketHeader`], start byte included.
#[derive(Debug, Clone, Copy)]
pub struct EncodedHeader {
    bytes: [u8; MAX_HEADER_SIZE],
    len: usize,
}

impl EncodedHeader {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// The length field(s), which are folded into the packet checksum.
    pub fn length_field(&self) -> &[u8] {
        &self.bytes[3..self.len]
    }
}

impl PacketHeader {
    pub fn new(framing: Framing, number: u8, length: usize) -> Self {
        PacketHeader {
            framing,
            number,
            length: length.min(framing.block_size()),
        }
    }

    pub fn encode(&self) -> EncodedHeader {
        let mut bytes = [0u8; MAX_HEADER_SIZE];
        bytes[0] = self.framing.start_byte();
        bytes[1] = self.number;
        bytes[2] = !self.number;

        let len = match self.framing {
            Framing::Soh => {
                bytes[3] = self.length as u8;
                4
            }
            Framing::Stx => {
                bytes[3] = (self.length >> 8) as u8;
                bytes[4] = self.length as u8;
                5
            }
        };

        EncodedHeader { bytes, len }
    }

    /// Decodes the bytes that follow an already consumed start byte.
    pub fn decode(framing: Framing, raw: &[u8]) -> Result<Self, TransferError> {
        let expected = framing.header_size();
        if raw.len() != expected {
            return Err(TransferError::ShortHeader { got: raw.len(), expected });
        }

        let (number, complement) = (raw[0], raw[1]);
        if number != !complement {
            return Err(TransferError::PacketNumber { number, complement });
        }

        let length = match framing {
            Framing::Soh => raw[2] as usize,
            Framing::Stx => ((raw[2] as usize) << 8) | raw[3] as usize,
        };

        if length > framing.block_size() {
            return Err(TransferError::DeclaredLength {
                length,
                block_size: framing.block_size(),
            });
        }

        Ok(PacketHeader { framing, number, length })
    }
}

// ============================================================================
// Session Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Window for each blocking read
    pub timeout: Duration,
    /// Slice a blocked read waits on the transport before yielding
    pub poll_interval: Duration,
    pub zero_read_retries: u32,
    /// Mode the receiver asks for; the sender follows whatever it is asked.
    pub checksum_mode: ChecksumMode,
    /// Overrides the transport-derived framing on the sending side
    pub framing: Option<Framing>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            zero_read_retries: DEFAULT_ZERO_READ_RETRIES,
            checksum_mode: ChecksumMode::Crc16,
            framing: None,
        }
    }
}

impl TransferConfig {
    pub fn framing_for(&self, kind: TransportKind) -> Framing {
        self.framing.unwrap_or_else(|| Framing::for_transport(kind))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soh_header_encoding() {
        let header = PacketHeader::new(Framing::Soh, 3, 44);
        let encoded = header.encode();
        assert_eq!(encoded.as_bytes(), &[SOH, 3, 0xFC, 44]);
        assert_eq!(encoded.length_field(), &[44]);
    }

    #[test]
    fn test_stx_header_encoding() {
        let header = PacketHeader::new(Framing::Stx, 1, 8192);
        let encoded = header.encode();
        assert_eq!(encoded.as_bytes(), &[STX, 1, 0xFE, 0x20, 0x00]);
        assert_eq!(encoded.length_field(), &[0x20, 0x00]);
    }

    #[test]
    fn test_length_clamped_to_block() {
        let header = PacketHeader::new(Framing::Soh, 1, 4000);
        assert_eq!(header.length, 128);
    }

    #[test]
    fn test_decode_valid_header() {
        let header = PacketHeader::decode(Framing::Stx, &[7, 0xF8, 0x01, 0x2C]).unwrap();
        assert_eq!(header.number, 7);
        assert_eq!(header.length, 300);
    }

    #[test]
    fn test_decode_rejects_bad_complement() {
        let err = PacketHeader::decode(Framing::Soh, &[1, 0xFF, 128]).unwrap_err();
        assert!(matches!(err, TransferError::PacketNumber { number: 1, complement: 0xFF }));
    }

    #[test]
    fn test_decode_rejects_short_header() {
        let err = PacketHeader::decode(Framing::Stx, &[1, 0xFE, 0x00]).unwrap_err();
        assert!(matches!(err, TransferError::ShortHeader { got: 3, expected: 4 }));
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let err = PacketHeader::decode(Framing::Soh, &[1, 0xFE, 200]).unwrap_err();
        assert!(matches!(err, TransferError::DeclaredLength { length: 200, block_size: 128 }));
    }

    #[test]
    fn test_framing_from_transport() {
        assert_eq!(Framing::for_transport(TransportKind::Serial), Framing::Soh);
        assert_eq!(Framing::for_transport(TransportKind::Network), Framing::Stx);

        let config = TransferConfig { framing: Some(Framing::Soh), ..Default::default() };
        assert_eq!(config.framing_for(TransportKind::Network), Framing::Soh);
    }
}
