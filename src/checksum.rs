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

//! Packet integrity: 8-bit additive checksum and CRC16-CCITT

use crate::protocol::{CRC_REQUEST, NAK};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumMode {
    /// Sum of bytes mod 256, one trailer byte
    Additive,
    /// CRC16-CCITT (poly 0x1021, init 0), two trailer bytes big-endian
    #[default]
    Crc16,
}

impl ChecksumMode {
    /// Maps the receiver's negotiation byte to a mode.
    pub fn from_request(byte: u8) -> Option<Self> {
        match byte {
            CRC_REQUEST => Some(ChecksumMode::Crc16),
            NAK => Some(ChecksumMode::Additive),
            _ => None,
        }
    }

    pub fn request_byte(self) -> u8 {
        match self {
            ChecksumMode::Crc16 => CRC_REQUEST,
            ChecksumMode::Additive => NAK,
        }
    }

    pub fn trailer_size(self) -> usize {
        match self {
            ChecksumMode::Additive => 1,
            ChecksumMode::Crc16 => 2,
        }
    }
}

// ============================================================================
// CRC16-CCITT
// ============================================================================

const fn crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC16_TABLE: [u16; 256] = crc16_table();

pub fn crc16_update(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        let idx = ((crc >> 8) ^ byte as u16) & 0xFF;
        crc = (crc << 8) ^ CRC16_TABLE[idx as usize];
    }
    crc
}

pub fn additive_update(sum: u8, data: &[u8]) -> u8 {
    data.iter().fold(sum, |acc, &b| acc.wrapping_add(b))
}

// ============================================================================
// Running Checksum
// ============================================================================

/// Accumulator for one packet, computed over length field(s) plus payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checksum {
    Additive(u8),
    Crc16(u16),
}

impl Checksum {
    pub fn new(mode: ChecksumMode) -> Self {
        match mode {
            ChecksumMode::Additive => Checksum::Additive(0),
            ChecksumMode::Crc16 => Checksum::Crc16(0),
        }
    }

    pub fn mode(&self) -> ChecksumMode {
        match self {
            Checksum::Additive(_) => ChecksumMode::Additive,
            Checksum::Crc16(_) => ChecksumMode::Crc16,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Checksum::Additive(sum) => *sum = additive_update(*sum, data),
            Checksum::Crc16(crc) => *crc = crc16_update(*crc, data),
        }
    }

    /// Trailer bytes as sent on the wire; only the first `trailer_size()` are meaningful.
    pub fn trailer(&self) -> [u8; 2] {
        match *self {
            Checksum::Additive(sum) => [sum, 0],
            Checksum::Crc16(crc) => crc.to_be_bytes(),
        }
    }

    pub fn matches(&self, trailer: &[u8]) -> bool {
        let size = self.mode().trailer_size();
        trailer.len() == size && trailer == &self.trailer()[..size]
    }
}

// ============================================================================
// Tests
// ============================================================================
