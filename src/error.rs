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

//! Errors raised by the transfer engines

use std::path::PathBuf;

use crate::container::ContainerError;

/// Renders an optional control byte for diagnostics.
fn show_byte(byte: &Option<u8>) -> String {
    match byte {
        Some(b) => format!("0x{:02X}", b),
        None => "timeout".to_string(),
    }
}

/// The first fatal condition of a session. Its `Display` text is the
/// diagnostic handed back to the caller.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file [{}]: {source}", .path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("transfer subsystem busy")]
    Busy,

    #[error("sync error, got [{}]", show_byte(.0))]
    Sync(Option<u8>),

    #[error("header size mismatch: {got} != {expected}")]
    ShortHeader { got: usize, expected: usize },

    #[error("packet number error: {number:#04x} / {complement:#04x}")]
    PacketNumber { number: u8, complement: u8 },

    #[error("packet sequence error: expected {expected}, got {got}")]
    Sequence { expected: u8, got: u8 },

    #[error("declared length {length} exceeds block size {block_size}")]
    DeclaredLength { length: usize, block_size: usize },

    #[error("could not parse identity packet (declared length {0})")]
    Identity(usize),

    #[error("could not receive data")]
    ReadFailed,

    #[error("timed out waiting for remote")]
    Timeout,

    #[error("canceled by remote")]
    CanceledByRemote,

    #[error("canceled")]
    Canceled,

    #[error("no ACK for EOT, received [{}]", show_byte(.0))]
    MissingFinalAck(Option<u8>),

    #[error("decompression failed: {0}")]
    Decompress(#[from] ContainerError),
}

impl TransferError {
    pub fn open(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TransferError::Open { path: path.into(), source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_messages() {
        assert_eq!(TransferError::Sync(Some(0x41)).to_string(), "sync error, got [0x41]");
        assert_eq!(TransferError::Sync(None).to_string(), "sync error, got [timeout]");
        assert_eq!(
            TransferError::MissingFinalAck(Some(0x15)).to_string(),
            "no ACK for EOT, received [0x15]"
        );
        assert_eq!(
            TransferError::PacketNumber { number: 1, complement: 0xFF }.to_string(),
            "packet number error: 0x01 / 0xff"
        );
    }
}
