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

//! Block-compressed container files
//!
//! A container is a run of records, each a 4-byte big-endian length
//! followed by that many bytes of one compressed block, closed by a
//! 2-byte big-endian additive sum over every decompressed byte.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::host::IdleNotifier;

pub const BLOCK_HEADER_SIZE: usize = 4;

pub const TRAILER_SIZE: usize = 2;

/// Plain bytes per block when packing
pub const DEFAULT_PACK_BLOCK_SIZE: usize = 4096;

/// Compressed blocks above this are treated as corruption.
pub const MAX_COMPRESSED_BLOCK: usize = 1 << 20;

/// Default zstd level (3 = fast with reasonable ratio).
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Blocks between idle notifications
const IDLE_EVERY: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container too short ({0} bytes)")]
    TooShort(u64),

    #[error("empty block at offset {0}")]
    EmptyBlock(u64),

    #[error("block of {length} bytes at offset {offset} overruns the container")]
    Overrun { offset: u64, length: u64 },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("checksum mismatch: expected {expected:#06x}, computed {actual:#06x}")]
    Checksum { expected: u16, actual: u16 },
}

// ============================================================================
// Block Codec
// ============================================================================

/// Compresses and restores single blocks.
pub trait BlockCodec {
    fn compress_block(&self, data: &[u8]) -> Result<Vec<u8>, ContainerError>;

    fn decompress_block(&self, block: &[u8]) -> Result<Vec<u8>, ContainerError>;
}

#[derive(Debug, Clone)]
pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        ZstdCodec { level }
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_LEVEL)
    }
}

impl BlockCodec for ZstdCodec {
    fn compress_block(&self, data: &[u8]) -> Result<Vec<u8>, ContainerError> {
        zstd::encode_all(data, self.level)
            .map_err(|e| ContainerError::Codec(format!("compression failed: {}", e)))
    }

    fn decompress_block(&self, block: &[u8]) -> Result<Vec<u8>, ContainerError> {
        zstd::decode_all(block)
            .map_err(|e| ContainerError::Codec(format!("decompression failed: {}", e)))
    }
}

// ============================================================================
// Summaries
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    pub blocks: u32,
    /// Decompressed (plain) bytes
    pub plain_bytes: u64,
    /// Container bytes, trailer included
    pub container_bytes: u64,
    pub checksum: u16,
}

fn sum16(sum: u16, data: &[u8]) -> u16 {
    data.iter().fold(sum, |acc, &b| acc.wrapping_add(b as u16))
}

/// Reads until `buf` is full or the stream ends; returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ============================================================================
// Decompression
// ============================================================================

/// Decompresses a `container_len`-byte container from `reader` into `writer`.
pub fn decompress_stream<R: Read, W: Write>(
    reader: &mut R,
    container_len: u64,
    writer: &mut W,
    codec: &dyn BlockCodec,
    idle: &dyn IdleNotifier,
) -> Result<ContainerSummary, ContainerError> {
    if container_len < TRAILER_SIZE as u64 {
        return Err(ContainerError::TooShort(container_len));
    }

    let body_len = container_len - TRAILER_SIZE as u64;
    let mut summary = ContainerSummary { container_bytes: container_len, ..Default::default() };
    let mut offset = 0u64;
    let mut block = Vec::new();

    while offset < body_len {
        let mut header = [0u8; BLOCK_HEADER_SIZE];
        if offset + BLOCK_HEADER_SIZE as u64 > body_len
            || read_full(reader, &mut header)? < BLOCK_HEADER_SIZE
        {
            return Err(ContainerError::Overrun { offset, length: BLOCK_HEADER_SIZE as u64 });
        }

        let length = u32::from_be_bytes(header) as u64;
        if length == 0 {
            return Err(ContainerError::EmptyBlock(offset));
        }

        let record_end = offset + BLOCK_HEADER_SIZE as u64 + length;
        if record_end > body_len || length > MAX_COMPRESSED_BLOCK as u64 {
            return Err(ContainerError::Overrun { offset, length });
        }

        block.resize(length as usize, 0);
        if read_full(reader, &mut block)? < block.len() {
            return Err(ContainerError::Overrun { offset, length });
        }

        let plain = codec.decompress_block(&block)?;
        if plain.is_empty() {
            return Err(ContainerError::Codec(format!("block at offset {} decompressed to nothing", offset)));
        }

        summary.checksum = sum16(summary.checksum, &plain);
        writer.write_all(&plain)?;
        summary.plain_bytes += plain.len() as u64;
        summary.blocks += 1;
        offset = record_end;

        debug!("Decompressed block {} ({} -> {} bytes)", summary.blocks, length, plain.len());
        if summary.blocks % IDLE_EVERY == 0 {
            idle.on_idle();
        }
    }

    let mut trailer = [0u8; TRAILER_SIZE];
    if read_full(reader, &mut trailer)? < TRAILER_SIZE {
        return Err(ContainerError::TooShort(container_len));
    }

    let expected = u16::from_be_bytes(trailer);
    if expected != summary.checksum {
        return Err(ContainerError::Checksum { expected, actual: summary.checksum });
    }

    writer.flush()?;
    Ok(summary)
}

/// Decompresses the container at `src` into `dst`. On any failure `dst` is
/// removed, so a partial output never survives.
pub fn decompress_file(
    src: &Path,
    dst: &Path,
    codec: &dyn BlockCodec,
    idle: &dyn IdleNotifier,
) -> Result<ContainerSummary, ContainerError> {
    let result = (|| {
        let input = File::open(src)?;
        let container_len = input.metadata()?.len();
        let mut reader = BufReader::new(input);
        let mut writer = BufWriter::new(File::create(dst)?);
        decompress_stream(&mut reader, container_len, &mut writer, codec, idle)
    })();

    match result {
        Ok(summary) => {
            info!(
                "Decompressed {} -> {} ({} blocks, {} bytes)",
                src.display(), dst.display(), summary.blocks, summary.plain_bytes
            );
            Ok(summary)
        }
        Err(e) => {
            match std::fs::remove_file(dst) {
                Ok(()) => debug!("Removed partial output {}", dst.display()),
                Err(rm) if rm.kind() == ErrorKind::NotFound => {}
                Err(rm) => warn!(error = %rm, "failed to remove {}", dst.display()),
            }
            Err(e)
        }
    }
}

// ============================================================================
// Packing
// ============================================================================

/// Builds a container from plain bytes, `block_size` bytes per record.
pub fn compress_stream<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    codec: &dyn BlockCodec,
    block_size: usize,
) -> Result<ContainerSummary, ContainerError> {
    let mut summary = ContainerSummary::default();
    let mut buf = vec![0u8; block_size.max(1)];

    loop {
        let n = read_full(reader, &mut buf)?;
        if n == 0 {
            break;
        }

        let plain = &buf[..n];
        let block = codec.compress_block(plain)?;
        let length = u32::try_from(block.len())
            .map_err(|_| ContainerError::Codec(format!("block of {} bytes too large", block.len())))?;

        writer.write_all(&length.to_be_bytes())?;
        writer.write_all(&block)?;

        summary.checksum = sum16(summary.checksum, plain);
        summary.plain_bytes += n as u64;
        summary.container_bytes += (BLOCK_HEADER_SIZE + block.len()) as u64;
        summary.blocks += 1;
    }

    writer.write_all(&summary.checksum.to_be_bytes())?;
    writer.flush()?;
    summary.container_bytes += TRAILER_SIZE as u64;
    Ok(summary)
}

pub fn compress_file(
    src: &Path,
    dst: &Path,
    codec: &dyn BlockCodec,
    block_size: usize,
) -> Result<ContainerSummary, ContainerError> {
    let mut reader = BufReader::new(File::open(src)?);
    let mut writer = BufWriter::new(File::create(dst)?);
    let summary = compress_stream(&mut reader, &mut writer, codec, block_size)?;
    info!(
        "Packed {} -> {} ({} blocks, {} -> {} bytes)",
        src.display(), dst.display(), summary.blocks, summary.plain_bytes, summary.container_bytes
    );
    Ok(summary)
}

// ============================================================================
// Tests
// ============================================================================
