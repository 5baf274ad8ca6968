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

//! Streams one wire packet straight from its source
//!
//! A [`ChunkIterator`] borrows its source for exactly one packet. It hands
//! the packet out in whatever draw sizes the caller asks for, reading file
//! content only as it is drawn, so a full 8192-byte block is never held in
//! memory at once. It cannot be rewound; the next packet needs a new
//! `prepare`.

use std::io::{ErrorKind, Read, Seek, SeekFrom};

use crate::checksum::{Checksum, ChecksumMode};
use crate::protocol::{EncodedHeader, Framing, PAD, PacketHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header { sent: usize },
    Data { sent: usize },
    Checksum { sent: usize },
    Done,
}

pub struct ChunkIterator<'a, R> {
    source: &'a mut R,
    header: PacketHeader,
    encoded: EncodedHeader,
    checksum: Checksum,
    /// Content bytes still expected from the source for this block
    content: usize,
    state: State,
}

impl<'a, R: Read + Seek> ChunkIterator<'a, R> {
    /// Starts a packet at the source's current position. The declared length
    /// is whatever is left of the source, clamped to the block size.
    pub fn prepare(
        framing: Framing,
        mode: ChecksumMode,
        number: u8,
        source: &'a mut R,
    ) -> std::io::Result<Self> {
        let current = source.stream_position()?;
        let end = source.seek(SeekFrom::End(0))?;
        source.seek(SeekFrom::Start(current))?;

        let remaining = end.saturating_sub(current);
        let length = remaining.min(framing.block_size() as u64) as usize;

        Ok(Self::with_length(framing, mode, number, length, source))
    }
}

impl<'a, R: Read> ChunkIterator<'a, R> {
    /// Starts a packet carrying `length` content bytes read from `source`.
    pub fn with_length(
        framing: Framing,
        mode: ChecksumMode,
        number: u8,
        length: usize,
        source: &'a mut R,
    ) -> Self {
        let header = PacketHeader::new(framing, number, length);
        ChunkIterator {
            source,
            header,
            encoded: header.encode(),
            checksum: Checksum::new(mode),
            content: header.length,
            state: State::Header { sent: 0 },
        }
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    /// Total bytes this packet puts on the wire.
    #[cfg(test)]
    pub fn packet_size(&self) -> usize {
        self.encoded.as_bytes().len()
            + self.header.framing.block_size()
            + self.checksum.mode().trailer_size()
    }

    #[cfg(test)]
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Copies the next part of the packet into `buf`. Returns 0 once the
    /// whole packet has been handed out.
    pub fn next(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut n = 0;

        while n < buf.len() {
            match self.state {
                State::Header { sent } => {
                    let bytes = self.encoded.as_bytes();
                    let take = (bytes.len() - sent).min(buf.len() - n);
                    buf[n..n + take].copy_from_slice(&bytes[sent..sent + take]);
                    n += take;

                    let sent = sent + take;
                    self.state = if sent == bytes.len() {
                        self.checksum.update(self.encoded.length_field());
                        State::Data { sent: 0 }
                    } else {
                        State::Header { sent }
                    };
                }
                State::Data { sent } => {
                    let block_size = self.header.framing.block_size();
                    let space = (block_size - sent).min(buf.len() - n);
                    let out = &mut buf[n..n + space];

                    let want = self.content.saturating_sub(sent).min(space);
                    let got = read_up_to(&mut *self.source, &mut out[..want])?;
                    if got < want {
                        // Source ran short of what it promised; pad from here on.
                        self.content = sent + got;
                    }
                    out[got..].fill(PAD);

                    self.checksum.update(out);
                    n += space;

                    let sent = sent + space;
                    self.state = if sent == block_size {
                        State::Checksum { sent: 0 }
                    } else {
                        State::Data { sent }
                    };
                }
                State::Checksum { sent } => {
                    let size = self.checksum.mode().trailer_size();
                    let trailer = self.checksum.trailer();
                    let take = (size - sent).min(buf.len() - n);
                    buf[n..n + take].copy_from_slice(&trailer[sent..sent + take]);
                    n += take;

                    let sent = sent + take;
                    self.state = if sent == size {
                        State::Done
                    } else {
                        State::Checksum { sent }
                    };
                }
                State::Done => break,
            }
        }

        Ok(n)
    }
}

/// Reads until `buf` is full or the source is exhausted.
fn read_up_to<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ============================================================================
// Tests
// ============================================================================
