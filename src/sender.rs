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

//! Download engine: sends a file to the remote receiver

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::marker::PhantomData;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::checksum::ChecksumMode;
use crate::chunk::ChunkIterator;
use crate::digest;
use crate::error::TransferError;
use crate::host::HostContext;
use crate::link::Link;
use crate::paths::DownloadPaths;
use crate::protocol::*;
use crate::serial::Transport;

// ============================================================================
// Summary
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub identity: String,
    pub checksum_mode: ChecksumMode,
    /// Data packets put on the wire, resends included
    pub packets_sent: u32,
    pub resends: u32,
    pub bytes: u64,
    /// Whether the compressed sibling was sent instead of the plain file
    pub compressed: bool,
}

// ============================================================================
// States
// ============================================================================

pub struct AwaitNegotiation;
pub struct SendIdentity;
pub struct AwaitResponse;
pub struct SendPacket;
pub struct AwaitFinalAck;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct SenderFsm<'a, State> {
    state: PhantomData<State>,
    link: Link<'a>,
    framing: Framing,
    mode: ChecksumMode,
    file: File,
    file_len: u64,
    /// Packets since the identity packet; the wire number is its low byte.
    sequence: u32,
    buffer: Vec<u8>,
    summary: DownloadSummary,
}

// ============================================================================
// Trait
// ============================================================================

pub enum SenderStep<'a> {
    Next(Box<dyn SenderState<'a> + 'a>),
    Done(DownloadSummary),
}

pub trait SenderState<'a> {
    fn step(self: Box<Self>) -> Result<SenderStep<'a>, TransferError>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<'a, S: 'a> SenderFsm<'a, S> {
    fn transition<T: 'a>(self) -> SenderStep<'a>
    where
        SenderFsm<'a, T>: SenderState<'a>,
    {
        SenderStep::Next(Box::new(SenderFsm::<T> {
            state: PhantomData,
            link: self.link,
            framing: self.framing,
            mode: self.mode,
            file: self.file,
            file_len: self.file_len,
            sequence: self.sequence,
            buffer: self.buffer,
            summary: self.summary,
        }))
    }

    fn state_name() -> &'static str {
        let type_name = std::any::type_name::<S>();
        type_name.split("::").last().unwrap_or(type_name)
    }

    fn io_error(&self, e: std::io::Error) -> TransferError {
        annotate(e, Self::state_name())
    }

    /// Streams one packet through the session buffer.
    fn stream_packet<R: Read>(
        link: &mut Link<'a>,
        buffer: &mut [u8],
        mut packet: ChunkIterator<'_, R>,
    ) -> Result<(), TransferError> {
        loop {
            let n = packet.next(buffer).map_err(|e| annotate(e, Self::state_name()))?;
            if n == 0 {
                return Ok(());
            }
            link.send(&buffer[..n])?;
        }
    }
}

fn annotate(e: std::io::Error, state_name: &str) -> TransferError {
    TransferError::Io(std::io::Error::new(
        e.kind(),
        format!("{} (in state: {})", e, state_name)
    ))
}

// ============================================================================
// State Implementations
// ============================================================================

impl<'a> SenderState<'a> for SenderFsm<'a, AwaitNegotiation> {
    fn step(self: Box<Self>) -> Result<SenderStep<'a>, TransferError> {
        let mut fsm = *self;

        match fsm.link.read_control()? {
            Some(CAN) => {
                debug!("Received: CAN");
                fsm.link.send_byte(ACK)?;
                fsm.link.flush_input();
                Err(TransferError::CanceledByRemote)
            }
            Some(byte) => match ChecksumMode::from_request(byte) {
                Some(mode) => {
                    debug!("Received: 0x{:02X}, using {:?}", byte, mode);
                    fsm.mode = mode;
                    fsm.summary.checksum_mode = mode;
                    Ok(fsm.transition::<SendIdentity>())
                }
                None => {
                    fsm.link.cancel_transfer();
                    Err(TransferError::Sync(Some(byte)))
                }
            },
            None => {
                fsm.link.cancel_transfer();
                Err(TransferError::Timeout)
            }
        }
    }
}

impl<'a> SenderState<'a> for SenderFsm<'a, SendIdentity> {
    fn step(self: Box<Self>) -> Result<SenderStep<'a>, TransferError> {
        let mut fsm = *self;

        // Always a 128-byte block with CRC16, whatever the data packets use.
        let mut identity = Cursor::new(fsm.summary.identity.clone().into_bytes());
        let packet = ChunkIterator::prepare(Framing::Soh, ChecksumMode::Crc16, IDENTITY_PACKET, &mut identity)
            .map_err(|e| fsm.io_error(e))?;
        Self::stream_packet(&mut fsm.link, &mut fsm.buffer, packet)?;
        debug!("Sent: identity packet {}", fsm.summary.identity);

        Ok(fsm.transition::<AwaitResponse>())
    }
}

impl<'a> SenderState<'a> for SenderFsm<'a, AwaitResponse> {
    fn step(self: Box<Self>) -> Result<SenderStep<'a>, TransferError> {
        let mut fsm = *self;

        match fsm.link.read_control()? {
            // 'C' counts as an acknowledgement here too.
            Some(ACK) | Some(CRC_REQUEST) => {
                fsm.sequence += 1;
                Ok(fsm.transition::<SendPacket>())
            }
            Some(NAK) => {
                warn!("Received: NAK for packet {}", fsm.sequence as u8);
                fsm.summary.resends += 1;
                if fsm.sequence == 0 {
                    Ok(fsm.transition::<SendIdentity>())
                } else {
                    Ok(fsm.transition::<SendPacket>())
                }
            }
            Some(CAN) => {
                debug!("Received: CAN");
                fsm.link.send_byte(ACK)?;
                Err(TransferError::CanceledByRemote)
            }
            Some(byte) => {
                fsm.link.cancel_transfer();
                Err(TransferError::Sync(Some(byte)))
            }
            None => {
                fsm.link.cancel_transfer();
                Err(TransferError::Timeout)
            }
        }
    }
}

impl<'a> SenderState<'a> for SenderFsm<'a, SendPacket> {
    fn step(self: Box<Self>) -> Result<SenderStep<'a>, TransferError> {
        let mut fsm = *self;

        let block_size = fsm.framing.block_size() as u64;
        let position = block_size * (fsm.sequence as u64 - 1);

        if position >= fsm.file_len {
            fsm.link.send_byte(EOT)?;
            debug!("Sent: EOT");
            return Ok(fsm.transition::<AwaitFinalAck>());
        }

        fsm.file.seek(SeekFrom::Start(position)).map_err(|e| fsm.io_error(e))?;

        let number = fsm.sequence as u8;
        let packet = ChunkIterator::prepare(fsm.framing, fsm.mode, number, &mut fsm.file)
            .map_err(|e| annotate(e, Self::state_name()))?;
        let length = packet.header().length as u64;
        Self::stream_packet(&mut fsm.link, &mut fsm.buffer, packet)?;

        fsm.summary.packets_sent += 1;
        fsm.summary.bytes = fsm.summary.bytes.max(position + length);
        debug!("Sent: packet {} ({} bytes at offset {})", number, length, position);

        Ok(fsm.transition::<AwaitResponse>())
    }
}

impl<'a> SenderState<'a> for SenderFsm<'a, AwaitFinalAck> {
    fn step(self: Box<Self>) -> Result<SenderStep<'a>, TransferError> {
        let mut fsm = *self;

        match fsm.link.read_control()? {
            Some(ACK) => {
                debug!("Received: ACK for EOT");
                Ok(SenderStep::Done(fsm.summary))
            }
            other => Err(TransferError::MissingFinalAck(other)),
        }
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl<'a> SenderFsm<'a, AwaitNegotiation> {
    pub fn new(link: Link<'a>, framing: Framing, file: File, file_len: u64, summary: DownloadSummary) -> Box<dyn SenderState<'a> + 'a> {
        let write_chunk = link.kind().write_chunk_size();
        Box::new(SenderFsm {
            state: PhantomData::<AwaitNegotiation>,
            link,
            framing,
            mode: ChecksumMode::Crc16,
            file,
            file_len,
            sequence: 0,
            buffer: vec![0; write_chunk],
            summary,
        })
    }
}

pub fn run_sender<'a>(mut fsm: Box<dyn SenderState<'a> + 'a>) -> Result<DownloadSummary, TransferError> {
    loop {
        match fsm.step()? {
            SenderStep::Next(next) => fsm = next,
            SenderStep::Done(summary) => return Ok(summary),
        }
    }
}

/// Sends `filename` to the remote receiver.
///
/// The identity digest comes from the file's sidecar when present, otherwise
/// the file is hashed. The compressed sibling is sent in place of the file
/// when one exists.
pub fn download(
    host: &HostContext<'_>,
    transport: &mut dyn Transport,
    filename: &Path,
    config: &TransferConfig,
) -> Result<DownloadSummary, TransferError> {
    let kind = transport.kind();
    let framing = config.framing_for(kind);

    let _session = match host.begin(kind) {
        Ok(session) => session,
        Err(e) => {
            Link::new(transport, config, host.cancel.clone()).cancel_transfer();
            return Err(e);
        }
    };

    info!("Download {} ({:?}, {} byte blocks)", filename.display(), kind, framing.block_size());

    let result = send_file(host, &mut *transport, filename, framing, config);

    let mut link = Link::new(transport, config, host.cancel.clone());
    match &result {
        Ok(summary) => {
            link.flush_input();
            info!("Download complete: {} packets, {} resends", summary.packets_sent, summary.resends);
        }
        Err(TransferError::Canceled) => {
            link.cancel_transfer();
            warn!("Download canceled");
        }
        Err(e) => {
            link.flush_input();
            warn!(error = %e, "Download failed");
        }
    }

    result
}

fn send_file(
    host: &HostContext<'_>,
    transport: &mut dyn Transport,
    filename: &Path,
    framing: Framing,
    config: &TransferConfig,
) -> Result<DownloadSummary, TransferError> {
    let mut link = Link::new(transport, config, host.cancel.clone());
    let paths = DownloadPaths::for_name(filename);

    let identity = match resolve_identity(host, &paths) {
        Ok(identity) => identity,
        Err(e) => {
            link.cancel_transfer();
            return Err(e);
        }
    };

    let (file, compressed) = match File::open(&paths.compressed) {
        Ok(file) => (Ok(file), true),
        Err(_) => (File::open(&paths.source), false),
    };
    let file = match file {
        Ok(file) => file,
        Err(e) => {
            link.cancel_transfer();
            return Err(TransferError::open(&paths.source, e));
        }
    };
    let file_len = file.metadata()?.len();

    if compressed {
        info!("Sending compressed sibling {}", paths.compressed.display());
    }

    let summary = DownloadSummary { identity, compressed, ..Default::default() };
    run_sender(SenderFsm::new(link, framing, file, file_len, summary))
}

fn resolve_identity(host: &HostContext<'_>, paths: &DownloadPaths) -> Result<String, TransferError> {
    if let Some(identity) = digest::read_sidecar(&paths.sidecar)? {
        debug!("Identity from sidecar {}", paths.sidecar.display());
        return Ok(identity);
    }

    digest::hash_file(&paths.source, host.idle).map_err(|e| TransferError::open(&paths.source, e))
}

// ============================================================================
// Tests
// ============================================================================
