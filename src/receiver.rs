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

//! Upload engine: receives a file from the remote sender
//!
//! Payload bytes go to disk as they arrive. The write position is marked
//! before every packet and a packet that fails its check is cut back off
//! the file before the NAK goes out.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::checksum::{Checksum, ChecksumMode};
use crate::container::{self, BlockCodec};
use crate::error::TransferError;
use crate::host::HostContext;
use crate::link::Link;
use crate::paths::{self, UploadPaths};
use crate::protocol::*;
use crate::serial::Transport;

// ============================================================================
// Summary
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub identity: Option<String>,
    pub checksum_mode: ChecksumMode,
    /// Data packets accepted
    pub packets: u32,
    pub naks: u32,
    pub duplicates: u32,
    /// Bytes written to the received file
    pub bytes: u64,
    /// Size of the decompressed output, for container uploads
    pub decompressed: Option<u64>,
}

// ============================================================================
// File Cursor
// ============================================================================

/// Destination file with a rewind mark.
struct FileCursor {
    file: File,
    position: u64,
    mark: u64,
}

impl FileCursor {
    fn create(path: &Path) -> std::io::Result<Self> {
        paths::ensure_parent(path)?;
        Ok(FileCursor { file: File::create(path)?, position: 0, mark: 0 })
    }

    fn mark(&mut self) {
        self.mark = self.position;
    }

    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all(data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    /// Drops everything written since the mark.
    fn rewind(&mut self) -> std::io::Result<()> {
        self.file.set_len(self.mark)?;
        self.file.seek(SeekFrom::Start(self.mark))?;
        self.position = self.mark;
        Ok(())
    }
}

// ============================================================================
// Packet Sequencing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Identity,
    Data,
    /// Repeat of the last accepted packet whose ACK was lost
    Duplicate,
}

#[derive(Debug, Default)]
struct Progress {
    last: u8,
    identity_seen: bool,
    data_seen: bool,
}

impl Progress {
    fn classify(&self, number: u8) -> Result<PacketKind, TransferError> {
        let started = self.identity_seen || self.data_seen;
        let expected = self.last.wrapping_add(1);

        if number == IDENTITY_PACKET && !started {
            Ok(PacketKind::Identity)
        } else if number == expected {
            Ok(PacketKind::Data)
        } else if number == self.last && started {
            Ok(PacketKind::Duplicate)
        } else {
            Err(TransferError::Sequence { expected, got: number })
        }
    }
}

// ============================================================================
// States
// ============================================================================

pub struct RequestMode;
pub struct AwaitStart;

pub struct ReceiveHeader {
    framing: Framing,
}

pub struct ReceivePayload {
    packet: PacketHeader,
    kind: PacketKind,
}

// ============================================================================
// FSM Structure
// ============================================================================

pub struct ReceiverFsm<'a, State> {
    state: State,
    link: Link<'a>,
    mode: ChecksumMode,
    output: FileCursor,
    sidecar: Option<PathBuf>,
    progress: Progress,
    buffer: Vec<u8>,
    summary: UploadSummary,
}

pub enum ReceiverStep<'a> {
    Next(Box<dyn ReceiverState<'a> + 'a>),
    Done(UploadSummary),
}

pub trait ReceiverState<'a> {
    fn step(self: Box<Self>) -> Result<ReceiverStep<'a>, TransferError>;
}

impl<'a, S: 'a> ReceiverFsm<'a, S> {
    fn transition<T: 'a>(self, state: T) -> ReceiverStep<'a>
    where
        ReceiverFsm<'a, T>: ReceiverState<'a>,
    {
        ReceiverStep::Next(Box::new(ReceiverFsm {
            state,
            link: self.link,
            mode: self.mode,
            output: self.output,
            sidecar: self.sidecar,
            progress: self.progress,
            buffer: self.buffer,
            summary: self.summary,
        }))
    }

    fn io_error(e: std::io::Error) -> TransferError {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        TransferError::Io(std::io::Error::new(
            e.kind(),
            format!("{} (in state: {})", e, state_name)
        ))
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl<'a> ReceiverState<'a> for ReceiverFsm<'a, RequestMode> {
    fn step(self: Box<Self>) -> Result<ReceiverStep<'a>, TransferError> {
        let mut fsm = *self;

        let request = fsm.mode.request_byte();
        fsm.link.send_byte(request)?;
        debug!("Sent: 0x{:02X}, requesting {:?}", request, fsm.mode);

        Ok(fsm.transition(AwaitStart))
    }
}

impl<'a> ReceiverState<'a> for ReceiverFsm<'a, AwaitStart> {
    fn step(self: Box<Self>) -> Result<ReceiverStep<'a>, TransferError> {
        let mut fsm = *self;

        let byte = fsm.link.read_control()?;
        if let Some(framing) = byte.and_then(Framing::from_start_byte) {
            return Ok(fsm.transition(ReceiveHeader { framing }));
        }

        match byte {
            Some(EOT) => {
                debug!("Received: EOT");
                fsm.link.send_byte(ACK)?;
                Ok(ReceiverStep::Done(fsm.summary))
            }
            Some(CAN) => {
                debug!("Received: CAN");
                fsm.link.send_byte(ACK)?;
                Err(TransferError::CanceledByRemote)
            }
            other => {
                fsm.link.cancel_transfer();
                Err(TransferError::Sync(other))
            }
        }
    }
}

impl<'a> ReceiverState<'a> for ReceiverFsm<'a, ReceiveHeader> {
    fn step(self: Box<Self>) -> Result<ReceiverStep<'a>, TransferError> {
        let mut fsm = *self;
        let framing = fsm.state.framing;

        let mut raw = [0u8; MAX_HEADER_SIZE];
        let got = fsm.link.fill(&mut raw[..framing.header_size()])?;

        let decoded = PacketHeader::decode(framing, &raw[..got]).and_then(|packet| {
            let kind = fsm.progress.classify(packet.number)?;
            if kind == PacketKind::Identity && packet.length != IDENTITY_LEN {
                return Err(TransferError::Identity(packet.length));
            }
            Ok((packet, kind))
        });

        match decoded {
            Ok((packet, kind)) => {
                debug!("Received: header {:?} ({:?})", packet, kind);
                Ok(fsm.transition(ReceivePayload { packet, kind }))
            }
            Err(e) => {
                fsm.link.cancel_transfer();
                Err(e)
            }
        }
    }
}

impl<'a> ReceiverState<'a> for ReceiverFsm<'a, ReceivePayload> {
    fn step(self: Box<Self>) -> Result<ReceiverStep<'a>, TransferError> {
        let mut fsm = *self;
        let (packet, kind) = (fsm.state.packet, fsm.state.kind);

        // The identity packet is always checked with CRC16.
        let mode = match kind {
            PacketKind::Identity => ChecksumMode::Crc16,
            _ => fsm.mode,
        };
        let mut checksum = Checksum::new(mode);
        checksum.update(packet.encode().length_field());

        let block_size = packet.framing.block_size();
        let total = block_size + mode.trailer_size();
        let mut identity = [0u8; IDENTITY_LEN];
        let mut trailer = [0u8; 2];
        let mut received = 0;

        fsm.output.mark();

        while received < total {
            let want = (total - received).min(fsm.buffer.len());
            let n = fsm.link.read_chunk(&mut fsm.buffer[..want])?;
            let chunk = &fsm.buffer[..n];

            let in_block = block_size.saturating_sub(received).min(n);
            checksum.update(&chunk[..in_block]);

            match kind {
                PacketKind::Data if received < packet.length => {
                    let content = (packet.length - received).min(in_block);
                    fsm.output.write(&chunk[..content]).map_err(Self::io_error)?;
                }
                PacketKind::Identity if received < IDENTITY_LEN => {
                    let take = (IDENTITY_LEN - received).min(in_block);
                    identity[received..received + take].copy_from_slice(&chunk[..take]);
                }
                _ => {}
            }

            let trailer_start = (received + in_block).saturating_sub(block_size);
            let tail = &chunk[in_block..];
            trailer[trailer_start..trailer_start + tail.len()].copy_from_slice(tail);

            received += n;
        }

        if !checksum.matches(&trailer[..mode.trailer_size()]) {
            warn!("Checksum mismatch on packet {}, requesting resend", packet.number);
            if kind == PacketKind::Data {
                fsm.output.rewind().map_err(Self::io_error)?;
            }
            fsm.summary.naks += 1;
            fsm.link.send_byte(NAK)?;
            return Ok(fsm.transition(AwaitStart));
        }

        match kind {
            PacketKind::Identity => {
                if let Some(path) = &fsm.sidecar {
                    paths::ensure_parent(path).map_err(Self::io_error)?;
                    std::fs::write(path, identity).map_err(|e| TransferError::open(path, e))?;
                }
                let digest = String::from_utf8_lossy(&identity).into_owned();
                debug!("Identity: {}", digest);
                fsm.progress.identity_seen = true;
                fsm.summary.identity = Some(digest);
            }
            PacketKind::Data => {
                fsm.progress.last = packet.number;
                fsm.progress.data_seen = true;
                fsm.summary.packets += 1;
                fsm.summary.bytes += packet.length as u64;
            }
            PacketKind::Duplicate => {
                debug!("Discarding repeat of packet {}", packet.number);
                fsm.summary.duplicates += 1;
            }
        }

        fsm.link.send_byte(ACK)?;
        Ok(fsm.transition(AwaitStart))
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl<'a> ReceiverFsm<'a, RequestMode> {
    fn new(link: Link<'a>, mode: ChecksumMode, output: FileCursor, sidecar: Option<PathBuf>) -> Box<dyn ReceiverState<'a> + 'a> {
        Box::new(ReceiverFsm {
            state: RequestMode,
            link,
            mode,
            output,
            sidecar,
            progress: Progress::default(),
            buffer: vec![0; Framing::Stx.block_size() + 2],
            summary: UploadSummary { checksum_mode: mode, ..Default::default() },
        })
    }
}

pub fn run_receiver<'a>(mut fsm: Box<dyn ReceiverState<'a> + 'a>) -> Result<UploadSummary, TransferError> {
    loop {
        match fsm.step()? {
            ReceiverStep::Next(next) => fsm = next,
            ReceiverStep::Done(summary) => return Ok(summary),
        }
    }
}

/// Files an upload has created; removed on drop unless committed.
struct PartialOutputs {
    paths: Vec<PathBuf>,
    committed: bool,
}

impl PartialOutputs {
    fn new(paths: &UploadPaths) -> Self {
        PartialOutputs { paths: paths.outputs(), committed: false }
    }

    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for PartialOutputs {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for path in &self.paths {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("Removed partial output {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(error = %e, "failed to remove {}", path.display()),
            }
        }
    }
}

/// Receives `filename` from the remote sender. A name ending in `.lz` is
/// received as a container and decompressed into the name without the
/// suffix once the transfer completes.
pub fn upload(
    host: &HostContext<'_>,
    transport: &mut dyn Transport,
    filename: &Path,
    config: &TransferConfig,
    codec: &dyn BlockCodec,
) -> Result<UploadSummary, TransferError> {
    let kind = transport.kind();

    let _session = match host.begin(kind) {
        Ok(session) => session,
        Err(e) => {
            Link::new(transport, config, host.cancel.clone()).cancel_transfer();
            return Err(e);
        }
    };

    info!("Upload {} ({:?})", filename.display(), kind);

    let paths = UploadPaths::for_name(filename);
    let mut outputs = PartialOutputs::new(&paths);

    let received = receive_file(host, &mut *transport, &paths, config);

    let mut link = Link::new(transport, config, host.cancel.clone());
    let result = match received {
        Ok(summary) => {
            link.flush_input();
            decompress(host, &paths, codec, summary)
        }
        Err(TransferError::Canceled) => {
            link.cancel_transfer();
            Err(TransferError::Canceled)
        }
        Err(e) => {
            link.flush_input();
            Err(e)
        }
    };

    match &result {
        Ok(summary) => {
            outputs.commit();
            info!(
                "Upload complete: {} packets, {} bytes, {} NAKs, {} duplicates",
                summary.packets, summary.bytes, summary.naks, summary.duplicates
            );
        }
        Err(e) => warn!(error = %e, "Upload failed"),
    }

    result
}

fn receive_file(
    host: &HostContext<'_>,
    transport: &mut dyn Transport,
    paths: &UploadPaths,
    config: &TransferConfig,
) -> Result<UploadSummary, TransferError> {
    let mut link = Link::new(transport, config, host.cancel.clone());

    let output = match FileCursor::create(&paths.received) {
        Ok(output) => output,
        Err(e) => {
            link.cancel_transfer();
            return Err(TransferError::open(&paths.received, e));
        }
    };

    run_receiver(ReceiverFsm::new(link, config.checksum_mode, output, paths.sidecar.clone()))
}

fn decompress(
    host: &HostContext<'_>,
    paths: &UploadPaths,
    codec: &dyn BlockCodec,
    mut summary: UploadSummary,
) -> Result<UploadSummary, TransferError> {
    if paths.compressed {
        let unpacked = container::decompress_file(&paths.received, &paths.target, codec, host.idle)?;
        summary.decompressed = Some(unpacked.plain_bytes);
    }
    Ok(summary)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkIterator;
    use crate::container::ZstdCodec;
    use crate::host::HostState;
    use crate::serial::{MockSerialPort, TransportKind, pipe_pair};
    use crate::sender::download;
    use std::io::Cursor;
    use std::time::Duration;

    const DIGEST: &str = "0123456789abcdef0123456789abcdef";

    fn quick_config() -> TransferConfig {
        TransferConfig {
            timeout: Duration::from_millis(30),
            poll_interval: Duration::from_millis(1),
            zero_read_retries: 3,
            ..Default::default()
        }
    }

    fn packet(framing: Framing, mode: ChecksumMode, number: u8, content: &[u8]) -> Vec<u8> {
        let mut source = Cursor::new(content.to_vec());
        let mut iter = ChunkIterator::with_length(framing, mode, number, content.len(), &mut source);
        let mut out = vec![0u8; iter.packet_size()];
        assert_eq!(iter.next(&mut out).unwrap(), out.len());
        out
    }

    fn identity() -> Vec<u8> {
        packet(Framing::Soh, ChecksumMode::Crc16, 0, DIGEST.as_bytes())
    }

    /// Identity, then `content` in SOH blocks, then EOT.
    fn whole_file(content: &[u8]) -> Vec<Vec<u8>> {
        let mut packets = vec![identity()];
        for (i, block) in content.chunks(128).enumerate() {
            packets.push(packet(Framing::Soh, ChecksumMode::Crc16, (i + 1) as u8, block));
        }
        packets.push(vec![EOT]);
        packets
    }

    fn script(packets: &[Vec<u8>]) -> Vec<Option<u8>> {
        packets.iter().flatten().map(|&b| Some(b)).collect()
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn test_receive_300_byte_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("part.nc");
        let data = content(300);

        let responses = script(&whole_file(&data));
        let expected_writes = vec![CRC_REQUEST, ACK, ACK, ACK, ACK, ACK];

        let state = HostState::new();
        let host = HostContext::new(&state);
        let mut port = MockSerialPort::new(responses, expected_writes);

        let summary = upload(&host, &mut port, &target, &quick_config(), &ZstdCodec::default()).unwrap();
        assert_eq!(summary.identity.as_deref(), Some(DIGEST));
        assert_eq!(summary.packets, 3);
        assert_eq!(summary.bytes, 300);
        assert_eq!(std::fs::read(&target).unwrap(), data);
        assert_eq!(std::fs::read(dir.path().join(".md5/part.nc")).unwrap(), DIGEST.as_bytes());
        assert!(!state.transfer_in_progress());
        assert!(state.rx_interrupt_enabled());
    }

    #[test]
    fn test_corrupt_packet_is_cut_back() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("part.nc");
        let data = content(256);

        let good_first = packet(Framing::Soh, ChecksumMode::Crc16, 1, &data[..128]);
        let mut corrupt = packet(Framing::Soh, ChecksumMode::Crc16, 2, &data[128..]);
        corrupt[40] ^= 0x08;

        // The sender gives up after the NAK, so only packet 1 survives.
        let responses = script(&[identity(), good_first, corrupt, vec![EOT]]);
        let expected_writes = vec![CRC_REQUEST, ACK, ACK, NAK, ACK];

        let state = HostState::new();
        let host = HostContext::new(&state);
        let mut port = MockSerialPort::new(responses, expected_writes);

        let summary = upload(&host, &mut port, &target, &quick_config(), &ZstdCodec::default()).unwrap();
        assert_eq!(summary.naks, 1);
        assert_eq!(std::fs::read(&target).unwrap(), &data[..128]);
    }

    #[test]
    fn test_corrupt_trailer_then_resend() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("part.nc");
        let data = content(100);

        let good = packet(Framing::Soh, ChecksumMode::Crc16, 1, &data);
        let mut corrupt = good.clone();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0x01;

        let responses = script(&[identity(), corrupt, good, vec![EOT]]);
        let expected_writes = vec![CRC_REQUEST, ACK, NAK, ACK, ACK];

        let state = HostState::new();
        let host = HostContext::new(&state);
        let mut port = MockSerialPort::new(responses, expected_writes);

        let summary = upload(&host, &mut port, &target, &quick_config(), &ZstdCodec::default()).unwrap();
        assert_eq!(summary.packets, 1);
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }

    #[test]
    fn test_corrupt_identity_is_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("part.nc");

        let mut corrupt = identity();
        corrupt[10] = b'x';

        let responses = script(&[corrupt, identity(), vec![EOT]]);
        let expected_writes = vec![CRC_REQUEST, NAK, ACK, ACK];

        let state = HostState::new();
        let host = HostContext::new(&state);
        let mut port = MockSerialPort::new(responses, expected_writes);

        let summary = upload(&host, &mut port, &target, &quick_config(), &ZstdCodec::default()).unwrap();
        assert_eq!(summary.identity.as_deref(), Some(DIGEST));
        assert_eq!(std::fs::read(dir.path().join(".md5/part.nc")).unwrap(), DIGEST.as_bytes());
    }

    #[test]
    fn test_duplicate_packets_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("part.nc");
        let data = content(200);

        let first = packet(Framing::Soh, ChecksumMode::Crc16, 1, &data[..128]);
        let second = packet(Framing::Soh, ChecksumMode::Crc16, 2, &data[128..]);
        let responses = script(&[identity(), identity(), first.clone(), first, second, vec![EOT]]);
        let expected_writes = vec![CRC_REQUEST, ACK, ACK, ACK, ACK, ACK, ACK];

        let state = HostState::new();
        let host = HostContext::new(&state);
        let mut port = MockSerialPort::new(responses, expected_writes);

        let summary = upload(&host, &mut port, &target, &quick_config(), &ZstdCodec::default()).unwrap();
        assert_eq!(summary.duplicates, 2);
        assert_eq!(summary.packets, 2);
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }

    #[test]
    fn test_additive_mode_request() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("part.nc");

        let responses = script(&[
            identity(),
            packet(Framing::Soh, ChecksumMode::Additive, 1, b"G1 X10\n"),
            vec![EOT],
        ]);
        let expected_writes = vec![NAK, ACK, ACK, ACK];

        let config = TransferConfig { checksum_mode: ChecksumMode::Additive, ..quick_config() };
        let state = HostState::new();
        let host = HostContext::new(&state);
        let mut port = MockSerialPort::new(responses, expected_writes);

        let summary = upload(&host, &mut port, &target, &config, &ZstdCodec::default()).unwrap();
        assert_eq!(summary.checksum_mode, ChecksumMode::Additive);
        assert_eq!(std::fs::read(&target).unwrap(), b"G1 X10\n");
    }

    #[test]
    fn test_stx_packets_on_network() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("part.nc");
        let data = content(9000);

        let responses = script(&[
            identity(),
            packet(Framing::Stx, ChecksumMode::Crc16, 1, &data[..8192]),
            packet(Framing::Stx, ChecksumMode::Crc16, 2, &data[8192..]),
            vec![EOT],
        ]);
        let expected_writes = vec![CRC_REQUEST, ACK, ACK, ACK, ACK];

        let state = HostState::new();
        state.set_rx_interrupt(false);
        let host = HostContext::new(&state);
        let mut port = MockSerialPort::network(responses, expected_writes);

        let summary = upload(&host, &mut port, &target, &quick_config(), &ZstdCodec::default()).unwrap();
        assert_eq!(summary.bytes, 9000);
        assert_eq!(std::fs::read(&target).unwrap(), data);
        assert!(!state.rx_interrupt_enabled());
    }

    #[test]
    fn test_bad_complement_cancels_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("part.nc");

        let mut bad = packet(Framing::Soh, ChecksumMode::Crc16, 1, b"data");
        bad[2] = 0x00;
        let responses = script(&[identity(), bad]);
        let expected_writes = vec![CRC_REQUEST, ACK, CAN];

        let state = HostState::new();
        let host = HostContext::new(&state);
        let mut port = MockSerialPort::new(responses, expected_writes);

        let err = upload(&host, &mut port, &target, &quick_config(), &ZstdCodec::default()).unwrap_err();
        assert!(matches!(err, TransferError::PacketNumber { number: 1, complement: 0 }));
        assert!(!target.exists());
        assert!(!dir.path().join(".md5/part.nc").exists());
    }

    #[test]
    fn test_out_of_sequence_packet() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("part.nc");

        let responses = script(&[identity(), packet(Framing::Soh, ChecksumMode::Crc16, 3, b"data")]);
        let expected_writes = vec![CRC_REQUEST, ACK, CAN];

        let state = HostState::new();
        let host = HostContext::new(&state);
        let mut port = MockSerialPort::new(responses, expected_writes);

        let err = upload(&host, &mut port, &target, &quick_config(), &ZstdCodec::default()).unwrap_err();
        assert!(matches!(err, TransferError::Sequence { expected: 1, got: 3 }));
    }

    #[test]
    fn test_identity_length_must_be_32() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("part.nc");

        let short = packet(Framing::Soh, ChecksumMode::Crc16, 0, &DIGEST.as_bytes()[..31]);
        let expected_writes = vec![CRC_REQUEST, CAN];

        let state = HostState::new();
        let host = HostContext::new(&state);
        let mut port = MockSerialPort::new(script(&[short]), expected_writes);

        let err = upload(&host, &mut port, &target, &quick_config(), &ZstdCodec::default()).unwrap_err();
        assert!(matches!(err, TransferError::Identity(31)));
    }

    #[test]
    fn test_remote_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("part.nc");

        let state = HostState::new();
        let host = HostContext::new(&state);
        let mut port = MockSerialPort::new(vec![Some(CAN)], vec![CRC_REQUEST, ACK]);

        let err = upload(&host, &mut port, &target, &quick_config(), &ZstdCodec::default()).unwrap_err();
        assert!(matches!(err, TransferError::CanceledByRemote));
        assert_eq!(err.to_string(), "canceled by remote");
        assert!(!target.exists());
    }

    #[test]
    fn test_failed_compressed_upload_keeps_existing_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("part.nc");
        std::fs::write(&plain, b"existing plain file").unwrap();

        let state = HostState::new();
        let host = HostContext::new(&state);
        let mut port = MockSerialPort::new(vec![Some(CAN)], vec![CRC_REQUEST, ACK]);

        let name = dir.path().join("part.nc.lz");
        let err = upload(&host, &mut port, &name, &quick_config(), &ZstdCodec::default()).unwrap_err();

        assert!(matches!(err, TransferError::CanceledByRemote));
        assert_eq!(std::fs::read(&plain).unwrap(), b"existing plain file");
        assert!(!dir.path().join(".lz/part.nc").exists());
    }

    #[test]
    fn test_sync_error_on_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("part.nc");

        let state = HostState::new();
        let host = HostContext::new(&state);
        let mut port = MockSerialPort::new(vec![Some(b'Z')], vec![CRC_REQUEST, CAN]);

        let err = upload(&host, &mut port, &target, &quick_config(), &ZstdCodec::default()).unwrap_err();
        assert!(matches!(err, TransferError::Sync(Some(b'Z'))));
    }

    #[test]
    fn test_truncated_payload_is_read_failure() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("part.nc");

        let full = packet(Framing::Soh, ChecksumMode::Crc16, 1, b"data");
        let responses = script(&[identity(), full[..60].to_vec()]);

        let state = HostState::new();
        let host = HostContext::new(&state);
        let mut port = MockSerialPort::new(responses, vec![CRC_REQUEST, ACK]);

        let err = upload(&host, &mut port, &target, &quick_config(), &ZstdCodec::default()).unwrap_err();
        assert!(matches!(err, TransferError::ReadFailed));
        assert!(!target.exists());
    }

    #[test]
    fn test_busy_leaves_destination_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("part.nc");
        std::fs::write(&target, b"keep me").unwrap();

        let state = HostState::new();
        let gate = || false;
        let host = HostContext::new(&state).with_gate(&gate);
        let mut port = MockSerialPort::new(vec![], vec![CAN]);

        let err = upload(&host, &mut port, &target, &quick_config(), &ZstdCodec::default()).unwrap_err();
        assert!(matches!(err, TransferError::Busy));
        assert_eq!(std::fs::read(&target).unwrap(), b"keep me");
        assert!(state.rx_interrupt_enabled());
    }

    #[test]
    fn test_firmware_upload_writes_no_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("firmware.bin");
        let data = content(50);

        let state = HostState::new();
        let host = HostContext::new(&state);
        let mut port = MockSerialPort::new(script(&whole_file(&data)), vec![CRC_REQUEST, ACK, ACK, ACK]);

        let summary = upload(&host, &mut port, &target, &quick_config(), &ZstdCodec::default()).unwrap();
        assert_eq!(summary.identity.as_deref(), Some(DIGEST));
        assert_eq!(std::fs::read(&target).unwrap(), data);
        assert!(!dir.path().join(".md5").exists());
    }

    fn container_for(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        container::compress_stream(&mut Cursor::new(data), &mut out, &ZstdCodec::default(), 256).unwrap();
        out
    }

    #[test]
    fn test_compressed_upload_is_decompressed() {
        let dir = tempfile::tempdir().unwrap();
        let data = content(2000);
        let packed = container_for(&data);

        let packets = whole_file(&packed);
        let mut expected_writes = vec![CRC_REQUEST];
        expected_writes.resize(packets.len() + 1, ACK);

        let state = HostState::new();
        let host = HostContext::new(&state);
        let mut port = MockSerialPort::new(script(&packets), expected_writes);

        let name = dir.path().join("part.nc.lz");
        let summary = upload(&host, &mut port, &name, &quick_config(), &ZstdCodec::default()).unwrap();

        assert_eq!(summary.decompressed, Some(2000));
        assert_eq!(std::fs::read(dir.path().join("part.nc")).unwrap(), data);
        assert_eq!(std::fs::read(dir.path().join(".lz/part.nc")).unwrap(), packed);
        assert_eq!(std::fs::read(dir.path().join(".md5/part.nc")).unwrap(), DIGEST.as_bytes());
    }

    #[test]
    fn test_bad_container_fails_whole_upload() {
        let dir = tempfile::tempdir().unwrap();
        let mut packed = container_for(&content(2000));
        let last = packed.len() - 1;
        packed[last] ^= 0xFF;

        let packets = whole_file(&packed);
        let mut expected_writes = vec![CRC_REQUEST];
        expected_writes.resize(packets.len() + 1, ACK);

        let state = HostState::new();
        let host = HostContext::new(&state);
        let mut port = MockSerialPort::new(script(&packets), expected_writes);

        let name = dir.path().join("part.nc.lz");
        let err = upload(&host, &mut port, &name, &quick_config(), &ZstdCodec::default()).unwrap_err();

        assert!(matches!(err, TransferError::Decompress(container::ContainerError::Checksum { .. })));
        assert!(!dir.path().join("part.nc").exists());
        assert!(!dir.path().join(".lz/part.nc").exists());
        assert!(!dir.path().join(".md5/part.nc").exists());
    }

    #[test]
    fn test_packet_numbers_wrap() {
        let mut progress = Progress::default();
        assert_eq!(progress.classify(0).unwrap(), PacketKind::Identity);
        progress.identity_seen = true;
        assert_eq!(progress.classify(0).unwrap(), PacketKind::Duplicate);
        assert_eq!(progress.classify(1).unwrap(), PacketKind::Data);

        progress.last = 255;
        progress.data_seen = true;
        assert_eq!(progress.classify(0).unwrap(), PacketKind::Data);
        assert_eq!(progress.classify(255).unwrap(), PacketKind::Duplicate);
        assert!(matches!(progress.classify(2), Err(TransferError::Sequence { expected: 0, got: 2 })));
    }

    #[test]
    fn test_file_cursor_rewind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let mut cursor = FileCursor::create(&path).unwrap();
        cursor.write(b"kept").unwrap();
        cursor.mark();
        cursor.write(b"dropped").unwrap();
        cursor.rewind().unwrap();
        cursor.write(b"!").unwrap();
        drop(cursor);

        assert_eq!(std::fs::read(&path).unwrap(), b"kept!");
    }

    // ------------------------------------------------------------------------
    // Loopback: both engines over a piped transport
    // ------------------------------------------------------------------------

    fn loopback_config() -> TransferConfig {
        TransferConfig {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(1),
            zero_read_retries: 10,
            ..Default::default()
        }
    }

    fn loopback(kind: TransportKind, source: &Path, destination: &Path) {
        let (mut near, mut far) = pipe_pair(kind);
        let config = loopback_config();

        std::thread::scope(|scope| {
            let sender = scope.spawn(|| {
                let state = HostState::new();
                let host = HostContext::new(&state);
                download(&host, &mut near, source, &config)
            });

            let state = HostState::new();
            let host = HostContext::new(&state);
            let received = upload(&host, &mut far, destination, &config, &ZstdCodec::default());

            let sent = sender.join().unwrap().unwrap();
            let received = received.unwrap();
            assert_eq!(received.identity.as_deref(), Some(sent.identity.as_str()));
        });
    }

    #[test]
    fn test_loopback_serial() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let data = content(1000);
        std::fs::write(src.path().join("part.nc"), &data).unwrap();

        loopback(TransportKind::Serial, &src.path().join("part.nc"), &dst.path().join("part.nc"));

        assert_eq!(std::fs::read(dst.path().join("part.nc")).unwrap(), data);
        let digest = crate::digest::hash_file(&src.path().join("part.nc"), &crate::host::NoIdle).unwrap();
        assert_eq!(std::fs::read_to_string(dst.path().join(".md5/part.nc")).unwrap(), digest);
    }

    #[test]
    fn test_loopback_network() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let data = content(20_000);
        std::fs::write(src.path().join("big.nc"), &data).unwrap();

        loopback(TransportKind::Network, &src.path().join("big.nc"), &dst.path().join("big.nc"));

        assert_eq!(std::fs::read(dst.path().join("big.nc")).unwrap(), data);
    }

    #[test]
    fn test_loopback_compressed_sibling() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let data = content(5000);
        let plain = src.path().join("part.nc");
        std::fs::write(&plain, &data).unwrap();

        std::fs::create_dir_all(src.path().join(".lz")).unwrap();
        container::compress_file(&plain, &src.path().join(".lz/part.nc"), &ZstdCodec::default(), 1024).unwrap();

        loopback(TransportKind::Network, &plain, &dst.path().join("part.nc.lz"));

        assert_eq!(std::fs::read(dst.path().join("part.nc")).unwrap(), data);
    }
}
