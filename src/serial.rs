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

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use serialport::{SerialPort as SerialPortTrait, DataBits, Parity, StopBits};

/// Shortest wait handed to a device; some drivers treat zero as "block forever".
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

// ============================================================================
// Transport Trait
// ============================================================================

/// Which medium a transport runs over. Serial is the constrained one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Serial,
    Network,
}

impl TransportKind {
    /// Constrained links get small blocks and have their receive interrupt
    /// taken over for the length of a session.
    pub fn is_constrained(self) -> bool {
        matches!(self, TransportKind::Serial)
    }

    /// Largest single write the sender hands to the transport.
    pub fn write_chunk_size(self) -> usize {
        match self {
            TransportKind::Serial => 128,
            TransportKind::Network => 4096,
        }
    }
}

/// Byte stream the transfer engines run over
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    /// Reads whatever is available within `timeout`. Nothing arriving is
    /// reported as `ErrorKind::TimedOut`.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Serial transport on top of the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
}

impl RealSerialPort {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(100))
            .open()?;

        Ok(RealSerialPort { port })
    }
}

impl Transport for RealSerialPort {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.port.set_timeout(timeout.max(MIN_READ_TIMEOUT))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        self.port.read(buf)
    }
}

// ============================================================================
// Network Implementation
// ============================================================================

/// Network transport used for the wireless link
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(addr: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(TcpTransport { stream })
    }
}

impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(buf)?;
        self.stream.flush()
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.stream.set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT)))?;
        match self.stream.read(buf) {
            Ok(0) if !buf.is_empty() => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no data",
            )),
            other => other,
        }
    }
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

#[cfg(test)]
pub struct MockSerialPort {
    kind: TransportKind,
    // Data to return on reads (None = timeout)
    read_buffer: Vec<Option<u8>>,
    read_pos: usize,
    // Track what was written
    write_log: Vec<u8>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
}

#[cfg(test)]
impl MockSerialPort {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockSerialPort {
            kind: TransportKind::Serial,
            read_buffer: responses,
            read_pos: 0,
            write_log: Vec::new(),
            expected_writes,
        }
    }

    pub fn network(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        let mut port = Self::new(responses, expected_writes);
        port.kind = TransportKind::Network;
        port
    }
}

#[cfg(test)]
impl Transport for MockSerialPort {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.write_log.extend_from_slice(buf);
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> std::io::Result<usize> {
        // Out of responses = timeout
        if self.read_pos >= self.read_buffer.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Mock timeout"
            ));
        }

        // If current response is None = timeout
        if self.read_buffer[self.read_pos].is_none() {
            self.read_pos += 1;
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Mock timeout"
            ));
        }

        let mut bytes_read = 0;
        while bytes_read < buf.len() && self.read_pos < self.read_buffer.len() {
            match self.read_buffer[self.read_pos] {
                Some(byte) => {
                    buf[bytes_read] = byte;
                    bytes_read += 1;
                    self.read_pos += 1;
                }
                None => break,  // Stop at timeout marker
            }
        }

        Ok(bytes_read)
    }
}

#[cfg(test)]
impl Drop for MockSerialPort {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert_eq!(
            self.read_pos,
            self.read_buffer.len(),
            "MockSerialPort dropped with {} unconsumed responses (read {} of {} bytes)",
            self.read_buffer.len() - self.read_pos,
            self.read_pos,
            self.read_buffer.len()
        );

        assert_eq!(
            &self.write_log,
            &self.expected_writes,
            "MockSerialPort write log mismatch!\nExpected {} bytes:\n{:02X?}\nGot {} bytes:\n{:02X?}",
            self.expected_writes.len(),
            self.expected_writes,
            self.write_log.len(),
            self.write_log
        );
    }
}

// ============================================================================
// In-Memory Pipe for Loopback Testing
// ============================================================================

/// One end of a bidirectional in-memory byte pipe
#[cfg(test)]
pub struct PipeTransport {
    kind: TransportKind,
    tx: std::sync::mpsc::Sender<u8>,
    rx: std::sync::mpsc::Receiver<u8>,
}

#[cfg(test)]
pub fn pipe_pair(kind: TransportKind) -> (PipeTransport, PipeTransport) {
    let (a_tx, b_rx) = std::sync::mpsc::channel();
    let (b_tx, a_rx) = std::sync::mpsc::channel();
    (
        PipeTransport { kind, tx: a_tx, rx: a_rx },
        PipeTransport { kind, tx: b_tx, rx: b_rx },
    )
}

#[cfg(test)]
impl Transport for PipeTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        for &byte in buf {
            self.tx.send(byte).map_err(|_| std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer hung up",
            ))?;
        }
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        use std::sync::mpsc::{RecvTimeoutError, TryRecvError};

        if buf.is_empty() {
            return Ok(0);
        }

        match self.rx.recv_timeout(timeout) {
            Ok(byte) => buf[0] = byte,
            Err(RecvTimeoutError::Timeout) => {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "pipe idle"));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer hung up"));
            }
        }

        let mut n = 1;
        while n < buf.len() {
            match self.rx.try_recv() {
                Ok(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(n)
    }
}
