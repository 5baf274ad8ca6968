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

//! Blocking reads with explicit deadlines over a [`Transport`]
//!
//! Every wait in a session goes through a [`Deadline`], which carries both
//! the timeout window and the session's cancellation token. While waiting,
//! the calling thread sleeps on the transport for one poll slice at a time
//! and yields between slices.

use std::io::ErrorKind;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::TransferError;
use crate::protocol::{CAN, TransferConfig};
use crate::serial::{Transport, TransportKind};

/// Upper bound on bytes discarded by a single flush.
const FLUSH_LIMIT: usize = 64 * 1024;

// ============================================================================
// Deadline
// ============================================================================

/// Point in time a blocking read gives up, plus the token that aborts it early.
#[derive(Debug, Clone, Copy)]
pub struct Deadline<'c> {
    expires: Instant,
    cancel: &'c CancellationToken,
}

impl<'c> Deadline<'c> {
    pub fn after(timeout: Duration, cancel: &'c CancellationToken) -> Self {
        Deadline { expires: Instant::now() + timeout, cancel }
    }

    /// Time left, or the reason there is none.
    pub fn check(&self) -> Result<Duration, TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Canceled);
        }
        let remaining = self.expires.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransferError::Timeout);
        }
        Ok(remaining)
    }
}

// ============================================================================
// Link
// ============================================================================

pub struct Link<'a> {
    transport: &'a mut dyn Transport,
    cancel: CancellationToken,
    timeout: Duration,
    poll_interval: Duration,
    zero_read_retries: u32,
}

impl<'a> Link<'a> {
    pub fn new(transport: &'a mut dyn Transport, config: &TransferConfig, cancel: CancellationToken) -> Self {
        Link {
            transport,
            cancel,
            timeout: config.timeout,
            poll_interval: config.poll_interval,
            zero_read_retries: config.zero_read_retries,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<(), TransferError> {
        self.transport.write_all(bytes)?;
        Ok(())
    }

    pub fn send_byte(&mut self, byte: u8) -> Result<(), TransferError> {
        trace!("Sent: 0x{:02X}", byte);
        self.send(&[byte])
    }

    /// Waits for whatever arrives first. `Ok(0)` means the transport reported
    /// ready but delivered nothing.
    pub fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        let deadline = Deadline::after(self.timeout, &self.cancel);
        loop {
            let remaining = deadline.check()?;
            match self.transport.read_timeout(buf, remaining.min(self.poll_interval)) {
                Ok(n) => return Ok(n),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    std::thread::yield_now();
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Single control byte. A timeout is `Ok(None)`; cancellation is an error.
    pub fn read_control(&mut self) -> Result<Option<u8>, TransferError> {
        let deadline = Deadline::after(self.timeout, &self.cancel);
        let mut buf = [0u8; 1];
        loop {
            let remaining = match deadline.check() {
                Ok(remaining) => remaining,
                Err(TransferError::Timeout) => return Ok(None),
                Err(e) => return Err(e),
            };
            match self.transport.read_timeout(&mut buf, remaining.min(self.poll_interval)) {
                Ok(1) => {
                    trace!("Received: 0x{:02X}", buf[0]);
                    return Ok(Some(buf[0]));
                }
                Ok(_) => std::thread::yield_now(),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    std::thread::yield_now();
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reads at least one byte, absorbing up to the retry budget of empty
    /// reads. Running out of time or retries is a read failure.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        let mut retries = self.zero_read_retries;
        loop {
            match self.read_some(buf) {
                Ok(0) if retries > 0 => retries -= 1,
                Ok(0) | Err(TransferError::Timeout) => return Err(TransferError::ReadFailed),
                other => return other,
            }
        }
    }

    /// Fills as much of `buf` as arrives, returning how much that was.
    pub fn fill(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read_chunk(&mut buf[filled..]) {
                Ok(n) => filled += n,
                Err(TransferError::ReadFailed) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    /// Discards input that is already waiting.
    pub fn flush_input(&mut self) {
        let mut scratch = [0u8; 256];
        let mut discarded = 0;
        while discarded < FLUSH_LIMIT {
            match self.transport.read_timeout(&mut scratch, Duration::ZERO) {
                Ok(0) | Err(_) => break,
                Ok(n) => discarded += n,
            }
        }
        if discarded > 0 {
            debug!("Flushed {} bytes of pending input", discarded);
        }
    }

    /// Tells the remote to give up and drops whatever it already sent.
    pub fn cancel_transfer(&mut self) {
        if let Err(e) = self.send_byte(CAN) {
            warn!(error = %e, "failed to send cancel");
        }
        self.flush_input();
    }
}

// ============================================================================
// Tests
// ============================================================================
