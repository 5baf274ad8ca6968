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

//! Host-side collaborators of a transfer session
//!
//! The engines never touch host globals directly. They get a [`HostContext`]
//! and hold a [`Session`] for their whole run; dropping the session puts the
//! transfer flag and the receive interrupt back the way they were.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TransferError;
use crate::serial::TransportKind;

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Whether the subsystem that competes with transfers is idle.
pub trait BusyGate {
    fn is_idle(&self) -> bool;
}

impl<F: Fn() -> bool> BusyGate for F {
    fn is_idle(&self) -> bool {
        self()
    }
}

pub struct AlwaysIdle;

impl BusyGate for AlwaysIdle {
    fn is_idle(&self) -> bool {
        true
    }
}

/// Invoked from long synchronous loops so other work can make progress.
pub trait IdleNotifier {
    fn on_idle(&self);
}

impl<F: Fn()> IdleNotifier for F {
    fn on_idle(&self) {
        self()
    }
}

pub struct NoIdle;

impl IdleNotifier for NoIdle {
    fn on_idle(&self) {}
}

// ============================================================================
// Host State
// ============================================================================

#[derive(Debug)]
pub struct HostState {
    transfer_in_progress: AtomicBool,
    rx_interrupt: AtomicBool,
    session_active: AtomicBool,
}

impl Default for HostState {
    fn default() -> Self {
        HostState {
            transfer_in_progress: AtomicBool::new(false),
            rx_interrupt: AtomicBool::new(true),
            session_active: AtomicBool::new(false),
        }
    }
}

impl HostState {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn transfer_in_progress(&self) -> bool {
        self.transfer_in_progress.load(Ordering::SeqCst)
    }

    pub fn rx_interrupt_enabled(&self) -> bool {
        self.rx_interrupt.load(Ordering::SeqCst)
    }

    pub fn set_rx_interrupt(&self, enabled: bool) {
        self.rx_interrupt.store(enabled, Ordering::SeqCst);
    }
}

// ============================================================================
// Session Guard
// ============================================================================

/// Exclusive hold on the host for one transfer.
#[derive(Debug)]
pub struct Session<'h> {
    host: &'h HostState,
    restore_rx_interrupt: Option<bool>,
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if let Some(enabled) = self.restore_rx_interrupt {
            self.host.set_rx_interrupt(enabled);
        }
        self.host.transfer_in_progress.store(false, Ordering::SeqCst);
        self.host.session_active.store(false, Ordering::SeqCst);
        debug!("Session released");
    }
}

// ============================================================================
// Host Context
// ============================================================================

/// Everything an engine needs from its surroundings.
pub struct HostContext<'h> {
    pub state: &'h HostState,
    pub gate: &'h dyn BusyGate,
    pub idle: &'h dyn IdleNotifier,
    pub cancel: CancellationToken,
}

impl<'h> HostContext<'h> {
    pub fn new(state: &'h HostState) -> Self {
        HostContext {
            state,
            gate: &AlwaysIdle,
            idle: &NoIdle,
            cancel: CancellationToken::new(),
        }
    }

    #[cfg(test)]
    pub fn with_gate(mut self, gate: &'h dyn BusyGate) -> Self {
        self.gate = gate;
        self
    }

    #[cfg(test)]
    pub fn with_idle(mut self, idle: &'h dyn IdleNotifier) -> Self {
        self.idle = idle;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Takes the host for a session. Constrained transports lose their
    /// receive interrupt until the session is dropped. A busy gate or an
    /// already running session is reported as `Busy` with nothing changed.
    pub fn begin(&self, kind: TransportKind) -> Result<Session<'h>, TransferError> {
        let host = self.state;

        if host.session_active.swap(true, Ordering::SeqCst) {
            return Err(TransferError::Busy);
        }

        let restore_rx_interrupt = if kind.is_constrained() {
            let previous = host.rx_interrupt_enabled();
            host.set_rx_interrupt(false);
            Some(previous)
        } else {
            None
        };

        let session = Session { host, restore_rx_interrupt };

        if !self.gate.is_idle() {
            // Dropping the session undoes the interrupt change.
            drop(session);
            return Err(TransferError::Busy);
        }

        host.transfer_in_progress.store(true, Ordering::SeqCst);
        debug!("Session started ({:?})", kind);
        Ok(session)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_sets_and_restores_flags() {
        let state = HostState::new();
        let host = HostContext::new(&state);

        {
            let _session = host.begin(TransportKind::Serial).unwrap();
            assert!(state.transfer_in_progress());
            assert!(!state.rx_interrupt_enabled());
        }

        assert!(!state.transfer_in_progress());
        assert!(state.rx_interrupt_enabled());
    }

    #[test]
    fn test_network_session_leaves_interrupt_alone() {
        let state = HostState::new();
        state.set_rx_interrupt(false);
        let host = HostContext::new(&state);

        let session = host.begin(TransportKind::Network).unwrap();
        assert!(!state.rx_interrupt_enabled());
        drop(session);
        assert!(!state.rx_interrupt_enabled());
    }

    #[test]
    fn test_busy_gate_rejects_without_side_effects() {
        let state = HostState::new();
        let gate = || false;
        let host = HostContext::new(&state).with_gate(&gate);

        assert!(matches!(host.begin(TransportKind::Serial), Err(TransferError::Busy)));
        assert!(!state.transfer_in_progress());
        assert!(state.rx_interrupt_enabled());
    }

    #[test]
    fn test_second_session_rejected() {
        let state = HostState::new();
        let host = HostContext::new(&state);

        let first = host.begin(TransportKind::Network).unwrap();
        assert!(matches!(host.begin(TransportKind::Network), Err(TransferError::Busy)));
        assert!(state.transfer_in_progress());
        drop(first);

        assert!(host.begin(TransportKind::Network).is_ok());
    }
}
