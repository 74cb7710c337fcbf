// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection state machine for the reliable transport.
//!
//! # Connection Lifecycle
//!
//! ```text
//!                 connect ok
//! Disconnected → Connecting → Connected
//!      ↑             │            │
//!      └── backoff ←─┴── error ←──┘
//!
//! any of the above ── stop ──→ Closing ──→ Disconnected
//! ```
//!
//! The machine is owned by exactly one publisher worker (single writer).
//! Everyone else observes it through a [`watch::Receiver`] obtained from
//! [`ConnectionStateMachine::subscribe()`]; producers never touch it.

use crate::error::{BrokerError, Result};
use crate::metrics;
use crate::resilience::Backoff;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// State of a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection (initial state, and after any failure).
    Disconnected,
    /// Opening the connection and declaring the exchange.
    Connecting,
    /// Connected and publishing.
    Connected,
    /// Stop requested, tearing the connection down.
    Closing,
}

impl ConnectionState {
    /// Whether `self → to` is a legal transition.
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Disconnected, Closing)
                | (Connecting, Closing)
                | (Connected, Closing)
                | (Closing, Disconnected)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state plus reconnect backoff, owned by one worker.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    transport: &'static str,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    backoff: Backoff,
    /// Consecutive failed connects (reset on success).
    failures: u64,
}

impl ConnectionStateMachine {
    pub fn new(transport: &'static str, backoff: Backoff) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            state: ConnectionState::Disconnected,
            state_tx,
            backoff,
            failures: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Consecutive connect failures since the last success.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Watch state changes from outside the worker.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Move to `to`, rejecting illegal transitions.
    pub fn transition(&mut self, to: ConnectionState) -> Result<()> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition_to(to) {
            return Err(BrokerError::InvalidState {
                expected: format!("a state that can move to {}", to),
                actual: self.state.to_string(),
            });
        }
        debug!(transport = self.transport, from = %self.state, to = %to, "Connection state change");
        self.state = to;
        self.state_tx.send_replace(to);
        metrics::record_connection_state(self.transport, to.as_str());
        Ok(())
    }

    /// A connect attempt is starting.
    pub fn begin_connect(&mut self) -> Result<()> {
        self.transition(ConnectionState::Connecting)
    }

    /// The connect attempt succeeded: reset backoff.
    pub fn connected(&mut self) -> Result<()> {
        self.transition(ConnectionState::Connected)?;
        if self.failures > 0 {
            info!(transport = self.transport, failures = self.failures, "Connected after retry");
        } else {
            info!(transport = self.transport, "Connected");
        }
        self.failures = 0;
        self.backoff.reset();
        metrics::record_connection_attempt(self.transport, true);
        Ok(())
    }

    /// A connect attempt or a live connection failed.
    ///
    /// Returns the delay to wait before the next attempt and doubles the
    /// backoff for the attempt after that.
    pub fn failed(&mut self) -> Result<Duration> {
        if self.state == ConnectionState::Connecting {
            metrics::record_connection_attempt(self.transport, false);
        }
        self.transition(ConnectionState::Disconnected)?;
        self.failures += 1;
        let delay = self.backoff.next_delay();
        warn!(
            transport = self.transport,
            failures = self.failures,
            delay_ms = delay.as_millis() as u64,
            "Connection unavailable, backing off"
        );
        Ok(delay)
    }

    /// Stop requested.
    pub fn closing(&mut self) -> Result<()> {
        self.transition(ConnectionState::Closing)
    }

    /// Teardown finished.
    pub fn closed(&mut self) -> Result<()> {
        self.transition(ConnectionState::Disconnected)
    }
}
