// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reliable queueing publisher.
//!
//! Producers enqueue into a bounded channel and return at once. One
//! background task owns the connection and drains the queue:
//!
//! ```text
//!   publish() ──try_send──► [ bounded queue ] ──recv──► worker ──► channel.publish()
//!        │                        ▲                        │
//!        └─ full: drop + count    └──── requeue (tail) ◄───┘ on failure
//! ```
//!
//! # Worker Loop
//!
//! - **Disconnected**: connect, declare the exchange, optionally enable
//!   confirms. Success resets the backoff; failure sleeps the next backoff
//!   delay (interruptible by stop) and tries again.
//! - **Connected**: pump the keepalive, pop one entry with a short timeout,
//!   serialize it, publish it. A failed publish goes back to the tail of the
//!   queue, the connection is torn down and the worker backs off before
//!   reconnecting. Delivery is at-least-once; a retried entry may land
//!   behind newer ones.
//!
//! Serialization failures drop the entry and leave the connection alone.
//!
//! # Shutdown
//!
//! [`ReliablePublisher::disconnect()`] raises the stop signal, waits up to the
//! configured grace period for the worker, and aborts it on expiry. Aborting
//! drops the worker's connection, which closes the socket.

use crate::config::ReliableConfig;
use crate::connection::{ConnectionState, ConnectionStateMachine};
use crate::error::{BrokerError, Result};
use crate::event::QueueEntry;
use crate::metrics;
use crate::resilience::Backoff;
use crate::transport::{ReliableChannel, ReliableConnector};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Publisher lifecycle, guarded by one async mutex.
enum Lifecycle {
    /// Built but not started. Publishes are buffered.
    Idle {
        queue_rx: mpsc::Receiver<QueueEntry>,
        machine: ConnectionStateMachine,
    },
    /// Worker task running.
    Running {
        stop_tx: watch::Sender<bool>,
        handle: JoinHandle<()>,
    },
    /// Stopped for good. The queue is closed.
    Stopped,
}

impl Lifecycle {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle { .. } => "idle",
            Self::Running { .. } => "running",
            Self::Stopped => "stopped",
        }
    }
}

/// Bounded-queue publisher with reconnect, backoff and optional confirms.
pub struct ReliablePublisher {
    config: ReliableConfig,
    connector: Arc<dyn ReliableConnector>,
    queue_tx: mpsc::Sender<QueueEntry>,
    state_rx: watch::Receiver<ConnectionState>,
    lifecycle: Mutex<Lifecycle>,
}

impl ReliablePublisher {
    /// Build a publisher over `connector`. Nothing touches the network until
    /// [`connect()`](Self::connect).
    pub fn new(config: ReliableConfig, connector: Arc<dyn ReliableConnector>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let machine = ConnectionStateMachine::new(connector.name(), Backoff::from_config(&config));
        let state_rx = machine.subscribe();

        Self {
            config,
            connector,
            queue_tx,
            state_rx,
            lifecycle: Mutex::new(Lifecycle::Idle { queue_rx, machine }),
        }
    }

    pub fn transport(&self) -> &'static str {
        self.connector.name()
    }

    pub fn config(&self) -> &ReliableConfig {
        &self.config
    }

    /// Current connection state (as last written by the worker).
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch connection state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Entries waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.queue_tx.max_capacity()
    }

    /// Non-blocking enqueue.
    ///
    /// Fails with [`BrokerError::Backpressure`] when the queue is full (the
    /// entry is dropped) and [`BrokerError::Shutdown`] once stopped.
    pub fn publish(&self, entry: QueueEntry) -> Result<()> {
        let transport = self.connector.name();
        match self.queue_tx.try_send(entry) {
            Ok(()) => {
                metrics::record_enqueued(transport);
                metrics::record_queue_depth(transport, self.queue_len());
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                metrics::record_dropped(transport, "queue_full");
                Err(BrokerError::Backpressure {
                    capacity: self.capacity(),
                })
            }
            Err(TrySendError::Closed(_)) => {
                metrics::record_dropped(transport, "shutdown");
                Err(BrokerError::Shutdown)
            }
        }
    }

    /// Start the worker. Idempotent while running; a stopped publisher
    /// cannot be restarted.
    pub async fn connect(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Idle { queue_rx, machine } => {
                let (stop_tx, stop_rx) = watch::channel(false);
                let worker = Worker {
                    exchange: self.config.exchange.clone(),
                    confirm_delivery: self.config.confirm_delivery,
                    poll_interval: self.config.poll_interval(),
                    connector: Arc::clone(&self.connector),
                    queue_rx,
                    requeue_tx: self.queue_tx.clone(),
                    machine,
                    stop_rx,
                    channel: None,
                };
                let handle = tokio::spawn(worker.run());
                info!(
                    transport = self.connector.name(),
                    exchange = %self.config.exchange,
                    buffered = self.queue_len(),
                    "Reliable publisher started"
                );
                *lifecycle = Lifecycle::Running { stop_tx, handle };
                Ok(())
            }
            running @ Lifecycle::Running { .. } => {
                *lifecycle = running;
                Ok(())
            }
            Lifecycle::Stopped => Err(BrokerError::InvalidState {
                expected: "idle or running".to_string(),
                actual: "stopped".to_string(),
            }),
        }
    }

    /// Stop the worker within the grace period. Idempotent; safe before
    /// [`connect()`](Self::connect).
    pub async fn disconnect(&self) {
        let previous = {
            let mut lifecycle = self.lifecycle.lock().await;
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        };
        let transport = self.connector.name();

        match previous {
            Lifecycle::Idle { queue_rx, .. } => {
                if !queue_rx.is_empty() {
                    warn!(transport, dropped = queue_rx.len(), "Publisher stopped before start, buffered messages dropped");
                }
                debug!(transport, "Publisher stopped before start");
            }
            Lifecycle::Running { stop_tx, mut handle } => {
                let _ = stop_tx.send(true);
                let grace = self.config.shutdown_grace();
                match tokio::time::timeout(grace, &mut handle).await {
                    Ok(Ok(())) => debug!(transport, "Worker stopped gracefully"),
                    Ok(Err(e)) => warn!(transport, error = %e, "Worker panicked during shutdown"),
                    Err(_) => {
                        warn!(transport, grace_ms = grace.as_millis() as u64, "Worker did not stop in time, aborting");
                        handle.abort();
                    }
                }
                info!(transport, "Reliable publisher stopped");
            }
            Lifecycle::Stopped => {
                trace!(transport, "Publisher already stopped");
            }
        }
    }

    /// Lifecycle phase name (`idle`, `running`, `stopped`).
    pub async fn phase(&self) -> &'static str {
        self.lifecycle.lock().await.name()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of one connected-branch step.
enum Step {
    Continue,
    Reconnect,
    Stop,
}

struct Worker {
    exchange: String,
    confirm_delivery: bool,
    poll_interval: Duration,
    connector: Arc<dyn ReliableConnector>,
    queue_rx: mpsc::Receiver<QueueEntry>,
    requeue_tx: mpsc::Sender<QueueEntry>,
    machine: ConnectionStateMachine,
    stop_rx: watch::Receiver<bool>,
    channel: Option<Box<dyn ReliableChannel>>,
}

impl Worker {
    async fn run(mut self) {
        let span = info_span!("reliable_publisher", transport = self.connector.name(), exchange = %self.exchange);

        async move {
            info!("Starting publisher worker");

            loop {
                if *self.stop_rx.borrow() {
                    break;
                }

                if self.channel.is_none() {
                    if !self.connect_or_backoff().await {
                        break;
                    }
                    continue;
                }

                match self.step().await {
                    Step::Continue => {}
                    Step::Reconnect => {
                        self.teardown().await;
                        if !self.backoff().await {
                            break;
                        }
                    }
                    Step::Stop => break,
                }
            }

            self.shutdown().await;
            info!("Publisher worker stopped");
        }
        .instrument(span)
        .await
    }

    /// Disconnected branch. Returns `false` when stop was requested.
    async fn connect_or_backoff(&mut self) -> bool {
        if let Err(e) = self.machine.begin_connect() {
            error!(error = %e, "Illegal connection state");
        }

        let attempt = tokio::select! {
            result = open_channel(self.connector.as_ref(), &self.exchange, self.confirm_delivery) => result,
            _ = self.stop_rx.wait_for(|stop| *stop) => return false,
        };

        match attempt {
            Ok(channel) => {
                self.channel = Some(channel);
                if let Err(e) = self.machine.connected() {
                    error!(error = %e, "Illegal connection state");
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "Connect failed");
                self.backoff().await
            }
        }
    }

    /// Mark the connection failed and sleep the backoff delay.
    /// Returns `false` when stop was requested during the wait.
    async fn backoff(&mut self) -> bool {
        let delay = match self.machine.failed() {
            Ok(delay) => delay,
            Err(e) => {
                error!(error = %e, "Illegal connection state");
                self.machine.backoff().floor()
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.stop_rx.wait_for(|stop| *stop) => false,
        }
    }

    /// Connected branch: keepalive, pop, serialize, publish.
    async fn step(&mut self) -> Step {
        let Some(channel) = self.channel.as_mut() else {
            return Step::Reconnect;
        };

        if let Err(e) = channel.heartbeat().await {
            warn!(error = %e, "Keepalive failed, reconnecting");
            return Step::Reconnect;
        }

        let entry = tokio::select! {
            popped = tokio::time::timeout(self.poll_interval, self.queue_rx.recv()) => match popped {
                Ok(Some(entry)) => entry,
                // Empty; the worker's own sender keeps the queue open
                Ok(None) | Err(_) => return Step::Continue,
            },
            _ = self.stop_rx.wait_for(|stop| *stop) => return Step::Stop,
        };

        let transport = self.connector.name();
        metrics::record_queue_depth(transport, self.requeue_tx.max_capacity() - self.requeue_tx.capacity());

        let body = match entry.to_json() {
            Ok(body) => body,
            Err(e) => {
                error!(routing_key = %entry.routing_key, error = %e, "Payload serialization failed, message dropped");
                metrics::record_dropped(transport, "serialization");
                return Step::Continue;
            }
        };

        let start = Instant::now();
        let result = channel.publish(&self.exchange, &entry.routing_key, &body).await;
        match result {
            Ok(()) => {
                metrics::record_publish(transport, true, start.elapsed());
                trace!(routing_key = %entry.routing_key, bytes = body.len(), "Published");
                Step::Continue
            }
            Err(e) => {
                metrics::record_publish(transport, false, start.elapsed());
                warn!(routing_key = %entry.routing_key, error = %e, "Publish failed, requeueing");
                self.requeue(entry);
                Step::Reconnect
            }
        }
    }

    /// Push a failed entry back onto the tail of the queue.
    fn requeue(&self, entry: QueueEntry) {
        let transport = self.connector.name();
        match self.requeue_tx.try_send(entry) {
            Ok(()) => metrics::record_requeued(transport),
            Err(TrySendError::Full(entry)) | Err(TrySendError::Closed(entry)) => {
                error!(routing_key = %entry.routing_key, "Queue full on requeue, message dropped");
                metrics::record_dropped(transport, "queue_full");
            }
        }
    }

    async fn teardown(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Error closing connection");
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.machine.closing() {
            error!(error = %e, "Illegal connection state");
        }
        self.teardown().await;
        if let Err(e) = self.machine.closed() {
            error!(error = %e, "Illegal connection state");
        }
        let remaining = self.queue_rx.len();
        if remaining > 0 {
            warn!(remaining, "Messages left undelivered at shutdown");
            for _ in 0..remaining {
                metrics::record_dropped(self.connector.name(), "shutdown");
            }
        }
    }
}

/// Open a connection, declare the exchange and optionally enable confirms.
async fn open_channel(
    connector: &dyn ReliableConnector,
    exchange: &str,
    confirm_delivery: bool,
) -> Result<Box<dyn ReliableChannel>> {
    let mut channel = connector.connect().await?;

    if let Err(e) = channel.declare(exchange).await {
        let _ = channel.close().await;
        return Err(e);
    }

    if confirm_delivery {
        if let Err(e) = channel.enable_confirms().await {
            warn!(error = %e, "Could not enable delivery confirmation, publishing without it");
        }
    }

    Ok(channel)
}
