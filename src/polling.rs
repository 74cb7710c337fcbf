// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Polling publisher.
//!
//! The simpler transport: an unbounded queue behind one lock, drained by a
//! background task that makes one request per message.
//!
//! # Delivery
//!
//! At-most-once. A failed publish drops the message, discards the client
//! handle (so the next attempt re-opens and re-authenticates) and pauses for
//! the retry interval. This differs on purpose from
//! [`ReliablePublisher`](crate::reliable::ReliablePublisher), which requeues.
//!
//! # Connect
//!
//! [`PollingPublisher::connect()`] opens a client and checks the target exists
//! before starting the worker. A failure is returned to the caller and the
//! publisher stays startable.

use crate::config::PollingConfig;
use crate::error::{BrokerError, Result};
use crate::event::QueueEntry;
use crate::metrics;
use crate::transport::{PollingClient, PollingConnector};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Unbounded FIFO shared by producers and the worker.
#[derive(Debug, Default)]
struct SharedQueue {
    entries: StdMutex<VecDeque<QueueEntry>>,
}

impl SharedQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<QueueEntry>> {
        // A panic while holding the lock cannot leave the deque half-updated
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, entry: QueueEntry) -> usize {
        let mut entries = self.lock();
        entries.push_back(entry);
        entries.len()
    }

    fn pop(&self) -> Option<QueueEntry> {
        self.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn drain(&self) -> usize {
        let mut entries = self.lock();
        let count = entries.len();
        entries.clear();
        count
    }
}

enum Lifecycle {
    Idle,
    Running {
        stop_tx: watch::Sender<bool>,
        handle: JoinHandle<()>,
    },
    Stopped,
}

/// Unbounded-queue publisher with at-most-once delivery.
pub struct PollingPublisher {
    config: PollingConfig,
    connector: Arc<dyn PollingConnector>,
    queue: Arc<SharedQueue>,
    accepting: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

impl PollingPublisher {
    pub fn new(config: PollingConfig, connector: Arc<dyn PollingConnector>) -> Self {
        Self {
            config,
            connector,
            queue: Arc::new(SharedQueue::default()),
            accepting: AtomicBool::new(true),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    pub fn transport(&self) -> &'static str {
        self.connector.name()
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Entries waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// O(1) enqueue. Never blocks on the network; fails only once stopped.
    pub fn publish(&self, entry: QueueEntry) -> Result<()> {
        let transport = self.connector.name();
        if !self.accepting.load(Ordering::Acquire) {
            metrics::record_dropped(transport, "shutdown");
            return Err(BrokerError::Shutdown);
        }
        let depth = self.queue.push(entry);
        metrics::record_enqueued(transport);
        metrics::record_queue_depth(transport, depth);
        Ok(())
    }

    /// Check the target and start the worker.
    ///
    /// Idempotent while running. A failed check returns
    /// [`BrokerError::Connection`] and leaves the publisher startable.
    pub async fn connect(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match &*lifecycle {
            Lifecycle::Running { .. } => return Ok(()),
            Lifecycle::Stopped => {
                return Err(BrokerError::InvalidState {
                    expected: "idle or running".to_string(),
                    actual: "stopped".to_string(),
                })
            }
            Lifecycle::Idle => {}
        }

        let transport = self.connector.name();
        let client = match self.open_checked().await {
            Ok(client) => client,
            Err(e) => {
                metrics::record_connection_attempt(transport, false);
                error!(transport, target = %self.config.target, error = %e, "Publish target check failed");
                return Err(e);
            }
        };
        metrics::record_connection_attempt(transport, true);

        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = Worker {
            config: self.config.clone(),
            connector: Arc::clone(&self.connector),
            queue: Arc::clone(&self.queue),
            client: Some(client),
            stop_rx,
        };
        let handle = tokio::spawn(worker.run());
        info!(transport, target = %self.config.target, "Polling publisher started");

        *lifecycle = Lifecycle::Running { stop_tx, handle };
        Ok(())
    }

    async fn open_checked(&self) -> Result<Box<dyn PollingClient>> {
        let client = self.connector.open().await?;
        client.check_target(&self.config.target).await?;
        Ok(client)
    }

    /// Stop the worker within the grace period. Idempotent; safe before
    /// [`connect()`](Self::connect).
    pub async fn disconnect(&self) {
        self.accepting.store(false, Ordering::Release);
        let previous = {
            let mut lifecycle = self.lifecycle.lock().await;
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        };
        let transport = self.connector.name();

        if let Lifecycle::Running { stop_tx, mut handle } = previous {
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
            info!(transport, "Polling publisher stopped");
        }

        let dropped = self.queue.drain();
        if dropped > 0 {
            warn!(transport, dropped, "Undelivered messages dropped at shutdown");
            for _ in 0..dropped {
                metrics::record_dropped(transport, "shutdown");
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════════════

struct Worker {
    config: PollingConfig,
    connector: Arc<dyn PollingConnector>,
    queue: Arc<SharedQueue>,
    client: Option<Box<dyn PollingClient>>,
    stop_rx: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        let span = info_span!("polling_publisher", transport = self.connector.name(), target = %self.config.target);

        async move {
            info!("Starting publisher worker");

            while !*self.stop_rx.borrow() {
                let Some(entry) = self.queue.pop() else {
                    if !self.pause(self.config.idle_interval()).await {
                        break;
                    }
                    continue;
                };

                if let Err(e) = self.deliver(&entry).await {
                    warn!(routing_key = %entry.routing_key, error = %e, "Publish failed, message dropped");
                    metrics::record_dropped(self.connector.name(), "publish_failed");
                    // Force re-open (and re-authentication) on the next attempt
                    self.client = None;
                    if !self.pause(self.config.retry_interval()).await {
                        break;
                    }
                }
            }

            info!("Publisher worker stopped");
        }
        .instrument(span)
        .await
    }

    /// Sleep, returning `false` if stop was requested meanwhile.
    async fn pause(&mut self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.stop_rx.wait_for(|stop| *stop) => false,
        }
    }

    async fn deliver(&mut self, entry: &QueueEntry) -> Result<()> {
        let transport = self.connector.name();

        let body = match entry.to_json_string() {
            Ok(body) => body,
            Err(e) => {
                // Not a transport failure: keep the client
                error!(routing_key = %entry.routing_key, error = %e, "Payload serialization failed, message dropped");
                metrics::record_dropped(transport, "serialization");
                return Ok(());
            }
        };

        if self.client.is_none() {
            debug!("Re-opening client");
            self.client = Some(self.connector.open().await?);
        }
        let Some(client) = self.client.as_ref() else {
            return Err(BrokerError::connection(transport, "No client"));
        };

        let start = Instant::now();
        let result = client.publish(&self.config.target, &entry.routing_key, body).await;
        metrics::record_publish(transport, result.is_ok(), start.elapsed());
        let message_id = result?;

        trace!(routing_key = %entry.routing_key, message_id = %message_id, "Published");
        Ok(())
    }
}
