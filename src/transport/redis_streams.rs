// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Streams backend for the reliable transport.
//!
//! The exchange is a stream key; every publish is one `XADD` entry:
//!
//! ```text
//! XADD <exchange> * routing_key <rk> content_type application/json payload <json>
//! ```
//!
//! Consumers bind to the stream with consumer groups and filter on
//! `routing_key`. Delivery confirmation uses `WAIT <replicas> <timeout>`: the
//! publish only counts once the required number of replicas acknowledged
//! the write.
//!
//! # Keepalive
//!
//! A multiplexed connection has no broker-driven heartbeat, so the channel
//! sends `PING` once the connection has been idle for half the configured
//! heartbeat. A heartbeat of zero disables it.

use super::{BoxFuture, ReliableChannel, ReliableConnector};
use crate::config::ReliableConfig;
use crate::error::BrokerError;
use crate::metrics;
use redis::aio::MultiplexedConnection;
use redis::Client;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

const TRANSPORT: &str = "redis";

/// Content type recorded on every stream entry.
pub const CONTENT_TYPE: &str = "application/json";

/// Opens multiplexed Redis connections.
pub struct RedisStreamConnector {
    client: Client,
    url: String,
    connect_timeout: Duration,
    heartbeat: Duration,
    confirm_replicas: u32,
    confirm_timeout: Duration,
}

impl RedisStreamConnector {
    /// Build a connector. An unparsable URL is a configuration error.
    pub fn new(config: &ReliableConfig) -> crate::error::Result<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| BrokerError::Config(format!("Invalid Redis URL: {}", e)))?;
        Ok(Self {
            client,
            url: config.url.clone(),
            connect_timeout: config.connect_timeout(),
            heartbeat: config.heartbeat(),
            confirm_replicas: config.confirm_replicas,
            confirm_timeout: config.confirm_timeout(),
        })
    }
}

impl ReliableConnector for RedisStreamConnector {
    fn name(&self) -> &'static str {
        TRANSPORT
    }

    fn connect(&self) -> BoxFuture<'_, Box<dyn ReliableChannel>> {
        Box::pin(async move {
            debug!(url = %self.url, "Opening Redis connection");

            // Wrap connection attempt in a timeout to avoid hanging on unreachable hosts
            let conn = match timeout(
                self.connect_timeout,
                self.client.get_multiplexed_async_connection(),
            )
            .await
            {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => return Err(BrokerError::connection(TRANSPORT, e.to_string())),
                Err(_) => {
                    return Err(BrokerError::connection(
                        TRANSPORT,
                        format!("Connection timed out after {:?}", self.connect_timeout),
                    ))
                }
            };

            let channel = RedisStreamChannel {
                conn: Some(conn),
                heartbeat: self.heartbeat,
                last_activity: Instant::now(),
                confirm: None,
                confirm_replicas: self.confirm_replicas,
                confirm_timeout: self.confirm_timeout,
            };
            Ok(Box::new(channel) as Box<dyn ReliableChannel>)
        })
    }
}

/// One open Redis connection.
pub struct RedisStreamChannel {
    conn: Option<MultiplexedConnection>,
    heartbeat: Duration,
    last_activity: Instant,
    /// `(replicas, timeout)` once confirms are enabled.
    confirm: Option<(u32, Duration)>,
    confirm_replicas: u32,
    confirm_timeout: Duration,
}

impl RedisStreamChannel {
    fn connection(&mut self) -> crate::error::Result<&mut MultiplexedConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| BrokerError::connection(TRANSPORT, "Connection closed"))
    }
}

/// Whether a keepalive is due after `idle` without traffic.
pub(crate) fn keepalive_due(heartbeat: Duration, idle: Duration) -> bool {
    !heartbeat.is_zero() && idle >= heartbeat / 2
}

impl ReliableChannel for RedisStreamChannel {
    fn declare<'a>(&'a mut self, exchange: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let conn = self.connection()?;
            let kind: String = redis::cmd("TYPE")
                .arg(exchange)
                .query_async(conn)
                .await
                .map_err(|e| {
                    BrokerError::connection(TRANSPORT, format!("Declare of {} failed: {}", exchange, e))
                })?;

            // A stream is created by its first XADD
            match kind.as_str() {
                "stream" | "none" => {
                    self.last_activity = Instant::now();
                    debug!(exchange, existing = kind == "stream", "Exchange declared");
                    Ok(())
                }
                other => Err(BrokerError::connection(
                    TRANSPORT,
                    format!("Exchange key {} exists with type {}", exchange, other),
                )),
            }
        })
    }

    fn enable_confirms(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.connection()?;
            // WAIT 0 0 returns at once; it fails where WAIT is not supported
            let _: i64 = redis::cmd("WAIT")
                .arg(0)
                .arg(0)
                .query_async(conn)
                .await
                .map_err(|e| {
                    BrokerError::connection(TRANSPORT, format!("Confirms unavailable: {}", e))
                })?;
            self.confirm = Some((self.confirm_replicas, self.confirm_timeout));
            info!(
                replicas = self.confirm_replicas,
                timeout_ms = self.confirm_timeout.as_millis() as u64,
                "Delivery confirmation enabled"
            );
            Ok(())
        })
    }

    fn heartbeat(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !keepalive_due(self.heartbeat, self.last_activity.elapsed()) {
                return Ok(());
            }
            let start = std::time::Instant::now();
            let conn = self.connection()?;
            let reply: String = redis::cmd("PING").query_async(conn).await.map_err(|e| {
                BrokerError::connection(TRANSPORT, format!("PING failed: {}", e))
            })?;
            if reply != "PONG" {
                return Err(BrokerError::connection(
                    TRANSPORT,
                    format!("Unexpected PING response: {}", reply),
                ));
            }
            self.last_activity = Instant::now();
            metrics::record_heartbeat_latency(TRANSPORT, start.elapsed());
            Ok(())
        })
    }

    fn publish<'a>(
        &'a mut self,
        exchange: &'a str,
        routing_key: &'a str,
        body: &'a [u8],
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let confirm = self.confirm;
            let conn = self.connection()?;

            let entry_id: String = redis::cmd("XADD")
                .arg(exchange)
                .arg("*")
                .arg("routing_key")
                .arg(routing_key)
                .arg("content_type")
                .arg(CONTENT_TYPE)
                .arg("payload")
                .arg(body)
                .query_async(&mut *conn)
                .await
                .map_err(|e| BrokerError::publish(TRANSPORT, format!("XADD failed: {}", e)))?;

            if let Some((replicas, wait_timeout)) = confirm {
                let acked: i64 = redis::cmd("WAIT")
                    .arg(replicas)
                    .arg(wait_timeout.as_millis() as u64)
                    .query_async(&mut *conn)
                    .await
                    .map_err(|e| BrokerError::publish(TRANSPORT, format!("WAIT failed: {}", e)))?;
                if acked < i64::from(replicas) {
                    return Err(BrokerError::publish(
                        TRANSPORT,
                        format!(
                            "Entry {} acknowledged by {} of {} replicas",
                            entry_id, acked, replicas
                        ),
                    ));
                }
            }

            self.last_activity = Instant::now();
            debug!(exchange, routing_key, entry_id = %entry_id, "Published stream entry");
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            // Dropping the last handle closes the socket
            if self.conn.take().is_none() {
                warn!("Close on an already closed Redis connection");
            }
            Ok(())
        })
    }
}
