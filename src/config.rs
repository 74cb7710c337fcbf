// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the event relay.
//!
//! All types deserialize from JSON or YAML with per-field defaults, and can be
//! built programmatically with the `for_testing()` helpers.
//!
//! # Quick Start
//!
//! ```rust
//! use event_relay::config::{BrokerConfig, RelayConfig, ReliableConfig};
//!
//! let config = RelayConfig {
//!     broker: BrokerConfig::Reliable(ReliableConfig::for_testing("redis://localhost:6379")),
//!     ..RelayConfig::for_testing()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! RelayConfig
//! ├── broker: BrokerConfig         # tagged by "type"
//! │   ├── reliable: ReliableConfig # Redis Streams, bounded queue, backoff
//! │   └── polling: PollingConfig   # SNS topic, at-most-once
//! ├── throttle: ThrottleConfig     # per-series coalescing window
//! └── events: EventsConfig         # which lifecycle events to publish
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "broker": {
//!     "type": "reliable",
//!     "url": "redis://broker:6379/0",
//!     "exchange": "e.dicom",
//!     "confirm_delivery": true
//!   },
//!   "throttle": { "window_ms": 500 },
//!   "events": { "stored_instance_publish_tags": ["SOPClassUID"] }
//! }
//! ```

use crate::error::{BrokerError, Result};
use crate::event::InstanceOrigin;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object handed to the relay by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Which transport to publish through, and its settings.
    pub broker: BrokerConfig,

    /// Coalescing window for high-frequency events.
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// Per-event toggles and attribute selection.
    #[serde(default)]
    pub events: EventsConfig,
}

impl RelayConfig {
    /// Parse and validate a JSON document.
    ///
    /// An unknown `broker.type` or a missing required field is a
    /// [`BrokerError::Config`].
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| BrokerError::Config(format!("Invalid relay configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.broker.validate()
    }

    /// Minimal config for tests: polling transport on a dummy topic.
    pub fn for_testing() -> Self {
        Self {
            broker: BrokerConfig::Polling(PollingConfig::for_testing(
                "arn:aws:sns:us-east-1:000000000000:events",
            )),
            throttle: ThrottleConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BrokerConfig: one variant per transport kind
// ═══════════════════════════════════════════════════════════════════════════════

/// Transport selection, discriminated by the `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerConfig {
    /// Bounded queue, reconnect with backoff, optional delivery confirmation.
    #[serde(alias = "redis")]
    Reliable(ReliableConfig),

    /// Unbounded queue over a request/response topic, at-most-once.
    #[serde(alias = "sns")]
    Polling(PollingConfig),
}

impl BrokerConfig {
    /// Short name of the transport kind (for logs and metrics).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Reliable(_) => "reliable",
            Self::Polling(_) => "polling",
        }
    }

    /// Validate the selected variant.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Reliable(cfg) => cfg.validate(),
            Self::Polling(cfg) => cfg.validate(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReliableConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for the reliable queueing transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliableConfig {
    /// Broker URL. Example: `"redis://broker.example.com:6379/0"`
    pub url: String,

    /// Exchange (stream) every event is published to.
    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// Keepalive period. The worker pings at half this interval while idle.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// How long the worker waits on an empty queue before looping.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,

    /// Require a broker acknowledgement before a publish counts as delivered.
    #[serde(default)]
    pub confirm_delivery: bool,

    /// Number of replicas that must acknowledge a confirmed publish.
    #[serde(default = "default_confirm_replicas")]
    pub confirm_replicas: u32,

    /// How long to wait for a confirmation (ms).
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,

    /// Backoff floor (seconds).
    #[serde(default = "default_min_backoff_secs")]
    pub min_backoff_secs: f64,

    /// Backoff ceiling (seconds).
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: f64,

    /// Bounded queue capacity. Publishes beyond this are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Timeout for a single connection attempt.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// How long `disconnect()` waits for the worker before abandoning it.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: f64,
}

fn default_exchange() -> String {
    "e.dicom".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_poll_interval_secs() -> f64 {
    0.05
}

fn default_confirm_replicas() -> u32 {
    1
}

fn default_confirm_timeout_ms() -> u64 {
    1000
}

fn default_min_backoff_secs() -> f64 {
    1.0
}

fn default_max_backoff_secs() -> f64 {
    60.0
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_shutdown_grace_secs() -> f64 {
    2.0
}

impl ReliableConfig {
    /// Config with all defaults for the given URL.
    pub fn for_testing(url: &str) -> Self {
        Self {
            url: url.to_string(),
            exchange: default_exchange(),
            heartbeat_secs: default_heartbeat_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            confirm_delivery: false,
            confirm_replicas: default_confirm_replicas(),
            confirm_timeout_ms: default_confirm_timeout_ms(),
            min_backoff_secs: default_min_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            queue_capacity: default_queue_capacity(),
            connect_timeout_secs: default_connect_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(BrokerError::Config("reliable transport requires `url`".to_string()));
        }
        if self.exchange.trim().is_empty() {
            return Err(BrokerError::Config("`exchange` must not be empty".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(BrokerError::Config("`queue_capacity` must be at least 1".to_string()));
        }
        check_secs("poll_interval_secs", self.poll_interval_secs, false)?;
        check_secs("min_backoff_secs", self.min_backoff_secs, false)?;
        check_secs("max_backoff_secs", self.max_backoff_secs, false)?;
        check_secs("shutdown_grace_secs", self.shutdown_grace_secs, true)?;
        if self.min_backoff_secs > self.max_backoff_secs {
            return Err(BrokerError::Config(format!(
                "backoff floor {}s is above ceiling {}s",
                self.min_backoff_secs, self.max_backoff_secs
            )));
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        seconds(self.poll_interval_secs)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn min_backoff(&self) -> Duration {
        seconds(self.min_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        seconds(self.max_backoff_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        seconds(self.shutdown_grace_secs)
    }
}

/// Upper bound for any interval given in fractional seconds (one day).
pub const MAX_INTERVAL_SECS: f64 = 86_400.0;

/// Reject a seconds value that is NaN, negative (or zero unless allowed),
/// or above [`MAX_INTERVAL_SECS`].
fn check_secs(name: &str, value: f64, allow_zero: bool) -> Result<()> {
    let low_ok = if allow_zero { value >= 0.0 } else { value > 0.0 };
    if !low_ok || !(value <= MAX_INTERVAL_SECS) {
        let bound = if allow_zero { "non-negative" } else { "positive" };
        return Err(BrokerError::Config(format!(
            "`{}` must be {} and at most {}s, got {}",
            name, bound, MAX_INTERVAL_SECS, value
        )));
    }
    Ok(())
}

/// Seconds as a `Duration`, clamped to `[0, MAX_INTERVAL_SECS]` so configs
/// built without `validate()` cannot panic.
fn seconds(value: f64) -> Duration {
    if value > 0.0 {
        Duration::from_secs_f64(value.min(MAX_INTERVAL_SECS))
    } else {
        Duration::ZERO
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PollingConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for the polling transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Topic identifier (an SNS topic ARN).
    pub target: String,

    /// Region override. Falls back to the ambient AWS configuration.
    #[serde(default)]
    pub region: Option<String>,

    /// Pause after a failed publish (seconds).
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: f64,

    /// Pause when the queue is empty (ms).
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,

    /// How long `disconnect()` waits for the worker before abandoning it.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: f64,
}

fn default_retry_interval_secs() -> f64 {
    1.0
}

fn default_idle_interval_ms() -> u64 {
    10
}

impl PollingConfig {
    pub fn for_testing(target: &str) -> Self {
        Self {
            target: target.to_string(),
            region: None,
            retry_interval_secs: default_retry_interval_secs(),
            idle_interval_ms: default_idle_interval_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.target.trim().is_empty() {
            return Err(BrokerError::Config("polling transport requires `target`".to_string()));
        }
        check_secs("retry_interval_secs", self.retry_interval_secs, true)?;
        check_secs("shutdown_grace_secs", self.shutdown_grace_secs, true)
    }

    pub fn retry_interval(&self) -> Duration {
        seconds(self.retry_interval_secs)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        seconds(self.shutdown_grace_secs)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ThrottleConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-key coalescing window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Minimum time between two publishes for the same key (ms). 0 disables.
    #[serde(default)]
    pub window_ms: u64,
}

impl ThrottleConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn is_enabled(&self) -> bool {
        self.window_ms > 0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EventsConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Which lifecycle events are published, and which main tags they carry.
///
/// Tag lists are `None` when the attribute selection is disabled entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_true")]
    pub stable_series: bool,
    #[serde(default = "default_true")]
    pub stable_study: bool,
    #[serde(default = "default_true")]
    pub stable_patient: bool,
    #[serde(default = "default_true")]
    pub deleted_series: bool,
    #[serde(default = "default_true")]
    pub deleted_study: bool,
    #[serde(default = "default_true")]
    pub deleted_patient: bool,
    #[serde(default = "default_true")]
    pub deleted_instance: bool,
    #[serde(default = "default_true")]
    pub stored_instance: bool,

    /// Instance origins whose stored events are never published.
    /// Matched case-insensitively; unknown names map to `UNKNOWN`.
    #[serde(default)]
    pub stored_instance_skip_origin: Vec<String>,

    #[serde(default)]
    pub stored_instance_publish_tags: Option<Vec<String>>,
    #[serde(default)]
    pub stable_series_publish_tags: Option<Vec<String>>,
    #[serde(default)]
    pub stable_study_publish_tags: Option<Vec<String>>,
    #[serde(default)]
    pub stable_patient_publish_tags: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            stable_series: true,
            stable_study: true,
            stable_patient: true,
            deleted_series: true,
            deleted_study: true,
            deleted_patient: true,
            deleted_instance: true,
            stored_instance: true,
            stored_instance_skip_origin: Vec::new(),
            stored_instance_publish_tags: None,
            stable_series_publish_tags: None,
            stable_study_publish_tags: None,
            stable_patient_publish_tags: None,
        }
    }
}

impl EventsConfig {
    /// Resolve the configured skip list to origins.
    pub fn skip_origins(&self) -> Vec<InstanceOrigin> {
        self.stored_instance_skip_origin
            .iter()
            .map(|raw| {
                InstanceOrigin::parse(raw).unwrap_or_else(|| {
                    warn!(origin = %raw, "Unknown origin value, using UNKNOWN");
                    InstanceOrigin::Unknown
                })
            })
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
