// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Host notification dispatch.
//!
//! [`EventDispatcher`] is the producer side of the relay. The host calls it
//! with change notifications and stored-instance notifications; it builds
//! events, applies the per-event toggles, routes stored-instance events
//! through the [`Throttler`] and hands everything to the [`Broker`].
//!
//! | Notification | Event | Notes |
//! |--------------|-------|-------|
//! | `Started` | `dicom.report.stored-patients` | after `broker.connect()` |
//! | `Stopped` | none | `broker.disconnect()` |
//! | `Stable(patient/study/series)` | `dicom.<level>.stable` | selected main tags |
//! | `Deleted(level)` | `dicom.<level>.deleted` | series delete cancels its trailing event |
//! | stored instance | `dicom.instance.stored` | throttled per series |
//!
//! Resource details come from the host through [`ResourceLookup`]. A failed
//! lookup is logged and the event still goes out with `"unknown"` ids.

use crate::broker::Broker;
use crate::config::{EventsConfig, RelayConfig};
use crate::error::Result;
use crate::event::{Event, EventKind, EventSink, InstanceOrigin, ResourceLevel};
use crate::metrics;
use crate::throttle::Throttler;
use crate::transport::BoxFuture;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Placeholder for ids a failed lookup could not resolve.
pub const UNKNOWN_ID: &str = "unknown";

/// What the host knows about one resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceInfo {
    pub id: String,
    /// Owning patient (for studies and series).
    pub parent_patient: Option<String>,
    /// Owning study (for series).
    pub parent_study: Option<String>,
    pub main_tags: Map<String, Value>,
}

/// Read-only access to host resources. Implemented by the host.
pub trait ResourceLookup: Send + Sync + 'static {
    /// Ids of every stored patient.
    fn stored_patients(&self) -> BoxFuture<'_, Vec<String>>;

    /// Details of one resource. Fails with `BrokerError::Lookup`.
    fn resource<'a>(&'a self, level: ResourceLevel, id: &'a str) -> BoxFuture<'a, ResourceInfo>;
}

/// A host change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeNotification {
    Started,
    Stopped,
    Stable { level: ResourceLevel, id: String },
    Deleted { level: ResourceLevel, id: String },
}

/// A newly stored instance.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredInstance {
    pub instance_id: String,
    pub series_id: String,
    pub remote_aet: Option<String>,
    pub remote_ip: Option<String>,
    pub origin: InstanceOrigin,
    /// The instance's tags by name; the configured subset is published.
    pub tags: Map<String, Value>,
}

/// Turns host notifications into published events.
pub struct EventDispatcher {
    broker: Arc<Broker>,
    throttler: Throttler,
    lookup: Arc<dyn ResourceLookup>,
    events: EventsConfig,
    skip_origins: Vec<InstanceOrigin>,
    window: Duration,
}

impl EventDispatcher {
    /// Build the broker from `config` and a dispatcher in front of it.
    pub fn from_config(config: &RelayConfig, lookup: Arc<dyn ResourceLookup>) -> Result<Self> {
        config.validate()?;
        let broker = Arc::new(Broker::from_config(&config.broker)?);
        Ok(Self::new(config, broker, lookup))
    }

    /// Dispatcher publishing through an existing broker.
    ///
    /// Throttle timers run on the tokio runtime current at construction;
    /// stored-instance hooks may then be called from any thread.
    pub fn new(config: &RelayConfig, broker: Arc<Broker>, lookup: Arc<dyn ResourceLookup>) -> Self {
        let sink: Arc<dyn EventSink> = broker.clone();
        Self {
            throttler: Throttler::new(sink),
            broker,
            lookup,
            events: config.events.clone(),
            skip_origins: config.events.skip_origins(),
            window: config.throttle.window(),
        }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn throttler(&self) -> &Throttler {
        &self.throttler
    }

    /// Handle a change notification. Never fails; problems are logged.
    pub async fn on_change(&self, change: ChangeNotification) {
        match change {
            ChangeNotification::Started => self.on_started().await,
            ChangeNotification::Stopped => {
                info!("Host stopping, releasing broker");
                self.broker.disconnect().await;
            }
            ChangeNotification::Stable { level, id } => self.on_stable(level, &id).await,
            ChangeNotification::Deleted { level, id } => self.on_deleted(level, &id),
        }
    }

    async fn on_started(&self) {
        if let Err(e) = self.broker.connect().await {
            error!(kind = self.broker.kind(), error = %e, "Broker connect failed");
        }

        let patient_ids = match self.lookup.stored_patients().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Could not list stored patients");
                metrics::record_lookup_failure("patients");
                Vec::new()
            }
        };

        let event = Event::new(EventKind::StoredPatients).with_attribute("patientIDs", patient_ids);
        self.dispatch(&event);
    }

    async fn on_stable(&self, level: ResourceLevel, id: &str) {
        let (kind, enabled, tags) = match level {
            ResourceLevel::Patient => (
                EventKind::StablePatient,
                self.events.stable_patient,
                self.events.stable_patient_publish_tags.as_deref(),
            ),
            ResourceLevel::Study => (
                EventKind::StableStudy,
                self.events.stable_study,
                self.events.stable_study_publish_tags.as_deref(),
            ),
            ResourceLevel::Series => {
                // Instance counting restarts once a series settles
                self.throttler.reset(id);
                (
                    EventKind::StableSeries,
                    self.events.stable_series,
                    self.events.stable_series_publish_tags.as_deref(),
                )
            }
            ResourceLevel::Instance => {
                debug!(id, "Stable instance notification ignored");
                return;
            }
        };

        if !enabled {
            metrics::record_event_skipped(kind.identity(), "disabled");
            return;
        }

        let info = match self.lookup.resource(level, id).await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(level = level.as_str(), id, error = %e, "Resource lookup failed, publishing without details");
                metrics::record_lookup_failure(level.as_str());
                None
            }
        };

        let event = stable_event(kind, level, id, info.as_ref(), tags);
        self.dispatch(&event);
    }

    fn on_deleted(&self, level: ResourceLevel, id: &str) {
        if level == ResourceLevel::Series && self.throttler.remove(id) {
            debug!(series = id, "Throttle state dropped for deleted series");
        }

        let enabled = match level {
            ResourceLevel::Patient => self.events.deleted_patient,
            ResourceLevel::Study => self.events.deleted_study,
            ResourceLevel::Series => self.events.deleted_series,
            ResourceLevel::Instance => self.events.deleted_instance,
        };
        let kind = EventKind::deleted(level);
        if !enabled {
            metrics::record_event_skipped(kind.identity(), "disabled");
            return;
        }

        let event = Event::new(kind)
            .with_attribute("type", level.as_str())
            .with_attribute("ID", id);
        self.dispatch(&event);
    }

    /// Handle a stored instance. Throttled per series when a window is set.
    pub fn on_stored_instance(&self, stored: StoredInstance) {
        let identity = EventKind::StoredInstance.identity();
        if !self.events.stored_instance {
            metrics::record_event_skipped(identity, "disabled");
            return;
        }
        if self.skip_origins.contains(&stored.origin) {
            debug!(instance = %stored.instance_id, origin = stored.origin.as_str(), "Instance origin skipped");
            metrics::record_event_skipped(identity, "origin");
            return;
        }

        let tags = select_tags(&stored.tags, self.events.stored_instance_publish_tags.as_deref());
        let series_id = stored.series_id.clone();

        let immediate = self.throttler.observe_with(&series_id, self.window, |count| {
            Event::new(EventKind::StoredInstance)
                .with_grouping_key(series_id.as_str())
                .with_attribute("seriesID", series_id.as_str())
                .with_attribute("instanceID", stored.instance_id.as_str())
                .with_attribute("instanceCount", count)
                .with_attribute("remoteAET", stored.remote_aet.clone())
                .with_attribute("remoteIP", stored.remote_ip.clone())
                .with_attribute("origin", stored.origin.as_str())
                .with_attributes(tags)
        });

        if let Some(event) = immediate {
            self.dispatch(&event);
        }
    }

    fn dispatch(&self, event: &Event) {
        metrics::record_event_dispatched(event.identity());
        self.broker.publish_event(event);
    }
}

/// Build a stable event from whatever the lookup returned.
fn stable_event(
    kind: EventKind,
    level: ResourceLevel,
    id: &str,
    info: Option<&ResourceInfo>,
    tags: Option<&[String]>,
) -> Event {
    let patient = info
        .and_then(|i| i.parent_patient.as_deref())
        .unwrap_or(UNKNOWN_ID);
    let study = info
        .and_then(|i| i.parent_study.as_deref())
        .unwrap_or(UNKNOWN_ID);

    let event = match level {
        ResourceLevel::Patient => Event::new(kind).with_attribute("patientID", id),
        ResourceLevel::Study => Event::new(kind)
            .with_attribute("studyID", id)
            .with_attribute("patientID", patient),
        _ => Event::new(kind)
            .with_attribute("seriesID", id)
            .with_attribute("studyID", study)
            .with_attribute("patientID", patient),
    };

    match info {
        Some(info) => event.with_attributes(select_tags(&info.main_tags, tags)),
        None => event,
    }
}

/// The configured subset of `available`. `None` selects nothing.
fn select_tags(available: &Map<String, Value>, wanted: Option<&[String]>) -> Vec<(String, Value)> {
    wanted
        .unwrap_or_default()
        .iter()
        .filter_map(|name| available.get(name).map(|value| (name.clone(), value.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tags() -> Map<String, Value> {
        let mut tags = Map::new();
        tags.insert("Modality".to_string(), json!("CT"));
        tags.insert("SeriesDescription".to_string(), json!("Chest"));
        tags
    }

    #[test]
    fn test_select_tags_subset() {
        let wanted = vec!["Modality".to_string(), "Missing".to_string()];
        let selected = select_tags(&tags(), Some(wanted.as_slice()));
        assert_eq!(selected, vec![("Modality".to_string(), json!("CT"))]);
        assert!(select_tags(&tags(), None).is_empty());
    }

    #[test]
    fn test_stable_series_with_details() {
        let info = ResourceInfo {
            id: "se-1".to_string(),
            parent_patient: Some("pa-1".to_string()),
            parent_study: Some("st-1".to_string()),
            main_tags: tags(),
        };
        let wanted = vec!["SeriesDescription".to_string()];
        let event = stable_event(
            EventKind::StableSeries,
            ResourceLevel::Series,
            "se-1",
            Some(&info),
            Some(wanted.as_slice()),
        );

        assert_eq!(
            Value::Object(event.payload()),
            json!({
                "identity": "dicom.series.stable",
                "seriesID": "se-1",
                "studyID": "st-1",
                "patientID": "pa-1",
                "SeriesDescription": "Chest",
            })
        );
    }

    #[test]
    fn test_stable_study_without_details_uses_unknown() {
        let event = stable_event(EventKind::StableStudy, ResourceLevel::Study, "st-1", None, None);
        assert_eq!(event.get("studyID"), Some(&json!("st-1")));
        assert_eq!(event.get("patientID"), Some(&json!(UNKNOWN_ID)));
        assert!(event.get("seriesID").is_none());
    }
}
