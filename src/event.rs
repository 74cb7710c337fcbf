// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event model.
//!
//! An [`Event`] is an identity tag, a routing key, an optional grouping key
//! (used only by the throttler) and an open map of attributes. It is
//! immutable once built; [`Event::payload()`] produces the flattened JSON
//! object that goes on the wire:
//!
//! ```text
//! { "identity": "dicom.instance.stored", "seriesID": "...", "SOPClassUID": "..." }
//! ```

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Name of the identity field in every payload.
pub const IDENTITY_FIELD: &str = "identity";

/// Kinds of lifecycle event the relay emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StableSeries,
    StableStudy,
    StablePatient,
    StoredInstance,
    PatientDeleted,
    StudyDeleted,
    SeriesDeleted,
    InstanceDeleted,
    /// Snapshot of all stored patients, emitted once at startup.
    StoredPatients,
}

impl EventKind {
    /// The identity string carried in the payload (and default routing key).
    pub fn identity(&self) -> &'static str {
        match self {
            Self::StableSeries => "dicom.series.stable",
            Self::StableStudy => "dicom.study.stable",
            Self::StablePatient => "dicom.patient.stable",
            Self::StoredInstance => "dicom.instance.stored",
            Self::PatientDeleted => "dicom.patient.deleted",
            Self::StudyDeleted => "dicom.study.deleted",
            Self::SeriesDeleted => "dicom.series.deleted",
            Self::InstanceDeleted => "dicom.instance.deleted",
            Self::StoredPatients => "dicom.report.stored-patients",
        }
    }

    /// The deletion event for a resource level.
    pub fn deleted(level: ResourceLevel) -> Self {
        match level {
            ResourceLevel::Patient => Self::PatientDeleted,
            ResourceLevel::Study => Self::StudyDeleted,
            ResourceLevel::Series => Self::SeriesDeleted,
            ResourceLevel::Instance => Self::InstanceDeleted,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identity())
    }
}

/// Level of a host resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceLevel {
    Patient,
    Study,
    Series,
    Instance,
}

impl ResourceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Patient => "patient",
            Self::Study => "study",
            Self::Series => "series",
            Self::Instance => "instance",
        }
    }
}

/// How a stored instance entered the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceOrigin {
    Unknown,
    DicomProtocol,
    RestApi,
    Plugin,
    Lua,
    WebDav,
}

impl InstanceOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::DicomProtocol => "DICOM_PROTOCOL",
            Self::RestApi => "REST_API",
            Self::Plugin => "PLUGIN",
            Self::Lua => "LUA",
            Self::WebDav => "WEB_DAV",
        }
    }

    /// Case-insensitive parse. Returns `None` for unrecognised names.
    pub fn parse(raw: &str) -> Option<Self> {
        let origin = match raw.trim().to_ascii_uppercase().as_str() {
            "UNKNOWN" => Self::Unknown,
            "DICOM_PROTOCOL" => Self::DicomProtocol,
            "REST_API" => Self::RestApi,
            "PLUGIN" => Self::Plugin,
            "LUA" => Self::Lua,
            "WEB_DAV" => Self::WebDav,
            _ => return None,
        };
        Some(origin)
    }
}

/// A lifecycle event ready to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    identity: String,
    routing_key: String,
    grouping_key: Option<String>,
    attributes: Map<String, Value>,
}

impl Event {
    /// Event of the given kind, routed by its identity.
    pub fn new(kind: EventKind) -> Self {
        Self::custom(kind.identity())
    }

    /// Event with a free-form identity, routed by that identity.
    pub fn custom(identity: impl Into<String>) -> Self {
        let identity = identity.into();
        Self {
            routing_key: identity.clone(),
            identity,
            grouping_key: None,
            attributes: Map::new(),
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_grouping_key(mut self, key: impl Into<String>) -> Self {
        self.grouping_key = Some(key.into());
        self
    }

    /// Set one attribute. `Value::Null` is skipped, like an unset optional field.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        if !value.is_null() {
            self.attributes.insert(name.into(), value);
        }
        self
    }

    /// Merge a set of attributes (later values win).
    pub fn with_attributes<I, K>(mut self, attrs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        for (name, value) in attrs {
            if !value.is_null() {
                self.attributes.insert(name.into(), value);
            }
        }
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn grouping_key(&self) -> Option<&str> {
        self.grouping_key.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        if name == IDENTITY_FIELD {
            return None;
        }
        self.attributes.get(name)
    }

    /// Flattened wire payload: the identity plus every attribute at top level.
    ///
    /// An attribute named `identity` never overrides the event identity.
    pub fn payload(&self) -> Map<String, Value> {
        let mut payload = Map::with_capacity(self.attributes.len() + 1);
        payload.insert(IDENTITY_FIELD.to_string(), Value::String(self.identity.clone()));
        for (name, value) in &self.attributes {
            if name != IDENTITY_FIELD {
                payload.insert(name.clone(), value.clone());
            }
        }
        payload
    }

    /// The queue entry this event becomes at publish time.
    pub fn to_entry(&self) -> QueueEntry {
        QueueEntry::new(self.payload(), self.routing_key.clone())
    }
}

/// One pending publish attempt: payload plus routing key.
///
/// Not durable; entries in memory are lost on crash.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub payload: Map<String, Value>,
    pub routing_key: String,
}

impl QueueEntry {
    pub fn new(payload: Map<String, Value>, routing_key: impl Into<String>) -> Self {
        Self {
            payload,
            routing_key: routing_key.into(),
        }
    }

    /// Serialize the payload to UTF-8 JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.payload)?)
    }

    /// Serialize the payload to a JSON string.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.payload)?)
    }
}

/// Destination for finished events.
///
/// Implemented by [`Broker`](crate::broker::Broker); the throttler delivers
/// trailing events through it. Must not block.
pub trait EventSink: Send + Sync + 'static {
    fn publish_event(&self, event: &Event);
}
