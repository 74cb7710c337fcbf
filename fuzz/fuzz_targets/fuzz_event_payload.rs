//! Fuzz target for event payload construction.
//!
//! Whatever the attribute names and values, the payload keeps the event
//! identity and serializes.

#![no_main]

use event_relay::{Event, EventKind};
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: (Vec<(String, String)>, &str)| {
    let (attrs, routing_key) = data;

    let event = Event::new(EventKind::StoredInstance)
        .with_routing_key(routing_key)
        .with_attributes(attrs.into_iter().map(|(k, v)| (k, Value::String(v))));

    let entry = event.to_entry();
    assert_eq!(
        entry.payload.get("identity"),
        Some(&Value::String("dicom.instance.stored".to_string()))
    );
    assert_eq!(entry.routing_key, routing_key);

    let body = entry.to_json().expect("string maps always serialize");
    let _: Value = serde_json::from_slice(&body).expect("payload is valid JSON");
});
