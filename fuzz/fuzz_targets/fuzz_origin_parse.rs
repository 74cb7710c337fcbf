//! Fuzz target for instance origin parsing.
//!
//! Parsing never panics, and every recognised origin round-trips through
//! its canonical name.

#![no_main]

use event_relay::InstanceOrigin;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|raw: &str| {
    if let Some(origin) = InstanceOrigin::parse(raw) {
        assert_eq!(InstanceOrigin::parse(origin.as_str()), Some(origin));
    }
});
