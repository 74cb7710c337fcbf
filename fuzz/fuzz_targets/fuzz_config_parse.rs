//! Fuzz target for relay configuration parsing.
//!
//! Arbitrary documents must produce a config or a `Config` error, never a
//! panic, and anything accepted must validate and either build a broker or
//! fail with `Config`.

#![no_main]

use event_relay::{Broker, BrokerError, RelayConfig};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|raw: &str| {
    match RelayConfig::from_json(raw) {
        Ok(config) => {
            assert!(config.validate().is_ok());
            let _ = config.events.skip_origins();
            let _ = config.throttle.window();
            match Broker::from_config(&config.broker) {
                Ok(_) | Err(BrokerError::Config(_)) => {}
                Err(other) => panic!("unexpected build error: {:?}", other),
            }
        }
        Err(BrokerError::Config(_)) => {}
        Err(other) => panic!("unexpected error kind: {:?}", other),
    }
});
