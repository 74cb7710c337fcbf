//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - In-memory transports with failure injection
//! - A recording event sink and a scripted resource lookup

#![allow(dead_code)]

pub mod containers;
pub mod mock_transport;

pub use containers::*;
pub use mock_transport::*;

use std::future::Future;
use std::time::Duration;

/// Poll `check` every 10ms until it holds, panicking after 5000 polls.
///
/// Under a paused clock the sleeps auto-advance, so this costs no real time.
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..5000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Like [`eventually`] for checks that talk to a real server (real time,
/// up to ten seconds).
pub async fn eventually_async<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}
