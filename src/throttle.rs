// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-key event throttler and coalescer.
//!
//! Bounds how often events for one grouping key (e.g. a series) are
//! published while guaranteeing that the latest event for the key is
//! eventually delivered.
//!
//! # Algorithm (window `W`, arrival at `t`)
//!
//! 1. `W == 0`: publish immediately (throttling disabled).
//! 2. `t - last_publish >= W`: publish immediately, set `last_publish = t`,
//!    cancel any scheduled trailing fire and discard its pending event.
//! 3. Otherwise keep the event as the key's pending (trailing) event,
//!    replacing any earlier one. If no fire is scheduled, schedule one at
//!    `last_publish + W`; an existing fire keeps its time.
//! 4. On fire: publish the pending event, set `last_publish = now`.
//!
//! ```text
//! W = 100ms     t=0    t=30   t=80   t=100          t=150
//! arrivals       e0     e30    e80                   e150
//! published      e0                   e80 (trailing)
//! fire                  ├─ at 100 ────┘             ├─ at 200
//! ```
//!
//! # Concurrency
//!
//! State lives in a [`DashMap`]; every read-modify-write for a key happens
//! under that key's entry lock, shared by producers and timer fires. The
//! lock is never held across the sink call. Each fire carries a generation
//! number that is re-checked under the lock, so a cancelled or replaced fire
//! that already woke up does nothing.
//!
//! Timers are tokio tasks spawned on the runtime captured at construction,
//! so producers may call in from threads outside any runtime. A throttler
//! built with no runtime in reach publishes deferred events immediately.

use crate::event::{Event, EventSink};
use crate::metrics;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Idle keys are swept once every this many new keys.
pub(crate) const PRUNE_EVERY: u64 = 1024;

/// A key with nothing pending is dropped once idle this long (or the window,
/// if longer). A series idle this long has long since gone stable.
pub(crate) const IDLE_KEY_TTL: Duration = Duration::from_secs(3600);

/// A scheduled trailing publish.
#[derive(Debug)]
struct ScheduledFire {
    generation: u64,
    deadline: Instant,
    handle: AbortHandle,
}

impl ScheduledFire {
    fn cancel(self) {
        self.handle.abort();
    }
}

/// Throttle state of one grouping key.
#[derive(Debug, Default)]
struct ThrottleState {
    /// `None` is "never published" (−∞).
    last_publish: Option<Instant>,
    pending: Option<Event>,
    timer: Option<ScheduledFire>,
    /// Arrivals since creation or the last reset.
    observed: u64,
}

impl ThrottleState {
    fn window_elapsed(&self, now: Instant, window: Duration) -> bool {
        match self.last_publish {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= window,
        }
    }

    fn is_idle(&self, now: Instant, idle_for: Duration) -> bool {
        self.pending.is_none() && self.timer.is_none() && self.window_elapsed(now, idle_for)
    }
}

struct Inner {
    states: DashMap<String, ThrottleState>,
    sink: Arc<dyn EventSink>,
    generation: AtomicU64,
    keys_created: AtomicU64,
    runtime: Option<Handle>,
}

impl Inner {
    /// Timer fire for `key`. A stale generation or a removed key is a no-op.
    fn fire(&self, key: &str, generation: u64) {
        let event = {
            let Some(mut state) = self.states.get_mut(key) else {
                trace!(key, "Fire for removed key ignored");
                return;
            };
            match &state.timer {
                Some(timer) if timer.generation == generation => {}
                _ => {
                    trace!(key, generation, "Stale fire ignored");
                    return;
                }
            }
            state.timer = None;
            let event = state.pending.take();
            if event.is_some() {
                state.last_publish = Some(Instant::now());
            }
            event
        };

        if let Some(event) = event {
            debug!(key, identity = event.identity(), "Publishing trailing event");
            metrics::record_trailing_fire();
            self.sink.publish_event(&event);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for mut entry in self.states.iter_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.cancel();
            }
        }
    }
}

/// Per-key leading/trailing coalescer.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Throttler {
    inner: Arc<Inner>,
}

impl Throttler {
    /// Throttler delivering trailing events to `sink`, with timers on the
    /// current tokio runtime (if any).
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self::build(sink, Handle::try_current().ok())
    }

    /// Throttler whose timers run on `runtime`.
    pub fn with_runtime(sink: Arc<dyn EventSink>, runtime: Handle) -> Self {
        Self::build(sink, Some(runtime))
    }

    fn build(sink: Arc<dyn EventSink>, runtime: Option<Handle>) -> Self {
        if runtime.is_none() {
            warn!("Throttler built outside a tokio runtime, trailing events will not be deferred");
        }
        Self {
            inner: Arc::new(Inner {
                states: DashMap::new(),
                sink,
                generation: AtomicU64::new(0),
                keys_created: AtomicU64::new(0),
                runtime,
            }),
        }
    }

    /// Observe `event` for `key`.
    ///
    /// Returns the event when it should be published now; `None` when it was
    /// deferred (it will reach the sink when the window elapses, unless a
    /// newer event replaces it or the key is removed).
    pub fn observe(&self, key: &str, event: Event, window: Duration) -> Option<Event> {
        self.observe_with(key, window, |_| event)
    }

    /// Like [`observe`](Self::observe), but builds the event inside the key's
    /// critical section from the key's arrival count (starting at 1).
    pub fn observe_with<F>(&self, key: &str, window: Duration, build: F) -> Option<Event>
    where
        F: FnOnce(u64) -> Event,
    {
        let now = Instant::now();
        let mut created = false;
        let mut state = self.inner.states.entry(key.to_string()).or_insert_with(|| {
            created = true;
            ThrottleState::default()
        });

        state.observed += 1;
        let event = build(state.observed);

        let result = if window.is_zero()
            || state.window_elapsed(now, window)
            || self.inner.runtime.is_none()
        {
            state.last_publish = Some(now);
            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }
            if state.pending.take().is_some() {
                metrics::record_trailing_discarded("superseded");
            }
            metrics::record_throttle_decision("immediate");
            Some(event)
        } else {
            if state.pending.replace(event).is_some() {
                metrics::record_throttle_decision("replaced");
            } else {
                metrics::record_throttle_decision("deferred");
            }
            if state.timer.is_none() {
                // window_elapsed() is false, so last_publish is set
                let deadline = state.last_publish.unwrap_or(now) + window;
                state.timer = self.schedule(key, deadline);
                trace!(key, delay_ms = (deadline - now).as_millis() as u64, "Trailing fire scheduled");
            }
            None
        };

        drop(state);
        if created {
            let total = self.inner.keys_created.fetch_add(1, Ordering::Relaxed) + 1;
            if total % PRUNE_EVERY == 0 {
                self.prune_idle(IDLE_KEY_TTL.max(window));
            }
            metrics::record_throttle_keys(self.inner.states.len());
        }
        result
    }

    fn schedule(&self, key: &str, deadline: Instant) -> Option<ScheduledFire> {
        let runtime = self.inner.runtime.as_ref()?;
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let key = key.to_string();

        let handle = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = inner.upgrade() {
                inner.fire(&key, generation);
            }
        });

        Some(ScheduledFire {
            generation,
            deadline,
            handle: handle.abort_handle(),
        })
    }

    /// Deletion hook: forget `key`, cancelling any scheduled fire. A pending
    /// event is dropped and never published.
    ///
    /// Returns `true` if the key was tracked.
    pub fn remove(&self, key: &str) -> bool {
        let Some((_, mut state)) = self.inner.states.remove(key) else {
            return false;
        };
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
        if state.pending.take().is_some() {
            debug!(key, "Trailing event discarded on delete");
            metrics::record_trailing_discarded("deleted");
        }
        metrics::record_throttle_keys(self.inner.states.len());
        true
    }

    /// Restart the arrival count of `key`. Timing and any pending trailing
    /// event are kept.
    pub fn reset(&self, key: &str) {
        if let Some(mut state) = self.inner.states.get_mut(key) {
            state.observed = 0;
        }
    }

    /// Drop keys with nothing pending whose last publish is at least
    /// `idle_for` ago. Returns how many were removed.
    pub fn prune_idle(&self, idle_for: Duration) -> usize {
        let now = Instant::now();
        let before = self.inner.states.len();
        self.inner.states.retain(|_, state| !state.is_idle(now, idle_for));
        let removed = before.saturating_sub(self.inner.states.len());
        if removed > 0 {
            debug!(removed, "Pruned idle throttle keys");
            metrics::record_throttle_keys(self.inner.states.len());
        }
        removed
    }

    /// When the scheduled trailing fire for `key` is due, if any.
    pub fn pending_deadline(&self, key: &str) -> Option<Instant> {
        self.inner
            .states
            .get(key)
            .and_then(|state| state.timer.as_ref().map(|t| t.deadline))
    }

    /// Whether `key` holds an unpublished trailing event.
    pub fn has_pending(&self, key: &str) -> bool {
        self.inner
            .states
            .get(key)
            .map(|state| state.pending.is_some())
            .unwrap_or(false)
    }

    /// Arrivals for `key` since it was created or reset.
    pub fn observed(&self, key: &str) -> u64 {
        self.inner.states.get(key).map(|state| state.observed).unwrap_or(0)
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.inner.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.states.is_empty()
    }
}

impl std::fmt::Debug for Throttler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttler").field("keys", &self.len()).finish()
    }
}
