// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Slow-start window controlling how many events are in flight per connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Initial window used when slow start is enabled.
pub const DEFAULT_START_WINDOW_SIZE: usize = 10;
pub const MIN_WINDOW_SIZE: usize = 1;

/// Shared in-flight budget for one connection.
///
/// Grows by half its size on every successful slice and halves on every
/// failed one. Updates are lock free; a grow only lands if nobody touched the
/// window since it was read, so a racing shrink always wins.
#[derive(Debug)]
pub struct WindowController {
    window: AtomicUsize,
    // largest window a slice was acknowledged with
    max_ok: AtomicUsize,
    start: usize,
    max: usize,
}

impl WindowController {
    pub fn new(start: usize, max: usize) -> Self {
        let max = max.max(MIN_WINDOW_SIZE);
        let start = start.clamp(MIN_WINDOW_SIZE, max);
        Self {
            window: AtomicUsize::new(start),
            max_ok: AtomicUsize::new(0),
            start,
            max,
        }
    }

    pub fn get(&self) -> usize {
        self.window.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Grow the window after a successful slice of a batch holding `batch_size` events.
    pub fn try_grow_window(&self, batch_size: usize) {
        let current = self.get();
        if current > batch_size {
            // the batch never needed the full window, nothing was learned
            return;
        }

        let max_ok = self.max_ok.load(Ordering::Acquire);
        let target = if max_ok <= current {
            self.max_ok.fetch_max(current, Ordering::AcqRel);
            // a batch that fits between the old and the new window caps the growth
            grow(current).min(batch_size).min(self.max)
        } else {
            // recovering from a shrink: return quickly to the last known good size
            grow(current).min(max_ok)
        };

        if target <= current {
            return;
        }
        if self
            .window
            .compare_exchange(current, target, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!("LOGSTASH | Window grown from {current} to {target}");
        }
    }

    /// Halve the window after a failed slice, never going below one event.
    pub fn shrink_window(&self) {
        let shrunk = self
            .window
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |window| {
                (window > MIN_WINDOW_SIZE).then(|| (window / 2).max(MIN_WINDOW_SIZE))
            });
        if let Ok(previous) = shrunk {
            debug!(
                "LOGSTASH | Window shrunk from {previous} to {}",
                (previous / 2).max(MIN_WINDOW_SIZE)
            );
        }
    }

    /// Forget everything learned about the downstream, e.g. after a reconnect.
    pub fn reset(&self) {
        self.max_ok.store(0, Ordering::Release);
        self.window.store(self.start, Ordering::Release);
    }
}

fn grow(window: usize) -> usize {
    window + window.div_ceil(2)
}
