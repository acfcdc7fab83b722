// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Publisher telemetry abstractions.
//!
//! Embedders implement [`Observer`] to feed publish outcomes into their own
//! metrics pipeline. Every hook is called from completion paths, possibly on
//! transport threads, so implementations must be cheap and thread safe.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Metrics hooks invoked by the publisher.
pub trait Observer: Send + Sync {
    /// Called once per published batch with its event count.
    fn new_batch(&self, _size: usize) {}
    /// Called for every completed slice with the number of events the collector acknowledged.
    fn acked_events(&self, _count: usize) {}
    /// Called when a batch is finalized with events that still need delivery.
    fn retryable_errors(&self, _count: usize) {}
    /// Called with the time between dispatching a slice and its completion.
    fn report_latency(&self, _latency: Duration) {}
}

/// Observer that discards everything.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Observer that keeps running totals.
#[derive(Debug, Default)]
pub struct PublishStats {
    batches: AtomicUsize,
    events: AtomicUsize,
    acked: AtomicUsize,
    retryable: AtomicUsize,
    latency_reports: AtomicUsize,
    latency_total_us: AtomicU64,
}

/// Point-in-time copy of [`PublishStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub batches: usize,
    pub events: usize,
    pub acked: usize,
    pub retryable: usize,
    pub latency_reports: usize,
    pub latency_total: Duration,
}

impl PublishStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            retryable: self.retryable.load(Ordering::Relaxed),
            latency_reports: self.latency_reports.load(Ordering::Relaxed),
            latency_total: Duration::from_micros(self.latency_total_us.load(Ordering::Relaxed)),
        }
    }
}

impl Observer for PublishStats {
    fn new_batch(&self, size: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.events.fetch_add(size, Ordering::Relaxed);
    }

    fn acked_events(&self, count: usize) {
        self.acked.fetch_add(count, Ordering::Relaxed);
    }

    fn retryable_errors(&self, count: usize) {
        self.retryable.fetch_add(count, Ordering::Relaxed);
    }

    fn report_latency(&self, latency: Duration) {
        self.latency_reports.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_total_us.fetch_add(micros, Ordering::Relaxed);
    }
}
