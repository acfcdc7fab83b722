// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exponential backoff around a [`Publisher`].
//!
//! The async publisher never retries on its own: a dispatch failure closes the
//! connection and surfaces the error. This wrapper is the caller-side policy
//! that slows down retries and reconnects before the next batch when the
//! connection went away.

use crate::client::Publisher;
use crate::error::PublishError;
use crate::event::Batch;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Doubling delay between `init` and `max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    init: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(init: Duration, max: Duration) -> Self {
        let max = max.max(init);
        Self {
            init,
            max,
            current: init,
        }
    }

    /// Delay to wait now; the following one is doubled.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.init;
    }
}

pub struct BackoffPublisher<P> {
    inner: P,
    backoff: Mutex<Backoff>,
    needs_reconnect: AtomicBool,
}

impl<P: Publisher> BackoffPublisher<P> {
    pub fn new(inner: P, init: Duration, max: Duration) -> Self {
        Self {
            inner,
            backoff: Mutex::new(Backoff::new(init, max)),
            needs_reconnect: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    fn next_delay(&self) -> Duration {
        #[allow(clippy::expect_used)]
        let mut backoff = self.backoff.lock().expect("lock poisoned");
        backoff.next_delay()
    }

    fn reset(&self) {
        #[allow(clippy::expect_used)]
        self.backoff.lock().expect("lock poisoned").reset();
    }

    // Connects the inner publisher and tracks whether a reconnect is still owed.
    async fn reconnect(&self, cancel: &CancellationToken) -> Result<(), PublishError> {
        match self.inner.connect(cancel).await {
            Ok(()) => {
                self.reset();
                self.needs_reconnect.store(false, Ordering::Release);
                Ok(())
            }
            Err(err) => {
                self.needs_reconnect.store(true, Ordering::Release);
                Err(err)
            }
        }
    }

    async fn wait(&self, cancel: &CancellationToken) {
        let delay = self.next_delay();
        debug!("LOGSTASH | Backing off for {delay:?}");
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[async_trait]
impl<P: Publisher> Publisher for BackoffPublisher<P> {
    async fn connect(&self, cancel: &CancellationToken) -> Result<(), PublishError> {
        let connected = self.reconnect(cancel).await;
        if connected.is_err() {
            self.wait(cancel).await;
        }
        connected
    }

    async fn publish(&self, batch: Box<dyn Batch>) -> Result<(), PublishError> {
        if self.needs_reconnect.load(Ordering::Acquire) {
            let cancel = CancellationToken::new();
            if let Err(err) = self.reconnect(&cancel).await {
                warn!("LOGSTASH | Reconnect to {} failed: {err}", self.inner.name());
                // the connection is known to be down, hand the whole batch back
                let events = batch.events().to_vec();
                batch.retry_events(events);
                self.wait(&cancel).await;
                return Err(err);
            }
        }

        match self.inner.publish(batch).await {
            Ok(()) => {
                self.reset();
                Ok(())
            }
            Err(err) => {
                if err.is_connection_error() {
                    self.needs_reconnect.store(true, Ordering::Release);
                }
                self.wait(&CancellationToken::new()).await;
                Err(err)
            }
        }
    }

    async fn close(&self) -> Result<(), PublishError> {
        self.reset();
        self.inner.close().await
    }

    fn name(&self) -> String {
        format!("backoff({})", self.inner.name())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::{BatchOutcome, Event, VecBatch};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    /// Fails the first `failures` publishes with a dispatch error.
    #[derive(Default)]
    struct FlakyPublisher {
        failures: usize,
        publishes: AtomicUsize,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl Publisher for FlakyPublisher {
        async fn connect(&self, _cancel: &CancellationToken) -> Result<(), PublishError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn publish(&self, batch: Box<dyn Batch>) -> Result<(), PublishError> {
            let attempt = self.publishes.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                let events = batch.events().to_vec();
                batch.retry_events(events);
                return Err(PublishError::Dispatch("broken pipe".into()));
            }
            batch.ack();
            Ok(())
        }

        async fn close(&self) -> Result<(), PublishError> {
            Ok(())
        }

        fn name(&self) -> String {
            "flaky".to_string()
        }
    }

    fn batch() -> (Box<dyn Batch>, tokio::sync::oneshot::Receiver<BatchOutcome>) {
        let (batch, outcome_rx) = VecBatch::new(vec![Event::new(json!({"message": "hi"}))]);
        (Box::new(batch), outcome_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_and_reconnects_after_connection_error() {
        let publisher = BackoffPublisher::new(
            FlakyPublisher {
                failures: 2,
                ..Default::default()
            },
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        assert_eq!(publisher.name(), "backoff(flaky)");

        let start = Instant::now();
        let (first, first_rx) = batch();
        assert!(publisher.publish(first).await.is_err());
        assert!(matches!(first_rx.await.unwrap(), BatchOutcome::Retry(_)));
        assert_eq!(start.elapsed(), Duration::from_secs(1));

        // the reconnect succeeded and reset the delay
        let (second, _) = batch();
        assert!(publisher.publish(second).await.is_err());
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(publisher.inner().connects.load(Ordering::SeqCst), 1);

        let (third, third_rx) = batch();
        publisher.publish(third).await.unwrap();
        assert_eq!(third_rx.await.unwrap(), BatchOutcome::Acked);
        assert_eq!(publisher.inner().connects.load(Ordering::SeqCst), 2);
        // no wait on success, and the next failure starts over at init
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(publisher.next_delay(), Duration::from_secs(1));
    }

    /// Never reachable: every connect and publish fails.
    #[derive(Default)]
    struct DownPublisher {
        publishes: AtomicUsize,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl Publisher for DownPublisher {
        async fn connect(&self, _cancel: &CancellationToken) -> Result<(), PublishError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Err(PublishError::Connect("connection refused".into()))
        }

        async fn publish(&self, batch: Box<dyn Batch>) -> Result<(), PublishError> {
            self.publishes.fetch_add(1, Ordering::SeqCst);
            let events = batch.events().to_vec();
            batch.retry_events(events);
            Err(PublishError::ConnectionClosed)
        }

        async fn close(&self) -> Result<(), PublishError> {
            Ok(())
        }

        fn name(&self) -> String {
            "down".to_string()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reconnect_takes_one_backoff_step() {
        let publisher = BackoffPublisher::new(
            DownPublisher::default(),
            Duration::from_secs(1),
            Duration::from_secs(60),
        );

        let start = Instant::now();
        let (first, _) = batch();
        assert!(publisher.publish(first).await.is_err());
        assert_eq!(start.elapsed(), Duration::from_secs(1));

        let start = Instant::now();
        let (second, second_rx) = batch();
        let err = publisher.publish(second).await.unwrap_err();
        assert_eq!(err, PublishError::Connect("connection refused".into()));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert!(matches!(second_rx.await.unwrap(), BatchOutcome::Retry(events) if events.len() == 1));

        let start = Instant::now();
        let (third, _) = batch();
        assert!(publisher.publish(third).await.is_err());
        assert_eq!(start.elapsed(), Duration::from_secs(4));

        // the dead connection is never handed a batch again
        assert_eq!(publisher.inner().publishes.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.inner().connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_wait_is_cancellable() {
        struct Unreachable;

        #[async_trait]
        impl Publisher for Unreachable {
            async fn connect(&self, _cancel: &CancellationToken) -> Result<(), PublishError> {
                Err(PublishError::Connect("connection refused".into()))
            }
            async fn publish(&self, batch: Box<dyn Batch>) -> Result<(), PublishError> {
                batch.ack();
                Ok(())
            }
            async fn close(&self) -> Result<(), PublishError> {
                Ok(())
            }
            fn name(&self) -> String {
                "unreachable".to_string()
            }
        }

        let publisher =
            BackoffPublisher::new(Unreachable, Duration::from_secs(30), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let start = Instant::now();
        let err = publisher.connect(&cancel).await.unwrap_err();
        assert_eq!(err, PublishError::Connect("connection refused".into()));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
