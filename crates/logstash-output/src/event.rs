// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Events and the batches that carry them into the publisher.

use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// A processed event ready for shipping.
///
/// Content and metadata are shared, so slicing a batch into windows clones
/// pointers rather than payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    content: Arc<Value>,
    #[serde(rename = "@metadata", skip_serializing_if = "map_is_empty")]
    meta: Arc<Map<String, Value>>,
}

fn map_is_empty(meta: &Arc<Map<String, Value>>) -> bool {
    meta.is_empty()
}

impl Event {
    pub fn new(content: Value) -> Self {
        Self {
            content: Arc::new(content),
            meta: Arc::new(Map::new()),
        }
    }

    pub fn with_meta(content: Value, meta: Map<String, Value>) -> Self {
        Self {
            content: Arc::new(content),
            meta: Arc::new(meta),
        }
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    pub fn meta(&self) -> &Map<String, Value> {
        &self.meta
    }
}

/// A group of events resolved as a unit.
///
/// Both terminal operations consume the batch, so a batch can only ever be
/// acknowledged or retried once.
pub trait Batch: Send + 'static {
    fn events(&self) -> &[Event];

    /// All events were delivered.
    fn ack(self: Box<Self>);

    /// Hand back the unacknowledged suffix of the batch for re-delivery.
    fn retry_events(self: Box<Self>, remaining: Vec<Event>);
}

/// Terminal state of a [`VecBatch`]
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Acked,
    Retry(Vec<Event>),
}

/// In-memory batch that reports its outcome through a oneshot channel.
#[derive(Debug)]
pub struct VecBatch {
    events: Vec<Event>,
    outcome_tx: oneshot::Sender<BatchOutcome>,
}

impl VecBatch {
    pub fn new(events: Vec<Event>) -> (Self, oneshot::Receiver<BatchOutcome>) {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        (Self { events, outcome_tx }, outcome_rx)
    }

    fn resolve(self, outcome: BatchOutcome) {
        if self.outcome_tx.send(outcome).is_err() {
            debug!("LOGSTASH | Batch outcome receiver dropped");
        }
    }
}

impl Batch for VecBatch {
    fn events(&self) -> &[Event] {
        &self.events
    }

    fn ack(self: Box<Self>) {
        self.resolve(BatchOutcome::Acked);
    }

    fn retry_events(self: Box<Self>, remaining: Vec<Event>) {
        self.resolve(BatchOutcome::Retry(remaining));
    }
}
