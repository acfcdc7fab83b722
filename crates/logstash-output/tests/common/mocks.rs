// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock implementations of the transport layer and of batches for testing

use async_trait::async_trait;
use logstash_output::event::{Batch, Event};
use logstash_output::transport::{
    AsyncClient, ClientFactory, ClientSettings, CompletionHandle, Rejected, Transport,
};
use logstash_output::PublishError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Raw transport counting connects and closes
pub struct MockTransport {
    address: String,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    /// `connect` never returns, to exercise cancellation
    pub hang_connect: AtomicBool,
}

impl MockTransport {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            hang_connect: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), PublishError> {
        if self.hang_connect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), PublishError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn address(&self) -> String {
        self.address.clone()
    }
}

/// What the scripted client does with the next slice
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum Step {
    Ack,
    Partial(usize, PublishError),
    Fail(PublishError),
    /// Keep the handle until the test completes it
    Hold,
    Reject(PublishError),
}

/// Protocol client that completes slices inline following a script.
/// Once the script is exhausted every slice is acknowledged.
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<Step>>,
    sent: Mutex<Vec<Vec<Event>>>,
    held: Mutex<Vec<CompletionHandle>>,
    closed: AtomicBool,
    pub closes: AtomicUsize,
    pub settings: Mutex<Option<ClientSettings>>,
}

#[allow(dead_code)]
impl ScriptedClient {
    pub fn push(&self, steps: impl IntoIterator<Item = Step>) {
        self.script.lock().unwrap().extend(steps);
    }

    /// Sizes of every slice accepted so far
    pub fn slice_sizes(&self) -> Vec<usize> {
        self.sent.lock().unwrap().iter().map(Vec::len).collect()
    }

    pub fn sent(&self) -> Vec<Vec<Event>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn take_held(&self) -> Vec<CompletionHandle> {
        std::mem::take(&mut *self.held.lock().unwrap())
    }
}

#[async_trait]
impl AsyncClient for ScriptedClient {
    async fn send(&self, events: &[Event], completion: CompletionHandle) -> Result<(), Rejected> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Rejected {
                error: PublishError::ConnectionClosed,
                completion,
            });
        }

        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Ack);
        if let Step::Reject(error) = step {
            return Err(Rejected { error, completion });
        }
        self.sent.lock().unwrap().push(events.to_vec());

        match step {
            Step::Ack => completion.ack(),
            Step::Partial(n, err) => completion.complete(n, Err(err)),
            Step::Fail(err) => completion.fail(err),
            Step::Hold => self.held.lock().unwrap().push(completion),
            Step::Reject(_) => unreachable!(),
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), PublishError> {
        self.closed.store(true, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
        // pending handles are dropped, which fails their slices
        self.take_held();
        Ok(())
    }
}

/// Hands out the shared scripted client, reopened on every build
pub struct ScriptedFactory {
    client: Arc<ScriptedClient>,
}

impl ScriptedFactory {
    pub fn new(client: Arc<ScriptedClient>) -> Self {
        Self { client }
    }
}

impl ClientFactory for ScriptedFactory {
    fn build(
        &self,
        _transport: Arc<dyn Transport>,
        settings: &ClientSettings,
    ) -> Result<Arc<dyn AsyncClient>, PublishError> {
        self.client.closed.store(false, Ordering::SeqCst);
        *self.client.settings.lock().unwrap() = Some(*settings);
        Ok(self.client.clone())
    }
}

/// Terminal calls observed on a [`RecordingBatch`]
#[derive(Debug, Default)]
pub struct Resolutions {
    pub acks: usize,
    pub retries: Vec<Vec<Event>>,
}

/// Batch recording every terminal call, to check they happen exactly once
pub struct RecordingBatch {
    events: Vec<Event>,
    resolutions: Arc<Mutex<Resolutions>>,
}

impl RecordingBatch {
    pub fn new(events: Vec<Event>) -> (Box<Self>, Arc<Mutex<Resolutions>>) {
        let resolutions = Arc::new(Mutex::new(Resolutions::default()));
        (
            Box::new(Self {
                events,
                resolutions: resolutions.clone(),
            }),
            resolutions,
        )
    }
}

impl Batch for RecordingBatch {
    fn events(&self) -> &[Event] {
        &self.events
    }

    fn ack(self: Box<Self>) {
        self.resolutions.lock().unwrap().acks += 1;
    }

    fn retry_events(self: Box<Self>, remaining: Vec<Event>) {
        self.resolutions.lock().unwrap().retries.push(remaining);
    }
}
