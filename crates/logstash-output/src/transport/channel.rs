// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process transport delivering slices to a [`ChannelReceiver`].
//!
//! Useful to embed the publisher in front of an in-process consumer and to
//! exercise it end to end. Every slice is forwarded to the receiver together
//! with a reply channel. A single ack loop per client awaits the replies in
//! send order, bounded by the configured timeout, so completions come back in
//! the order the slices were sent. At most `queue_size + 1`
//! slices are unacknowledged at any time; further sends wait for a slot.

use super::{AsyncClient, ClientFactory, ClientSettings, CompletionHandle, Rejected, Transport};
use crate::error::PublishError;
use crate::event::Event;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Reply a consumer sends for one slice.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceReply {
    pub acked: usize,
    pub result: Result<(), PublishError>,
}

/// A slice as seen by the consumer.
#[derive(Debug)]
pub struct ReceivedSlice {
    pub events: Vec<Event>,
    pub compression_level: u32,
    reply_tx: oneshot::Sender<SliceReply>,
}

impl ReceivedSlice {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn reply(self, acked: usize, result: Result<(), PublishError>) {
        if self.reply_tx.send(SliceReply { acked, result }).is_err() {
            debug!("LOGSTASH | Reply for a slice nobody waits for anymore");
        }
    }

    pub fn ack(self) {
        let n = self.events.len();
        self.reply(n, Ok(()));
    }

    pub fn fail(self, err: PublishError) {
        self.reply(0, Err(err));
    }
}

/// Consumer end of the in-process transport.
#[derive(Debug)]
pub struct ChannelReceiver {
    slices_rx: mpsc::Receiver<ReceivedSlice>,
}

impl ChannelReceiver {
    pub async fn recv(&mut self) -> Option<ReceivedSlice> {
        self.slices_rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ReceivedSlice> {
        self.slices_rx.try_recv().ok()
    }
}

/// Raw side of the in-process transport. Only tracks connection state.
#[derive(Debug)]
pub struct ChannelTransport {
    address: String,
    connected: AtomicBool,
    connects: AtomicUsize,
}

impl ChannelTransport {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Number of successful `connect` calls.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&self) -> Result<(), PublishError> {
        self.connected.store(true, Ordering::Release);
        self.connects.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn close(&self) -> Result<(), PublishError> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    fn address(&self) -> String {
        self.address.clone()
    }
}

/// Builds a [`ChannelClient`] feeding the shared receiver on every (re)connect.
#[derive(Debug, Clone)]
pub struct ChannelClientFactory {
    slices_tx: mpsc::Sender<ReceivedSlice>,
}

impl ClientFactory for ChannelClientFactory {
    fn build(
        &self,
        _transport: Arc<dyn Transport>,
        settings: &ClientSettings,
    ) -> Result<Arc<dyn AsyncClient>, PublishError> {
        let runtime = Handle::try_current().map_err(|e| PublishError::Connect(e.to_string()))?;
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        runtime.spawn(ack_loop(pending_rx, settings.timeout, closed.clone()));

        Ok(Arc::new(ChannelClient {
            slices_tx: self.slices_tx.clone(),
            pending_tx: Mutex::new(Some(pending_tx)),
            in_flight: Arc::new(Semaphore::new(settings.queue_size + 1)),
            send_lock: tokio::sync::Mutex::new(()),
            closed,
            compression_level: settings.compression_level,
        }))
    }
}

/// Creates the three ends of an in-process connection.
pub fn channel(
    address: &str,
) -> (Arc<ChannelTransport>, Arc<ChannelClientFactory>, ChannelReceiver) {
    let (slices_tx, slices_rx) = mpsc::channel(64);
    (
        Arc::new(ChannelTransport {
            address: address.to_string(),
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        }),
        Arc::new(ChannelClientFactory { slices_tx }),
        ChannelReceiver { slices_rx },
    )
}

struct PendingAck {
    reply_rx: oneshot::Receiver<SliceReply>,
    completion: CompletionHandle,
    _permit: OwnedSemaphorePermit,
}

pub struct ChannelClient {
    slices_tx: mpsc::Sender<ReceivedSlice>,
    pending_tx: Mutex<Option<mpsc::UnboundedSender<PendingAck>>>,
    in_flight: Arc<Semaphore>,
    // keeps forwarding and ack registration of one slice together
    send_lock: tokio::sync::Mutex<()>,
    closed: CancellationToken,
    compression_level: u32,
}

impl ChannelClient {
    fn pending_tx(&self) -> Option<mpsc::UnboundedSender<PendingAck>> {
        #[allow(clippy::expect_used)]
        let pending_tx = self.pending_tx.lock().expect("lock poisoned");
        pending_tx.clone()
    }
}

#[async_trait]
impl AsyncClient for ChannelClient {
    async fn send(&self, events: &[Event], completion: CompletionHandle) -> Result<(), Rejected> {
        let _order = self.send_lock.lock().await;

        let Some(pending_tx) = self.pending_tx() else {
            return Err(Rejected {
                error: PublishError::ConnectionClosed,
                completion,
            });
        };

        let permit = tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            permit = Arc::clone(&self.in_flight).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            return Err(Rejected {
                error: PublishError::ConnectionClosed,
                completion,
            });
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let slice = ReceivedSlice {
            events: events.to_vec(),
            compression_level: self.compression_level,
            reply_tx,
        };
        let forwarded = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(PublishError::ConnectionClosed),
            sent = self.slices_tx.send(slice) => {
                sent.map_err(|_| PublishError::Dispatch("receiver dropped".to_string()))
            }
        };
        if let Err(error) = forwarded {
            return Err(Rejected { error, completion });
        }

        let pending = PendingAck {
            reply_rx,
            completion,
            _permit: permit,
        };
        if let Err(mpsc::error::SendError(pending)) = pending_tx.send(pending) {
            return Err(Rejected {
                error: PublishError::ConnectionClosed,
                completion: pending.completion,
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), PublishError> {
        self.closed.cancel();
        #[allow(clippy::expect_used)]
        self.pending_tx.lock().expect("lock poisoned").take();
        Ok(())
    }
}

async fn ack_loop(
    mut pending_rx: mpsc::UnboundedReceiver<PendingAck>,
    timeout: Duration,
    closed: CancellationToken,
) {
    while let Some(PendingAck {
        reply_rx,
        completion,
        _permit,
    }) = pending_rx.recv().await
    {
        let reply = tokio::select! {
            biased;
            _ = closed.cancelled() => {
                completion.fail(PublishError::ConnectionClosed);
                continue;
            }
            reply = tokio::time::timeout(timeout, reply_rx) => reply,
        };

        match reply {
            Ok(Ok(SliceReply { acked, result })) => completion.complete(acked, result),
            Ok(Err(_)) => completion.fail(PublishError::SliceDropped),
            Err(_) => {
                warn!("LOGSTASH | No acknowledgment received within {timeout:?}");
                completion.fail(PublishError::Timeout(timeout));
            }
        }
    }
    debug!("LOGSTASH | Ack loop stopped");
}
