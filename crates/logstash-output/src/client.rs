// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connection adapter exposing the publisher to the pipeline.

use crate::config::PublisherConfig;
use crate::deadlock::{DeadlockListener, StallAction};
use crate::error::PublishError;
use crate::event::{Batch, Event};
use crate::observer::Observer;
use crate::session::{CompletionHandle, PublishSession, Rejected, SliceSender};
use crate::transport::{AsyncClient, ClientFactory, ClientSettings, Transport};
use crate::window::WindowController;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Output as seen by the pipeline.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn connect(&self, cancel: &CancellationToken) -> Result<(), PublishError>;

    /// Hands the batch to the connection. Returns once every slice was
    /// dispatched; the batch itself is acknowledged or retried later.
    async fn publish(&self, batch: Box<dyn Batch>) -> Result<(), PublishError>;

    async fn close(&self) -> Result<(), PublishError>;

    /// Identity used in logs and metrics.
    fn name(&self) -> String;
}

/// Live connection: the raw transport and the protocol client built on it.
struct Connection {
    transport: Arc<dyn Transport>,
    client: Mutex<Option<Arc<dyn AsyncClient>>>,
}

impl Connection {
    async fn close(&self) -> Result<(), PublishError> {
        let mut client = self.client.lock().await;
        debug!("LOGSTASH | close connection");
        match client.take() {
            Some(client) => client.close().await,
            None => self.transport.close().await,
        }
    }

    async fn current(&self) -> Option<Arc<dyn AsyncClient>> {
        self.client.lock().await.clone()
    }
}

#[async_trait]
impl SliceSender for Connection {
    async fn send_slice(
        &self,
        events: &[Event],
        completion: CompletionHandle,
    ) -> Result<(), Rejected> {
        // a client closed after this read rejects the send itself
        match self.current().await {
            Some(client) => client.send(events, completion).await,
            None => Err(Rejected {
                error: PublishError::ConnectionClosed,
                completion,
            }),
        }
    }
}

/// Publisher pipelining windowed slices over one persistent connection.
pub struct AsyncPublisher {
    connection: Arc<Connection>,
    factory: Arc<dyn ClientFactory>,
    observer: Arc<dyn Observer>,
    window: Option<Arc<WindowController>>,
    settings: ClientSettings,
    config: PublisherConfig,
}

impl AsyncPublisher {
    /// Builds the publisher and its protocol client. The transport is not
    /// connected until [`connect`](Publisher::connect) is called.
    pub fn new(
        transport: Arc<dyn Transport>,
        factory: Arc<dyn ClientFactory>,
        observer: Arc<dyn Observer>,
        config: PublisherConfig,
    ) -> Result<Self, PublishError> {
        config.validate()?;

        let window = config.slow_start.then(|| {
            Arc::new(WindowController::new(
                config.slow_start_window,
                config.bulk_max_size,
            ))
        });

        if config.ttl.is_some() {
            warn!(r#"LOGSTASH | The async publisher does not support the "ttl" option"#);
        }

        let settings = config.client_settings();
        let client = factory.build(Arc::clone(&transport), &settings)?;

        Ok(Self {
            connection: Arc::new(Connection {
                transport,
                client: Mutex::new(Some(client)),
            }),
            factory,
            observer,
            window,
            settings,
            config,
        })
    }

    /// Current window size, `None` when slow start is disabled.
    pub fn window_size(&self) -> Option<usize> {
        self.window.as_ref().map(|window| window.get())
    }

    fn stall_action(&self) -> StallAction {
        let connection = Arc::clone(&self.connection);
        let address = connection.transport.address();
        Box::new(move || {
            tokio::spawn(async move {
                warn!("LOGSTASH | Forcing close of stalled connection to {address}");
                if let Err(err) = connection.close().await {
                    error!("LOGSTASH | Failed to close stalled connection: {err}");
                }
            });
        })
    }
}

#[async_trait]
impl Publisher for AsyncPublisher {
    async fn connect(&self, cancel: &CancellationToken) -> Result<(), PublishError> {
        debug!("LOGSTASH | connect");
        // the slot stays empty while dialing, so publish and close fail fast
        let previous = self.connection.client.lock().await.take();
        if let Some(previous) = previous {
            if let Err(err) = previous.close().await {
                debug!("LOGSTASH | Failed to close previous client: {err}");
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PublishError::Cancelled),
            connected = self.connection.transport.connect() => connected?,
        }

        let client = self
            .factory
            .build(Arc::clone(&self.connection.transport), &self.settings)?;
        let replaced = {
            let mut slot = self.connection.client.lock().await;
            if let Some(window) = &self.window {
                window.reset();
            }
            slot.replace(client)
        };
        if let Some(stale) = replaced {
            debug!("LOGSTASH | Replacing client installed by a concurrent connect");
            if let Err(err) = stale.close().await {
                debug!("LOGSTASH | Failed to close replaced client: {err}");
            }
        }
        Ok(())
    }

    async fn publish(&self, batch: Box<dyn Batch>) -> Result<(), PublishError> {
        let size = batch.events().len();
        self.observer.new_batch(size);

        if size == 0 {
            batch.ack();
            return Ok(());
        }

        let listener = DeadlockListener::new(self.config.deadlock_timeout, self.stall_action());
        let session = PublishSession::new(
            batch,
            self.window.clone(),
            Arc::clone(&self.observer),
            listener,
        );
        debug!(
            "LOGSTASH | Publishing {size} events to {} in session {}",
            self.connection.transport.address(),
            session.id()
        );

        if let Err(err) = session.dispatch(self.connection.as_ref()).await {
            if let Err(close_err) = self.close().await {
                debug!("LOGSTASH | Failed to close connection after dispatch error: {close_err}");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), PublishError> {
        self.connection.close().await
    }

    fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for AsyncPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "async({})", self.connection.transport.address())
    }
}

impl fmt::Debug for AsyncPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncPublisher")
            .field("address", &self.connection.transport.address())
            .field("window", &self.window_size())
            .field("settings", &self.settings)
            .finish()
    }
}
