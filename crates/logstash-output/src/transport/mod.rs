// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Interfaces to the connection layer the publisher sits on.
//!
//! Dialing, TLS and the wire encoding live behind these traits. The
//! publisher only needs a raw [`Transport`] it can (re)connect and close, and
//! an [`AsyncClient`] built on top of it that accepts slices of events.

pub mod channel;

use crate::error::PublishError;
use crate::event::Event;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use crate::session::{CompletionHandle, Rejected, SliceCompletion};

/// Raw connection to the collector.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self) -> Result<(), PublishError>;

    async fn close(&self) -> Result<(), PublishError>;

    /// Remote address, used in logs and in the publisher's name.
    fn address(&self) -> String;
}

/// Protocol-level client pipelining slices over one connection.
///
/// `send` returns once the slice was accepted; the outcome is reported later
/// through the [`CompletionHandle`], exactly once per slice. The acknowledged
/// count of a completion must cover a prefix of that slice's events. Slices
/// may complete in any order, but resolving them in send order keeps retries
/// minimal. A refused slice is returned with its handle untouched.
#[async_trait]
pub trait AsyncClient: Send + Sync + 'static {
    async fn send(&self, events: &[Event], completion: CompletionHandle) -> Result<(), Rejected>;

    async fn close(&self) -> Result<(), PublishError>;
}

/// Settings handed to the protocol client on every (re)connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSettings {
    /// Slices that may wait for an acknowledgment behind the one being sent.
    pub queue_size: usize,
    /// Time to wait for the acknowledgment of one slice.
    pub timeout: Duration,
    /// Opaque to the publisher, interpreted by the wire encoder.
    pub compression_level: u32,
}

/// Builds the protocol client around a connected transport.
pub trait ClientFactory: Send + Sync + 'static {
    fn build(
        &self,
        transport: Arc<dyn Transport>,
        settings: &ClientSettings,
    ) -> Result<Arc<dyn AsyncClient>, PublishError>;
}
