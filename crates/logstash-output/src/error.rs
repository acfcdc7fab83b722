// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Errors surfaced by the publisher, its transports, and its configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// Sending through a client that was closed or never built
    #[error("connection closed")]
    ConnectionClosed,

    /// The transport refused to accept a slice
    #[error("failed to dispatch events: {0}")]
    Dispatch(String),

    /// The collector reported a failure for an accepted slice
    #[error("failed to deliver events: {0}")]
    Delivery(String),

    #[error("no acknowledgment received within {0:?}")]
    Timeout(Duration),

    /// A completion handle was dropped before the transport resolved it
    #[error("slice dropped before it was acknowledged")]
    SliceDropped,

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("connect cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PublishError {
    /// Whether the error means the connection itself can no longer be used
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            PublishError::ConnectionClosed
                | PublishError::Dispatch(_)
                | PublishError::Connect(_)
        )
    }
}
