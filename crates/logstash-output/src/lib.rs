// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous batch publisher for Logstash-style collectors.
//!
//! Batches handed to [`AsyncPublisher::publish`] are split into slices sized
//! by an adaptive slow-start window, pipelined over one persistent
//! connection, and acknowledged or handed back for retry once every slice
//! completed. A per-batch watchdog closes connections that stop making
//! progress.
//!
//! ```text
//!   pipeline ──publish(batch)──> AsyncPublisher ──> PublishSession
//!                                     │                  │ slices sized by WindowController
//!                                     v                  v
//!                               AsyncClient::send(slice, CompletionHandle)
//!                                                        │
//!                         completions ───────────────────┘
//!                         (window grow/shrink, ack or retry_events)
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod backoff;
pub mod client;
pub mod config;
pub mod deadlock;
pub mod error;
pub mod event;
pub mod logger;
pub mod observer;
mod session;
pub mod transport;
pub mod window;

pub use backoff::BackoffPublisher;
pub use client::{AsyncPublisher, Publisher};
pub use config::PublisherConfig;
pub use error::PublishError;
pub use event::{Batch, BatchOutcome, Event, VecBatch};
pub use observer::{NoopObserver, Observer, PublishStats};
