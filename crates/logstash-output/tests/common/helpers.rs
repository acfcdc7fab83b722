// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for building events, batches and publishers

use super::mocks::{MockTransport, ScriptedClient, ScriptedFactory};
use logstash_output::{AsyncPublisher, Event, PublishStats, PublisherConfig};
use serde_json::json;
use std::sync::Arc;

/// Events numbered `0..n`
pub fn events(n: usize) -> Vec<Event> {
    (0..n)
        .map(|i| Event::new(json!({ "message": format!("line {i}"), "seq": i })))
        .collect()
}

pub struct Harness {
    pub publisher: AsyncPublisher,
    pub transport: Arc<MockTransport>,
    pub client: Arc<ScriptedClient>,
    pub stats: Arc<PublishStats>,
}

/// Publisher over a scripted client. Slices complete inline unless scripted otherwise.
pub fn scripted_publisher(config: PublisherConfig) -> Harness {
    let transport = Arc::new(MockTransport::new("127.0.0.1:5044"));
    let client = Arc::new(ScriptedClient::default());
    let stats = Arc::new(PublishStats::default());
    let publisher = AsyncPublisher::new(
        transport.clone(),
        Arc::new(ScriptedFactory::new(client.clone())),
        stats.clone(),
        config,
    )
    .expect("failed to create publisher");
    Harness {
        publisher,
        transport,
        client,
        stats,
    }
}

pub fn windowed(start: usize, bulk_max_size: usize) -> PublisherConfig {
    PublisherConfig {
        slow_start: true,
        slow_start_window: start,
        bulk_max_size,
        ..Default::default()
    }
}
