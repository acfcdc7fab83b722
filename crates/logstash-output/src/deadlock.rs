// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Watchdog for publish sessions that stop making acknowledgment progress.
//!
//! A collector can accept a send and then never answer it. Without a watchdog
//! the session owning that send would never finalize and the pipeline would
//! stall silently. The listener turns that into a logged, observable failure:
//! when no progress arrives within the timeout it runs its stall action once
//! (the publisher force-closes the connection) and exits.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Time a session may go without any acknowledged event.
pub const DEFAULT_DEADLOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub type StallAction = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
pub struct DeadlockListener {
    ack_tx: mpsc::UnboundedSender<usize>,
    cancel: CancellationToken,
}

impl DeadlockListener {
    /// Start the watchdog. Must be called from within a tokio runtime.
    pub fn new(timeout: Duration, on_stall: StallAction) -> Self {
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run(timeout, ack_rx, cancel.clone(), on_stall));
        Self { ack_tx, cancel }
    }

    /// Record progress. Only a positive count resets the timer.
    pub fn ack(&self, n: usize) {
        if self.cancel.is_cancelled() {
            return;
        }
        // the task is gone once it reported a stall
        let _ = self.ack_tx.send(n);
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for DeadlockListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    timeout: Duration,
    mut ack_rx: mpsc::UnboundedReceiver<usize>,
    cancel: CancellationToken,
    on_stall: StallAction,
) {
    let deadline = sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("LOGSTASH | Deadlock listener closed");
                return;
            }
            Some(n) = ack_rx.recv() => {
                if n > 0 {
                    deadline.as_mut().reset(Instant::now() + timeout);
                }
            }
            _ = &mut deadline => {
                warn!(
                    "LOGSTASH | Batch hasn't reported progress in the last {:?}, the connection may be stalled. Closing connection.",
                    timeout
                );
                on_stall();
                return;
            }
        }
    }
}
