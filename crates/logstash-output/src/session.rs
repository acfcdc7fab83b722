// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-batch coordination of windowed sends.
//!
//! A [`PublishSession`] splits one batch into slices sized by the shared
//! window, hands every slice to the transport together with a
//! [`CompletionHandle`], and resolves the batch once all of them came back.
//!
//! Lifecycle of the reference count:
//!
//! ```text
//!   new()            refs = 1   (the dispatch loop itself)
//!   per slice        refs += 1  (before the slice is handed off)
//!   per completion   refs -= 1
//!   loop exits       refs -= 1  (DispatchGuard drop)
//!   refs == 0        finalize(): ack or retry_events, exactly once
//! ```
//!
//! An acknowledgment count always covers a prefix of its own slice. The
//! session applies it at the slice's offset and only advances the batch's
//! acknowledged prefix over contiguous, fully acknowledged slices, so
//! completions may arrive in any order. Everything after the first gap is
//! handed back on retry; events a later slice already delivered may be sent
//! twice, none is ever lost.

use crate::deadlock::DeadlockListener;
use crate::error::PublishError;
use crate::event::{Batch, Event};
use crate::observer::Observer;
use crate::window::WindowController;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of one slice, as reported by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceCompletion {
    pub session_id: u64,
    pub slice_index: usize,
    /// Number of events of the slice the collector acknowledged, in send order.
    pub acked: usize,
    pub result: Result<(), PublishError>,
}

/// A slice the transport refused to take. The handle is returned unresolved.
#[derive(Debug)]
pub struct Rejected {
    pub error: PublishError,
    pub completion: CompletionHandle,
}

/// Hands slices to the connection. Implemented by the connection adapter.
#[async_trait]
pub(crate) trait SliceSender: Send + Sync {
    /// Sends one slice. A closed connection rejects the slice with
    /// [`PublishError::ConnectionClosed`].
    async fn send_slice(
        &self,
        events: &[Event],
        completion: CompletionHandle,
    ) -> Result<(), Rejected>;
}

#[derive(Debug, Default)]
struct SessionState {
    // events[acked..] is the unacknowledged suffix
    acked: usize,
    // a partially acknowledged slice ends the prefix for good
    gap: bool,
    // completed slices past the prefix, by offset: (acked, len)
    pending: BTreeMap<usize, (usize, usize)>,
    error: Option<PublishError>,
}

impl SessionState {
    fn apply(&mut self, offset: usize, acked: usize, len: usize) {
        self.pending.insert(offset, (acked, len));
        while !self.gap {
            let Some((acked, len)) = self.pending.remove(&self.acked) else {
                break;
            };
            self.acked += acked;
            self.gap = acked < len;
        }
    }
}

pub(crate) struct PublishSession {
    id: u64,
    batch: Mutex<Option<Box<dyn Batch>>>,
    events: Vec<Event>,
    state: Mutex<SessionState>,
    refs: AtomicUsize,
    next_slice: AtomicUsize,
    window: Option<Arc<WindowController>>,
    observer: Arc<dyn Observer>,
    listener: DeadlockListener,
}

impl fmt::Debug for PublishSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishSession")
            .field("id", &self.id)
            .field("events", &self.events.len())
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .finish()
    }
}

impl PublishSession {
    pub(crate) fn new(
        batch: Box<dyn Batch>,
        window: Option<Arc<WindowController>>,
        observer: Arc<dyn Observer>,
        listener: DeadlockListener,
    ) -> Arc<Self> {
        let events = batch.events().to_vec();
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            batch: Mutex::new(Some(batch)),
            events,
            state: Mutex::new(SessionState::default()),
            refs: AtomicUsize::new(1),
            next_slice: AtomicUsize::new(0),
            window,
            observer,
            listener,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Split the batch and hand every slice to `sender`.
    ///
    /// Returns once all slices were handed off, not once they were
    /// acknowledged. On a dispatch failure the error is returned right away
    /// and the batch is resolved as soon as the slices already in flight
    /// complete.
    pub(crate) async fn dispatch(
        self: Arc<Self>,
        sender: &dyn SliceSender,
    ) -> Result<(), PublishError> {
        let _guard = DispatchGuard(Arc::clone(&self));
        let total = self.events.len();
        let mut offset = 0;

        while offset < total {
            let remaining = total - offset;
            let n = match &self.window {
                Some(window) => window.get().min(remaining),
                None => remaining,
            };
            let slice = &self.events[offset..offset + n];

            let completion = self.completion(offset, n);
            if let Err(Rejected { error, completion }) = sender.send_slice(slice, completion).await
            {
                completion.abandon(error.clone());
                return Err(error);
            }

            debug!(
                "LOGSTASH | {} events out of {} events sent. Continue sending",
                n, remaining
            );
            offset += n;
        }

        Ok(())
    }

    fn completion(self: &Arc<Self>, offset: usize, slice_len: usize) -> CompletionHandle {
        self.refs.fetch_add(1, Ordering::AcqRel);
        CompletionHandle {
            session: Some(Arc::clone(self)),
            slice_index: self.next_slice.fetch_add(1, Ordering::Relaxed),
            offset,
            slice_len,
            dispatched_at: Instant::now(),
        }
    }

    fn record_error(&self, err: PublishError) {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock poisoned");
        self.record_error_locked(&mut state, err);
    }

    fn record_error_locked(&self, state: &mut SessionState, err: PublishError) {
        if state.error.is_none() {
            state.error = Some(err);
        } else {
            debug!("LOGSTASH | Session {} additional error: {err}", self.id);
        }
    }

    fn on_completion(&self, completion: SliceCompletion, slice: &CompletionHandle) {
        let SliceCompletion {
            slice_index,
            acked,
            result,
            ..
        } = completion;

        if acked > slice.slice_len {
            warn!(
                "LOGSTASH | Slice {slice_index} of session {} acknowledged {acked} events but only {} were sent",
                self.id, slice.slice_len
            );
        }
        let acked = acked.min(slice.slice_len);

        self.observer.acked_events(acked);
        self.listener.ack(acked);
        {
            #[allow(clippy::expect_used)]
            let mut state = self.state.lock().expect("lock poisoned");
            state.apply(slice.offset, acked, slice.slice_len);
            if let Err(err) = &result {
                self.record_error_locked(&mut state, err.clone());
            }
        }

        if let Some(window) = &self.window {
            match &result {
                Err(_) => window.shrink_window(),
                Ok(()) => window.try_grow_window(self.events.len()),
            }
        }

        self.observer.report_latency(slice.dispatched_at.elapsed());
        self.release();
    }

    fn release(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finalize();
        }
    }

    fn finalize(&self) {
        self.listener.close();

        let (acked, err) = {
            #[allow(clippy::expect_used)]
            let mut state = self.state.lock().expect("lock poisoned");
            (state.acked, state.error.take())
        };
        let remaining = &self.events[acked..];
        if !remaining.is_empty() {
            self.observer.retryable_errors(remaining.len());
        }

        #[allow(clippy::expect_used)]
        let batch = self.batch.lock().expect("lock poisoned").take();
        let Some(batch) = batch else {
            error!("LOGSTASH | Session {} finalized twice", self.id);
            return;
        };

        match err {
            None => batch.ack(),
            Some(err) => {
                batch.retry_events(remaining.to_vec());
                error!("LOGSTASH | Failed to publish events caused by: {err}");
            }
        }
    }
}

/// Releases the dispatch loop's own reference when the loop exits.
struct DispatchGuard(Arc<PublishSession>);

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// One-shot completion for a dispatched slice.
///
/// Consumed by [`complete`](Self::complete). A handle dropped without being
/// completed resolves the slice as [`PublishError::SliceDropped`] with
/// nothing acknowledged, so a torn down transport never leaks a session.
pub struct CompletionHandle {
    session: Option<Arc<PublishSession>>,
    slice_index: usize,
    // position of the slice's first event in the batch
    offset: usize,
    slice_len: usize,
    dispatched_at: Instant,
}

impl CompletionHandle {
    /// Number of events in the slice this handle belongs to.
    pub fn slice_len(&self) -> usize {
        self.slice_len
    }

    pub fn slice_index(&self) -> usize {
        self.slice_index
    }

    pub fn complete(mut self, acked: usize, result: Result<(), PublishError>) {
        self.resolve(acked, result);
    }

    /// The whole slice was acknowledged.
    pub fn ack(self) {
        let n = self.slice_len;
        self.complete(n, Ok(()));
    }

    /// The slice failed without any event being acknowledged.
    pub fn fail(self, err: PublishError) {
        self.complete(0, Err(err));
    }

    // Undo a dispatch the transport refused: records the error on the session
    // and drops the slice's reference without touching window or observer.
    fn abandon(mut self, err: PublishError) {
        if let Some(session) = self.session.take() {
            session.record_error(err);
            session.release();
        }
    }

    fn resolve(&mut self, acked: usize, result: Result<(), PublishError>) {
        if let Some(session) = self.session.take() {
            let completion = SliceCompletion {
                session_id: session.id,
                slice_index: self.slice_index,
                acked,
                result,
            };
            session.on_completion(completion, self);
        }
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        if self.session.is_some() {
            debug!("LOGSTASH | Slice {} dropped unresolved", self.slice_index);
            self.resolve(0, Err(PublishError::SliceDropped));
        }
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("session", &self.session.as_ref().map(|s| s.id))
            .field("slice_index", &self.slice_index)
            .field("offset", &self.offset)
            .field("slice_len", &self.slice_len)
            .finish()
    }
}
