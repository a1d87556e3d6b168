// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Typed push/pull event stream terminated by a result value.
//!
//! The producer side returns synchronously from the loop entry point and is
//! driven from a detached task: `push` and `end` never block.  The consumer
//! pulls events in push order; the result handle resolves after `end` and
//! may be awaited by any number of observers.

use tokio::sync::{mpsc, watch};

/// Producer half.  Single producer; both methods are non-blocking.
pub struct EventSink<E, R> {
    tx: mpsc::UnboundedSender<E>,
    result_tx: watch::Sender<Option<R>>,
}

impl<E, R> EventSink<E, R> {
    /// Push one event.  Dropped consumers are ignored — the producing loop
    /// must keep running (and persisting) even when nobody listens.
    pub fn push(&self, event: E) {
        let _ = self.tx.send(event);
    }

    /// Close the stream with its result value.
    pub fn end(&self, result: R) {
        let _ = self.result_tx.send(Some(result));
    }
}

/// Consumer half: an async pull iterator plus a result handle.
pub struct EventStream<E, R> {
    rx: mpsc::UnboundedReceiver<E>,
    result_rx: watch::Receiver<Option<R>>,
    terminal: fn(&E) -> bool,
    done: bool,
}

impl<E, R: Clone> EventStream<E, R> {
    /// Create a connected sink/stream pair.  `terminal` flags the event
    /// types that end iteration (the loop's `agent_end` / `agent_error`).
    pub fn channel(terminal: fn(&E) -> bool) -> (EventSink<E, R>, EventStream<E, R>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = watch::channel(None);
        (
            EventSink { tx, result_tx },
            EventStream {
                rx,
                result_rx,
                terminal,
                done: false,
            },
        )
    }

    /// Next event in push order; `None` once a terminal event has been
    /// yielded or the producer is gone and the queue is drained.
    pub async fn next(&mut self) -> Option<E> {
        if self.done {
            return None;
        }
        let event = self.rx.recv().await?;
        if (self.terminal)(&event) {
            self.done = true;
        }
        Some(event)
    }

    /// A cloneable handle on the stream's result.
    pub fn result_handle(&self) -> ResultHandle<R> {
        ResultHandle(self.result_rx.clone())
    }
}

/// Awaitable result of a stream; clone freely for multiple observers.
#[derive(Clone)]
pub struct ResultHandle<R>(watch::Receiver<Option<R>>);

impl<R: Clone> ResultHandle<R> {
    /// Resolves after the producer calls `end`.  `None` when the producer
    /// was dropped without ending the stream.
    pub async fn wait(mut self) -> Option<R> {
        let result = match self.0.wait_for(|v| v.is_some()).await {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        if result.is_some() {
            return result;
        }
        self.0.borrow().clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
