// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Two-layer lane scheduler.
//!
//! A **lane** is a named FIFO queue with a concurrency cap.  Two conventions
//! are layered per run: the per-session lane (`session:<key>`, cap 1)
//! serializes runs of one session, and the shared global lane caps
//! concurrency across the whole process.  Nesting order is fixed — session
//! outside, global inside — so a session's queued request waits on its own
//! predecessor before contending for a global slot.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::debug;

/// Name of the shared process-wide lane.
pub const GLOBAL_LANE: &str = "global";

/// Conventional lane name for a session key.
pub fn session_lane(key: &str) -> String {
    format!("session:{key}")
}

/// Per-enqueue options.
#[derive(Default)]
pub struct LaneOpts {
    /// Fire `on_slow_wait` once when queue time exceeds this threshold.
    pub warn_after: Option<Duration>,
    pub on_slow_wait: Option<Box<dyn FnOnce(Duration) + Send>>,
}

struct LaneState {
    max_concurrent: usize,
    active: usize,
    queue: VecDeque<oneshot::Sender<Permit>>,
}

impl LaneState {
    fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            active: 0,
            queue: VecDeque::new(),
        }
    }
}

type Lanes = Mutex<HashMap<String, LaneState>>;

/// Process-wide lane registry.
#[derive(Clone, Default)]
pub struct LaneScheduler {
    inner: Arc<Lanes>,
}

/// In-flight slot of a lane; releasing on drop keeps the counter correct
/// even when the task future is cancelled mid-flight.
struct Permit {
    inner: Arc<Lanes>,
    lane: String,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut lanes = self.inner.lock().expect("lane table lock poisoned");
        if let Some(state) = lanes.get_mut(&self.lane) {
            state.active = state.active.saturating_sub(1);
        }
        drain_locked(&self.inner, &mut lanes, &self.lane);
    }
}

/// Hand out permits while capacity remains.  Must be called with the lane
/// table lock held; a send to a dropped waiter is rolled back in place (the
/// returned permit is forgotten, not dropped, to avoid re-entering the lock).
fn drain_locked(inner: &Arc<Lanes>, lanes: &mut HashMap<String, LaneState>, lane: &str) {
    let Some(state) = lanes.get_mut(lane) else {
        return;
    };
    while state.active < state.max_concurrent {
        let Some(waiter) = state.queue.pop_front() else {
            break;
        };
        state.active += 1;
        let permit = Permit {
            inner: inner.clone(),
            lane: lane.to_string(),
        };
        if let Err(unsent) = waiter.send(permit) {
            std::mem::forget(unsent);
            state.active -= 1;
        }
    }
}

impl LaneScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a lane's concurrency cap, creating the lane if needed.
    pub fn configure(&self, lane: &str, max_concurrent: usize) {
        let mut lanes = self.inner.lock().expect("lane table lock poisoned");
        let state = lanes
            .entry(lane.to_string())
            .or_insert_with(|| LaneState::new(max_concurrent.max(1)));
        state.max_concurrent = max_concurrent.max(1);
        drain_locked(&self.inner, &mut lanes, lane);
    }

    /// Number of in-flight tasks on a lane.
    pub fn active(&self, lane: &str) -> usize {
        self.inner
            .lock()
            .expect("lane table lock poisoned")
            .get(lane)
            .map(|s| s.active)
            .unwrap_or(0)
    }

    /// Queue depth of a lane (excluding in-flight tasks).
    pub fn queued(&self, lane: &str) -> usize {
        self.inner
            .lock()
            .expect("lane table lock poisoned")
            .get(lane)
            .map(|s| s.queue.len())
            .unwrap_or(0)
    }

    /// Remove an idle lane.  Returns `false` when the lane is busy or has
    /// queued waiters.
    pub fn delete_lane(&self, lane: &str) -> bool {
        let mut lanes = self.inner.lock().expect("lane table lock poisoned");
        match lanes.get(lane) {
            Some(state) if state.active == 0 && state.queue.is_empty() => {
                lanes.remove(lane);
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    /// Run `task` on `lane`, waiting FIFO for a free slot.  An unseen lane
    /// is created with a cap of 1.
    pub async fn enqueue<F, T>(&self, lane: &str, mut opts: LaneOpts, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let (permit_tx, mut permit_rx) = oneshot::channel::<Permit>();
        let enqueued_at = Instant::now();
        {
            let mut lanes = self.inner.lock().expect("lane table lock poisoned");
            lanes
                .entry(lane.to_string())
                .or_insert_with(|| LaneState::new(1))
                .queue
                .push_back(permit_tx);
            drain_locked(&self.inner, &mut lanes, lane);
        }

        let permit = if let Some(threshold) = opts.warn_after {
            tokio::select! {
                biased;
                p = &mut permit_rx => p,
                _ = tokio::time::sleep(threshold) => {
                    let waited = enqueued_at.elapsed();
                    debug!(lane, ?waited, "task exceeded lane wait threshold");
                    if let Some(cb) = opts.on_slow_wait.take() {
                        cb(waited);
                    }
                    (&mut permit_rx).await
                }
            }
        } else {
            permit_rx.await
        };

        // Err only when the scheduler itself was torn down with waiters
        // still queued; run the task unguarded rather than losing it.
        let _slot = permit.ok();
        task.await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
