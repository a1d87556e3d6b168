// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The heartbeat scheduler: a coalescing layer over the policy gate.
//!
//! Single task, cooperative: wake requests arriving within `coalesce_ms` of
//! each other collapse into one handler invocation, and the interval timer
//! reschedules itself with a fresh deadline after every fire (never a
//! periodic interval, so delays cannot accumulate drift).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use runa_config::HeartbeatConfig;

use crate::policy::{
    HeartbeatEvent, HeartbeatOutcome, HeartbeatPolicy, SkipReason, WakeReason,
};

/// Callback invoked for each delivered wake.  Returns the text to send (an
/// empty string acknowledges without sending).
pub type HeartbeatCallback =
    Arc<dyn Fn(HeartbeatEvent) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;

/// Returns `true` while agent runs are in flight; the wake is then deferred
/// with a short retry instead of racing the active run.
pub type BusyCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Delay before retrying a deferred or failed wake.
const RETRY_DELAY: Duration = Duration::from_secs(1);

enum Ctl {
    Request(WakeReason),
    SetCallback(Option<HeartbeatCallback>),
    UpdateConfig(HeartbeatConfig),
    Stop,
}

/// Handle to a running heartbeat scheduler.
pub struct Heartbeat {
    ctl: mpsc::UnboundedSender<Ctl>,
    task: tokio::task::JoinHandle<()>,
}

impl Heartbeat {
    /// Spawn the scheduler task.  Returns the handle and a channel of
    /// per-wake outcomes (useful for observability and tests).
    pub fn start(
        config: HeartbeatConfig,
        heartbeat_file: PathBuf,
        callback: Option<HeartbeatCallback>,
        busy: Option<BusyCheck>,
    ) -> (Self, mpsc::UnboundedReceiver<HeartbeatOutcome>) {
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_scheduler(
            config,
            heartbeat_file,
            callback,
            busy,
            ctl_rx,
            outcome_tx,
        ));
        (Self { ctl: ctl_tx, task }, outcome_rx)
    }

    /// Request a wake.  Requests inside the coalescing window collapse.
    pub fn request(&self, reason: WakeReason) {
        let _ = self.ctl.send(Ctl::Request(reason));
    }

    /// Manual trigger (`trigger_heartbeat()` surface).
    pub fn trigger(&self) {
        self.request(WakeReason::Manual);
    }

    pub fn set_callback(&self, callback: Option<HeartbeatCallback>) {
        let _ = self.ctl.send(Ctl::SetCallback(callback));
    }

    /// Hot-reschedule with a new config.
    pub fn update_config(&self, config: HeartbeatConfig) {
        let _ = self.ctl.send(Ctl::UpdateConfig(config));
    }

    /// Stop the scheduler, clearing all timers and pending state.
    pub fn stop(&self) {
        let _ = self.ctl.send(Ctl::Stop);
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_scheduler(
    mut config: HeartbeatConfig,
    heartbeat_file: PathBuf,
    mut callback: Option<HeartbeatCallback>,
    busy: Option<BusyCheck>,
    mut ctl: mpsc::UnboundedReceiver<Ctl>,
    outcomes: mpsc::UnboundedSender<HeartbeatOutcome>,
) {
    let mut policy = HeartbeatPolicy::new();
    let mut next_due = Instant::now() + Duration::from_secs(config.interval_secs);
    let mut pending: Option<WakeReason> = None;
    let mut coalesce_deadline: Option<Instant> = None;

    loop {
        let wake_at = match coalesce_deadline {
            Some(c) => c.min(next_due),
            None => next_due,
        };

        tokio::select! {
            msg = ctl.recv() => match msg {
                None | Some(Ctl::Stop) => break,
                Some(Ctl::Request(reason)) => {
                    // Latest reason wins; the timer is only armed once.
                    pending = Some(reason);
                    if coalesce_deadline.is_none() {
                        coalesce_deadline =
                            Some(Instant::now() + Duration::from_millis(config.coalesce_ms));
                    }
                }
                Some(Ctl::SetCallback(cb)) => callback = cb,
                Some(Ctl::UpdateConfig(c)) => {
                    config = c;
                    next_due = Instant::now() + Duration::from_secs(config.interval_secs);
                }
            },
            _ = tokio::time::sleep_until(wake_at) => {
                let coalesce_fired = coalesce_deadline.map(|c| c <= next_due).unwrap_or(false);
                let reason = if coalesce_fired {
                    coalesce_deadline = None;
                    pending.take().unwrap_or(WakeReason::Retry)
                } else {
                    next_due = Instant::now() + Duration::from_secs(config.interval_secs);
                    WakeReason::Interval
                };

                let outcome = fire(
                    &mut policy,
                    &config,
                    reason,
                    &heartbeat_file,
                    callback.as_ref(),
                    busy.as_ref(),
                )
                .await;
                debug!(reason = %reason, ?outcome, "heartbeat wake");
                let _ = outcomes.send(outcome);

                match outcome {
                    HeartbeatOutcome::Skipped(SkipReason::RequestsInFlight) => {
                        // Keep the reason so an exec wake stays exempt from
                        // the empty-content gate on retry.
                        pending = Some(pending.take().unwrap_or(reason));
                        coalesce_deadline = Some(Instant::now() + RETRY_DELAY);
                    }
                    HeartbeatOutcome::Failed if reason != WakeReason::Retry => {
                        // One retry per failure; a failing retry waits for
                        // the next interval instead of looping.
                        pending = Some(WakeReason::Retry);
                        coalesce_deadline = Some(Instant::now() + RETRY_DELAY);
                    }
                    HeartbeatOutcome::Failed => {}
                    _ => {
                        if pending.is_some() && coalesce_deadline.is_none() {
                            coalesce_deadline = Some(
                                Instant::now() + Duration::from_millis(config.coalesce_ms),
                            );
                        }
                    }
                }
            }
        }
    }
}

async fn fire(
    policy: &mut HeartbeatPolicy,
    config: &HeartbeatConfig,
    reason: WakeReason,
    heartbeat_file: &PathBuf,
    callback: Option<&HeartbeatCallback>,
    busy: Option<&BusyCheck>,
) -> HeartbeatOutcome {
    if busy.map(|b| b()).unwrap_or(false) {
        return HeartbeatOutcome::Skipped(SkipReason::RequestsInFlight);
    }

    let raw = std::fs::read_to_string(heartbeat_file).unwrap_or_default();
    let now_local = chrono::Local::now().time();
    if let Some(skip) = policy.gate(config, reason, &raw, now_local, callback.is_some()) {
        return HeartbeatOutcome::Skipped(skip);
    }

    let cb = callback.expect("gate admits only with a callback");
    let event = HeartbeatEvent {
        content: raw,
        reason,
        source: "scheduler".into(),
    };
    match cb(event).await {
        Ok(text) => policy.record_reply(config, &text, Utc::now()),
        Err(e) => {
            warn!(error = %e, "heartbeat callback failed; will retry");
            HeartbeatOutcome::Failed
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn write_heartbeat(dir: &tempfile::TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("HEARTBEAT.md");
        std::fs::write(&path, content).unwrap();
        path
    }

    fn counting_callback(counter: Arc<AtomicU32>, reply: &'static str) -> HeartbeatCallback {
        Arc::new(move |_event| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(reply.to_string())
            })
        })
    }

    fn fast_config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval_secs: 3_600, // keep the interval timer out of the way
            coalesce_ms: 250,
            ..HeartbeatConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn coalesced_requests_fire_once() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_heartbeat(&tmp, "check things");
        let count = Arc::new(AtomicU32::new(0));
        let (hb, mut outcomes) = Heartbeat::start(
            fast_config(),
            path,
            Some(counting_callback(count.clone(), "report")),
            None,
        );

        for _ in 0..5 {
            hb.request(WakeReason::Manual);
        }
        tokio::time::advance(Duration::from_millis(300)).await;
        let outcome = outcomes.recv().await.unwrap();

        assert_eq!(outcome, HeartbeatOutcome::Ran);
        assert_eq!(count.load(Ordering::SeqCst), 1, "five requests, one run");
        hb.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_content_skips_unless_exec() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_heartbeat(&tmp, "<!-- nothing -->");
        let count = Arc::new(AtomicU32::new(0));
        let (hb, mut outcomes) = Heartbeat::start(
            fast_config(),
            path,
            Some(counting_callback(count.clone(), "report")),
            None,
        );

        hb.request(WakeReason::Manual);
        tokio::time::advance(Duration::from_millis(300)).await;
        assert_eq!(
            outcomes.recv().await.unwrap(),
            HeartbeatOutcome::Skipped(SkipReason::EmptyContent)
        );

        hb.request(WakeReason::Exec);
        tokio::time::advance(Duration::from_millis(300)).await;
        assert_eq!(outcomes.recv().await.unwrap(), HeartbeatOutcome::Ran);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        hb.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn busy_defers_and_retries() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_heartbeat(&tmp, "check things");
        let count = Arc::new(AtomicU32::new(0));
        let busy = Arc::new(AtomicU32::new(1));
        let busy_flag = busy.clone();
        let busy_check: BusyCheck = Arc::new(move || busy_flag.load(Ordering::SeqCst) > 0);

        let (hb, mut outcomes) = Heartbeat::start(
            fast_config(),
            path,
            Some(counting_callback(count.clone(), "report")),
            Some(busy_check),
        );

        hb.request(WakeReason::Manual);
        tokio::time::advance(Duration::from_millis(300)).await;
        assert_eq!(
            outcomes.recv().await.unwrap(),
            HeartbeatOutcome::Skipped(SkipReason::RequestsInFlight)
        );

        // The run finishes; the 1 s retry should deliver the wake.
        busy.store(0, Ordering::SeqCst);
        tokio::time::advance(Duration::from_millis(1_100)).await;
        assert_eq!(outcomes.recv().await.unwrap(), HeartbeatOutcome::Ran);
        hb.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_callback_is_retried() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_heartbeat(&tmp, "check things");
        let count = Arc::new(AtomicU32::new(0));
        let calls = count.clone();
        let callback: HeartbeatCallback = Arc::new(move |_event| {
            let calls = calls.clone();
            Box::pin(async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("transient failure")
                }
                Ok("recovered".to_string())
            })
        });

        let (hb, mut outcomes) =
            Heartbeat::start(fast_config(), path, Some(callback), None);

        hb.request(WakeReason::Manual);
        tokio::time::advance(Duration::from_millis(300)).await;
        assert_eq!(outcomes.recv().await.unwrap(), HeartbeatOutcome::Failed);

        tokio::time::advance(Duration::from_millis(1_100)).await;
        assert_eq!(outcomes.recv().await.unwrap(), HeartbeatOutcome::Ran);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        hb.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn interval_timer_fires_and_reschedules() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_heartbeat(&tmp, "check things");
        let count = Arc::new(AtomicU32::new(0));
        let config = HeartbeatConfig {
            interval_secs: 10,
            ..HeartbeatConfig::default()
        };
        let (hb, mut outcomes) = Heartbeat::start(
            config,
            path,
            Some(counting_callback(count.clone(), "report")),
            None,
        );

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(outcomes.recv().await.unwrap(), HeartbeatOutcome::Ran);

        // Second interval fire: the same text inside the duplicate window
        // must be suppressed, not resent.
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(
            outcomes.recv().await.unwrap(),
            HeartbeatOutcome::Skipped(SkipReason::DuplicateMessage)
        );
        assert_eq!(count.load(Ordering::SeqCst), 2);
        hb.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn no_callback_skips() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_heartbeat(&tmp, "check things");
        let (hb, mut outcomes) = Heartbeat::start(fast_config(), path, None, None);

        hb.request(WakeReason::Manual);
        tokio::time::advance(Duration::from_millis(300)).await;
        assert_eq!(
            outcomes.recv().await.unwrap(),
            HeartbeatOutcome::Skipped(SkipReason::NoCallback)
        );
        hb.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_further_fires() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_heartbeat(&tmp, "check things");
        let count = Arc::new(AtomicU32::new(0));
        let (hb, mut outcomes) = Heartbeat::start(
            fast_config(),
            path,
            Some(counting_callback(count.clone(), "report")),
            None,
        );

        hb.stop();
        hb.request(WakeReason::Manual);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(outcomes.recv().await.is_none(), "scheduler task exited");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_reply_is_ran_ack() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_heartbeat(&tmp, "check things");
        let count = Arc::new(AtomicU32::new(0));
        let (hb, mut outcomes) = Heartbeat::start(
            fast_config(),
            path,
            Some(counting_callback(count.clone(), "")),
            None,
        );

        hb.request(WakeReason::Manual);
        tokio::time::advance(Duration::from_millis(300)).await;
        assert_eq!(outcomes.recv().await.unwrap(), HeartbeatOutcome::RanAck);
        hb.stop();
    }
}
