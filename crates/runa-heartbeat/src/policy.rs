// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The heartbeat policy layer: pure decision logic, no timers.
//!
//! The scheduler owns the clock; everything here is a function of explicit
//! inputs so the gate can be tested without sleeping.

use chrono::{DateTime, NaiveTime, Utc};

use runa_config::{ActiveHoursConfig, HeartbeatConfig};

use crate::content::is_effectively_empty;

/// Why the scheduler woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The regular interval elapsed.
    Interval,
    /// An exec-style tool asked for an immediate wake.  Exec wakes bypass
    /// the empty-content gate.
    Exec,
    /// Explicit `trigger_heartbeat()` call.
    Manual,
    /// Re-armed after a failed or deferred attempt.
    Retry,
}

impl std::fmt::Display for WakeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WakeReason::Interval => "interval",
            WakeReason::Exec => "exec",
            WakeReason::Manual => "manual",
            WakeReason::Retry => "retry",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    OutsideActiveHours,
    EmptyContent,
    NoCallback,
    DuplicateMessage,
    RequestsInFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The callback ran and its reply was delivered.
    Ran,
    /// The callback ran and acknowledged with an empty reply.
    RanAck,
    Skipped(SkipReason),
    /// The callback returned an error; the scheduler re-arms a retry.
    Failed,
}

/// What the callback receives on each delivered wake.
#[derive(Debug, Clone)]
pub struct HeartbeatEvent {
    /// Raw HEARTBEAT.md content (pre-strip), so the callback sees exactly
    /// what the user wrote.
    pub content: String,
    pub reason: WakeReason,
    /// Where the wake came from, for logging ("scheduler", "exec", …).
    pub source: String,
}

/// True when `now` falls inside the window.  `start > end` wraps past
/// midnight (e.g. 22:00–06:00).
pub fn in_active_hours(hours: &ActiveHoursConfig, now: NaiveTime) -> bool {
    if hours.start <= hours.end {
        now >= hours.start && now < hours.end
    } else {
        now >= hours.start || now < hours.end
    }
}

/// Mutable policy state that survives between wakes: the last delivered
/// reply, for duplicate suppression.
#[derive(Debug, Default)]
pub struct HeartbeatPolicy {
    last_sent: Option<(String, DateTime<Utc>)>,
}

impl HeartbeatPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-callback gate.  Returns the skip reason that stops this wake, or
    /// `None` when the callback should run.
    pub fn gate(
        &self,
        config: &HeartbeatConfig,
        reason: WakeReason,
        raw_content: &str,
        now_local: NaiveTime,
        has_callback: bool,
    ) -> Option<SkipReason> {
        if let Some(hours) = &config.active_hours {
            if !in_active_hours(hours, now_local) {
                return Some(SkipReason::OutsideActiveHours);
            }
        }
        if is_effectively_empty(raw_content) && reason != WakeReason::Exec {
            return Some(SkipReason::EmptyContent);
        }
        if !has_callback {
            return Some(SkipReason::NoCallback);
        }
        None
    }

    /// Classify the callback's reply and record it for duplicate
    /// suppression.
    pub fn record_reply(
        &mut self,
        config: &HeartbeatConfig,
        text: &str,
        now: DateTime<Utc>,
    ) -> HeartbeatOutcome {
        if text.trim().is_empty() {
            return HeartbeatOutcome::RanAck;
        }
        if let Some((last_text, last_at)) = &self.last_sent {
            let window = chrono::Duration::seconds(config.duplicate_window_secs as i64);
            if last_text == text && now - *last_at < window {
                return HeartbeatOutcome::Skipped(SkipReason::DuplicateMessage);
            }
        }
        self.last_sent = Some((text.to_string(), now));
        HeartbeatOutcome::Ran
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
