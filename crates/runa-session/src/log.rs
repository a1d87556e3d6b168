// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Append-only per-session transcript storage.
//!
//! One JSONL file per session under the log directory.  The first record of a
//! file names the session key (so `list()` never has to reverse the sanitized
//! filename); message and compaction-boundary records follow, one JSON object
//! per line.  The log never rewrites history — compaction only appends a
//! boundary record, and `load()` materializes the post-compaction view.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use runa_model::Message;

use crate::key::SessionKey;

/// One line of a session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LogRecord {
    /// File header: the exact session key this file belongs to.
    Session { key: String },
    Message { id: u64, message: Message },
    Compaction {
        summary: String,
        first_kept_entry_id: u64,
        tokens_before: usize,
        timestamp: DateTime<Utc>,
    },
}

/// A compaction boundary as stored in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionRecord {
    pub summary: String,
    pub first_kept_entry_id: u64,
    pub tokens_before: usize,
}

/// One transcript entry with its stable id.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: u64,
    pub message: Message,
}

/// The loaded state of one session: entries after the last compaction
/// boundary plus the boundary itself (if any).
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub entries: Vec<LogEntry>,
    pub compaction: Option<CompactionRecord>,
}

impl SessionState {
    pub fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SessionMeta {
    next_id: u64,
    last_ts: Option<DateTime<Utc>>,
}

/// Append-only JSONL session store.
pub struct SessionLog {
    dir: PathBuf,
    /// Per-session append cursor (next entry id, last timestamp), lazily
    /// initialized from the file on first touch.
    meta: Mutex<HashMap<String, SessionMeta>>,
}

impl SessionLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            meta: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &SessionKey) -> PathBuf {
        self.dir.join(format!("{}.jsonl", key.file_stem()))
    }

    /// Read every parseable record from a session file.  A torn final line
    /// (partial write at crash time) is tolerated and skipped.
    fn read_records(&self, path: &Path) -> anyhow::Result<Vec<LogRecord>> {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };
        let lines: Vec<&str> = text.lines().collect();
        let mut records = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(line) {
                Ok(r) => records.push(r),
                Err(e) if i + 1 == lines.len() => {
                    warn!(path = %path.display(), error = %e, "dropping torn final record");
                }
                Err(e) => {
                    warn!(path = %path.display(), line = i + 1, error = %e, "skipping unparseable record");
                }
            }
        }
        Ok(records)
    }

    fn meta_for(&self, key: &SessionKey) -> anyhow::Result<SessionMeta> {
        {
            let cache = self.meta.lock().expect("session meta lock poisoned");
            if let Some(m) = cache.get(&key.full()) {
                return Ok(*m);
            }
        }
        let mut meta = SessionMeta::default();
        for record in self.read_records(&self.path_for(key))? {
            if let LogRecord::Message { id, message } = record {
                meta.next_id = meta.next_id.max(id + 1);
                meta.last_ts = Some(match meta.last_ts {
                    Some(prev) => prev.max(message.timestamp),
                    None => message.timestamp,
                });
            }
        }
        self.meta
            .lock()
            .expect("session meta lock poisoned")
            .insert(key.full(), meta);
        Ok(meta)
    }

    fn write_record(&self, key: &SessionKey, record: &LogRecord) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating session directory {}", self.dir.display()))?;
        let path = self.path_for(key);
        let is_new = !path.exists();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        if is_new {
            let header = LogRecord::Session { key: key.full() };
            writeln!(file, "{}", serde_json::to_string(&header)?)?;
        }
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        file.flush()?;
        // Durable-before-return: a crash after append must not lose the entry.
        file.sync_data()
            .with_context(|| format!("syncing {}", path.display()))?;
        Ok(())
    }

    /// Atomically append one message; returns its entry id.
    ///
    /// Timestamps are clamped to be non-decreasing within the session.
    pub fn append(&self, key: &SessionKey, msg: &Message) -> anyhow::Result<u64> {
        let mut meta = self.meta_for(key)?;
        let id = meta.next_id;

        let mut message = msg.clone();
        if let Some(last) = meta.last_ts {
            if message.timestamp < last {
                message.timestamp = last;
            }
        }

        self.write_record(key, &LogRecord::Message { id, message: message.clone() })?;

        meta.next_id = id + 1;
        meta.last_ts = Some(message.timestamp);
        self.meta
            .lock()
            .expect("session meta lock poisoned")
            .insert(key.full(), meta);
        Ok(id)
    }

    /// Record a compaction boundary.
    pub fn append_compaction(
        &self,
        key: &SessionKey,
        summary: &str,
        first_kept_entry_id: u64,
        tokens_before: usize,
    ) -> anyhow::Result<()> {
        self.write_record(
            key,
            &LogRecord::Compaction {
                summary: summary.to_string(),
                first_kept_entry_id,
                tokens_before,
                timestamp: Utc::now(),
            },
        )
    }

    /// Load the session state: entries at or after the last compaction
    /// boundary, plus that boundary (if any).
    pub fn load_state(&self, key: &SessionKey) -> anyhow::Result<SessionState> {
        let records = self.read_records(&self.path_for(key))?;

        let compaction = records.iter().rev().find_map(|r| match r {
            LogRecord::Compaction {
                summary,
                first_kept_entry_id,
                tokens_before,
                ..
            } => Some(CompactionRecord {
                summary: summary.clone(),
                first_kept_entry_id: *first_kept_entry_id,
                tokens_before: *tokens_before,
            }),
            _ => None,
        });
        let first_kept = compaction.as_ref().map(|c| c.first_kept_entry_id);

        let entries = records
            .into_iter()
            .filter_map(|r| match r {
                LogRecord::Message { id, message } => Some(LogEntry { id, message }),
                _ => None,
            })
            .filter(|e| first_kept.map(|f| e.id >= f).unwrap_or(true))
            .collect();

        Ok(SessionState { entries, compaction })
    }

    /// Load the materialized transcript: the compaction summary (when
    /// present) as a synthetic user message, followed by the kept messages.
    pub fn load(&self, key: &SessionKey) -> anyhow::Result<Vec<Message>> {
        let state = self.load_state(key)?;
        let mut messages = Vec::with_capacity(state.entries.len() + 1);
        if let Some(c) = &state.compaction {
            messages.push(Message::user(c.summary.clone()));
        }
        messages.extend(state.entries.into_iter().map(|e| e.message));
        Ok(messages)
    }

    /// Every session key with a transcript file in the log directory.
    pub fn list(&self) -> anyhow::Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir).context("reading session directory")? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(LogRecord::Session { key }) =
                self.read_records(&path)?.into_iter().next()
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Delete a session's transcript.
    pub fn clear(&self, key: &SessionKey) -> anyhow::Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
        }
        self.meta
            .lock()
            .expect("session meta lock poisoned")
            .remove(&key.full());
        Ok(())
    }

    /// Find the entry id of a message equal to `msg` (latest match wins).
    pub fn resolve_message_entry_id(
        &self,
        key: &SessionKey,
        msg: &Message,
    ) -> anyhow::Result<Option<u64>> {
        let state = self.load_state(key)?;
        Ok(state
            .entries
            .iter()
            .rev()
            .find(|e| e.message == *msg)
            .map(|e| e.id))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
