// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::fmt;

use uuid::Uuid;

/// Ill-formed session key errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("session key must have the shape agent:<agentId>:<tail>: {0}")]
    Shape(String),
    #[error("session key has an empty segment: {0}")]
    EmptySegment(String),
    #[error("subagent tail must carry a UUID: {0}")]
    BadSubagentId(String),
    #[error("session id may not contain ':' or whitespace: {0}")]
    BadSessionId(String),
}

/// The tail of a session key: what kind of session it names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionTail {
    /// The agent's default session.
    Main,
    /// A caller-supplied session id.
    Named(String),
    /// A child session spawned for one subagent task.
    Subagent(Uuid),
}

/// A normalized session key of the shape `agent:<agentId>:<tail>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    agent_id: String,
    tail: SessionTail,
}

impl SessionKey {
    /// The agent's main session.
    pub fn main(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            tail: SessionTail::Main,
        }
    }

    /// A named session for a caller-supplied id.
    pub fn named(agent_id: impl Into<String>, session_id: &str) -> Result<Self, KeyError> {
        if session_id.is_empty() {
            return Err(KeyError::EmptySegment(session_id.into()));
        }
        if session_id.contains(':') || session_id.chars().any(char::is_whitespace) {
            return Err(KeyError::BadSessionId(session_id.into()));
        }
        if session_id == "main" {
            return Ok(Self::main(agent_id));
        }
        Ok(Self {
            agent_id: agent_id.into(),
            tail: SessionTail::Named(session_id.into()),
        })
    }

    /// A fresh subagent session key with a generated UUID.
    pub fn subagent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            tail: SessionTail::Subagent(Uuid::new_v4()),
        }
    }

    /// Parse a full `agent:<agentId>:<tail>` key, rejecting ill-formed input.
    pub fn parse(key: &str) -> Result<Self, KeyError> {
        let mut parts = key.splitn(3, ':');
        let prefix = parts.next().unwrap_or_default();
        let agent_id = parts.next().unwrap_or_default();
        let tail = parts.next().unwrap_or_default();

        if prefix != "agent" {
            return Err(KeyError::Shape(key.into()));
        }
        if agent_id.is_empty() || tail.is_empty() {
            return Err(KeyError::EmptySegment(key.into()));
        }

        if tail == "main" {
            return Ok(Self::main(agent_id));
        }
        if let Some(id) = tail.strip_prefix("subagent:") {
            let uuid =
                Uuid::parse_str(id).map_err(|_| KeyError::BadSubagentId(key.into()))?;
            return Ok(Self {
                agent_id: agent_id.into(),
                tail: SessionTail::Subagent(uuid),
            });
        }
        Self::named(agent_id, tail)
    }

    /// Resolve from the public API inputs: an explicit full key wins, then a
    /// bare session id, then the agent's main session.
    pub fn resolve(
        agent_id: &str,
        session_key: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<Self, KeyError> {
        if let Some(key) = session_key {
            return Self::parse(key);
        }
        if let Some(id) = session_id {
            return Self::named(agent_id, id);
        }
        Ok(Self::main(agent_id))
    }

    /// Accept either a full key or a bare session id in one argument.
    pub fn resolve_flexible(agent_id: &str, key_or_id: &str) -> Result<Self, KeyError> {
        if key_or_id.starts_with("agent:") {
            Self::parse(key_or_id)
        } else {
            Self::named(agent_id, key_or_id)
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn tail(&self) -> &SessionTail {
        &self.tail
    }

    pub fn is_subagent(&self) -> bool {
        matches!(self.tail, SessionTail::Subagent(_))
    }

    /// The full normalized key string.
    pub fn full(&self) -> String {
        match &self.tail {
            SessionTail::Main => format!("agent:{}:main", self.agent_id),
            SessionTail::Named(id) => format!("agent:{}:{id}", self.agent_id),
            SessionTail::Subagent(uuid) => {
                format!("agent:{}:subagent:{uuid}", self.agent_id)
            }
        }
    }

    /// Filesystem-safe stem for the session's transcript file.
    pub fn file_stem(&self) -> String {
        self.full()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
