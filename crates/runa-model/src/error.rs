// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Substring classification of provider errors.
//!
//! Provider adapters surface errors as free-form text; the loop only needs a
//! coarse disposition: retry (rate limit), compact-and-retry (context
//! overflow), or surface.  Classification is substring matching over the
//! lowercased error text, checked in a fixed order.

/// Coarse classification of an error observed from a model provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RateLimit,
    Auth,
    Timeout,
    Billing,
    Format,
    ContextOverflow,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Auth => "auth",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Billing => "billing",
            ErrorKind::Format => "format",
            ErrorKind::ContextOverflow => "context_overflow",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

const CONTEXT_OVERFLOW_PATTERNS: &[&str] = &[
    "context_length_exceeded",
    "exceed_context_size",
    "prompt is too long",
    "maximum context length",
    "context window",
    "input is too long",
];

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "429",
    "overloaded",
];

const AUTH_PATTERNS: &[&str] = &[
    "401",
    "403",
    "unauthorized",
    "invalid api key",
    "invalid x-api-key",
    "authentication",
];

const BILLING_PATTERNS: &[&str] = &[
    "billing",
    "insufficient credit",
    "insufficient quota",
    "payment required",
    "402",
];

const TIMEOUT_PATTERNS: &[&str] = &["timed out", "timeout", "deadline exceeded", "504"];

const FORMAT_PATTERNS: &[&str] = &["invalid request", "malformed", "400", "invalid_request_error"];

/// Classify an error message into an [`ErrorKind`].
///
/// Overflow is checked first: some backends report it as a 400
/// invalid-request, and the overflow disposition must win.
pub fn classify_str(message: &str) -> ErrorKind {
    let msg = message.to_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| msg.contains(p));

    if matches(CONTEXT_OVERFLOW_PATTERNS) {
        ErrorKind::ContextOverflow
    } else if matches(RATE_LIMIT_PATTERNS) {
        ErrorKind::RateLimit
    } else if matches(AUTH_PATTERNS) {
        ErrorKind::Auth
    } else if matches(BILLING_PATTERNS) {
        ErrorKind::Billing
    } else if matches(TIMEOUT_PATTERNS) {
        ErrorKind::Timeout
    } else if matches(FORMAT_PATTERNS) {
        ErrorKind::Format
    } else {
        ErrorKind::Unknown
    }
}

/// Classify an [`anyhow::Error`], including its source chain text.
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    classify_str(&format!("{err:#}"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
