//! # Errors
//!
//! Typed errors that cross module seams. Plumbing inside a module uses
//! `anyhow` with context, like the rest of the crate.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::swarm::messages::Topic;

/// Longest failure description carried by a [`CallFailure`]
pub const MAX_FAILURE_CHARS: usize = 100;

/// Errors raised by the message bus
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BusError {
    #[error("no handler registered for topic {0}")]
    UnknownTopic(Topic),
    #[error("a handler is already registered for topic {0}")]
    AlreadyRegistered(Topic),
    #[error("message bus is closed")]
    Closed,
}

/// Errors raised by the knowledge store adapter
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("upsert arrays disagree in length: {ids} ids, {vectors} vectors, {documents} documents, {metadata} metadata")]
    LengthMismatch {
        ids: usize,
        vectors: usize,
        documents: usize,
        metadata: usize,
    },
    #[error("lock error: {0}")]
    Lock(String),
}

/// Structured failure returned by the retry wrapper once attempts run out.
///
/// Callers turn this into a sentinel record instead of propagating it, so
/// downstream stages always see a valid-shaped value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFailure {
    /// Number of attempts made before giving up
    pub attempts: u32,
    /// Last error, truncated to [`MAX_FAILURE_CHARS`]
    pub reason: String,
    /// Whether the run was cancelled while retrying
    pub cancelled: bool,
}

impl CallFailure {
    pub fn new(attempts: u32, reason: impl AsRef<str>) -> Self {
        Self {
            attempts,
            reason: truncate_chars(reason.as_ref(), MAX_FAILURE_CHARS),
            cancelled: false,
        }
    }

    pub fn cancelled(attempts: u32) -> Self {
        Self {
            attempts,
            reason: "cancelled".to_string(),
            cancelled: true,
        }
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} attempts)", self.reason, self.attempts)
    }
}

impl std::error::Error for CallFailure {}

/// Truncate on a char boundary
pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
