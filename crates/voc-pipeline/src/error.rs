use std::time::Duration;

use thiserror::Error;
use voc_core::{ChannelKind, DiscardReason, SourceConfigError};
use voc_crawler::Retriable;
use voc_db::{DbError, QueueError};

/// A raw record that cannot become feedback. Never fatal: the record is
/// discarded with its reason.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum CleaningError {
    #[error("malformed content: {reason}")]
    MalformedContent { reason: DiscardReason },
}

impl CleaningError {
    #[must_use]
    pub fn reason(self) -> DiscardReason {
        match self {
            CleaningError::MalformedContent { reason } => reason,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("completion request timed out")]
    Timeout,

    #[error("completion service rate limited (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("completion service returned {status}")]
    Server { status: u16 },

    #[error("completion request rejected with {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected completion response: {0}")]
    InvalidResponse(String),
}

impl Retriable for LlmError {
    fn is_retriable(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout
                | LlmError::RateLimited { .. }
                | LlmError::Server { .. }
                | LlmError::Transport(_)
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after_secs } => {
                Some(Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Transport(err.to_string())
        }
    }
}

/// Why one feedback item did not produce an insight.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("completion timed out")]
    Timeout,

    #[error("invalid extraction: {0}")]
    InvalidSchema(String),

    #[error("completion failed: {0}")]
    Llm(LlmError),

    #[error("attempt budget exhausted")]
    AttemptsExhausted,
}

impl From<LlmError> for ExtractionError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Timeout => ExtractionError::Timeout,
            other => ExtractionError::Llm(other),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Request(String),

    #[error("embedding service returned {0}")]
    Status(u16),

    #[error("embedding response invalid: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error("cannot read taxonomy {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed taxonomy: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid keyword pattern for theme {theme}: {source}")]
    Pattern {
        theme: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("embeddings unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("no free name for emerging theme {0:?}")]
    ThemeNameTaken(String),

    #[error(transparent)]
    Store(#[from] DbError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("channel unreachable: {0}")]
    ChannelUnreachable(String),

    #[error("receiver responded {status}")]
    Rejected { status: u16 },

    #[error("no {0} channel configured")]
    NotConfigured(ChannelKind),

    #[error("invalid target: {0}")]
    InvalidTarget(String),
}

impl Retriable for DeliveryError {
    fn is_retriable(&self) -> bool {
        match self {
            DeliveryError::ChannelUnreachable(_) => true,
            DeliveryError::Rejected { status } => *status == 429 || *status >= 500,
            DeliveryError::NotConfigured(_) | DeliveryError::InvalidTarget(_) => false,
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        DeliveryError::ChannelUnreachable(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("source {0} is not active")]
    SourceInactive(i64),

    #[error(transparent)]
    InvalidConfig(#[from] SourceConfigError),

    #[error("unserializable job: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] DbError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("malformed job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] DbError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("{0} insights could not be classified")]
    Unclassified(usize),
}
