use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::kafka::message::Message;

/// Stable categories for processor failures. The string form is used as the
/// `error.type` metric label and span attribute, so raw error text never leaks
/// into label values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The payload could not be decoded.
    Decode,
    /// The payload decoded but failed business validation.
    Validation,
    /// A downstream dependency failed; a retry may succeed.
    Transient,
    Internal,
    /// The processor gave up because the cancellation token fired.
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Decode => "decode",
            FailureKind::Validation => "validation",
            FailureKind::Transient => "transient",
            FailureKind::Internal => "internal",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("{kind} failure: {source:#}")]
pub struct ProcessorError {
    kind: FailureKind,
    #[source]
    source: anyhow::Error,
}

impl ProcessorError {
    pub fn new(kind: FailureKind, source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn decode(source: impl Into<anyhow::Error>) -> Self {
        Self::new(FailureKind::Decode, source)
    }

    pub fn validation(source: impl Into<anyhow::Error>) -> Self {
        Self::new(FailureKind::Validation, source)
    }

    pub fn transient(source: impl Into<anyhow::Error>) -> Self {
        Self::new(FailureKind::Transient, source)
    }

    pub fn internal(source: impl Into<anyhow::Error>) -> Self {
        Self::new(FailureKind::Internal, source)
    }

    pub fn cancelled() -> Self {
        Self::new(
            FailureKind::Cancelled,
            anyhow::anyhow!("processing cancelled"),
        )
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }
}

/// User-supplied business logic for a single message.
///
/// Implementations paired with at-least-once delivery must be idempotent, since
/// records can be redelivered after a failed commit or a restart. Implementations
/// must return promptly once `cancel` fires.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(
        &self,
        cancel: &CancellationToken,
        message: &Message,
    ) -> Result<(), ProcessorError>;
}
