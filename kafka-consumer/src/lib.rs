//! Kafka consumer runtime.
//!
//! Records fetched for a dynamic set of partition assignments are dispatched to
//! one worker per live partition. Each worker hands records to a user
//! [`Processor`] and commits their offsets, either after processing
//! (at-least-once) or before it (at-most-once).
//!
//! ```text
//! host client ──► fetch pump ──► event loop ──► partition channel ──► worker ──► Processor
//!      │                            ▲                                    │
//!      └── rebalance callbacks ─────┘                                    └──► commit
//! ```
//!
//! ## Error logging
//!
//! Errors are logged on a stable `error` field (`error = %e`), next to the
//! `messaging.*` attributes that locate the record. Processor failures are
//! counted by category on the `error.type` label, never by their text.

pub mod config;
pub mod error;
pub mod event_loop;
pub mod kafka;
pub mod metrics_consts;
pub mod orchestrator;
pub mod processor;
pub mod runtime;
pub mod telemetry;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod test_utils;

// Re-export commonly used types for convenience
pub use config::{Config, ConsumerConfig, TlsConfig};
pub use error::{ConfigError, ConsumerError};
pub use kafka::Message;
pub use orchestrator::DeliveryMode;
pub use processor::{FailureKind, Processor, ProcessorError};
pub use runtime::{Runtime, TopicProcessor};
