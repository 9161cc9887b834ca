use std::{fmt, time::Duration};

use thiserror::Error;
use uuid::Uuid;

use crate::event_store::ExpectedVersion;

#[derive(Error, Debug)]
pub enum CqrsError {
    #[error("Failed to (de)serialize event payload: {0}")]
    PayloadDeserialization(#[from] serde_json::Error),

    #[error("Command validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error(
        "Concurrency conflict on stream `{stream}`: expected {expected}, current {}",
        version_label(.current)
    )]
    ConcurrencyConflict {
        stream: String,
        expected: ExpectedVersion,
        current: Option<u64>,
    },

    #[error("No aggregate handles command `{0}`")]
    UnregisteredCommand(&'static str),

    #[error("No read model handles query `{0}`")]
    UnregisteredQuery(&'static str),

    #[error("Duplicate handler for `{key}` in `{owner}`")]
    DuplicateHandler { owner: String, key: String },

    #[error("Command `{0}` carries no aggregate id")]
    MissingAggregateId(&'static str),

    #[error("Read model `{read_model}` failed to apply event {event_id} ({event_type}): {source}")]
    ProjectionApply {
        read_model: String,
        event_id: Uuid,
        event_type: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Read model `{read_model}` gave no consistent snapshot within {waited:?}")]
    QueryTimeout { read_model: String, waited: Duration },

    #[error("Query handler of read model `{read_model}` failed: {source}")]
    QueryHandler {
        read_model: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Event store operation failed on stream `{stream}`: {source}")]
    StoreOperation {
        stream: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Subscription to `{stream}` lagged, {missed} events were not delivered")]
    SubscriptionLagged { stream: String, missed: u64 },

    #[error("Snapshot operation failed: {0}")]
    Snapshot(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Generic CQRS error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl CqrsError {
    pub(crate) fn store(stream: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::StoreOperation {
            stream: stream.into(),
            source: source.into(),
        }
    }

    /// Whether re-reading the stream and submitting the same command again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

fn version_label(version: &Option<u64>) -> String {
    match version {
        Some(v) => v.to_string(),
        None => "empty stream".to_string(),
    }
}

/// A single field-level rule violation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

/// The set of violations that made a command invalid.
#[derive(Clone, Debug, Default, PartialEq, Eq, Error)]
pub struct ValidationError {
    violations: Vec<Violation>,
}

impl ValidationError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for an error with a single violation.
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new().with(field, message)
    }

    pub fn with(mut self, field: impl Into<String>, message: impl Into<String>) -> Self {
        self.push(field, message);
        self
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.violations.push(Violation {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn extend(&mut self, other: ValidationError) {
        self.violations.extend(other.violations);
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.violations.is_empty() {
            return write!(f, "command rejected");
        }
        let parts: Vec<String> = self
            .violations
            .iter()
            .map(|v| format!("{}: {}", v.field, v.message))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

// Result alias within the library
pub type Result<T, E = CqrsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_violation() {
        let err = ValidationError::field("name", "must not be blank").with("user_id", "is required");
        assert_eq!(err.violations().len(), 2);
        assert_eq!(
            err.to_string(),
            "name: must not be blank, user_id: is required"
        );
    }

    #[test]
    fn conflict_on_empty_stream_is_readable() {
        let err = CqrsError::ConcurrencyConflict {
            stream: "Account-1".to_string(),
            expected: ExpectedVersion::NoStream,
            current: None,
        };
        assert!(err.to_string().contains("empty stream"));
        assert!(err.is_retryable());
    }

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(!CqrsError::MissingAggregateId("Cmd").is_retryable());
        assert!(!CqrsError::from(ValidationError::field("a", "b")).is_retryable());
    }

    // Errors cross task boundaries through the projection engine.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<CqrsError>();
        }
    };
}
