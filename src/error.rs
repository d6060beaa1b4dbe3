use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

/// Error type for all bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// A task or event handler with the same task name was already registered.
    #[error("task {task_name} already registered")]
    AlreadyRegistered { task_name: String },

    /// A task definition carries an explicit queue that differs from the
    /// service's queue.
    #[error("task {task_name} belongs to a different queue. Expected {expected}, got {got}")]
    WrongQueue {
        task_name: String,
        expected: String,
        got: String,
    },

    /// Producer-side input failed JSON-schema validation. Raised before any
    /// SQL is issued.
    #[error("invalid input for {name}: {reason}")]
    Validation { name: String, reason: String },

    /// The given JSON schema could not be compiled into a validator.
    #[error("invalid schema for {name}: {reason}")]
    InvalidSchema { name: String, reason: String },

    /// An applied migration's hash no longer matches the embedded file.
    /// The scripts have changed since they were applied.
    #[error("hashes don't match for migrations {files:?}")]
    MigrationHashMismatch { files: Vec<String> },

    /// A migration file name does not match `^(-?\d+)[-_]?(.*)\.sql$`.
    #[error("invalid migration file name: '{file_name}'")]
    InvalidMigrationFile { file_name: String },

    /// Configuration was rejected at construction time.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Serialize a handler error into the open record persisted as `task.output`.
///
/// Every piece of context the error carries is kept: the message, the debug
/// rendition of the chain as `stack`, and any structured attributes the
/// handler attached via [`HandlerError::attr`].
pub fn serialize_error(err: &anyhow::Error) -> JsonValue {
    let mut record = Map::new();
    record.insert("name".into(), JsonValue::String("Error".into()));
    record.insert("message".into(), JsonValue::String(err.to_string()));
    record.insert("stack".into(), JsonValue::String(format!("{err:?}")));

    if let Some(handler_err) = err.downcast_ref::<HandlerError>() {
        for (key, value) in &handler_err.attributes {
            record.insert(key.clone(), value.clone());
        }
    }

    JsonValue::Object(record)
}

/// A handler failure carrying arbitrary string-keyed attributes.
///
/// Handlers may return any `anyhow::Error`; use this type when structured
/// context should survive into the persisted `task.output` record.
///
/// ```
/// use tbus::HandlerError;
/// use serde_json::json;
///
/// let err = HandlerError::new("payment declined")
///     .attr("code", json!("card_declined"))
///     .attr("retryable", json!(false));
/// assert_eq!(err.to_string(), "payment declined");
/// ```
#[derive(Debug)]
pub struct HandlerError {
    message: String,
    attributes: Vec<(String, JsonValue)>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            attributes: Vec::new(),
        }
    }

    /// Attach a structured attribute copied into the persisted error record.
    pub fn attr(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.attributes.push((key.into(), value));
        self
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_plain_errors() {
        let err = anyhow::anyhow!("boom");
        let record = serialize_error(&err);
        assert_eq!(record["name"], json!("Error"));
        assert_eq!(record["message"], json!("boom"));
        assert!(record["stack"].as_str().unwrap().contains("boom"));
    }

    #[test]
    fn keeps_handler_error_attributes() {
        let err: anyhow::Error = HandlerError::new("declined")
            .attr("code", json!(42))
            .attr("hint", json!("retry tomorrow"))
            .into();
        let record = serialize_error(&err);
        assert_eq!(record["message"], json!("declined"));
        assert_eq!(record["code"], json!(42));
        assert_eq!(record["hint"], json!("retry tomorrow"));
    }
}
