//! Per-entity migration strategies.
//!
//! Each migratable entity family declares its strategy explicitly: which
//! store partition it lives in, which bulk endpoint it submits to, how many
//! records one worker claims at a time, the bulk-submit options, and the
//! transform that maps a source payload to a destination payload.

use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;

/// Pure mapping from one source record payload to one destination payload.
///
/// Implementations live with the embedding application; the orchestrator
/// only calls `convert` once per claimed record.
pub trait Transform: Send + Sync {
    fn convert(&self, payload: &Value) -> Result<Value>;
}

impl<F> Transform for F
where
    F: Fn(&Value) -> Result<Value> + Send + Sync,
{
    fn convert(&self, payload: &Value) -> Result<Value> {
        self(payload)
    }
}

/// Declared migration strategy for one entity family.
#[derive(Clone)]
pub struct EntityStrategy {
    /// Store partition, e.g. "ticket".
    pub resource_type: String,
    /// Destination resource family, e.g. "tickets"; also the payload key.
    pub resource_plural: String,
    /// Records claimed per batch.
    pub batch_size: usize,
    /// Query options appended to the bulk-create request.
    pub bulk_options: Vec<(String, String)>,
    pub transform: Arc<dyn Transform>,
}

impl EntityStrategy {
    pub fn new(
        resource_type: impl Into<String>,
        resource_plural: impl Into<String>,
        batch_size: usize,
        transform: Arc<dyn Transform>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_plural: resource_plural.into(),
            batch_size,
            bulk_options: Vec::new(),
            transform,
        }
    }

    pub fn with_bulk_options(mut self, options: Vec<(String, String)>) -> Self {
        self.bulk_options = options;
        self
    }

    /// Ticket preset: small batches, archived on import.
    pub fn tickets(transform: Arc<dyn Transform>) -> Self {
        Self::new("ticket", "tickets", 25, transform).with_bulk_options(vec![(
            "archive_immediately".to_string(),
            "true".to_string(),
        )])
    }

    /// User preset.
    pub fn users(transform: Arc<dyn Transform>) -> Self {
        Self::new("user", "users", 100, transform)
    }

    /// Wrap converted payloads into the bulk-create body,
    /// `{"<plural>": [...]}`.
    pub fn build_payload(&self, converted: Vec<Value>) -> Value {
        let mut body = serde_json::Map::new();
        body.insert(self.resource_plural.clone(), Value::Array(converted));
        Value::Object(body)
    }
}
