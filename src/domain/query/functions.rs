//! `{"__function__": name}` markers in stored JSON filters.
//!
//! Markers are replaced by a pre-pass over the parsed document. Each marker
//! is evaluated at most once per request: the [`FunctionCache`] lives for one
//! request, so every reference inside it sees the same value.

use chrono::Utc;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub const FUNCTION_KEY: &str = "__function__";

#[derive(Debug, Error)]
pub enum FunctionError {
    #[error("unsupported function [{0}] in __function__ query dictionary")]
    Unsupported(String),
    #[error("__function__ must name a function")]
    NotAName,
    #[error("query is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("query must be a JSON object")]
    NotAnObject,
}

pub type Evaluator = Arc<dyn Fn() -> JsonValue + Send + Sync>;

/// Marker name to evaluator.
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: HashMap<String, Evaluator>,
}

impl FunctionTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// `current_datetime` (RFC 3339), `current_timestamp_millis` and `current_timestamp_seconds`.
    pub fn standard() -> Self {
        Self::empty()
            .with("current_datetime", || JsonValue::from(Utc::now().to_rfc3339()))
            .with("current_timestamp_millis", || {
                JsonValue::from(Utc::now().timestamp_millis())
            })
            .with("current_timestamp_seconds", || {
                JsonValue::from(Utc::now().timestamp_micros() as f64 / 1_000_000.0)
            })
    }

    pub fn with<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn() -> JsonValue + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(f));
        self
    }

    fn get(&self, name: &str) -> Option<&Evaluator> {
        self.functions.get(name)
    }
}

/// Values already computed during the current request.
#[derive(Debug, Default)]
pub struct FunctionCache {
    values: HashMap<String, JsonValue>,
}

impl FunctionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Replaces every marker object inside `value`.
pub fn evaluate(
    value: JsonValue,
    table: &FunctionTable,
    cache: &mut FunctionCache,
) -> Result<JsonValue, FunctionError> {
    match value {
        JsonValue::Object(map) => {
            if let Some(marker) = map.get(FUNCTION_KEY) {
                let name = marker.as_str().ok_or(FunctionError::NotAName)?;
                if let Some(v) = cache.values.get(name) {
                    return Ok(v.clone());
                }
                let f = table
                    .get(name)
                    .ok_or_else(|| FunctionError::Unsupported(name.to_string()))?;
                let v = f();
                cache.values.insert(name.to_string(), v.clone());
                return Ok(v);
            }
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k, evaluate(v, table, cache)?);
            }
            Ok(JsonValue::Object(out))
        }
        JsonValue::Array(items) => items
            .into_iter()
            .map(|v| evaluate(v, table, cache))
            .collect::<Result<Vec<_>, _>>()
            .map(JsonValue::Array),
        other => Ok(other),
    }
}

/// Parses a stored filter document and evaluates its markers.
pub fn parse_query(
    query: &str,
    table: &FunctionTable,
    cache: &mut FunctionCache,
) -> Result<Map<String, JsonValue>, FunctionError> {
    let parsed: JsonValue = serde_json::from_str(query)?;
    match evaluate(parsed, table, cache)? {
        JsonValue::Object(map) => Ok(map),
        _ => Err(FunctionError::NotAnObject),
    }
}
