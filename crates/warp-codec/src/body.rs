//! Structured bodies carried by list and map lane `event`/`command` envelopes.
//!
//! Value lanes carry the new value directly as the body. List and map lanes
//! wrap each mutation in a single-key object naming the operation, e.g.
//! `{"update":{"key":"a","value":1}}`, or a bare string for `"clear"`.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::CodecError;
use crate::Value;

/// Keyed mutation of a map lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapAction {
    /// Insert or replace the value stored under `key`.
    Update { key: Value, value: Value },
    /// Remove the entry stored under `key`.
    Remove { key: Value },
    /// Remove every entry.
    Clear,
    /// Remove the first `count` entries in key order.
    Drop { count: usize },
    /// Keep only the first `count` entries in key order.
    Take { count: usize },
}

impl MapAction {
    pub fn from_body(body: &Value) -> Result<Self, CodecError> {
        Ok(Self::deserialize(body)?)
    }

    pub fn to_body(&self) -> Value {
        match self {
            Self::Update { key, value } => json!({"update": {"key": key, "value": value}}),
            Self::Remove { key } => json!({"remove": {"key": key}}),
            Self::Clear => json!("clear"),
            Self::Drop { count } => json!({"drop": {"count": count}}),
            Self::Take { count } => json!({"take": {"count": count}}),
        }
    }
}

/// Positional mutation of a list lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListAction {
    /// Replace the item at `index`; appends when `index == len`.
    Update { index: usize, value: Value },
    /// Insert before `index`, shifting later items right.
    Insert { index: usize, value: Value },
    /// Remove the item at `index`.
    Remove { index: usize },
    /// Move one item from `from` to `to`.
    Move { from: usize, to: usize },
    Clear,
    /// Remove the first `count` items.
    Drop { count: usize },
    /// Keep only the first `count` items.
    Take { count: usize },
}

impl ListAction {
    pub fn from_body(body: &Value) -> Result<Self, CodecError> {
        Ok(Self::deserialize(body)?)
    }

    pub fn to_body(&self) -> Value {
        match self {
            Self::Update { index, value } => {
                json!({"update": {"index": index, "value": value}})
            }
            Self::Insert { index, value } => {
                json!({"insert": {"index": index, "value": value}})
            }
            Self::Remove { index } => json!({"remove": {"index": index}}),
            Self::Move { from, to } => json!({"move": {"from": from, "to": to}}),
            Self::Clear => json!("clear"),
            Self::Drop { count } => json!({"drop": {"count": count}}),
            Self::Take { count } => json!({"take": {"count": count}}),
        }
    }
}
