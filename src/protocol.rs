//! Wire types for the table's two channels.
//!
//! The table talks JSON on both channels, but with loose shapes: a state
//! payload may be a single object, a list of objects, or `null` as a
//! disconnect signal, and objects within a list are either entity
//! fragments (carrying an `id`), timing fragments (carrying
//! `remaining_time`/`total_time`), or something this client does not
//! recognize. This module decodes those shapes into a tagged union once,
//! at the boundary, so the rest of the crate can dispatch exhaustively
//! instead of inspecting JSON at every call site.
//!
//! Boolean device fields arrive as the string literals `"true"`/`"false"`.
//! They stay strings inside entity records so the no-op merge check runs
//! against the raw wire representation; [`parse_wire_bool`] normalizes
//! them at the point of interpretation.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use serde_with::{formats::Flexible, serde_as, DurationMilliSeconds};

use crate::{
    error::{Error, Result},
    model::Entity,
};

/// Response envelope for command posts.
///
/// The table answers every command with `{"err": ..., "resp": ...}`, or
/// `{"err": ..., "error": ...}` when the command failed. `err` follows
/// JavaScript truthiness: `false`, `null`, `0`, and `""` all mean success.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub err: Value,
    #[serde(default)]
    pub resp: Value,
    #[serde(default)]
    pub error: Option<Value>,
}

impl Envelope {
    /// Unwraps the envelope into the `resp` payload.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` when the table reported a truthy
    /// `err`, carrying whatever detail the table sent along.
    pub fn into_result(self) -> Result<Value> {
        if is_truthy(&self.err) {
            let detail = self.error.unwrap_or(self.err);
            return Err(Error::failed_precondition(format!(
                "table rejected command: {detail}"
            )));
        }

        Ok(self.resp)
    }
}

/// JavaScript-style truthiness, as the table's firmware applies it.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

/// One timing fragment, pushed periodically while a track plays.
///
/// The table does not timestamp these; the receiver records its own
/// local receipt time.
#[serde_as]
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct Timing {
    /// Time left on the active track.
    #[serde_as(as = "DurationMilliSeconds<f64, Flexible>")]
    pub remaining_time: Duration,

    /// Total length of the active track.
    #[serde_as(as = "DurationMilliSeconds<f64, Flexible>")]
    pub total_time: Duration,
}

/// One object within an update batch.
#[derive(Clone, Debug)]
pub enum Fragment {
    /// An entity fragment: a partial delta for one device-reported object.
    Entity(Entity),

    /// A timing fragment for the active track.
    Timing(Timing),

    /// A fragment this client does not recognize.
    ///
    /// Kept as an escape hatch for forward compatibility; ingestion skips
    /// these without touching existing state.
    Unknown(Map<String, Value>),
}

impl Fragment {
    /// Classifies one object out of an update batch.
    #[must_use]
    pub fn from_map(map: Map<String, Value>) -> Self {
        if let Ok(entity) = Entity::from_map(map.clone()) {
            return Self::Entity(entity);
        }

        if map.contains_key("remaining_time") {
            if let Ok(timing) = Timing::deserialize(Value::Object(map.clone())) {
                return Self::Timing(timing);
            }
        }

        Self::Unknown(map)
    }
}

/// A decoded state payload from either channel.
#[derive(Clone, Debug)]
pub enum Update {
    /// A batch of fragments to merge into local state.
    Batch(Vec<Fragment>),

    /// The push channel reported loss of the table.
    Disconnect,
}

impl Update {
    /// Decodes an arbitrary payload into an [`Update`].
    ///
    /// A single object becomes a singleton batch; `null` is the
    /// disconnect signal.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for any other top-level shape. The
    /// caller decides how to surface it; existing state is untouched.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::Disconnect),
            Value::Object(map) => Ok(Self::Batch(vec![Fragment::from_map(map)])),
            Value::Array(items) => {
                let mut fragments = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Object(map) => fragments.push(Fragment::from_map(map)),
                        other => {
                            return Err(Error::invalid_argument(format!(
                                "update batch contains a non-object item: {other}"
                            )))
                        }
                    }
                }
                Ok(Self::Batch(fragments))
            }
            other => Err(Error::invalid_argument(format!(
                "unrecognized update payload: {other}"
            ))),
        }
    }
}

/// Normalizes a wire boolean at the point of interpretation.
///
/// Accepts native booleans and the string literals `"true"`/`"false"`.
/// Anything else is not a boolean.
#[must_use]
pub fn parse_wire_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn null_payload_is_disconnect() {
        assert!(matches!(
            Update::from_value(Value::Null),
            Ok(Update::Disconnect)
        ));
    }

    #[test]
    fn single_object_becomes_singleton_batch() {
        let update = Update::from_value(json!({"id": "d1", "type": "device"}))
            .expect("single object payload");
        match update {
            Update::Batch(fragments) => {
                assert_eq!(fragments.len(), 1);
                assert!(matches!(fragments[0], Fragment::Entity(_)));
            }
            Update::Disconnect => panic!("expected a batch"),
        }
    }

    #[test]
    fn list_payload_classifies_fragments() {
        let update = Update::from_value(json!([
            {"id": "p1", "type": "playlist"},
            {"remaining_time": 500, "total_time": 2000},
            {"mystery": true},
        ]))
        .expect("list payload");

        let Update::Batch(fragments) = update else {
            panic!("expected a batch");
        };
        assert!(matches!(fragments[0], Fragment::Entity(_)));
        assert!(matches!(
            fragments[1],
            Fragment::Timing(Timing {
                remaining_time, total_time
            }) if remaining_time == Duration::from_millis(500)
                && total_time == Duration::from_secs(2)
        ));
        assert!(matches!(fragments[2], Fragment::Unknown(_)));
    }

    #[test]
    fn scalar_payload_is_a_protocol_error() {
        let err = Update::from_value(json!(42)).expect_err("scalar payload");
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let err = Update::from_value(json!(["not-an-object"])).expect_err("scalar list item");
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn envelope_err_truthiness() {
        let ok: Envelope =
            serde_json::from_value(json!({"err": false, "resp": [1, 2]})).expect("envelope");
        assert_eq!(ok.into_result().expect("falsy err"), json!([1, 2]));

        let failed: Envelope =
            serde_json::from_value(json!({"err": "no such verb", "error": {"code": 1}}))
                .expect("envelope");
        let err = failed.into_result().expect_err("truthy err");
        assert_eq!(err.kind, ErrorKind::FailedPrecondition);

        let empty: Envelope = serde_json::from_value(json!({"err": "", "resp": null}))
            .expect("envelope");
        assert!(empty.into_result().expect("empty string err is falsy").is_null());
    }

    #[test]
    fn wire_bools_normalize() {
        assert_eq!(parse_wire_bool(&json!("true")), Some(true));
        assert_eq!(parse_wire_bool(&json!("false")), Some(false));
        assert_eq!(parse_wire_bool(&json!(true)), Some(true));
        assert_eq!(parse_wire_bool(&json!("yes")), None);
        assert_eq!(parse_wire_bool(&json!(1)), None);
    }

    #[test]
    fn malformed_timing_fragment_is_unknown() {
        let update = Update::from_value(json!([{"remaining_time": "soon"}])).expect("batch");
        let Update::Batch(fragments) = update else {
            panic!("expected a batch");
        };
        assert!(matches!(fragments[0], Fragment::Unknown(_)));
    }
}
