use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Placeholder direction reported by a hand that has not produced a gesture yet.
pub const NOT_ACTIVE: &str = "not active";

/// The single authoritative robot/gesture state relayed to every consumer.
///
/// Every field carries a default so the object is always fully populated.
/// Partial updates go through [`RobotState::merged`], which only overwrites
/// the leaves present in the incoming payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RobotState {
    /// Emergency stop latch raised by the operator's gesture.
    pub stopped: bool,
    pub hand: Hands,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Hands {
    pub right: RightHand,
    pub left: LeftHand,
}

/// Right hand steers on the horizontal axis only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RightHand {
    /// e.g. "left", "right", "center", or [`NOT_ACTIVE`]
    pub horizontal: String,
    pub active: bool,
}

/// Left hand reports both axes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeftHand {
    pub horizontal: String,
    /// e.g. "up", "down", or [`NOT_ACTIVE`]
    pub vertical: String,
    pub active: bool,
}

impl Default for RightHand {
    fn default() -> Self {
        Self {
            horizontal: NOT_ACTIVE.to_string(),
            active: true,
        }
    }
}

impl Default for LeftHand {
    fn default() -> Self {
        Self {
            horizontal: NOT_ACTIVE.to_string(),
            vertical: NOT_ACTIVE.to_string(),
            active: true,
        }
    }
}

impl RobotState {
    /// Return a copy of `self` with the partial update `patch` applied.
    ///
    /// Only keys present in `patch` are written; unknown keys are ignored.
    /// `self` is never modified, so a failed merge leaves the caller's state
    /// exactly as it was.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidPayload`] when `patch` is not a JSON
    /// object, when `hand` is not an object, or when a hand slot holds an
    /// array.
    pub fn merged(&self, patch: &Value) -> Result<RobotState, RelayError> {
        let Value::Object(fields) = patch else {
            return Err(RelayError::InvalidPayload(format!(
                "expected a JSON object, got {}",
                kind(patch)
            )));
        };

        let mut next = self.clone();

        if let Some(stopped) = fields.get("stopped") {
            next.stopped = truthy(stopped);
        }

        if let Some(hand) = fields.get("hand") {
            let Value::Object(hand) = hand else {
                return Err(RelayError::InvalidPayload(format!(
                    "`hand` must be an object, got {}",
                    kind(hand)
                )));
            };
            if let Some(right) = hand.get("right") {
                next.hand.right.apply(right)?;
            }
            if let Some(left) = hand.get("left") {
                next.hand.left.apply(left)?;
            }
        }

        Ok(next)
    }
}

impl RightHand {
    fn apply(&mut self, value: &Value) -> Result<(), RelayError> {
        match value {
            Value::Object(fields) => {
                if let Some(h) = fields.get("horizontal") {
                    self.horizontal = coerce_string(h);
                }
                if let Some(a) = fields.get("active") {
                    self.active = truthy(a);
                }
                Ok(())
            }
            Value::Array(_) => Err(RelayError::InvalidPayload(
                "`hand.right` must be an object or a string".to_string(),
            )),
            // Legacy clients send the direction as a bare string.
            scalar => {
                self.horizontal = coerce_string(scalar);
                Ok(())
            }
        }
    }
}

impl LeftHand {
    fn apply(&mut self, value: &Value) -> Result<(), RelayError> {
        match value {
            Value::Object(fields) => {
                if let Some(h) = fields.get("horizontal") {
                    self.horizontal = coerce_string(h);
                }
                if let Some(v) = fields.get("vertical") {
                    self.vertical = coerce_string(v);
                }
                if let Some(a) = fields.get("active") {
                    self.active = truthy(a);
                }
                Ok(())
            }
            Value::Array(_) => Err(RelayError::InvalidPayload(
                "`hand.left` must be an object or a string".to_string(),
            )),
            scalar => {
                self.horizontal = coerce_string(scalar);
                Ok(())
            }
        }
    }
}

/// Boolean coercion used for `stopped` and `active`.
///
/// `null`, `false`, `0`, `""`, `[]` and `{}` are false; everything else is
/// true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// String coercion used for `horizontal` and `vertical`.
///
/// JSON strings are taken verbatim.  Booleans and `null` render the way the
/// first producers wrote them (`"True"`, `"False"`, `"None"`); numbers,
/// arrays and objects become their compact JSON text.
pub fn coerce_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Null => "None".to_string(),
        other => other.to_string(),
    }
}

/// `true` when an HTTP body carries no usable update at all.
pub fn is_empty_payload(value: &Value) -> bool {
    !truthy(value)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Which producer an accepted update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    Http,
    PushChannel,
    Broker,
}

impl std::fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateSource::Http => write!(f, "http"),
            UpdateSource::PushChannel => write!(f, "push_channel"),
            UpdateSource::Broker => write!(f, "broker"),
        }
    }
}

/// One entry of the store's bounded window of recent updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub revision: u64,
    pub at: DateTime<Utc>,
    pub source: UpdateSource,
    pub state: RobotState,
}

/// Error taxonomy shared by the store, the relay pipeline and the ingress
/// surfaces.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("No data received")]
    EmptyPayload,

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Delivery to connection {0} failed")]
    DeliveryFailure(String),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Unexpected failure: {0}")]
    Unexpected(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_state_serializes_to_wire_shape() {
        let json = serde_json::to_value(RobotState::default()).unwrap();
        assert_eq!(
            json,
            json!({
                "stopped": false,
                "hand": {
                    "right": { "horizontal": "not active", "active": true },
                    "left": { "horizontal": "not active", "vertical": "not active", "active": true }
                }
            })
        );
    }

    #[test]
    fn merge_only_touches_supplied_leaves() {
        let base = RobotState::default();
        let next = base
            .merged(&json!({ "hand": { "left": { "vertical": "up" } } }))
            .unwrap();

        assert_eq!(next.hand.left.vertical, "up");
        assert_eq!(next.hand.left.horizontal, base.hand.left.horizontal);
        assert_eq!(next.hand.left.active, base.hand.left.active);
        assert_eq!(next.hand.right, base.hand.right);
        assert_eq!(next.stopped, base.stopped);
    }

    #[test]
    fn sequential_merges_accumulate() {
        let state = RobotState::default()
            .merged(&json!({ "stopped": true }))
            .unwrap()
            .merged(&json!({ "hand": { "right": { "active": false } } }))
            .unwrap();

        let mut expected = RobotState::default();
        expected.stopped = true;
        expected.hand.right.active = false;
        assert_eq!(state, expected);
    }

    #[test]
    fn legacy_string_sets_only_horizontal() {
        let mut base = RobotState::default();
        base.hand.right.active = false;
        base.hand.left.active = false;
        base.hand.left.vertical = "down".to_string();

        let next = base
            .merged(&json!({ "hand": { "right": "left", "left": "right" } }))
            .unwrap();

        assert_eq!(next.hand.right.horizontal, "left");
        assert!(!next.hand.right.active, "legacy form must keep prior active");
        assert_eq!(next.hand.left.horizontal, "right");
        assert_eq!(next.hand.left.vertical, "down");
        assert!(!next.hand.left.active);
    }

    #[test]
    fn coercion_rules() {
        let next = RobotState::default()
            .merged(&json!({
                "stopped": 1,
                "hand": {
                    "right": { "horizontal": 42, "active": "" },
                    "left": { "horizontal": true, "vertical": null, "active": [0] }
                }
            }))
            .unwrap();

        assert!(next.stopped);
        assert_eq!(next.hand.right.horizontal, "42");
        assert!(!next.hand.right.active);
        assert_eq!(next.hand.left.horizontal, "True");
        assert_eq!(next.hand.left.vertical, "None");
        assert!(next.hand.left.active);
    }

    #[test]
    fn string_coercion_of_scalars() {
        assert_eq!(coerce_string(&json!("left")), "left");
        assert_eq!(coerce_string(&json!(false)), "False");
        assert_eq!(coerce_string(&json!(null)), "None");
        assert_eq!(coerce_string(&json!(-3)), "-3");
        assert_eq!(coerce_string(&json!(["up"])), r#"["up"]"#);
    }

    #[test]
    fn legacy_scalar_hand_uses_string_coercion() {
        let next = RobotState::default()
            .merged(&json!({ "hand": { "right": false } }))
            .unwrap();
        assert_eq!(next.hand.right.horizontal, "False");
        assert!(next.hand.right.active);
    }

    #[test]
    fn non_object_top_level_is_invalid() {
        let base = RobotState::default();
        for bad in [json!([1, 2]), json!("stop"), json!(3), json!(null)] {
            let err = base.merged(&bad).unwrap_err();
            assert!(matches!(err, RelayError::InvalidPayload(_)), "{bad} should be invalid");
        }
    }

    #[test]
    fn non_object_hand_is_invalid() {
        let err = RobotState::default()
            .merged(&json!({ "stopped": true, "hand": "left" }))
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidPayload(_)));
    }

    #[test]
    fn array_in_hand_slot_is_invalid() {
        let err = RobotState::default()
            .merged(&json!({ "hand": { "left": ["up"] } }))
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidPayload(_)));
    }

    #[test]
    fn unknown_keys_are_a_noop() {
        let base = RobotState::default();
        assert_eq!(base.merged(&json!({})).unwrap(), base);
        assert_eq!(base.merged(&json!({ "type": "pinch_down" })).unwrap(), base);
    }

    #[test]
    fn empty_payload_detection() {
        for empty in [json!(null), json!({}), json!([]), json!(""), json!(0), json!(false)] {
            assert!(is_empty_payload(&empty), "{empty} should count as empty");
        }
        assert!(!is_empty_payload(&json!({ "stopped": false })));
        assert!(!is_empty_payload(&json!([1])));
    }

    #[test]
    fn update_source_wire_names() {
        assert_eq!(serde_json::to_string(&UpdateSource::PushChannel).unwrap(), "\"push_channel\"");
        assert_eq!(UpdateSource::Broker.to_string(), "broker");
    }

    #[test]
    fn relay_error_display() {
        assert_eq!(RelayError::EmptyPayload.to_string(), "No data received");
        let err = RelayError::BrokerUnavailable("timed out".to_string());
        assert!(err.to_string().contains("timed out"));
    }
}
