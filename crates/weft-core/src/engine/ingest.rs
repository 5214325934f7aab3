//! Callback payload normalization.
//!
//! External actors report progress through one authenticated entry point,
//! whether they send a single result, a declared batch, or an open-ended
//! stream. All accepted payload shapes normalize to "N items arrived":
//!
//! - a single item object
//! - an object with an explicit `items` array
//! - any other object, treated as one implicit item
//!
//! The expected total and the explicit completion signal travel out of band
//! (header or payload field) and are applied independently of item delivery.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Item status
// ---------------------------------------------------------------------------

/// Outcome an item reports. Unrecognized spellings count as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Success,
    Failed,
}

impl ItemStatus {
    fn from_value(value: Option<&Value>) -> Self {
        match value.and_then(Value::as_str) {
            Some("failed") | Some("failure") | Some("error") => ItemStatus::Failed,
            _ => ItemStatus::Success,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == ItemStatus::Success
    }
}

// ---------------------------------------------------------------------------
// CallbackItem
// ---------------------------------------------------------------------------

/// One normalized item from a callback payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackItem {
    /// The execution unit this item is an outcome for, when the sender
    /// attributes it. Items without one either create child work (foreach)
    /// or complete the step's own unit.
    pub unit_id: Option<Uuid>,
    /// Reported outcome.
    pub status: ItemStatus,
    /// Result payload: the item's `output` field when present, otherwise the
    /// item itself.
    pub output: Value,
    /// Error message accompanying a failed item.
    pub error: Option<String>,
}

/// Keys an item object may use for control data rather than payload.
const UNIT_ID_KEYS: [&str; 2] = ["unit_id", "task_id"];

fn parse_item(value: &Value) -> CallbackItem {
    let Value::Object(map) = value else {
        return CallbackItem {
            unit_id: None,
            status: ItemStatus::Success,
            output: value.clone(),
            error: None,
        };
    };

    let unit_id = UNIT_ID_KEYS
        .iter()
        .find_map(|k| map.get(*k))
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok());
    let status = ItemStatus::from_value(map.get("status"));
    let error = map.get("error").and_then(Value::as_str).map(String::from);
    let output = map.get("output").cloned().unwrap_or_else(|| value.clone());

    CallbackItem {
        unit_id,
        status,
        output,
        error,
    }
}

/// Normalize any accepted payload shape into a list of items.
///
/// `null` normalizes to zero items -- a no-op that is still acknowledged.
pub fn normalize_items(payload: &Value) -> Vec<CallbackItem> {
    match payload {
        Value::Null => Vec::new(),
        Value::Array(entries) => entries.iter().map(parse_item).collect(),
        Value::Object(map) => match map.get("items") {
            Some(Value::Array(entries)) => entries.iter().map(parse_item).collect(),
            // `items` present but not an array: the object is one implicit item.
            _ => vec![parse_item(payload)],
        },
        // Scalars are tolerated as one implicit item.
        other => vec![parse_item(other)],
    }
}

// ---------------------------------------------------------------------------
// CallbackRequest
// ---------------------------------------------------------------------------

/// A callback delivery, after the transport layer has pulled control data
/// out of headers and/or the payload.
#[derive(Debug, Clone, Default)]
pub struct CallbackRequest {
    /// Raw JSON body in any of the accepted shapes.
    pub payload: Value,
    /// Declared expected total, when the sender knows it.
    pub expected_count: Option<u32>,
    /// Explicit "no more items will be sent" signal.
    pub complete: bool,
    /// Source-provided idempotency key for the whole delivery.
    pub idempotency_key: Option<String>,
}

impl CallbackRequest {
    /// Build a request from a body plus header-level control values.
    ///
    /// Header values win; payload fields (`expected_count`, `complete`,
    /// `idempotency_key`) fill in when headers are absent.
    pub fn from_parts(
        payload: Value,
        header_expected: Option<u32>,
        header_complete: Option<bool>,
        header_idempotency: Option<String>,
    ) -> Self {
        let body_expected = payload
            .get("expected_count")
            .and_then(Value::as_u64)
            .map(|n| n as u32);
        let body_complete = payload
            .get("complete")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let body_idempotency = payload
            .get("idempotency_key")
            .and_then(Value::as_str)
            .map(String::from);

        Self {
            expected_count: header_expected.or(body_expected),
            complete: header_complete.unwrap_or(body_complete),
            idempotency_key: header_idempotency.or(body_idempotency),
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// CallbackAck
// ---------------------------------------------------------------------------

/// Acknowledgment returned for every accepted callback.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackAck {
    pub received_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_count: Option<u32>,
    pub processed_count: u32,
    pub failed_count: u32,
    /// Whether the batch is now considered complete.
    pub complete: bool,
    /// The delivery was recognized as a duplicate and changed nothing.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
    /// The run or step had already finished; the delivery was acknowledged
    /// without effect.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub no_op: bool,
    /// Units created by this delivery (streamed foreach items).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub created_unit_ids: Vec<Uuid>,
    /// Non-fatal observations, e.g. a conflicting late expected count.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Secret comparison
// ---------------------------------------------------------------------------

/// Constant-time comparison of a presented callback secret.
///
/// Time taken is independent of how many bytes match.
pub fn secret_matches(expected: &str, presented: &str) -> bool {
    let token = presented.strip_prefix("Bearer ").unwrap_or(presented);
    let (a, b) = (expected.as_bytes(), token.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -----------------------------------------------------------------------
    // Shape normalization
    // -----------------------------------------------------------------------

    #[test]
    fn single_item_object_is_one_item() {
        let items = normalize_items(&json!({"status": "success", "output": {"score": 9}}));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, ItemStatus::Success);
        assert_eq!(items[0].output, json!({"score": 9}));
    }

    #[test]
    fn explicit_items_array_normalizes_each() {
        let items = normalize_items(&json!({
            "items": [
                {"status": "success"},
                {"status": "failed", "error": "timeout"},
                {"output": "bare"},
            ]
        }));
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].status, ItemStatus::Success);
        assert_eq!(items[1].status, ItemStatus::Failed);
        assert_eq!(items[1].error.as_deref(), Some("timeout"));
        assert_eq!(items[2].output, json!("bare"));
    }

    #[test]
    fn arbitrary_object_is_one_implicit_item() {
        let items = normalize_items(&json!({"answer": 42, "notes": "done"}));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].output, json!({"answer": 42, "notes": "done"}));
        assert_eq!(items[0].status, ItemStatus::Success);
    }

    #[test]
    fn null_payload_is_zero_items() {
        assert!(normalize_items(&Value::Null).is_empty());
    }

    #[test]
    fn empty_items_array_is_zero_items() {
        assert!(normalize_items(&json!({"items": []})).is_empty());
    }

    #[test]
    fn unit_id_and_task_id_both_attribute() {
        let id = Uuid::now_v7();
        let a = normalize_items(&json!({"unit_id": id.to_string()}));
        let b = normalize_items(&json!({"task_id": id.to_string()}));
        assert_eq!(a[0].unit_id, Some(id));
        assert_eq!(b[0].unit_id, Some(id));
    }

    #[test]
    fn unparseable_unit_id_is_ignored() {
        let items = normalize_items(&json!({"unit_id": "not-a-uuid"}));
        assert!(items[0].unit_id.is_none());
    }

    #[test]
    fn failure_spellings_normalize() {
        for spelling in ["failed", "failure", "error"] {
            let items = normalize_items(&json!({"status": spelling}));
            assert_eq!(items[0].status, ItemStatus::Failed, "spelling {spelling}");
        }
        let items = normalize_items(&json!({"status": "something-new"}));
        assert_eq!(items[0].status, ItemStatus::Success);
    }

    // -----------------------------------------------------------------------
    // Request assembly
    // -----------------------------------------------------------------------

    #[test]
    fn header_control_values_win_over_payload() {
        let req = CallbackRequest::from_parts(
            json!({"expected_count": 10, "complete": false, "idempotency_key": "body"}),
            Some(5),
            Some(true),
            Some("header".to_string()),
        );
        assert_eq!(req.expected_count, Some(5));
        assert!(req.complete);
        assert_eq!(req.idempotency_key.as_deref(), Some("header"));
    }

    #[test]
    fn payload_control_values_fill_in() {
        let req = CallbackRequest::from_parts(
            json!({"expected_count": 10, "complete": true, "idempotency_key": "k1"}),
            None,
            None,
            None,
        );
        assert_eq!(req.expected_count, Some(10));
        assert!(req.complete);
        assert_eq!(req.idempotency_key.as_deref(), Some("k1"));
    }

    // -----------------------------------------------------------------------
    // Secret comparison
    // -----------------------------------------------------------------------

    #[test]
    fn secret_comparison_accepts_bearer_prefix() {
        assert!(secret_matches("s3cret", "s3cret"));
        assert!(secret_matches("s3cret", "Bearer s3cret"));
        assert!(!secret_matches("s3cret", "wrong"));
        assert!(!secret_matches("s3cret", ""));
        assert!(!secret_matches("s3cret", "s3cret-longer"));
    }
}
