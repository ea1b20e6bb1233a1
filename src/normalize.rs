//! Event normalizer.
//!
//! Turns any [`Inspect`] object into a bounded, JSON-safe [`NormalizedEvent`].
//! Nested values are converted with a depth budget so arbitrarily deep or
//! cyclic object graphs always terminate; objects below the root are
//! summarised by their first working identifier accessor.

use crate::inspect::{Inspect, Reflected};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::sync::LazyLock;
use tracing::trace;

/// Depth budget for accessor return values.
pub const MAX_DEPTH: u32 = 2;

/// Identifier accessors tried, in order, to summarise a nested object.
pub const IDENTIFIER_ACCESSORS: [&str; 6] =
    ["getId", "getID", "getUid", "getUID", "getName", "getPath"];

/// Placeholder for a collection cut off by the depth budget.
pub const ARRAY_PLACEHOLDER: &str = "[array]";

static ACCESSOR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(get|is)[A-Z_]").expect("accessor pattern is valid"));

/// JSON-safe description of one host event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Concrete type name of the source event
    pub class: String,

    /// Capabilities the event type implements, in declaration order
    pub interfaces: Vec<String>,

    /// Accessor name -> normalized return value, in accessor order
    pub values: Map<String, Value>,
}

/// Whether `name` looks like a getter (`getFoo`, `isFoo`, `get_foo`).
pub fn is_accessor_name(name: &str) -> bool {
    ACCESSOR_PATTERN.is_match(name)
}

/// Normalize an event. Never fails: accessors that error are left out.
pub fn normalize(event: &dyn Inspect) -> NormalizedEvent {
    let class = event.type_name();
    let mut values = Map::new();

    for name in event.accessors() {
        if !is_accessor_name(&name) {
            continue;
        }
        match event.call(&name) {
            Some(Ok(value)) => {
                values.insert(name, normalize_value(&value, MAX_DEPTH));
            }
            Some(Err(e)) => {
                trace!(class = %class, accessor = %name, error = %e, "Accessor failed, skipping");
            }
            None => {}
        }
    }

    NormalizedEvent {
        class,
        interfaces: event.interfaces(),
        values,
    }
}

/// Convert one reflected value with `depth` levels of budget left.
pub fn normalize_value(value: &Reflected, depth: u32) -> Value {
    match value {
        Reflected::Null => Value::Null,
        Reflected::Bool(b) => Value::Bool(*b),
        Reflected::Int(i) => Value::from(*i),
        Reflected::Float(x) => Number::from_f64(*x).map_or(Value::Null, Value::Number),
        Reflected::Str(s) => Value::String(s.clone()),
        Reflected::DateTime(dt) => Value::String(dt.to_rfc3339()),
        Reflected::List(items) => {
            if depth == 0 {
                return Value::String(ARRAY_PLACEHOLDER.to_string());
            }
            Value::Array(items.iter().map(|v| normalize_value(v, depth - 1)).collect())
        }
        Reflected::Map(entries) => {
            if depth == 0 {
                return Value::String(ARRAY_PLACEHOLDER.to_string());
            }
            Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v, depth - 1)))
                    .collect(),
            )
        }
        Reflected::Object(object) => normalize_object(object.as_ref(), depth),
    }
}

fn normalize_object(object: &dyn Inspect, depth: u32) -> Value {
    if let Some(Ok(json)) = object.json_value() {
        return normalize_json(json, depth);
    }

    let type_name = object.type_name();
    if depth == 0 {
        return placeholder(&type_name);
    }

    for getter in IDENTIFIER_ACCESSORS {
        if let Some(Ok(id)) = object.call(getter) {
            let mut summary = Map::new();
            summary.insert("_class".to_string(), Value::String(type_name));
            summary.insert(getter.to_string(), normalize_value(&id, depth - 1));
            return Value::Object(summary);
        }
    }

    match object.display() {
        Some(Ok(text)) => Value::String(text),
        _ => placeholder(&type_name),
    }
}

/// Apply the depth budget to an already JSON-shaped value.
fn normalize_json(value: Value, depth: u32) -> Value {
    match value {
        Value::Array(items) => {
            if depth == 0 {
                return Value::String(ARRAY_PLACEHOLDER.to_string());
            }
            Value::Array(
                items
                    .into_iter()
                    .map(|v| normalize_json(v, depth - 1))
                    .collect(),
            )
        }
        Value::Object(map) => {
            if depth == 0 {
                return Value::String(ARRAY_PLACEHOLDER.to_string());
            }
            Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, normalize_json(v, depth - 1)))
                    .collect(),
            )
        }
        scalar => scalar,
    }
}

fn placeholder(type_name: &str) -> Value {
    Value::String(format!("[{}]", type_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::{AccessError, DynamicObject};
    use chrono::{FixedOffset, TimeZone};
    use serde_json::json;
    use std::sync::{Arc, Weak};

    #[test]
    fn test_accessor_name_pattern() {
        assert!(is_accessor_name("getUserId"));
        assert!(is_accessor_name("isDirectory"));
        assert!(is_accessor_name("get_raw"));
        assert!(!is_accessor_name("getter"));
        assert!(!is_accessor_name("isolate"));
        assert!(!is_accessor_name("stopPropagation"));
        assert!(!is_accessor_name("get"));
    }

    #[test]
    fn test_scalar_event_is_lossless_and_deterministic() {
        let event = DynamicObject::new("OCA\\Test\\ScalarEvent")
            .implements("OCP\\EventDispatcher\\Event")
            .value("getUserId", "u123")
            .value("getCount", 3)
            .value("getRatio", 0.5)
            .value("isActive", true)
            .value("getNothing", Reflected::Null);

        let first = normalize(&event);
        let second = normalize(&event);

        assert_eq!(first, second);
        assert_eq!(first.class, "OCA\\Test\\ScalarEvent");
        assert_eq!(first.interfaces, vec!["OCP\\EventDispatcher\\Event"]);
        assert_eq!(
            Value::Object(first.values),
            json!({
                "getUserId": "u123",
                "getCount": 3,
                "getRatio": 0.5,
                "isActive": true,
                "getNothing": null
            })
        );
    }

    #[test]
    fn test_failing_accessor_is_absent() {
        let event = DynamicObject::new("Test")
            .value("getOk", "fine")
            .failing("getBroken", "session expired");

        let normalized = normalize(&event);
        assert_eq!(normalized.values.len(), 1);
        assert!(!normalized.values.contains_key("getBroken"));
    }

    #[test]
    fn test_non_accessor_methods_are_skipped() {
        let event = DynamicObject::new("Test")
            .value("stopPropagation", Reflected::Null)
            .value("getter", 1)
            .value("isPropagationStopped", false);

        let normalized = normalize(&event);
        let keys: Vec<&String> = normalized.values.keys().collect();
        assert_eq!(keys, vec!["isPropagationStopped"]);
    }

    #[test]
    fn test_key_order_follows_accessors() {
        let event = DynamicObject::new("Test")
            .value("getZ", 1)
            .value("getA", 2)
            .value("getM", 3);

        let keys: Vec<String> = normalize(&event).values.keys().cloned().collect();
        assert_eq!(keys, vec!["getZ", "getA", "getM"]);
    }

    #[test]
    fn test_non_finite_float_becomes_null() {
        assert_eq!(normalize_value(&Reflected::Float(f64::NAN), MAX_DEPTH), Value::Null);
    }

    #[test]
    fn test_datetime_is_iso8601_with_offset() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let dt = offset.with_ymd_and_hms(2025, 12, 11, 10, 0, 0).unwrap();

        assert_eq!(
            normalize_value(&Reflected::DateTime(dt), MAX_DEPTH),
            json!("2025-12-11T10:00:00+02:00")
        );
    }

    #[test]
    fn test_nested_lists_hit_placeholder() {
        let value = Reflected::from(vec![vec![vec![1, 2]]]);
        assert_eq!(normalize_value(&value, MAX_DEPTH), json!([["[array]"]]));
    }

    #[test]
    fn test_map_keeps_keys() {
        let value = Reflected::Map(vec![
            ("b".to_string(), Reflected::Int(1)),
            ("a".to_string(), Reflected::Str("x".into())),
        ]);
        assert_eq!(normalize_value(&value, MAX_DEPTH), json!({"b": 1, "a": "x"}));
    }

    #[test]
    fn test_object_summarised_by_first_identifier() {
        let node = DynamicObject::new("OC\\Files\\Node\\File")
            .failing("getId", "not stored yet")
            .value("getName", "report.pdf")
            .value("getPath", "/alice/files/report.pdf");

        assert_eq!(
            normalize_value(&Reflected::object(node), MAX_DEPTH),
            json!({"_class": "OC\\Files\\Node\\File", "getName": "report.pdf"})
        );
    }

    #[test]
    fn test_object_without_identifier_uses_display() {
        let obj = DynamicObject::new("OC\\Share")
            .with_display(|| Ok("share#12".to_string()));

        assert_eq!(normalize_value(&Reflected::object(obj), MAX_DEPTH), json!("share#12"));
    }

    #[test]
    fn test_object_fallback_placeholder() {
        let failing_display = DynamicObject::new("OC\\Broken")
            .with_display(|| Err(AccessError::new("nope")));
        let bare = DynamicObject::new("OC\\Opaque");

        assert_eq!(
            normalize_value(&Reflected::object(failing_display), MAX_DEPTH),
            json!("[OC\\Broken]")
        );
        assert_eq!(normalize_value(&Reflected::object(bare), MAX_DEPTH), json!("[OC\\Opaque]"));
    }

    #[test]
    fn test_object_at_exhausted_budget() {
        let user = DynamicObject::new("OC\\User\\User").value("getUID", "alice");
        assert_eq!(normalize_value(&Reflected::object(user), 0), json!("[OC\\User\\User]"));
    }

    #[test]
    fn test_self_serializing_object() {
        let obj = DynamicObject::new("OC\\Tag")
            .value("getId", 9)
            .with_json(|| Ok(json!({"id": 9, "tags": [["deep"]]})));

        // The JSON result is converted under the same budget.
        assert_eq!(
            normalize_value(&Reflected::object(obj), MAX_DEPTH),
            json!({"id": 9, "tags": ["[array]"]})
        );
    }

    #[test]
    fn test_failing_self_serialization_falls_back() {
        let obj = DynamicObject::new("OC\\Tag")
            .value("getId", 9)
            .with_json(|| Err(AccessError::new("bad")));

        assert_eq!(
            normalize_value(&Reflected::object(obj), MAX_DEPTH),
            json!({"_class": "OC\\Tag", "getId": 9})
        );
    }

    fn chain(depth: usize) -> DynamicObject {
        let mut node = DynamicObject::new("Level4").value("getLabel", "bottom");
        for level in (1..depth).rev() {
            let inner = Reflected::object(node);
            node = DynamicObject::new(format!("Level{level}")).value("getId", inner);
        }
        node
    }

    #[test]
    fn test_deep_graph_is_cut_at_depth_ceiling() {
        let event = DynamicObject::new("DeepEvent").value("getRoot", Reflected::object(chain(4)));

        let normalized = normalize(&event);
        assert_eq!(
            normalized.values["getRoot"],
            json!({
                "_class": "Level1",
                "getId": {"_class": "Level2", "getId": "[Level3]"}
            })
        );
    }

    #[test]
    fn test_cyclic_graph_terminates() {
        let node: Arc<DynamicObject> = Arc::new_cyclic(|weak: &Weak<DynamicObject>| {
            let weak = weak.clone();
            DynamicObject::new("OC\\Files\\Node\\Folder").accessor("getId", move || {
                let me = weak.upgrade().ok_or_else(|| AccessError::new("gone"))?;
                Ok(Reflected::Object(me))
            })
        });

        let event = DynamicObject::new("CycleEvent").value("getNode", Reflected::Object(node));

        let normalized = normalize(&event);
        assert_eq!(
            normalized.values["getNode"],
            json!({
                "_class": "OC\\Files\\Node\\Folder",
                "getId": {
                    "_class": "OC\\Files\\Node\\Folder",
                    "getId": "[OC\\Files\\Node\\Folder]"
                }
            })
        );
    }
}
