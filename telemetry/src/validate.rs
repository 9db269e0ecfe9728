use crate::errors::{Error, Result};
use crate::model::TelemetryEvent;
use chrono::{DateTime, NaiveDateTime};
use serde_json::{Map, Value};

const BATTERY_MIN: i64 = 0;
const BATTERY_MAX: i64 = 100;

/// Fields every inbound payload must carry.
pub const REQUIRED_FIELDS: [&str; 6] = ["device_id", "timestamp", "field_a", "field_b", "battery", "seq"];

/// Validates a raw inbound payload and coerces it into a [`TelemetryEvent`].
///
/// Fails closed: any missing or uncoercible required field is a
/// [`Error::Validation`]. Fields outside the schema are dropped and the
/// owner annotations are left empty for the gateway to fill in.
pub fn validate(payload: &Value) -> Result<TelemetryEvent> {
    let obj = payload
        .as_object()
        .ok_or_else(|| Error::Validation("payload must be a JSON object".to_string()))?;

    let missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|name| lookup(obj, name).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(Error::Validation(format!(
            "missing required fields: {}",
            missing.join(", ")
        )));
    }

    let device_id = coerce_string("device_id", required(obj, "device_id")?)?;
    if device_id.is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }

    let timestamp = match required(obj, "timestamp")? {
        Value::String(s) if is_iso8601(s) => s.clone(),
        other => {
            return Err(Error::Validation(format!(
                "timestamp must be an ISO-8601 string, got {}",
                other
            )))
        }
    };

    let battery = coerce_int("battery", required(obj, "battery")?)?;
    if !(BATTERY_MIN..=BATTERY_MAX).contains(&battery) {
        return Err(Error::Validation(format!(
            "Battery {} out of range [{}, {}]",
            battery, BATTERY_MIN, BATTERY_MAX
        )));
    }

    let meta = match obj.get("meta") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(m)) => m.clone(),
        Some(other) => {
            return Err(Error::Validation(format!("meta must be an object, got {}", other)))
        }
    };

    Ok(TelemetryEvent {
        device_id,
        timestamp,
        field_a: coerce_float("field_a", required(obj, "field_a")?)?,
        field_b: coerce_float("field_b", required(obj, "field_b")?)?,
        battery,
        seq: coerce_int("seq", required(obj, "seq")?)?,
        meta,
        owner_id: None,
        owner_email: None,
        device_ref: None,
    })
}

/// Looks a field up, accepting the legacy `ts` key for `timestamp`.
fn lookup<'a>(obj: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    obj.get(name)
        .or_else(|| (name == "timestamp").then(|| obj.get("ts")).flatten())
}

fn required<'a>(obj: &'a Map<String, Value>, name: &str) -> Result<&'a Value> {
    lookup(obj, name).ok_or_else(|| Error::Validation(format!("missing required field: {}", name)))
}

fn uncoercible(name: &str, kind: &str, value: &Value) -> Error {
    Error::Validation(format!("{} must be {}, got {}", name, kind, value))
}

fn coerce_string(name: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(uncoercible(name, "a string", other)),
    }
}

fn coerce_float(name: &str, value: &Value) -> Result<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| uncoercible(name, "a finite number", value))
}

fn coerce_int(name: &str, value: &Value) -> Result<i64> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|v| v.is_finite() && *v >= i64::MIN as f64 && *v < i64::MAX as f64)
                .map(|v| v.trunc() as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| uncoercible(name, "an integer", value))
}

fn is_iso8601(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Value {
        json!({
            "device_id": "dev-1",
            "timestamp": "2024-05-01T10:00:00Z",
            "field_a": 6.0,
            "field_b": 1.25,
            "battery": 80,
            "seq": 1
        })
    }

    #[test]
    fn test_valid_payload() {
        let event = validate(&payload()).unwrap();

        assert_eq!(event.device_id, "dev-1");
        assert_eq!(event.timestamp, "2024-05-01T10:00:00Z");
        assert_eq!(event.field_a, 6.0);
        assert_eq!(event.battery, 80);
        assert!(event.meta.is_empty());
    }

    #[test]
    fn test_each_missing_field_rejected() {
        for field in REQUIRED_FIELDS {
            let mut p = payload();
            p.as_object_mut().unwrap().remove(field);

            match validate(&p) {
                Err(Error::Validation(msg)) => assert!(msg.contains(field), "{}", msg),
                other => panic!("expected validation error for {}, got {:?}", field, other),
            }
        }
    }

    #[test]
    fn test_coerces_loose_types() {
        let p = json!({
            "device_id": 42,
            "timestamp": "2024-05-01T10:00:00.123456",
            "field_a": "6.5",
            "field_b": 2,
            "battery": 99.7,
            "seq": "17"
        });
        let event = validate(&p).unwrap();

        assert_eq!(event.device_id, "42");
        assert_eq!(event.field_a, 6.5);
        assert_eq!(event.field_b, 2.0);
        assert_eq!(event.battery, 99);
        assert_eq!(event.seq, 17);
    }

    #[test]
    fn test_rejects_uncoercible_values() {
        let cases = [
            ("field_a", json!("hot")),
            ("field_b", json!(null)),
            ("battery", json!("5.5")),
            ("seq", json!(true)),
            ("device_id", json!(["a"])),
            ("timestamp", json!(1714557600)),
            ("timestamp", json!("yesterday")),
        ];
        for (field, value) in cases {
            let mut p = payload();
            p[field] = value;
            assert!(validate(&p).is_err(), "{} should be rejected", field);
        }
    }

    #[test]
    fn test_legacy_ts_key() {
        let mut p = payload();
        let obj = p.as_object_mut().unwrap();
        let ts = obj.remove("timestamp").unwrap();
        obj.insert("ts".to_string(), ts);

        assert_eq!(validate(&p).unwrap().timestamp, "2024-05-01T10:00:00Z");
    }

    #[test]
    fn test_battery_out_of_range() {
        let mut p = payload();
        p["battery"] = json!(150);
        assert!(validate(&p).is_err());
    }

    #[test]
    fn test_empty_device_id() {
        let mut p = payload();
        p["device_id"] = json!("");
        assert!(validate(&p).is_err());
    }

    #[test]
    fn test_unknown_fields_dropped_and_meta_kept() {
        let mut p = payload();
        p["meta"] = json!({"fw": "1.2.0"});
        p["owner_id"] = json!("intruder");
        p["extra"] = json!(1);
        let event = validate(&p).unwrap();

        assert_eq!(event.meta["fw"], "1.2.0");
        assert_eq!(event.owner_id, None);
        let encoded = serde_json::to_value(&event).unwrap();
        assert!(encoded.get("extra").is_none());
    }

    #[test]
    fn test_meta_must_be_object() {
        let mut p = payload();
        p["meta"] = json!("tags");
        assert!(validate(&p).is_err());
    }

    #[test]
    fn test_revalidation_is_stable() {
        let first = validate(&json!({
            "device_id": 7,
            "ts": "2024-05-01T10:00:00+02:00",
            "field_a": "0.1",
            "field_b": 1e-3,
            "battery": "12",
            "seq": 3.9,
            "meta": {"k": [1, 2]}
        }))
        .unwrap();
        let encoded = serde_json::to_value(&first).unwrap();
        let second = validate(&encoded).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_not_an_object() {
        assert!(validate(&json!([1, 2, 3])).is_err());
    }
}
