use crate::pgrepr::Value;

/// Converts a scalar to the textual wire form sent in DataRow columns.
///
/// Booleans render as `t`/`f`, dates as ISO `yyyy-mm-dd`, timestamps as
/// full ISO-8601, and JSON values as their serialized text (JSON that the
/// backend already delivered as a string passes through unchanged). NULL
/// never reaches this function; the framing layer encodes it as column
/// length -1.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => if *b { "t" } else { "f" }.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        // Already-string JSON passes through as its serialized text.
        Value::Text(s) => s.clone(),
        Value::Bytes(b) => format!("\\x{}", hex_encode(b)),
        Value::Json(v) => v.to_string(),
        Value::Date(d) => d.format("%Y-%m-%d").to_string(),
        Value::Timestamp(ts) => ts.to_rfc3339(),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    #[test]
    fn test_bool_wire_form() {
        assert_eq!(format_value(&Value::Bool(true)), "t");
        assert_eq!(format_value(&Value::Bool(false)), "f");
    }

    #[test]
    fn test_numbers_use_natural_decimal_form() {
        assert_eq!(format_value(&Value::Int(-42)), "-42");
        assert_eq!(format_value(&Value::Float(1.5)), "1.5");
    }

    #[test]
    fn test_date_and_timestamp() {
        let d = NaiveDate::from_ymd_opt(2023, 7, 4).unwrap();
        assert_eq!(format_value(&Value::Date(d)), "2023-07-04");

        let ts = Utc.with_ymd_and_hms(2023, 7, 4, 12, 30, 0).unwrap();
        let formatted = format_value(&Value::Timestamp(ts));
        assert!(formatted.starts_with("2023-07-04T12:30:00"));
    }

    #[test]
    fn test_json_values_serialize() {
        let v = serde_json::json!({"a": 1});
        assert_eq!(format_value(&Value::Json(v)), r#"{"a":1}"#);
        // JSON the backend already delivered as a string passes through.
        let s = Value::Text(r#"{"b":2}"#.to_string());
        assert_eq!(format_value(&s), r#"{"b":2}"#);
    }

    #[test]
    fn test_bytea_hex_form() {
        assert_eq!(
            format_value(&Value::Bytes(vec![0xde, 0xad])),
            "\\xdead"
        );
    }
}
