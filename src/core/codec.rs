//! Payload codec layer
//!
//! Decodes raw driver payloads into typed metric values and encodes
//! metric sets back into wire payloads, per connection payload format.

pub mod buffer;
pub mod delimited;
pub mod json;
pub mod xml;

use chrono::DateTime;
use serde_json::Value;
use tracing::warn;

use super::metrics::Metric;
use super::types::{string_to_bool, MetricType, MetricValue, PayloadFormat, RawValue};
use crate::utils::{EdgeSrvError, Result};

/// Decode one metric's value out of a raw payload.
pub fn parse_value(
    raw: &RawValue,
    metric: &Metric,
    format: PayloadFormat,
    delimiter: &str,
) -> Result<MetricValue> {
    if let RawValue::Decoded(v) = raw {
        return Ok(v.clone());
    }

    match format {
        PayloadFormat::Delimited => {
            let text = raw
                .as_text()
                .ok_or_else(|| EdgeSrvError::decode("delimited payload is not text"))?;
            Ok(delimited::split_field(&text, delimiter, &metric.properties.path)
                .map(|field| coerce_string(field, metric.metric_type))
                .unwrap_or(MetricValue::Null))
        }
        PayloadFormat::Json => {
            let text = raw
                .as_text()
                .ok_or_else(|| EdgeSrvError::decode("JSON payload is not text"))?;
            let doc: Value = serde_json::from_str(text.as_ref())?;
            let node = if metric.properties.path.is_empty() {
                Some(&doc)
            } else {
                json::query(&doc, &metric.properties.path)
            };
            Ok(match node {
                None => MetricValue::Null,
                Some(v) if metric.metric_type == MetricType::DataSet => {
                    json::project_dataset(v, metric)
                }
                Some(v) => coerce_json(v, metric.metric_type),
            })
        }
        PayloadFormat::Xml => {
            let text = raw
                .as_text()
                .ok_or_else(|| EdgeSrvError::decode("XML payload is not text"))?;
            Ok(xml::query_text(&text, &metric.properties.path)?
                .map(|s| coerce_string(&s, metric.metric_type))
                .unwrap_or(MetricValue::Null))
        }
        PayloadFormat::FixedBuffer => {
            let bytes = raw
                .as_bytes()
                .ok_or_else(|| EdgeSrvError::decode("buffer payload has no bytes"))?;
            buffer::read_value(bytes, metric)
        }
        // reserved
        PayloadFormat::SerialisedBuffer => Ok(MetricValue::Null),
    }
}

/// Payload-borne timestamp, milliseconds. Only JSON payloads carry one
/// (at `$.timestamp`); every other format defers to the local clock.
pub fn parse_timestamp(raw: &RawValue, format: PayloadFormat) -> Option<i64> {
    if format != PayloadFormat::Json {
        return None;
    }
    let text = raw.as_text()?;
    let doc: Value = serde_json::from_str(text.as_ref()).ok()?;
    match json::query(&doc, "$.timestamp")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => parse_datetime_ms(s),
        _ => None,
    }
}

/// Encode a metric set into one wire payload.
pub fn encode(metrics: &[Metric], format: PayloadFormat, delimiter: &str) -> Result<Vec<u8>> {
    match format {
        PayloadFormat::Json => {
            let doc = if metrics.len() == 1 && metrics[0].properties.path.is_empty() {
                metrics[0].value.to_json()
            } else {
                let mut doc = Value::Null;
                for m in metrics {
                    if m.properties.path.is_empty() {
                        json::insert(&mut doc, &m.name, m.value.to_json());
                    } else {
                        json::insert(&mut doc, &m.properties.path, m.value.to_json());
                    }
                }
                doc
            };
            Ok(serde_json::to_vec(&doc)?)
        }
        PayloadFormat::FixedBuffer => buffer::encode_all(metrics),
        PayloadFormat::Delimited => Ok(delimited::join(metrics, delimiter).into_bytes()),
        PayloadFormat::Xml | PayloadFormat::SerialisedBuffer => {
            warn!(format = format.as_str(), "encode not implemented for this payload format");
            Ok(Vec::new())
        }
    }
}

fn parse_datetime_ms(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Base-10 integer prefix parse; `None` when no digits are present.
fn parse_int_prefix(s: &str) -> Option<i64> {
    let s = s.trim();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        None => (1i64, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    digits[..end].parse::<i64>().ok().map(|v| sign * v)
}

/// String → typed conversion used by the delimited and XML decoders.
pub fn coerce_string(s: &str, ty: MetricType) -> MetricValue {
    match ty {
        MetricType::Float | MetricType::Double => s
            .trim()
            .parse::<f64>()
            .map(MetricValue::Float)
            .unwrap_or(MetricValue::Null),
        ty if ty.is_signed_integer() => parse_int_prefix(s)
            .map(MetricValue::Int)
            .unwrap_or(MetricValue::Null),
        MetricType::DateTime => parse_datetime_ms(s)
            .or_else(|| parse_int_prefix(s))
            .and_then(|ms| u64::try_from(ms).ok())
            .map(MetricValue::UInt)
            .unwrap_or(MetricValue::Null),
        ty if ty.is_unsigned_integer() => parse_int_prefix(s)
            .and_then(|v| u64::try_from(v).ok())
            .map(MetricValue::UInt)
            .unwrap_or(MetricValue::Null),
        MetricType::Boolean => MetricValue::Bool(string_to_bool(s)),
        MetricType::Bytes | MetricType::File => MetricValue::Bytes(s.as_bytes().to_vec()),
        ty if ty.is_string_like() => MetricValue::String(s.to_string()),
        // structured types arrive as JSON text or not at all
        _ => serde_json::from_str(s)
            .map(MetricValue::Json)
            .unwrap_or(MetricValue::Null),
    }
}

/// JSON node → typed conversion used by the JSON decoder and command
/// handling. 64-bit wire integers are narrowed here.
pub fn coerce_json(v: &Value, ty: MetricType) -> MetricValue {
    match v {
        Value::Null => MetricValue::Null,
        Value::String(s) => coerce_string(s, ty),
        _ => match ty {
            MetricType::Boolean => v
                .as_bool()
                .or_else(|| v.as_i64().map(|i| i != 0))
                .map(MetricValue::Bool)
                .unwrap_or(MetricValue::Null),
            MetricType::Float | MetricType::Double => v
                .as_f64()
                .map(MetricValue::Float)
                .unwrap_or(MetricValue::Null),
            ty if ty.is_signed_integer() => v
                .as_i64()
                .or_else(|| v.as_f64().map(|f| f.round() as i64))
                .map(MetricValue::Int)
                .unwrap_or(MetricValue::Null),
            ty if ty.is_unsigned_integer() => v
                .as_u64()
                .or_else(|| v.as_f64().and_then(|f| if f >= 0.0 { Some(f.round() as u64) } else { None }))
                .map(MetricValue::UInt)
                .unwrap_or(MetricValue::Null),
            ty if ty.is_string_like() => MetricValue::String(v.to_string()),
            MetricType::Bytes | MetricType::File => v
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|b| b.as_u64().map(|b| b as u8))
                        .collect::<Vec<u8>>()
                })
                .map(MetricValue::Bytes)
                .unwrap_or(MetricValue::Null),
            _ => MetricValue::Json(v.clone()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Endianness;
    use serde_json::json;

    fn metric(ty: MetricType, path: &str) -> Metric {
        let mut m = Metric::new("t", ty);
        m.properties.method = "GET".into();
        m.properties.address = "a".into();
        m.properties.path = path.into();
        m
    }

    #[test]
    fn test_json_path_decode() {
        let raw = RawValue::Text(r#"{"sensor":{"temp":"23.5"}}"#.to_string());
        let m = metric(MetricType::Float, "$.sensor.temp");
        let v = parse_value(&raw, &m, PayloadFormat::Json, "").unwrap();
        assert_eq!(v, MetricValue::Float(23.5));
    }

    #[test]
    fn test_json_missing_path_is_null() {
        let raw = RawValue::Text(r#"{"a":1}"#.to_string());
        let m = metric(MetricType::Float, "$.b");
        assert_eq!(
            parse_value(&raw, &m, PayloadFormat::Json, "").unwrap(),
            MetricValue::Null
        );
    }

    #[test]
    fn test_delimited_decode() {
        let raw = RawValue::Text("12;34;56".to_string());
        let m = metric(MetricType::Int32, "2");
        assert_eq!(
            parse_value(&raw, &m, PayloadFormat::Delimited, ";").unwrap(),
            MetricValue::Int(56)
        );
        // empty delimiter: whole payload
        let whole = metric(MetricType::String, "");
        let raw = RawValue::Text("whole payload".to_string());
        assert_eq!(
            parse_value(&raw, &whole, PayloadFormat::Delimited, "").unwrap(),
            MetricValue::String("whole payload".into())
        );
    }

    #[test]
    fn test_serialised_buffer_reserved() {
        let raw = RawValue::Bytes(vec![1, 2, 3]);
        let m = metric(MetricType::Int32, "0");
        assert_eq!(
            parse_value(&raw, &m, PayloadFormat::SerialisedBuffer, "").unwrap(),
            MetricValue::Null
        );
    }

    #[test]
    fn test_parse_timestamp_json_only() {
        let raw = RawValue::Text(r#"{"timestamp": 1700000000000, "v": 1}"#.to_string());
        assert_eq!(parse_timestamp(&raw, PayloadFormat::Json), Some(1_700_000_000_000));
        assert_eq!(parse_timestamp(&raw, PayloadFormat::Delimited), None);

        let rfc = RawValue::Text(r#"{"timestamp": "2023-11-14T22:13:20Z"}"#.to_string());
        assert_eq!(parse_timestamp(&rfc, PayloadFormat::Json), Some(1_700_000_000_000));
    }

    #[test]
    fn test_json_round_trip_disjoint_paths() {
        let mut m1 = metric(MetricType::Float, "$.line.temp");
        m1.value = MetricValue::Float(1.25);
        let mut m2 = metric(MetricType::Int32, "$.line.count");
        m2.value = MetricValue::Int(9);

        let payload = encode(&[m1.clone(), m2.clone()], PayloadFormat::Json, "").unwrap();
        let raw = RawValue::Bytes(payload);
        assert_eq!(
            parse_value(&raw, &m1, PayloadFormat::Json, "").unwrap(),
            MetricValue::Float(1.25)
        );
        assert_eq!(
            parse_value(&raw, &m2, PayloadFormat::Json, "").unwrap(),
            MetricValue::Int(9)
        );
    }

    #[test]
    fn test_xml_encode_returns_empty() {
        let m = metric(MetricType::Float, "//v");
        assert!(encode(&[m], PayloadFormat::Xml, "").unwrap().is_empty());
    }

    #[test]
    fn test_coerce_string_rules() {
        assert_eq!(coerce_string("23.5", MetricType::Double), MetricValue::Float(23.5));
        assert_eq!(coerce_string("junk", MetricType::Int32), MetricValue::Null);
        assert_eq!(coerce_string("-17", MetricType::Int16), MetricValue::Int(-17));
        assert_eq!(coerce_string("42abc", MetricType::Int32), MetricValue::Int(42));
        assert_eq!(coerce_string("0", MetricType::Boolean), MetricValue::Bool(false));
        assert_eq!(coerce_string("maybe", MetricType::Boolean), MetricValue::Bool(true));
        assert_eq!(
            coerce_string("2023-11-14T22:13:20Z", MetricType::DateTime),
            MetricValue::UInt(1_700_000_000_000)
        );
    }

    #[test]
    fn test_coerce_json_narrows_64bit() {
        assert_eq!(coerce_json(&json!(70000), MetricType::UInt16), MetricValue::UInt(70000));
        assert_eq!(coerce_json(&json!(2500), MetricType::UInt16), MetricValue::UInt(2500));
        assert_eq!(coerce_json(&json!(-3), MetricType::Int8), MetricValue::Int(-3));
        assert_eq!(coerce_json(&json!(true), MetricType::Boolean), MetricValue::Bool(true));
    }

    #[test]
    fn test_pdp_fixed_buffer_via_dispatch() {
        let mut m = metric(MetricType::UInt32, "0");
        m.properties.endianness = Endianness::Pdp;
        let raw = RawValue::Bytes(vec![0x01, 0x02, 0x03, 0x04]);
        assert_eq!(
            parse_value(&raw, &m, PayloadFormat::FixedBuffer, "").unwrap(),
            MetricValue::UInt(0x0304_0102)
        );
    }
}
