//! Delimited text codec
//!
//! With a nonempty delimiter the payload is split and indexed by the
//! metric's integer `path`; with an empty delimiter the whole payload is
//! the value.

use crate::core::metrics::Metric;

/// Select a field from a delimited payload.
pub fn split_field<'a>(payload: &'a str, delimiter: &str, path: &str) -> Option<&'a str> {
    if delimiter.is_empty() {
        return Some(payload);
    }
    let index: usize = path.trim().parse().ok()?;
    payload.split(delimiter).nth(index)
}

/// Join string coercions of the metrics into one delimited payload.
///
/// When every metric carries a numeric field index the fields are placed
/// at their declared positions; otherwise metric order is used.
pub fn join(metrics: &[Metric], delimiter: &str) -> String {
    let indices: Option<Vec<usize>> = metrics
        .iter()
        .map(|m| m.properties.path.trim().parse().ok())
        .collect();

    match indices {
        Some(indices) if !indices.is_empty() => {
            let width = indices.iter().max().map(|m| m + 1).unwrap_or(0);
            let mut fields = vec![String::new(); width];
            for (m, i) in metrics.iter().zip(indices) {
                fields[i] = m.value.as_string();
            }
            fields.join(delimiter)
        }
        _ => metrics
            .iter()
            .map(|m| m.value.as_string())
            .collect::<Vec<_>>()
            .join(delimiter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{MetricType, MetricValue};

    #[test]
    fn test_split_field() {
        assert_eq!(split_field("a;b;c", ";", "1"), Some("b"));
        assert_eq!(split_field("a;b;c", ";", "5"), None);
        assert_eq!(split_field("whole", "", "anything"), Some("whole"));
        assert_eq!(split_field("a;b", ";", "x"), None);
    }

    #[test]
    fn test_join_by_field_index() {
        let mut a = Metric::new("a", MetricType::Int32);
        a.properties.path = "2".into();
        a.value = MetricValue::Int(3);
        let mut b = Metric::new("b", MetricType::String);
        b.properties.path = "0".into();
        b.value = MetricValue::String("hi".into());

        assert_eq!(join(&[a, b], ";"), "hi;;3");
    }
}
