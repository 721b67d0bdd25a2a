//! JSON payload selection and assembly
//!
//! Decoding applies the metric's `path` as a JSONPath (the dotted/indexed
//! subset: `$.a.b[0]`, quoted keys allowed); encoding assembles a document
//! by inserting each metric at the pointer derived from its path.

use serde_json::Value;

use crate::core::metrics::Metric;
use crate::core::types::MetricValue;

/// One step of a parsed path.
#[derive(Debug, Clone, PartialEq)]
pub enum PathToken {
    Key(String),
    Index(usize),
}

/// Tokenise a JSONPath-subset expression. Accepts a leading `$`, dotted
/// keys, bracketed indices and bracketed quoted keys.
pub fn parse_path(path: &str) -> Vec<PathToken> {
    let mut tokens = Vec::new();
    let mut chars = path.trim().trim_start_matches('$').chars().peekable();
    let mut current = String::new();

    let flush = |current: &mut String, tokens: &mut Vec<PathToken>| {
        if !current.is_empty() {
            tokens.push(PathToken::Key(std::mem::take(current)));
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '.' => flush(&mut current, &mut tokens),
            '[' => {
                flush(&mut current, &mut tokens);
                let mut inner = String::new();
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    inner.push(c);
                }
                let inner = inner.trim();
                if let Ok(i) = inner.parse::<usize>() {
                    tokens.push(PathToken::Index(i));
                } else {
                    tokens.push(PathToken::Key(
                        inner.trim_matches(|c| c == '\'' || c == '"').to_string(),
                    ));
                }
            }
            _ => current.push(c),
        }
    }
    flush(&mut current, &mut tokens);
    tokens
}

/// Resolve a path against a document. `None` when any step is absent.
pub fn query<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = root;
    for token in parse_path(path) {
        node = match token {
            PathToken::Key(k) => node.get(k.as_str())?,
            PathToken::Index(i) => node.get(i)?,
        };
    }
    Some(node)
}

/// Insert a value at a path, creating intermediate objects and arrays.
pub fn insert(root: &mut Value, path: &str, value: Value) {
    let mut tokens = parse_path(path);
    let Some(last) = tokens.pop() else {
        *root = value;
        return;
    };

    let mut node = root;
    for token in &tokens {
        node = match token {
            PathToken::Key(k) => {
                if !node.is_object() {
                    *node = Value::Object(Default::default());
                }
                node.as_object_mut()
                    .expect("object was just ensured")
                    .entry(k.clone())
                    .or_insert(Value::Null)
            }
            PathToken::Index(i) => {
                if !node.is_array() {
                    *node = Value::Array(Vec::new());
                }
                let arr = node.as_array_mut().expect("array was just ensured");
                while arr.len() <= *i {
                    arr.push(Value::Null);
                }
                &mut arr[*i]
            }
        };
    }

    match last {
        PathToken::Key(k) => {
            if !node.is_object() {
                *node = Value::Object(Default::default());
            }
            node.as_object_mut()
                .expect("object was just ensured")
                .insert(k, value);
        }
        PathToken::Index(i) => {
            if !node.is_array() {
                *node = Value::Array(Vec::new());
            }
            let arr = node.as_array_mut().expect("array was just ensured");
            while arr.len() <= i {
                arr.push(Value::Null);
            }
            arr[i] = value;
        }
    }
}

/// Project data-set rows into the declared column order.
///
/// The payload is one row (object or array) or an array of rows; the
/// column order comes from the metric's `datasetColumns` extra, falling
/// back to the object's own key order.
pub fn project_dataset(value: &Value, metric: &Metric) -> MetricValue {
    let columns: Option<Vec<String>> = metric
        .properties
        .extra
        .get("datasetColumns")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|c| c.as_str().map(str::to_string))
                .collect()
        });

    let rows: Vec<&Value> = match value {
        Value::Array(items) if items.iter().all(|i| i.is_object() || i.is_array()) => {
            items.iter().collect()
        }
        other => vec![other],
    };

    let projected: Vec<Value> = rows
        .into_iter()
        .map(|row| match row {
            Value::Object(map) => {
                let cols: Vec<String> = columns
                    .clone()
                    .unwrap_or_else(|| map.keys().cloned().collect());
                Value::Array(
                    cols.iter()
                        .map(|c| map.get(c).cloned().unwrap_or(Value::Null))
                        .collect(),
                )
            }
            other => other.clone(),
        })
        .collect();

    MetricValue::Json(Value::Array(projected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_path_forms() {
        assert_eq!(
            parse_path("$.sensor.temp"),
            vec![PathToken::Key("sensor".into()), PathToken::Key("temp".into())]
        );
        assert_eq!(
            parse_path("$.rows[2].v"),
            vec![
                PathToken::Key("rows".into()),
                PathToken::Index(2),
                PathToken::Key("v".into())
            ]
        );
        assert_eq!(
            parse_path("$['a b']"),
            vec![PathToken::Key("a b".into())]
        );
    }

    #[test]
    fn test_query() {
        let doc = json!({"sensor": {"temp": "23.5", "hist": [1, 2, 3]}});
        assert_eq!(query(&doc, "$.sensor.temp"), Some(&json!("23.5")));
        assert_eq!(query(&doc, "$.sensor.hist[1]"), Some(&json!(2)));
        assert_eq!(query(&doc, "$.sensor.missing"), None);
    }

    #[test]
    fn test_insert_builds_structure() {
        let mut doc = Value::Null;
        insert(&mut doc, "$.a.b", json!(1));
        insert(&mut doc, "$.a.c[1]", json!("x"));
        assert_eq!(doc, json!({"a": {"b": 1, "c": [null, "x"]}}));
    }

    #[test]
    fn test_insert_round_trips_with_query() {
        let mut doc = Value::Null;
        insert(&mut doc, "$.m.v", json!(42));
        assert_eq!(query(&doc, "$.m.v"), Some(&json!(42)));
    }

    #[test]
    fn test_project_dataset_with_columns() {
        let mut m = Metric::new("ds", crate::core::types::MetricType::DataSet);
        m.properties
            .extra
            .insert("datasetColumns".into(), json!(["b", "a"]));
        let out = project_dataset(&json!([{"a": 1, "b": 2}, {"a": 3, "b": 4}]), &m);
        assert_eq!(out, MetricValue::Json(json!([[2, 1], [4, 3]])));
    }
}
