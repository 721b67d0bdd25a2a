//! XML payload selection
//!
//! Decoding parses the payload into a DOM (roxmltree) and applies the
//! metric's `path` as an XPath subset: absolute and relative element
//! steps, `//name` descendant search, `[n]` position and `[@k='v']`
//! attribute predicates, and a final `@attr` or `text()` step.

use roxmltree::{Document, Node};

use crate::utils::{ErrorExt, Result};

#[derive(Debug)]
enum Step {
    Descendant(String, Predicate),
    Child(String, Predicate),
    Attribute(String),
    Text,
}

#[derive(Debug, Default)]
struct Predicate {
    position: Option<usize>,
    attr: Option<(String, String)>,
}

fn parse_steps(path: &str) -> Vec<Step> {
    let mut steps = Vec::new();
    let mut rest = path.trim();
    loop {
        let descendant = if let Some(r) = rest.strip_prefix("//") {
            rest = r;
            true
        } else if let Some(r) = rest.strip_prefix('/') {
            rest = r;
            false
        } else {
            false
        };

        if rest.is_empty() {
            break;
        }
        let (segment, tail) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        rest = tail;

        if segment == "text()" {
            steps.push(Step::Text);
            continue;
        }
        if let Some(attr) = segment.strip_prefix('@') {
            steps.push(Step::Attribute(attr.to_string()));
            continue;
        }

        let (name, predicate) = match segment.find('[') {
            Some(i) => {
                let inner = segment[i + 1..].trim_end_matches(']');
                let mut p = Predicate::default();
                if let Ok(pos) = inner.parse::<usize>() {
                    p.position = Some(pos);
                } else if let Some(cond) = inner.strip_prefix('@') {
                    if let Some((k, v)) = cond.split_once('=') {
                        p.attr = Some((
                            k.trim().to_string(),
                            v.trim().trim_matches(|c| c == '\'' || c == '"').to_string(),
                        ));
                    }
                }
                (&segment[..i], p)
            }
            None => (segment, Predicate::default()),
        };

        if descendant {
            steps.push(Step::Descendant(name.to_string(), predicate));
        } else {
            steps.push(Step::Child(name.to_string(), predicate));
        }

        if rest.is_empty() {
            break;
        }
    }
    steps
}

fn matches(node: &Node<'_, '_>, name: &str, predicate: &Predicate) -> bool {
    if node.tag_name().name() != name {
        return false;
    }
    if let Some((k, v)) = &predicate.attr {
        if node.attribute(k.as_str()) != Some(v.as_str()) {
            return false;
        }
    }
    true
}

fn select<'a>(from: Node<'a, 'a>, step: &Step) -> Option<Node<'a, 'a>> {
    match step {
        Step::Child(name, p) => {
            let mut hits = from
                .children()
                .filter(|n| n.is_element() && matches(n, name, p));
            match p.position {
                // XPath positions are 1-based
                Some(pos) => hits.nth(pos.saturating_sub(1)),
                None => hits.next(),
            }
        }
        Step::Descendant(name, p) => {
            let mut hits = from
                .descendants()
                .filter(|n| n.is_element() && matches(n, name, p));
            match p.position {
                Some(pos) => hits.nth(pos.saturating_sub(1)),
                None => hits.next(),
            }
        }
        _ => None,
    }
}

/// Evaluate the path against the document; returns the matched text or
/// attribute value, `None` when nothing matches.
pub fn query_text(xml: &str, path: &str) -> Result<Option<String>> {
    let doc = Document::parse(xml).decode_error("invalid XML payload")?;
    let steps = parse_steps(path);

    let mut node = doc.root();
    for step in &steps {
        match step {
            Step::Attribute(attr) => {
                return Ok(node.attribute(attr.as_str()).map(str::to_string));
            }
            Step::Text => break,
            _ => match select(node, step) {
                Some(next) => node = next,
                None => return Ok(None),
            },
        }
    }

    let text = node
        .descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect::<String>();
    let text = text.trim();
    if text.is_empty() {
        Ok(None)
    } else {
        Ok(Some(text.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<MTConnectStreams>
        <DeviceStream name="Mill-1">
            <Samples>
                <Temperature dataItemId="temp1">23.5</Temperature>
                <Load dataItemId="load1">0.8</Load>
            </Samples>
        </DeviceStream>
    </MTConnectStreams>"#;

    #[test]
    fn test_absolute_path() {
        let v = query_text(DOC, "/MTConnectStreams/DeviceStream/Samples/Load").unwrap();
        assert_eq!(v, Some("0.8".to_string()));
    }

    #[test]
    fn test_descendant_search() {
        let v = query_text(DOC, "//Temperature").unwrap();
        assert_eq!(v, Some("23.5".to_string()));
    }

    #[test]
    fn test_attribute_predicate_and_selection() {
        let v = query_text(DOC, "//Temperature[@dataItemId='temp1']/@dataItemId").unwrap();
        assert_eq!(v, Some("temp1".to_string()));
        let miss = query_text(DOC, "//Temperature[@dataItemId='other']").unwrap();
        assert_eq!(miss, None);
    }

    #[test]
    fn test_invalid_xml_is_error() {
        assert!(query_text("<broken", "//x").is_err());
    }
}
