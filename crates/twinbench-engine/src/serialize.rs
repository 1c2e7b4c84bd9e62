//! Value capture for instrumentation logs.
//!
//! Captured inputs and outputs go through a rule chain: closures are rendered
//! as their source text, oversized lists collapse to a shape summary, and
//! everything else falls through to a JSON projection plus a bounded repr.

use serde::Serialize;
use serde_json::json;

use crate::value::Value;

/// Lists longer than this are summarized instead of captured element by
/// element.
pub const LARGE_LIST_THRESHOLD: usize = 64;

/// Upper bound on the rendered text of a captured value.
pub const MAX_RENDERED_LEN: usize = 512;

/// One captured value: a JSON projection plus a human-readable rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapturedValue {
    pub raw: serde_json::Value,
    pub rendered: String,
}

pub trait SerializeRule {
    fn try_capture(&self, value: &Value) -> Option<CapturedValue>;
}

/// Ordered rule chain; the last rule always captures.
pub struct SerializerChain {
    rules: Vec<Box<dyn SerializeRule>>,
}

impl Default for SerializerChain {
    fn default() -> Self {
        Self {
            rules: vec![
                Box::new(ClosureRule),
                Box::new(LargeListRule {
                    threshold: LARGE_LIST_THRESHOLD,
                }),
                Box::new(FallbackRule {
                    max_len: MAX_RENDERED_LEN,
                }),
            ],
        }
    }
}

impl std::fmt::Debug for SerializerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<serializer chain>")
    }
}

impl SerializerChain {
    pub fn capture(&self, value: &Value) -> CapturedValue {
        // Instrumentation wrappers are transparent to capture.
        if let Value::Instrumented(ic) = value {
            return self.capture(&ic.inner);
        }
        for rule in &self.rules {
            if let Some(captured) = rule.try_capture(value) {
                return captured;
            }
        }
        CapturedValue {
            raw: serde_json::Value::Null,
            rendered: value.repr(),
        }
    }
}

/// Functions and lambdas capture as their deterministic source rendering.
struct ClosureRule;

impl SerializeRule for ClosureRule {
    fn try_capture(&self, value: &Value) -> Option<CapturedValue> {
        let Value::Function(f) = value else {
            return None;
        };
        let source = f.decl.source_text();
        Some(CapturedValue {
            raw: json!({ "kind": "closure", "source": source }),
            rendered: source,
        })
    }
}

/// Oversized lists capture as a length/first-element-type summary.
struct LargeListRule {
    threshold: usize,
}

impl SerializeRule for LargeListRule {
    fn try_capture(&self, value: &Value) -> Option<CapturedValue> {
        let Value::List(items) = value else {
            return None;
        };
        let items = items.borrow();
        if items.len() <= self.threshold {
            return None;
        }
        let element_type = items.first().map_or("unknown", Value::type_name);
        Some(CapturedValue {
            raw: json!({
                "kind": "large_list",
                "len": items.len(),
                "element_type": element_type,
            }),
            rendered: format!("<list of {} {element_type} values>", items.len()),
        })
    }
}

/// Terminal rule: JSON projection plus a length-bounded repr.
struct FallbackRule {
    max_len: usize,
}

impl SerializeRule for FallbackRule {
    fn try_capture(&self, value: &Value) -> Option<CapturedValue> {
        Some(CapturedValue {
            raw: value.to_json(),
            rendered: truncate_middle(&value.repr(), self.max_len),
        })
    }
}

/// Bound a string by dropping its middle, keeping both ends.
pub fn truncate_middle(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let keep = max_len.saturating_sub(3);
    let head_len = keep / 2 + keep % 2;
    let tail_len = keep / 2;
    let head: String = text.chars().take(head_len).collect();
    let tail: String = text
        .chars()
        .rev()
        .take(tail_len)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_values_keep_their_json_projection() {
        let chain = SerializerChain::default();
        let captured = chain.capture(&Value::list(vec![Value::Int(1), Value::Bool(true)]));
        assert_eq!(captured.raw, json!([1, true]));
        assert_eq!(captured.rendered, "[1, true]");
    }

    #[test]
    fn large_lists_collapse_to_a_summary() {
        let chain = SerializerChain::default();
        let items: Vec<Value> = (0..100).map(Value::Int).collect();
        let captured = chain.capture(&Value::list(items));
        assert_eq!(captured.raw["kind"], "large_list");
        assert_eq!(captured.raw["len"], 100);
        assert_eq!(captured.raw["element_type"], "int");
        assert!(captured.rendered.contains("100 int values"));
    }

    #[test]
    fn truncation_keeps_both_ends() {
        let text = "a".repeat(40) + &"b".repeat(40);
        let truncated = truncate_middle(&text, 21);
        assert_eq!(truncated.chars().count(), 21);
        assert!(truncated.starts_with("aaa"));
        assert!(truncated.ends_with("bbb"));
        assert!(truncated.contains("..."));
        assert_eq!(truncate_middle("short", 21), "short");
    }
}
