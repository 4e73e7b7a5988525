//! `%{key}` placeholder expansion for strings, maps and JSON trees.
//!
//! Rules:
//! - `%{key}` becomes the value for `key`; unknown keys become "".
//! - `\%{key}` is an escape and produces the literal text `%{key}`.
//! - A `%` that is not followed by `{` is kept as-is.
//! - An unterminated `%{...` consumes the rest of the input and produces "".

use std::collections::HashMap;

use serde_json::Value;

pub trait StringExpander {
    /// Value for `key`, or `None` when the key is unknown.
    fn lookup(&self, key: &str) -> Option<String>;

    fn expand(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(pos) = rest.find(['\\', '%']) {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            if let Some(after) = tail.strip_prefix("\\%") {
                out.push('%');
                rest = after;
            } else if let Some(after) = tail.strip_prefix("%{") {
                match after.find('}') {
                    Some(end) => {
                        out.push_str(&self.lookup(&after[..end]).unwrap_or_default());
                        rest = &after[end + 1..];
                    }
                    None => {
                        rest = "";
                    }
                }
            } else {
                // Lone '%' or '\'; both are single-byte.
                out.push_str(&tail[..1]);
                rest = &tail[1..];
            }
        }
        out.push_str(rest);
        out
    }

    /// Expand both keys and values.
    fn expand_map(&self, input: &HashMap<String, String>) -> HashMap<String, String> {
        input
            .iter()
            .map(|(k, v)| (self.expand(k), self.expand(v)))
            .collect()
    }

    /// Expand every string leaf of a JSON tree. Object keys, numbers, booleans
    /// and nulls are left alone.
    fn expand_json(&self, input: &Value) -> Value {
        match input {
            Value::String(s) => Value::String(self.expand(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.expand_json(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.expand_json(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// Expander backed by a fixed key/value map.
#[derive(Debug, Clone, Default)]
pub struct FixedMapStringExpander {
    vars: HashMap<String, String>,
}

impl FixedMapStringExpander {
    pub fn new(vars: HashMap<String, String>) -> Self {
        Self { vars }
    }
}

impl StringExpander for FixedMapStringExpander {
    fn lookup(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}
