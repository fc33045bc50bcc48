//! Parsed document references.
//!
//! Two spellings are accepted and mean the same thing:
//!
//! ```text
//! {pattern_file}.start.x      document `pattern_file`, path [start, x]
//! {parameters.passes}         document `parameters`,   path [passes]
//! ```
//!
//! References are parsed once at load time and resolved against the bound
//! document map; there is no string interpolation at run time.

use std::fmt;

use serde_json::Value;

use crate::error::{BindError, ConfigError};

/// A document name plus a path into it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocRef {
    /// Requirement name inside the braces.
    pub document: String,
    /// Object keys to follow, outermost first.
    pub path: Vec<String>,
}

impl DocRef {
    /// Parses either reference spelling.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidReference {
            reference: text.to_string(),
            reason: reason.to_string(),
        };

        let body = text
            .trim()
            .strip_prefix('{')
            .ok_or_else(|| invalid("must start with '{'"))?;
        let close = body.find('}').ok_or_else(|| invalid("missing '}'"))?;
        let (inner, rest) = (&body[..close], &body[close + 1..]);

        let mut segments: Vec<&str> = inner.split('.').collect();
        if !rest.is_empty() {
            if segments.len() != 1 {
                return Err(invalid("document name inside braces cannot contain '.'"));
            }
            let tail = rest
                .strip_prefix('.')
                .ok_or_else(|| invalid("expected '.' after '}'"))?;
            segments.extend(tail.split('.'));
        }

        if segments.iter().any(|s| s.trim().is_empty()) {
            return Err(invalid("empty path segment"));
        }
        let mut segments = segments.into_iter().map(|s| s.trim().to_string());
        let document = segments.next().ok_or_else(|| invalid("empty reference"))?;
        Ok(Self {
            document,
            path: segments.collect(),
        })
    }

    /// Walks `path` through `doc`. Numeric segments index arrays.
    pub fn lookup<'a>(&self, doc: &'a Value) -> Result<&'a Value, BindError> {
        let mut current = doc;
        for segment in &self.path {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            current = next.ok_or_else(|| BindError::UnresolvedPath {
                reference: self.to_string(),
                reason: format!("no field '{segment}'"),
            })?;
        }
        Ok(current)
    }
}

impl fmt::Display for DocRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.document)?;
        for segment in &self.path {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_outer_path() {
        let r = DocRef::parse("{pattern_file}.start.x").unwrap();
        assert_eq!(r.document, "pattern_file");
        assert_eq!(r.path, vec!["start", "x"]);
    }

    #[test]
    fn test_parse_inner_path() {
        let r = DocRef::parse("{parameters.passes}").unwrap();
        assert_eq!(r.document, "parameters");
        assert_eq!(r.path, vec!["passes"]);
    }

    #[test]
    fn test_parse_whole_document() {
        let r = DocRef::parse("{parameter_file}").unwrap();
        assert_eq!(r.document, "parameter_file");
        assert!(r.path.is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "parameters.passes",
            "{parameters",
            "{a.b}.c",
            "{a}x",
            "{a}..b",
            "{}",
        ] {
            assert!(DocRef::parse(bad).is_err(), "accepted {bad}");
        }
    }

    #[test]
    fn test_lookup_walks_objects_and_arrays() {
        let doc = json!({"passes": [{"y": 1.5}, {"y": 3.0}]});
        let r = DocRef::parse("{pattern}.passes.1.y").unwrap();
        assert_eq!(r.lookup(&doc).unwrap(), &json!(3.0));

        let missing = DocRef::parse("{pattern}.passes.7.y").unwrap();
        assert!(matches!(
            missing.lookup(&doc),
            Err(BindError::UnresolvedPath { .. })
        ));
    }

    #[test]
    fn test_display_round_trips() {
        let r = DocRef::parse("{parameters.gas.main_flow}").unwrap();
        assert_eq!(r.to_string(), "{parameters}.gas.main_flow");
        assert_eq!(DocRef::parse(&r.to_string()).unwrap(), r);
    }
}
