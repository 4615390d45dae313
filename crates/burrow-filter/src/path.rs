use serde_json::Value;

/// Compiled field-extraction path over a JSON document.
///
/// Supported forms: `$.segment.segment` and `$['segment']` steps, freely
/// mixed (`$.headers['Content-Type']`). Extraction yields a scalar as a
/// string; objects, arrays and absent fields extract nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    steps: Vec<String>,
    source: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid field path {path:?}: {reason}")]
pub struct FieldPathError {
    pub path: String,
    pub reason: &'static str,
}

impl FieldPath {
    pub fn parse(path: &str) -> Result<Self, FieldPathError> {
        let fail = |reason| FieldPathError {
            path: path.to_string(),
            reason,
        };

        let mut rest = path
            .strip_prefix('$')
            .ok_or_else(|| fail("path must start with '$'"))?;

        let mut steps = Vec::new();
        while !rest.is_empty() {
            if let Some(after_dot) = rest.strip_prefix('.') {
                let end = after_dot
                    .find(['.', '['])
                    .unwrap_or(after_dot.len());
                let segment = &after_dot[..end];
                if segment.is_empty() {
                    return Err(fail("empty segment after '.'"));
                }
                steps.push(segment.to_string());
                rest = &after_dot[end..];
            } else if let Some(after_bracket) = rest.strip_prefix('[') {
                let quote = after_bracket
                    .chars()
                    .next()
                    .filter(|c| *c == '\'' || *c == '"')
                    .ok_or_else(|| fail("bracket step must be quoted"))?;
                let inner = &after_bracket[1..];
                let close = inner
                    .find(quote)
                    .ok_or_else(|| fail("unterminated quoted segment"))?;
                let segment = &inner[..close];
                if segment.is_empty() {
                    return Err(fail("empty quoted segment"));
                }
                let after_quote = &inner[close + 1..];
                rest = after_quote
                    .strip_prefix(']')
                    .ok_or_else(|| fail("missing closing bracket"))?;
                steps.push(segment.to_string());
            } else {
                return Err(fail("expected '.' or '[' step"));
            }
        }

        if steps.is_empty() {
            return Err(fail("path selects the whole document"));
        }

        Ok(Self {
            steps,
            source: path.to_string(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Walks the document and renders the selected scalar as a string.
    pub fn extract(&self, document: &Value) -> Option<String> {
        let mut current = document;
        for step in &self.steps {
            current = current.as_object()?.get(step)?;
        }
        match current {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            Value::Bool(flag) => Some(flag.to_string()),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_dotted_and_bracket_steps() {
        let path = FieldPath::parse("$.headers['Content-Type']").expect("parse");
        let document = json!({"headers": {"Content-Type": "application/json"}});
        assert_eq!(
            path.extract(&document),
            Some("application/json".to_string())
        );
    }

    #[test]
    fn extracts_nested_scalars_as_strings() {
        let document = json!({
            "uri": "/api/items",
            "authorization": {"sub": "dev", "exp": 1234, "admin": true}
        });

        let cases = [
            ("$.uri", "/api/items"),
            ("$.authorization.sub", "dev"),
            ("$.authorization.exp", "1234"),
            ("$.authorization.admin", "true"),
        ];
        for (path, expected) in cases {
            let compiled = FieldPath::parse(path).expect(path);
            assert_eq!(compiled.extract(&document), Some(expected.to_string()), "{path}");
        }
    }

    #[test]
    fn absent_fields_and_non_scalars_extract_nothing() {
        let document = json!({"headers": {"Host": "svc"}, "list": [1, 2]});

        for path in ["$.missing", "$.headers.Missing", "$.headers", "$.list"] {
            let compiled = FieldPath::parse(path).expect(path);
            assert_eq!(compiled.extract(&document), None, "{path}");
        }
    }

    #[test]
    fn malformed_paths_fail_to_parse() {
        for path in ["uri", "$", "$.", "$.a..b", "$[unquoted]", "$['open", "$['x'"] {
            assert!(FieldPath::parse(path).is_err(), "{path}");
        }
    }
}
