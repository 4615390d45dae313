use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::path::{FieldPath, FieldPathError};

#[derive(Debug, thiserror::Error)]
pub enum InvalidFilterSyntax {
    #[error(transparent)]
    Path(#[from] FieldPathError),
    #[error("invalid match pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// One declarative match rule: extract a field from the JSON projection of
/// a request, then test it against a regex with full-string semantics.
///
/// Only the two source strings travel on the wire; the compiled state is
/// rebuilt with `compile` on the receiving side and a pattern that fails
/// to compile must be rejected before it is ever stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterPattern {
    pub json_path: String,
    pub match_pattern: String,
    #[serde(skip)]
    compiled: Option<CompiledPattern>,
}

#[derive(Debug, Clone)]
struct CompiledPattern {
    path: FieldPath,
    regex: Regex,
}

impl PartialEq for FilterPattern {
    fn eq(&self, other: &Self) -> bool {
        self.json_path == other.json_path && self.match_pattern == other.match_pattern
    }
}

impl FilterPattern {
    pub fn new(json_path: impl Into<String>, match_pattern: impl Into<String>) -> Self {
        Self {
            json_path: json_path.into(),
            match_pattern: match_pattern.into(),
            compiled: None,
        }
    }

    pub fn compile(&mut self) -> Result<(), InvalidFilterSyntax> {
        let path = FieldPath::parse(&self.json_path)?;
        // Anchor the pattern: matching is whole-field, not substring.
        let regex = Regex::new(&format!("^(?:{})$", self.match_pattern)).map_err(|source| {
            InvalidFilterSyntax::Pattern {
                pattern: self.match_pattern.clone(),
                source,
            }
        })?;
        self.compiled = Some(CompiledPattern { path, regex });
        Ok(())
    }

    pub fn compiled(
        json_path: impl Into<String>,
        match_pattern: impl Into<String>,
    ) -> Result<Self, InvalidFilterSyntax> {
        let mut pattern = Self::new(json_path, match_pattern);
        pattern.compile()?;
        Ok(pattern)
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    /// Absent field or type mismatch is a non-match, never an error.
    pub fn matches(&self, document: &Value) -> bool {
        let Some(compiled) = self.compiled.as_ref() else {
            tracing::warn!(
                json_path = %self.json_path,
                "filter pattern evaluated without compile()"
            );
            return false;
        };
        let Some(field) = compiled.path.extract(document) else {
            return false;
        };
        let matched = compiled.regex.is_match(&field);
        tracing::debug!(
            json_path = %self.json_path,
            match_pattern = %self.match_pattern,
            field = %field,
            matched,
            "filter evaluation"
        );
        matched
    }
}

/// Ordered pattern list with OR semantics: a request matches when any
/// single pattern matches its extracted field.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    patterns: Vec<FilterPattern>,
}

impl FilterSet {
    pub fn add(&mut self, pattern: FilterPattern) {
        // Uncompiled patterns are never accepted into the set.
        if pattern.is_compiled() {
            self.patterns.push(pattern);
        } else {
            tracing::warn!(
                json_path = %pattern.json_path,
                "dropping uncompiled filter pattern"
            );
        }
    }

    pub fn add_all(&mut self, patterns: Vec<FilterPattern>) {
        for pattern in patterns {
            self.add(pattern);
        }
    }

    pub fn clear(&mut self) {
        self.patterns.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn patterns(&self) -> &[FilterPattern] {
        &self.patterns
    }

    pub fn matches(&self, document: &Value) -> bool {
        self.patterns
            .iter()
            .any(|pattern| pattern.matches(document))
    }
}
