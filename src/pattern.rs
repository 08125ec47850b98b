//! Operation-name glob patterns.
//!
//! `*` matches any (possibly empty) substring; every other character matches
//! itself. Matching is anchored at both ends: `api.*` matches `api.getUser`
//! but not `v2.api.getUser`.

use std::fmt::{self, Display, Formatter};

use memchr::memmem;

/// A compiled operation-name pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationPattern {
    source: String,
    kind: PatternKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternKind {
    /// No wildcard: plain equality
    Exact,
    /// Only wildcards: matches every name
    Any,
    /// Anchored prefix and suffix with literal segments between them
    Glob {
        prefix: String,
        suffix: String,
        middles: Vec<String>,
    },
}

impl OperationPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        let source = pattern.into();
        let kind = Self::compile(&source);
        Self { source, kind }
    }

    fn compile(source: &str) -> PatternKind {
        if !source.contains('*') {
            return PatternKind::Exact;
        }

        let segments: Vec<&str> = source.split('*').collect();
        if segments.iter().all(|s| s.is_empty()) {
            return PatternKind::Any;
        }

        // `split` on a string containing '*' yields at least two segments.
        let prefix = segments[0].to_string();
        let suffix = segments[segments.len() - 1].to_string();
        let middles = segments[1..segments.len() - 1]
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();

        PatternKind::Glob {
            prefix,
            suffix,
            middles,
        }
    }

    /// Check whether `operation` matches this pattern.
    pub fn matches(&self, operation: &str) -> bool {
        match &self.kind {
            PatternKind::Exact => self.source == operation,
            PatternKind::Any => true,
            PatternKind::Glob {
                prefix,
                suffix,
                middles,
            } => {
                if operation.len() < prefix.len() + suffix.len()
                    || !operation.starts_with(prefix.as_str())
                    || !operation.ends_with(suffix.as_str())
                {
                    return false;
                }

                // Greedy left-to-right search is sufficient for literal
                // segments: the earliest match leaves the most room after it.
                let mut rest = &operation.as_bytes()[prefix.len()..operation.len() - suffix.len()];
                for middle in middles {
                    match memmem::find(rest, middle.as_bytes()) {
                        Some(pos) => rest = &rest[pos + middle.len()..],
                        None => return false,
                    }
                }
                true
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_wildcard(&self) -> bool {
        !matches!(self.kind, PatternKind::Exact)
    }
}

impl Display for OperationPattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl From<&str> for OperationPattern {
    fn from(pattern: &str) -> Self {
        Self::new(pattern)
    }
}
