//! Declarative regex tables.
//!
//! Provider rules are declared as ordered `(name, pattern)` lists and compiled
//! once per formatter. Lookups go by name so individual rules stay testable
//! and replaceable.

use crate::error::{PrismError, PrismResult};
use regex::Regex;
use std::fmt;
use tracing::error;

/// A compiled rule with its name and source preserved for diagnostics.
#[derive(Clone)]
pub struct CompiledPattern {
    /// Rule name, unique inside its table.
    pub name: &'static str,
    /// Source pattern.
    pub pattern: &'static str,
    /// Compiled regex.
    pub regex: Regex,
}

impl CompiledPattern {
    /// Compiles one rule.
    pub fn compile(name: &'static str, pattern: &'static str) -> PrismResult<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| PrismError::Config(format!("invalid pattern {name}: {e}")))?;
        Ok(Self {
            name,
            pattern,
            regex,
        })
    }
}

impl fmt::Debug for CompiledPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledPattern")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// Ordered rule list for one scope (a provider, or `common`).
#[derive(Debug, Clone, Default)]
pub struct PatternTable {
    scope: String,
    patterns: Vec<CompiledPattern>,
}

impl PatternTable {
    /// Compiles `specs` in order. Rules that fail to compile are logged and
    /// left out; [`PatternTable::len`] exposes how many survived.
    pub fn build(scope: impl Into<String>, specs: &[(&'static str, &'static str)]) -> Self {
        let scope = scope.into();
        let patterns = specs
            .iter()
            .filter_map(|(name, pattern)| match CompiledPattern::compile(name, pattern) {
                Ok(p) => Some(p),
                Err(e) => {
                    error!(scope = %scope, error = %e, "Dropping invalid pattern");
                    None
                }
            })
            .collect();
        Self { scope, patterns }
    }

    /// Scope this table belongs to.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Looks up a rule by name.
    pub fn get(&self, name: &str) -> Option<&Regex> {
        self.patterns
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.regex)
    }

    /// Rules in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &CompiledPattern> {
        self.patterns.iter()
    }

    /// Number of compiled rules.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether the table has no rules.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// True if any rule matches `text`.
    pub fn any_match(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.regex.is_match(text))
    }
}
