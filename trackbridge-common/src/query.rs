//! Typed query builder rendered to the tracking server's query language
//!
//! ```
//! use trackbridge_common::query::{Filter, Query};
//!
//! let q = Query::new("Task")
//!     .select(["name", "project.full_name"])
//!     .filter(Filter::eq("name", "charA").and(Filter::eq("parent.id", "p-1")));
//!
//! assert_eq!(
//!     q.render(),
//!     r#"select name, project.full_name from Task where name is "charA" and parent.id is "p-1""#
//! );
//! ```

use serde_json::Value;
use std::fmt;

/// Filter expression over dotted attribute paths
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every entity
    All,
    Eq(String, Value),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(path.into(), value.into())
    }

    /// Conjunction, flattening nested `And`s and dropping `All`
    pub fn and(self, other: Filter) -> Self {
        let mut parts = Vec::new();
        for f in [self, other] {
            match f {
                Filter::All => {}
                Filter::And(inner) => parts.extend(inner),
                f => parts.push(f),
            }
        }
        match parts.len() {
            0 => Filter::All,
            1 => parts.remove(0),
            _ => Filter::And(parts),
        }
    }

    /// Evaluate against an entity, resolving attribute paths through `resolve`
    pub fn matches<F>(&self, resolve: &F) -> bool
    where
        F: Fn(&str) -> Option<Value>,
    {
        match self {
            Filter::All => true,
            Filter::Eq(path, expected) => resolve(path)
                .map(|actual| values_equal(&actual, expected))
                .unwrap_or(false),
            Filter::And(parts) => parts.iter().all(|p| p.matches(resolve)),
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Escape a string literal for the query language
pub fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", escape(s)),
        Value::Null => "none".to_string(),
        other => other.to_string(),
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::All => Ok(()),
            Filter::Eq(path, value) => write!(f, "{} is {}", path, render_value(value)),
            Filter::And(parts) => {
                let rendered: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                f.write_str(&rendered.join(" and "))
            }
        }
    }
}

/// A query for one entity type
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub entity_type: String,
    pub projections: Vec<String>,
    pub filter: Filter,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            projections: Vec::new(),
            filter: Filter::All,
            limit: None,
        }
    }

    /// Shorthand for an id lookup
    pub fn by_id(entity_type: impl Into<String>, id: &str) -> Self {
        Self::new(entity_type).filter(Filter::eq("id", id))
    }

    pub fn select<I, S>(mut self, projections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projections.extend(projections.into_iter().map(Into::into));
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = std::mem::replace(&mut self.filter, Filter::All).and(filter);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Render as a query-language expression
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.projections.is_empty() {
            out.push_str("select ");
            out.push_str(&self.projections.join(", "));
            out.push_str(" from ");
        }
        out.push_str(&self.entity_type);
        if self.filter != Filter::All {
            out.push_str(" where ");
            out.push_str(&self.filter.to_string());
        }
        if let Some(limit) = self.limit {
            out.push_str(&format!(" limit {}", limit));
        }
        out
    }
}
