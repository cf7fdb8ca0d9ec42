//! Abstract, store-agnostic filter trees.
//!
//! A [`Filter`] is built by the caller before each query and translated once into a native query
//! document by [`crate::translate`]. Leaf variants carry a field path and a value; composites carry
//! children. `ElemMatch` is the one variant with both.

mod parse;

use bson::Bson;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use parse::FilterSpec;

use crate::errors::DbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    Ne,
    Contains,
    StartsWith,
    EndsWith,
    In,
    Nin,
    Gt,
    Gte,
    Lt,
    Lte,
    Range,
    And,
    Or,
    Not,
    All,
    ElemMatch,
    Text,
}

impl FilterOp {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "$eq",
            Self::Ne => "$ne",
            Self::Contains => "$contains",
            Self::StartsWith => "$startwith",
            Self::EndsWith => "$endwith",
            Self::In => "$in",
            Self::Nin => "$nin",
            Self::Gt => "$gt",
            Self::Gte => "$gte",
            Self::Lt => "$lt",
            Self::Lte => "$lte",
            Self::Range => "$range",
            Self::And => "$and",
            Self::Or => "$or",
            Self::Not => "$not",
            Self::All => "$all",
            Self::ElemMatch => "$elemMatch",
            Self::Text => "$text",
        }
    }

    #[must_use]
    pub const fn is_composite(self) -> bool {
        matches!(self, Self::And | Self::Or | Self::Not)
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterOp {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = s.strip_prefix('$').unwrap_or(s);
        Ok(match op.to_ascii_lowercase().as_str() {
            "eq" => Self::Eq,
            "ne" => Self::Ne,
            "contains" => Self::Contains,
            "startwith" | "startswith" => Self::StartsWith,
            "endwith" | "endswith" => Self::EndsWith,
            "in" => Self::In,
            "nin" => Self::Nin,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "range" | "between" => Self::Range,
            "and" => Self::And,
            "or" => Self::Or,
            "not" => Self::Not,
            "all" => Self::All,
            "elemmatch" => Self::ElemMatch,
            "text" | "search" => Self::Text,
            _ => return Err(DbError::UnsupportedOperator(s.to_string())),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { field: String, value: Bson },
    Ne { field: String, value: Bson },
    Contains { field: String, values: Vec<Bson> },
    StartsWith { field: String, value: Bson },
    EndsWith { field: String, value: Bson },
    In { field: String, values: Vec<Bson> },
    Nin { field: String, values: Vec<Bson> },
    Gt { field: String, value: Bson },
    Gte { field: String, value: Bson },
    Lt { field: String, value: Bson },
    Lte { field: String, value: Bson },
    Range { field: String, low: Bson, high: Bson },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    /// Only a single child is translatable.
    Not(Vec<Filter>),
    /// `value` must be an array.
    All { field: String, value: Bson },
    ElemMatch { field: String, items: Vec<Filter> },
    Text { search: String },
    /// A clause of the serialized form that could not be parsed. Kept so `and`/`or` can apply
    /// their composite policy; translating it on its own fails.
    Invalid(Rejected),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejected {
    UnknownOp(String),
    Malformed(String),
}

impl Rejected {
    #[must_use]
    pub fn to_error(&self) -> DbError {
        match self {
            Self::UnknownOp(op) => DbError::UnsupportedOperator(op.clone()),
            Self::Malformed(reason) => DbError::Translation(reason.clone()),
        }
    }
}

impl From<DbError> for Rejected {
    fn from(e: DbError) -> Self {
        match e {
            DbError::UnsupportedOperator(op) => Self::UnknownOp(op),
            DbError::Translation(reason) => Self::Malformed(reason),
            other => Self::Malformed(other.to_string()),
        }
    }
}

impl Filter {
    /// Operator of the node; `None` for an unparsed clause.
    #[must_use]
    pub const fn op(&self) -> Option<FilterOp> {
        Some(match self {
            Self::Eq { .. } => FilterOp::Eq,
            Self::Ne { .. } => FilterOp::Ne,
            Self::Contains { .. } => FilterOp::Contains,
            Self::StartsWith { .. } => FilterOp::StartsWith,
            Self::EndsWith { .. } => FilterOp::EndsWith,
            Self::In { .. } => FilterOp::In,
            Self::Nin { .. } => FilterOp::Nin,
            Self::Gt { .. } => FilterOp::Gt,
            Self::Gte { .. } => FilterOp::Gte,
            Self::Lt { .. } => FilterOp::Lt,
            Self::Lte { .. } => FilterOp::Lte,
            Self::Range { .. } => FilterOp::Range,
            Self::And(_) => FilterOp::And,
            Self::Or(_) => FilterOp::Or,
            Self::Not(_) => FilterOp::Not,
            Self::All { .. } => FilterOp::All,
            Self::ElemMatch { .. } => FilterOp::ElemMatch,
            Self::Text { .. } => FilterOp::Text,
            Self::Invalid(_) => return None,
        })
    }

    /// Field path of a leaf (or element-match) filter; `None` for composites and text search.
    #[must_use]
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Eq { field, .. }
            | Self::Ne { field, .. }
            | Self::Contains { field, .. }
            | Self::StartsWith { field, .. }
            | Self::EndsWith { field, .. }
            | Self::In { field, .. }
            | Self::Nin { field, .. }
            | Self::Gt { field, .. }
            | Self::Gte { field, .. }
            | Self::Lt { field, .. }
            | Self::Lte { field, .. }
            | Self::Range { field, .. }
            | Self::All { field, .. }
            | Self::ElemMatch { field, .. } => Some(field),
            Self::And(_) | Self::Or(_) | Self::Not(_) | Self::Text { .. } | Self::Invalid(_) => None,
        }
    }

    /// Children of a composite or element-match filter.
    #[must_use]
    pub fn items(&self) -> &[Self] {
        match self {
            Self::And(items) | Self::Or(items) | Self::Not(items) => items,
            Self::ElemMatch { items, .. } => items,
            _ => &[],
        }
    }
}

fn values<I, V>(values: I) -> Vec<Bson>
where
    I: IntoIterator<Item = V>,
    V: Into<Bson>,
{
    values.into_iter().map(Into::into).collect()
}

pub fn eq(field: &str, value: impl Into<Bson>) -> Filter {
    Filter::Eq { field: field.to_string(), value: value.into() }
}

pub fn ne(field: &str, value: impl Into<Bson>) -> Filter {
    Filter::Ne { field: field.to_string(), value: value.into() }
}

/// Case-insensitive substring match; several values match if any one does. Needles are literal
/// text, regex metacharacters in them are escaped.
pub fn contains<I, V>(field: &str, needles: I) -> Filter
where
    I: IntoIterator<Item = V>,
    V: Into<Bson>,
{
    Filter::Contains { field: field.to_string(), values: values(needles) }
}

/// Case-insensitive prefix match on literal text.
pub fn starts_with(field: &str, value: impl Into<Bson>) -> Filter {
    Filter::StartsWith { field: field.to_string(), value: value.into() }
}

/// Case-insensitive suffix match on literal text.
pub fn ends_with(field: &str, value: impl Into<Bson>) -> Filter {
    Filter::EndsWith { field: field.to_string(), value: value.into() }
}

pub fn in_set<I, V>(field: &str, set: I) -> Filter
where
    I: IntoIterator<Item = V>,
    V: Into<Bson>,
{
    Filter::In { field: field.to_string(), values: values(set) }
}

pub fn nin<I, V>(field: &str, set: I) -> Filter
where
    I: IntoIterator<Item = V>,
    V: Into<Bson>,
{
    Filter::Nin { field: field.to_string(), values: values(set) }
}

pub fn gt(field: &str, value: impl Into<Bson>) -> Filter {
    Filter::Gt { field: field.to_string(), value: value.into() }
}

pub fn gte(field: &str, value: impl Into<Bson>) -> Filter {
    Filter::Gte { field: field.to_string(), value: value.into() }
}

pub fn lt(field: &str, value: impl Into<Bson>) -> Filter {
    Filter::Lt { field: field.to_string(), value: value.into() }
}

pub fn lte(field: &str, value: impl Into<Bson>) -> Filter {
    Filter::Lte { field: field.to_string(), value: value.into() }
}

/// Inclusive range, `low <= field <= high`.
pub fn range(field: &str, low: impl Into<Bson>, high: impl Into<Bson>) -> Filter {
    Filter::Range { field: field.to_string(), low: low.into(), high: high.into() }
}

pub fn and(items: impl IntoIterator<Item = Filter>) -> Filter {
    Filter::And(items.into_iter().collect())
}

pub fn or(items: impl IntoIterator<Item = Filter>) -> Filter {
    Filter::Or(items.into_iter().collect())
}

pub fn not(item: Filter) -> Filter {
    Filter::Not(vec![item])
}

pub fn all(field: &str, value: impl Into<Bson>) -> Filter {
    Filter::All { field: field.to_string(), value: value.into() }
}

pub fn elem_match(field: &str, items: impl IntoIterator<Item = Filter>) -> Filter {
    Filter::ElemMatch { field: field.to_string(), items: items.into_iter().collect() }
}

/// Free-text search against the collection's text index.
pub fn text(search: &str) -> Filter {
    Filter::Text { search: search.to_string() }
}
