use bson::Bson;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::filter::Filter;

// Safety limits to prevent resource abuse
pub(crate) const MAX_SORT_FIELDS: usize = 32;
pub(crate) const MAX_PROJECTION_FIELDS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggrOp {
    Sum,
    Count,
    Avg,
    Min,
    Max,
    First,
    Last,
    Push,
}

impl AggrOp {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "$sum",
            Self::Count => "$count",
            Self::Avg => "$avg",
            Self::Min => "$min",
            Self::Max => "$max",
            Self::First => "$first",
            Self::Last => "$last",
            Self::Push => "$push",
        }
    }
}

/// One accumulator of a grouping stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggrItem {
    pub field: String,
    pub op: AggrOp,
    pub alias: String,
}

impl AggrItem {
    pub fn new(op: AggrOp, field: &str, alias: &str) -> Self {
        Self { field: field.to_string(), op, alias: alias.to_string() }
    }

    /// Sum of `field`, reported under the field's own name.
    pub fn sum(field: &str) -> Self {
        Self::new(AggrOp::Sum, field, field)
    }

    pub fn avg(field: &str) -> Self {
        Self::new(AggrOp::Avg, field, field)
    }

    pub fn min(field: &str) -> Self {
        Self::new(AggrOp::Min, field, field)
    }

    pub fn max(field: &str) -> Self {
        Self::new(AggrOp::Max, field, field)
    }

    pub fn count(alias: &str) -> Self {
        Self::new(AggrOp::Count, "", alias)
    }

    #[must_use]
    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = alias.to_string();
        self
    }
}

/// Names accepted by the command clause. Matching is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandName {
    Aggregate,
    Pipe,
    Command,
    Distinct,
    GfsWrite,
    GfsRead,
    GfsRemove,
    GfsTruncate,
    Watch,
    Other(String),
}

impl CommandName {
    /// Large-object commands share the `gfs` prefix.
    #[must_use]
    pub fn is_blob(&self) -> bool {
        match self {
            Self::GfsWrite | Self::GfsRead | Self::GfsRemove | Self::GfsTruncate => true,
            Self::Other(name) => name.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("gfs")),
            _ => false,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Aggregate => "aggregate",
            Self::Pipe => "pipe",
            Self::Command => "command",
            Self::Distinct => "distinct",
            Self::GfsWrite => "gfswrite",
            Self::GfsRead => "gfsread",
            Self::GfsRemove => "gfsremove",
            Self::GfsTruncate => "gfstruncate",
            Self::Watch => "watch",
            Self::Other(name) => name,
        }
    }
}

impl FromStr for CommandName {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "aggregate" => Self::Aggregate,
            "pipe" => Self::Pipe,
            "command" => Self::Command,
            "distinct" => Self::Distinct,
            "gfswrite" => Self::GfsWrite,
            "gfsread" => Self::GfsRead,
            "gfsremove" | "gfsdelete" => Self::GfsRemove,
            "gfstruncate" => Self::GfsTruncate,
            "watch" => Self::Watch,
            _ => Self::Other(s.to_string()),
        })
    }
}

impl From<&str> for CommandName {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(name) => name,
            Err(never) => match never {},
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named command plus its caller-supplied payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub name: CommandName,
    pub payload: Bson,
}

/// The mutating operation a query describes, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Insert,
    Update,
    Delete,
    Save,
    Command,
}

/// One clause of an abstract query, in the order the caller built it.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryItem {
    From(String),
    Select(Vec<String>),
    Where(Filter),
    Order(Vec<String>),
    Skip(u64),
    Take(i64),
    Aggr(Vec<AggrItem>),
    GroupBy(Vec<String>),
    Command(CommandSpec),
    Insert,
    /// Allow-list of updatable fields; empty means all.
    Update(Vec<String>),
    Delete,
    Save,
}
