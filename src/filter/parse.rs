use bson::Bson;
use serde::{Deserialize, Serialize};

use super::{Filter, FilterOp};
use crate::errors::DbError;

/// Serde-facing `{op, field, value, items}` form of a filter, as produced by query layers that
/// build filters from configuration or JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub op: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub field: String,
    #[serde(default, skip_serializing_if = "is_null")]
    pub value: Bson,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<FilterSpec>,
}

fn is_null(b: &Bson) -> bool {
    matches!(b, Bson::Null)
}

fn list(op: FilterOp, value: Bson) -> Result<Vec<Bson>, DbError> {
    match value {
        Bson::Array(items) => Ok(items),
        other => Err(DbError::Translation(format!("{op} expects a list, got {other}"))),
    }
}

/// Children that fail to parse are kept as [`Filter::Invalid`]; the translator decides what to do
/// with them.
fn children(items: Vec<FilterSpec>) -> Vec<Filter> {
    items
        .into_iter()
        .map(|spec| Filter::try_from(spec).unwrap_or_else(|e| Filter::Invalid(e.into())))
        .collect()
}

impl TryFrom<FilterSpec> for Filter {
    type Error = DbError;

    fn try_from(spec: FilterSpec) -> Result<Self, Self::Error> {
        let op: FilterOp = spec.op.parse()?;
        let FilterSpec { field, value, items, .. } = spec;
        Ok(match op {
            FilterOp::Eq => Self::Eq { field, value },
            FilterOp::Ne => Self::Ne { field, value },
            FilterOp::Contains => {
                // a scalar is a single needle
                let values = match value {
                    Bson::Array(items) => items,
                    other => vec![other],
                };
                Self::Contains { field, values }
            }
            FilterOp::StartsWith => Self::StartsWith { field, value },
            FilterOp::EndsWith => Self::EndsWith { field, value },
            FilterOp::In => Self::In { field, values: list(op, value)? },
            FilterOp::Nin => Self::Nin { field, values: list(op, value)? },
            FilterOp::Gt => Self::Gt { field, value },
            FilterOp::Gte => Self::Gte { field, value },
            FilterOp::Lt => Self::Lt { field, value },
            FilterOp::Lte => Self::Lte { field, value },
            FilterOp::Range => {
                let bounds = list(op, value)?;
                let [low, high]: [Bson; 2] = bounds.try_into().map_err(|b: Vec<Bson>| {
                    DbError::Translation(format!("$range expects [low, high], got {} values", b.len()))
                })?;
                Self::Range { field, low, high }
            }
            FilterOp::And => Self::And(children(items)),
            FilterOp::Or => Self::Or(children(items)),
            FilterOp::Not => Self::Not(children(items)),
            FilterOp::All => Self::All { field, value },
            FilterOp::ElemMatch => Self::ElemMatch { field, items: children(items) },
            FilterOp::Text => {
                let search = value
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| DbError::Translation("$text expects a search string".into()))?;
                Self::Text { search }
            }
        })
    }
}

impl Filter {
    /// Parses the JSON `{op, field, value, items}` form.
    pub fn from_json(s: &str) -> Result<Self, DbError> {
        let spec: FilterSpec =
            serde_json::from_str(s).map_err(|e| DbError::Translation(format!("invalid filter json: {e}")))?;
        Self::try_from(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Rejected, and, contains, eq, range};

    #[test]
    fn parses_nested_json() {
        let f = Filter::from_json(
            r#"{"op":"$and","items":[
                {"op":"$eq","field":"kind","value":"safe"},
                {"op":"$contains","field":"name","value":"kan"},
                {"op":"$range","field":"code","value":["a","m"]}
            ]}"#,
        )
        .unwrap();
        assert_eq!(
            f,
            and([eq("kind", "safe"), contains("name", ["kan"]), range("code", "a", "m")])
        );
    }

    #[test]
    fn unknown_operator_is_reported_by_name() {
        let err = Filter::from_json(r#"{"op":"$near","field":"loc"}"#).unwrap_err();
        assert_eq!(err.to_string(), "filter op $near is not defined");
    }

    #[test]
    fn bad_children_are_kept_for_the_translator() {
        let f = Filter::from_json(
            r#"{"op":"$or","items":[
                {"op":"$eq","field":"a","value":1},
                {"op":"$range","field":"b","value":[1]},
                {"op":"$near","field":"loc"}
            ]}"#,
        )
        .unwrap();
        let items = f.items();
        assert_eq!(items[0], eq("a", 1));
        assert!(matches!(&items[1], Filter::Invalid(Rejected::Malformed(r)) if r.contains("[low, high]")));
        assert_eq!(items[2], Filter::Invalid(Rejected::UnknownOp("$near".into())));
    }

    #[test]
    fn range_needs_two_bounds() {
        let err = Filter::from_json(r#"{"op":"$range","field":"a","value":[1]}"#).unwrap_err();
        assert!(err.is_translation());
    }
}
