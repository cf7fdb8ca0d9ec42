//! Filter Translator: [`Filter`] tree to a native query document.
//!
//! Translation is pure and recursive. The only behavior that varies is how `and`/`or` treat a
//! child that fails to translate, selected by [`CompositePolicy`].

use bson::{Bson, Document, doc};
use serde::{Deserialize, Serialize};

use crate::errors::DbError;
use crate::filter::{self, Filter};

/// How `and`/`or` composites react to a child that fails translation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositePolicy {
    /// The failing child is dropped and the rest of the composite is kept.
    #[default]
    Permissive,
    /// The first child error aborts the whole translation.
    Strict,
}

impl std::str::FromStr for CompositePolicy {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "permissive" => Ok(Self::Permissive),
            "strict" => Ok(Self::Strict),
            other => Err(DbError::Config(format!("unknown composite policy {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Translator {
    policy: CompositePolicy,
}

/// Translates with the default (permissive) policy.
pub fn translate(f: &Filter) -> Result<Document, DbError> {
    Translator::default().translate(f)
}

fn cond(field: &str, op: &str, value: Bson) -> Document {
    let mut inner = Document::new();
    inner.insert(op, value);
    let mut out = Document::new();
    out.insert(field, inner);
    out
}

fn pattern(field: &str, regex: String) -> Document {
    let mut out = Document::new();
    out.insert(field, doc! {"$regex": regex, "$options": "i"});
    out
}

/// Text a pattern operator matches literally.
fn needle(value: &Bson) -> Result<String, DbError> {
    let raw = match value {
        Bson::String(s) => s.clone(),
        Bson::Int32(n) => n.to_string(),
        Bson::Int64(n) => n.to_string(),
        Bson::Double(n) => n.to_string(),
        other => {
            return Err(DbError::Translation(format!("pattern operand must be text, got {other}")));
        }
    };
    Ok(regex::escape(&raw))
}

impl Translator {
    #[must_use]
    pub const fn new(policy: CompositePolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub const fn policy(&self) -> CompositePolicy {
        self.policy
    }

    pub fn translate(&self, f: &Filter) -> Result<Document, DbError> {
        let out = match f {
            Filter::Eq { field, value } => {
                let mut d = Document::new();
                d.insert(field.as_str(), value.clone());
                d
            }
            Filter::Ne { field, value } => cond(field, "$ne", value.clone()),
            Filter::Contains { field, values } => match values.as_slice() {
                [] => {
                    return Err(DbError::Translation(format!("contains on {field} needs a value")));
                }
                [one] => pattern(field, format!(".*{}.*", needle(one)?)),
                many => {
                    let mut clauses = Vec::with_capacity(many.len());
                    for v in many {
                        clauses.push(Bson::Document(pattern(field, format!(".*{}.*", needle(v)?))));
                    }
                    doc! {"$or": clauses}
                }
            },
            Filter::StartsWith { field, value } => pattern(field, format!("^{}.*$", needle(value)?)),
            Filter::EndsWith { field, value } => pattern(field, format!("^.*{}$", needle(value)?)),
            Filter::In { field, values } => cond(field, "$in", Bson::Array(values.clone())),
            Filter::Nin { field, values } => cond(field, "$nin", Bson::Array(values.clone())),
            Filter::Gt { field, value } => cond(field, "$gt", value.clone()),
            Filter::Gte { field, value } => cond(field, "$gte", value.clone()),
            Filter::Lt { field, value } => cond(field, "$lt", value.clone()),
            Filter::Lte { field, value } => cond(field, "$lte", value.clone()),
            Filter::Range { field, low, high } => {
                return self.translate(&filter::and([
                    filter::gte(field, low.clone()),
                    filter::lte(field, high.clone()),
                ]));
            }
            Filter::And(items) => self.composite("$and", items)?,
            Filter::Or(items) => self.composite("$or", items)?,
            Filter::Not(items) => self.negate(items)?,
            Filter::All { field, value } => {
                if field.is_empty() {
                    return Err(DbError::Precondition("field name is required for $all".into()));
                }
                match value {
                    Bson::Array(_) => cond(field, "$all", value.clone()),
                    other => {
                        return Err(DbError::Translation(format!(
                            "$all on {field} expects a list, got {other}"
                        )));
                    }
                }
            }
            Filter::ElemMatch { field, items } => {
                let mut merged = Document::new();
                for item in items {
                    for (k, v) in self.translate(item)? {
                        merged.insert(k, v);
                    }
                }
                cond(field, "$elemMatch", Bson::Document(merged))
            }
            Filter::Text { search } => doc! {"$text": {"$search": search.as_str()}},
            Filter::Invalid(rejected) => return Err(rejected.to_error()),
        };
        Ok(out)
    }

    fn composite(&self, op: &str, items: &[Filter]) -> Result<Document, DbError> {
        let mut clauses = Vec::with_capacity(items.len());
        for item in items {
            match self.translate(item) {
                Ok(d) => clauses.push(Bson::Document(d)),
                Err(e) if self.policy == CompositePolicy::Permissive => {
                    log::debug!("dropping child of {op}: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        let mut out = Document::new();
        out.insert(op, clauses);
        Ok(out)
    }

    /// Wraps a single leaf child's condition in `$not`; composite children become `$nor`.
    fn negate(&self, items: &[Filter]) -> Result<Document, DbError> {
        let [child] = items else {
            return Err(DbError::Translation(format!(
                "$not takes exactly one filter, got {}",
                items.len()
            )));
        };
        let translated = self.translate(child)?;
        if let Some(field) = child.field()
            && translated.len() == 1
            && let Some(value) = translated.get(field)
        {
            let negated = match value {
                Bson::Document(_) | Bson::RegularExpression(_) => value.clone(),
                bare => Bson::Document(doc! {"$eq": bare.clone()}),
            };
            return Ok(cond(field, "$not", negated));
        }
        Ok(doc! {"$nor": [translated]})
    }
}
