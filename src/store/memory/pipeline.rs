use bson::{Bson, Document};

use super::eval::{
    as_f64, as_i64, check_sort, compare_bson, compare_docs, get_path, matches, project,
};
use crate::store::{StoreError, StoreResult};

/// Runs an aggregation pipeline over an in-memory snapshot of a collection.
pub fn run(mut docs: Vec<Document>, pipeline: &[Document]) -> StoreResult<Vec<Document>> {
    for stage in pipeline {
        let mut entries = stage.iter();
        let (Some((name, arg)), None) = (entries.next(), entries.next()) else {
            return Err(StoreError::Message("a pipeline stage must have exactly one key".into()));
        };
        docs = match name.as_str() {
            "$match" => {
                let filter = stage_doc(name, arg)?;
                let mut kept = Vec::with_capacity(docs.len());
                for d in docs {
                    if matches(&d, filter)? {
                        kept.push(d);
                    }
                }
                kept
            }
            "$group" => group(docs, stage_doc(name, arg)?)?,
            "$sort" => {
                let sort = stage_doc(name, arg)?;
                check_sort(sort)?;
                docs.sort_by(|a, b| compare_docs(a, b, sort));
                docs
            }
            "$skip" => {
                let n = stage_count(name, arg)?;
                docs.into_iter().skip(n).collect()
            }
            "$limit" => {
                let n = stage_count(name, arg)?;
                docs.truncate(n);
                docs
            }
            "$project" => {
                let projection = stage_doc(name, arg)?;
                docs.iter().map(|d| project(d, projection)).collect::<StoreResult<_>>()?
            }
            "$count" => {
                let field = arg
                    .as_str()
                    .ok_or_else(|| StoreError::Message("$count needs a field name".into()))?;
                let n = i64::try_from(docs.len()).unwrap_or(i64::MAX);
                let mut out = Document::new();
                out.insert(field, narrow_int(n));
                vec![out]
            }
            other => return Err(StoreError::Unsupported(format!("pipeline stage {other}"))),
        };
    }
    Ok(docs)
}

fn stage_doc<'a>(name: &str, arg: &'a Bson) -> StoreResult<&'a Document> {
    arg.as_document().ok_or_else(|| StoreError::Message(format!("{name} needs a document")))
}

fn stage_count(name: &str, arg: &Bson) -> StoreResult<usize> {
    as_i64(arg)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| StoreError::Message(format!("{name} needs a non-negative integer")))
}

/// Evaluates a grouping expression: `"$path"`, a sub-document of expressions, or a literal.
fn eval_expr(doc: &Document, expr: &Bson) -> Bson {
    match expr {
        Bson::String(s) if s.starts_with('$') => {
            get_path(doc, &s[1..]).cloned().unwrap_or(Bson::Null)
        }
        Bson::Document(d) => {
            let mut out = Document::new();
            for (k, v) in d {
                out.insert(k.clone(), eval_expr(doc, v));
            }
            Bson::Document(out)
        }
        other => other.clone(),
    }
}

enum Acc {
    Sum { total: f64, int_total: i64, all_int: bool },
    Avg { total: f64, n: u64 },
    Min(Option<Bson>),
    Max(Option<Bson>),
    First(Option<Bson>),
    Last(Option<Bson>),
    Push(Vec<Bson>),
}

impl Acc {
    fn new(op: &str) -> StoreResult<Self> {
        Ok(match op {
            "$sum" => Self::Sum { total: 0.0, int_total: 0, all_int: true },
            "$avg" => Self::Avg { total: 0.0, n: 0 },
            "$min" => Self::Min(None),
            "$max" => Self::Max(None),
            "$first" => Self::First(None),
            "$last" => Self::Last(None),
            "$push" => Self::Push(Vec::new()),
            other => return Err(StoreError::Unsupported(format!("accumulator {other}"))),
        })
    }

    fn feed(&mut self, v: Bson) {
        match self {
            Self::Sum { total, int_total, all_int } => {
                if let Some(f) = as_f64(&v) {
                    *total += f;
                    match v {
                        Bson::Int32(_) | Bson::Int64(_) => {
                            *int_total = int_total.saturating_add(as_i64(&v).unwrap_or(0));
                        }
                        _ => *all_int = false,
                    }
                }
            }
            Self::Avg { total, n } => {
                if let Some(f) = as_f64(&v) {
                    *total += f;
                    *n += 1;
                }
            }
            Self::Min(cur) => {
                if !matches!(v, Bson::Null)
                    && cur.as_ref().is_none_or(|c| compare_bson(&v, c).is_lt())
                {
                    *cur = Some(v);
                }
            }
            Self::Max(cur) => {
                if !matches!(v, Bson::Null)
                    && cur.as_ref().is_none_or(|c| compare_bson(&v, c).is_gt())
                {
                    *cur = Some(v);
                }
            }
            Self::First(cur) => {
                if cur.is_none() {
                    *cur = Some(v);
                }
            }
            Self::Last(cur) => *cur = Some(v),
            Self::Push(items) => items.push(v),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn finish(self) -> Bson {
        match self {
            Self::Sum { total, int_total, all_int } => {
                if all_int { narrow_int(int_total) } else { Bson::Double(total) }
            }
            Self::Avg { total, n } => {
                if n == 0 { Bson::Null } else { Bson::Double(total / n as f64) }
            }
            Self::Min(v) | Self::Max(v) | Self::First(v) | Self::Last(v) => {
                v.unwrap_or(Bson::Null)
            }
            Self::Push(items) => Bson::Array(items),
        }
    }
}

fn narrow_int(n: i64) -> Bson {
    i32::try_from(n).map_or(Bson::Int64(n), Bson::Int32)
}

fn group(docs: Vec<Document>, spec: &Document) -> StoreResult<Vec<Document>> {
    let key_expr = spec
        .get("_id")
        .ok_or_else(|| StoreError::Message("$group needs an _id expression".into()))?;
    let mut fields: Vec<(&str, &str, &Bson)> = Vec::new();
    for (alias, acc) in spec {
        if alias == "_id" {
            continue;
        }
        let acc = acc
            .as_document()
            .filter(|d| d.len() == 1)
            .ok_or_else(|| StoreError::Message(format!("accumulator {alias} must be {{op: expr}}")))?;
        if let Some((op, expr)) = acc.iter().next() {
            fields.push((alias.as_str(), op.as_str(), expr));
        }
    }

    // first-seen order of group keys
    let mut groups: Vec<(Bson, Vec<Acc>)> = Vec::new();
    for d in &docs {
        let key = eval_expr(d, key_expr);
        let idx = match groups.iter().position(|(k, _)| *k == key) {
            Some(i) => i,
            None => {
                let accs = fields.iter().map(|(_, op, _)| Acc::new(op)).collect::<StoreResult<_>>()?;
                groups.push((key, accs));
                groups.len() - 1
            }
        };
        for (acc, (_, _, expr)) in groups[idx].1.iter_mut().zip(fields.iter()) {
            acc.feed(eval_expr(d, expr));
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, accs)| {
            let mut out = Document::new();
            out.insert("_id", key);
            for (acc, (alias, _, _)) in accs.into_iter().zip(fields.iter()) {
                out.insert(*alias, acc.finish());
            }
            out
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn staff() -> Vec<Document> {
        vec![
            doc! {"_id": 1, "dept": "ops", "salary": 10.5, "age": 30},
            doc! {"_id": 2, "dept": "dev", "salary": 20.0, "age": 40},
            doc! {"_id": 3, "dept": "ops", "salary": 4.5, "age": 50},
        ]
    }

    #[test]
    fn group_sum_count_avg() {
        let out = run(
            staff(),
            &[doc! {"$group": {
                "_id": {"dept": "$dept"},
                "total": {"$sum": "$salary"},
                "n": {"$sum": 1},
                "avg_age": {"$avg": "$age"},
            }}],
        )
        .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get_document("_id").unwrap(), &doc! {"dept": "ops"});
        assert_eq!(out[0].get_f64("total").unwrap(), 15.0);
        assert_eq!(out[0].get("n"), Some(&Bson::Int32(2)));
        assert_eq!(out[0].get_f64("avg_age").unwrap(), 40.0);
    }

    #[test]
    fn match_sort_skip_limit_count() {
        let out = run(
            staff(),
            &[
                doc! {"$match": {"age": {"$gte": 40}}},
                doc! {"$sort": {"age": -1}},
                doc! {"$limit": 1},
            ],
        )
        .unwrap();
        assert_eq!(out, vec![doc! {"_id": 3, "dept": "ops", "salary": 4.5, "age": 50}]);
        let out = run(staff(), &[doc! {"$skip": 1}, doc! {"$count": "n"}]).unwrap();
        assert_eq!(out, vec![doc! {"n": 2}]);
    }

    #[test]
    fn unknown_stage_is_rejected() {
        assert!(run(staff(), &[doc! {"$bucketAuto": {}}]).is_err());
    }
}
