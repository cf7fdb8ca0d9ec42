use bson::{Bson, Document};
use regex::RegexBuilder;
use std::cmp::Ordering;

use crate::query::MAX_SORT_FIELDS;
use crate::store::{StoreError, StoreResult};

// Safety limits to prevent resource abuse
pub(crate) const MAX_PATH_DEPTH: usize = 32;
pub(crate) const MAX_IN_SET: usize = 1000;

/// Evaluates a query document (`{field: cond, "$or": [...], ...}`) against `doc`.
pub fn matches(doc: &Document, filter: &Document) -> StoreResult<bool> {
    for (key, cond) in filter {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for f in logical_operands(key, cond)? {
                    if !matches(doc, f)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for f in logical_operands(key, cond)? {
                    if matches(doc, f)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for f in logical_operands(key, cond)? {
                    if matches(doc, f)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            "$text" => text_matches(doc, cond)?,
            k if k.starts_with('$') => {
                return Err(StoreError::Unsupported(format!("unknown top-level operator {k}")));
            }
            path => field_matches(get_path(doc, path), cond)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn logical_operands<'a>(op: &str, cond: &'a Bson) -> StoreResult<Vec<&'a Document>> {
    let Bson::Array(items) = cond else {
        return Err(StoreError::Message(format!("{op} needs an array")));
    };
    items
        .iter()
        .map(|b| match b {
            Bson::Document(d) => Ok(d),
            _ => Err(StoreError::Message(format!("{op} entries must be documents"))),
        })
        .collect()
}

fn is_operator_doc(d: &Document) -> bool {
    d.keys().next().is_some_and(|k| k.starts_with('$'))
}

fn field_matches(value: Option<&Bson>, cond: &Bson) -> StoreResult<bool> {
    match cond {
        Bson::Document(ops) if is_operator_doc(ops) => operators_match(value, ops),
        Bson::RegularExpression(re) => {
            regex_matches(value, re.pattern.as_str(), re.options.as_str())
        }
        target => Ok(eq_match(value, target)),
    }
}

fn operators_match(value: Option<&Bson>, ops: &Document) -> StoreResult<bool> {
    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => eq_match(value, arg),
            "$ne" => !eq_match(value, arg),
            "$gt" => cmp_match(value, arg, |o| o == Ordering::Greater),
            "$gte" => cmp_match(value, arg, |o| o != Ordering::Less),
            "$lt" => cmp_match(value, arg, |o| o == Ordering::Less),
            "$lte" => cmp_match(value, arg, |o| o != Ordering::Greater),
            "$in" => in_set(value, set_arg(op, arg)?),
            "$nin" => !in_set(value, set_arg(op, arg)?),
            "$exists" => value.is_some() == truthy(arg),
            "$regex" => {
                let pattern = match arg {
                    Bson::String(s) => s.clone(),
                    Bson::RegularExpression(re) => re.pattern.as_str().to_string(),
                    _ => return Err(StoreError::Message("$regex needs a string".into())),
                };
                let options = ops.get("$options").and_then(Bson::as_str).unwrap_or("");
                regex_matches(value, &pattern, options)?
            }
            "$options" => true,
            "$not" => !field_matches(value, arg)?,
            "$all" => {
                let wanted = array_arg(op, arg)?;
                wanted.iter().all(|w| eq_match(value, w))
            }
            "$elemMatch" => {
                let Bson::Document(inner) = arg else {
                    return Err(StoreError::Message("$elemMatch needs a document".into()));
                };
                elem_match(value, inner)?
            }
            "$size" => match (value, arg) {
                (Some(Bson::Array(a)), n) => as_i64(n).is_some_and(|n| a.len() as i64 == n),
                _ => false,
            },
            other => {
                return Err(StoreError::Unsupported(format!("unknown operator {other}")));
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn elem_match(value: Option<&Bson>, inner: &Document) -> StoreResult<bool> {
    let Some(Bson::Array(items)) = value else {
        return Ok(false);
    };
    for item in items {
        let hit = if is_operator_doc(inner) {
            operators_match(Some(item), inner)?
        } else if let Bson::Document(d) = item {
            matches(d, inner)?
        } else {
            false
        };
        if hit {
            return Ok(true);
        }
    }
    Ok(false)
}

fn array_arg<'a>(op: &str, arg: &'a Bson) -> StoreResult<&'a [Bson]> {
    match arg {
        Bson::Array(a) => Ok(a.as_slice()),
        _ => Err(StoreError::Message(format!("{op} needs an array"))),
    }
}

fn set_arg<'a>(op: &str, arg: &'a Bson) -> StoreResult<&'a [Bson]> {
    let set = array_arg(op, arg)?;
    if set.len() > MAX_IN_SET {
        return Err(StoreError::Message(format!(
            "{op} takes at most {MAX_IN_SET} values, got {}",
            set.len()
        )));
    }
    Ok(set)
}

fn truthy(b: &Bson) -> bool {
    match b {
        Bson::Boolean(v) => *v,
        Bson::Null => false,
        other => as_f64(other).is_none_or(|n| n != 0.0),
    }
}

/// Equality with array membership, the way a document store treats `{tags: "x"}`.
pub(crate) fn eq_match(value: Option<&Bson>, target: &Bson) -> bool {
    match value {
        None => matches!(target, Bson::Null),
        Some(whole @ Bson::Array(items)) => {
            values_equal(whole, target) || items.iter().any(|i| values_equal(i, target))
        }
        Some(v) => values_equal(v, target),
    }
}

fn values_equal(a: &Bson, b: &Bson) -> bool {
    if is_num(a) && is_num(b) {
        return compare_bson(a, b) == Ordering::Equal;
    }
    a == b
}

fn in_set(value: Option<&Bson>, set: &[Bson]) -> bool {
    set.iter().any(|x| eq_match(value, x))
}

fn cmp_match(value: Option<&Bson>, target: &Bson, pred: impl Fn(Ordering) -> bool) -> bool {
    match value {
        None => false,
        Some(Bson::Array(items)) => {
            items.iter().any(|i| comparable(i, target) && pred(compare_bson(i, target)))
        }
        Some(v) => comparable(v, target) && pred(compare_bson(v, target)),
    }
}

fn comparable(a: &Bson, b: &Bson) -> bool {
    (is_num(a) && is_num(b)) || type_rank(a) == type_rank(b)
}

fn regex_matches(value: Option<&Bson>, pattern: &str, options: &str) -> StoreResult<bool> {
    let re = RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .build()
        .map_err(|e| StoreError::Message(format!("invalid regex {pattern}: {e}")))?;
    Ok(match value {
        Some(Bson::String(s)) => re.is_match(s),
        Some(Bson::Array(items)) => {
            items.iter().any(|i| matches!(i, Bson::String(s) if re.is_match(s)))
        }
        _ => false,
    })
}

fn text_matches(doc: &Document, cond: &Bson) -> StoreResult<bool> {
    let search = match cond {
        Bson::Document(d) => d.get("$search").and_then(Bson::as_str),
        _ => None,
    }
    .ok_or_else(|| StoreError::Message("$text needs $search".into()))?;
    let terms: Vec<String> = search.split_whitespace().map(str::to_lowercase).collect();
    if terms.is_empty() {
        return Ok(false);
    }
    let mut haystack = Vec::new();
    collect_strings(&Bson::Document(doc.clone()), &mut haystack);
    Ok(haystack.iter().any(|s| {
        let s = s.to_lowercase();
        terms.iter().any(|t| s.contains(t.as_str()))
    }))
}

fn collect_strings(b: &Bson, out: &mut Vec<String>) {
    match b {
        Bson::String(s) => out.push(s.clone()),
        Bson::Array(items) => items.iter().for_each(|i| collect_strings(i, out)),
        Bson::Document(d) => d.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// Resolves a dotted path; numeric segments index into arrays.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    if path.is_empty() || path.len() > 1024 {
        return None;
    }
    let mut segs = path.split('.');
    let first = segs.next()?;
    let mut cur = doc.get(first)?;
    for (depth, seg) in segs.enumerate() {
        if depth + 1 >= MAX_PATH_DEPTH {
            return None;
        }
        cur = match cur {
            Bson::Document(d) => d.get(seg)?,
            Bson::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

fn ensure_subdoc<'a>(root: &'a mut Document, key: &str) -> Option<&'a mut Document> {
    if !matches!(root.get(key), Some(Bson::Document(_))) {
        root.insert(key.to_string(), Bson::Document(Document::new()));
    }
    match root.get_mut(key) {
        Some(Bson::Document(d)) => Some(d),
        _ => None,
    }
}

fn traverse_to_parent<'a>(root: &'a mut Document, path: &str) -> Option<(&'a mut Document, String)> {
    let mut cur = root;
    let mut iter = path.split('.').peekable();
    while let Some(seg) = iter.next() {
        if iter.peek().is_none() {
            return Some((cur, seg.to_string()));
        }
        cur = ensure_subdoc(cur, seg)?;
    }
    None
}

pub(crate) fn set_path(root: &mut Document, path: &str, value: Bson) -> bool {
    let Some((parent, last)) = traverse_to_parent(root, path) else {
        return false;
    };
    let old = parent.insert(last, value.clone());
    old.as_ref() != Some(&value)
}

fn unset_path(root: &mut Document, path: &str) -> bool {
    match traverse_to_parent(root, path) {
        Some((parent, last)) => parent.remove(&last).is_some(),
        None => false,
    }
}

/// Applies `$set`, `$unset` and `$inc`; returns whether the document changed.
pub fn apply_update(doc: &mut Document, update: &Document) -> StoreResult<bool> {
    let mut changed = false;
    for (op, arg) in update {
        let Bson::Document(fields) = arg else {
            return Err(StoreError::Message(format!("{op} needs a document")));
        };
        for (path, v) in fields {
            if path == "_id" && op != "$set" {
                continue;
            }
            let hit = match op.as_str() {
                "$set" => {
                    if path == "_id" && doc.get("_id").is_some_and(|cur| cur != v) {
                        return Err(StoreError::Message("the _id field is immutable".into()));
                    }
                    set_path(doc, path, v.clone())
                }
                "$unset" => unset_path(doc, path),
                "$inc" => {
                    let by = as_f64(v)
                        .ok_or_else(|| StoreError::Message("$inc requires numeric".into()))?;
                    let cur = get_path(doc, path).cloned().unwrap_or(Bson::Int32(0));
                    set_path(doc, path, add_numbers(&cur, v, by))
                }
                other => {
                    return Err(StoreError::Unsupported(format!("update operator {other}")));
                }
            };
            changed |= hit;
        }
    }
    Ok(changed)
}

fn add_numbers(cur: &Bson, by: &Bson, by_f: f64) -> Bson {
    match (cur, by) {
        (Bson::Int32(a), Bson::Int32(b)) => {
            a.checked_add(*b).map_or(Bson::Int64(i64::from(*a) + i64::from(*b)), Bson::Int32)
        }
        (Bson::Int32(_) | Bson::Int64(_), Bson::Int32(_) | Bson::Int64(_)) => {
            Bson::Int64(as_i64(cur).unwrap_or(0).saturating_add(as_i64(by).unwrap_or(0)))
        }
        _ => Bson::Double(as_f64(cur).unwrap_or(0.0) + by_f),
    }
}

/// Rejects sort documents longer than the query layer accepts.
pub(crate) fn check_sort(sort: &Document) -> StoreResult<()> {
    if sort.len() > MAX_SORT_FIELDS {
        return Err(StoreError::Message(format!(
            "too many sort keys: {} > {MAX_SORT_FIELDS}",
            sort.len()
        )));
    }
    Ok(())
}

pub fn compare_docs(a: &Document, b: &Document, sort: &Document) -> Ordering {
    for (field, dir) in sort {
        let va = get_path(a, field);
        let vb = get_path(b, field);
        let ord = match (va, vb) {
            (Some(x), Some(y)) => compare_bson(x, y),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        if ord != Ordering::Equal {
            let desc = as_f64(dir).is_some_and(|d| d < 0.0);
            return if desc { ord.reverse() } else { ord };
        }
    }
    Ordering::Equal
}

fn is_num(x: &Bson) -> bool {
    matches!(x, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_))
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn as_f64(x: &Bson) -> Option<f64> {
    match x {
        Bson::Int32(i) => Some(f64::from(*i)),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Double(f) => Some(*f),
        Bson::Decimal128(d) => d.to_string().parse::<f64>().ok(),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
pub(crate) fn as_i64(x: &Bson) -> Option<i64> {
    match x {
        Bson::Int32(i) => Some(i64::from(*i)),
        Bson::Int64(i) => Some(*i),
        Bson::Double(f) if f.fract() == 0.0 => Some(*f as i64),
        _ => None,
    }
}

pub fn compare_bson(a: &Bson, b: &Bson) -> Ordering {
    use bson::Bson as T;
    if is_num(a) && is_num(b) {
        return as_f64(a).unwrap_or(f64::NAN).total_cmp(&as_f64(b).unwrap_or(f64::NAN));
    }
    match (a, b) {
        (T::String(x), T::String(y)) => x.cmp(y),
        (T::Boolean(x), T::Boolean(y)) => x.cmp(y),
        (T::DateTime(x), T::DateTime(y)) => x.cmp(y),
        (T::ObjectId(x), T::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (T::Array(x), T::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let o = compare_bson(l, r);
                if o != Ordering::Equal {
                    return o;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(v: &Bson) -> u8 {
    use bson::Bson as T;
    match v {
        T::MinKey => 0,
        T::Null | T::Undefined => 1,
        T::Int32(_) | T::Int64(_) | T::Double(_) | T::Decimal128(_) => 2,
        T::Symbol(_) | T::String(_) => 3,
        T::Document(_) => 4,
        T::Array(_) => 5,
        T::Binary(_) => 6,
        T::ObjectId(_) => 7,
        T::Boolean(_) => 8,
        T::DateTime(_) => 9,
        T::Timestamp(_) => 10,
        T::RegularExpression(_) => 11,
        T::DbPointer(_) => 12,
        T::JavaScriptCode(_) => 13,
        T::JavaScriptCodeWithScope(_) => 14,
        T::MaxKey => 255,
    }
}

/// Applies a projection document: inclusion (`1`), exclusion (`0`) or computed (`"$path"`).
pub fn project(doc: &Document, projection: &Document) -> StoreResult<Document> {
    let mut include_id = true;
    let mut inclusions = Vec::new();
    let mut exclusions = Vec::new();
    for (field, spec) in projection {
        if field == "_id" && matches!(spec, Bson::Boolean(_) | Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) {
            include_id = truthy(spec);
            continue;
        }
        match spec {
            Bson::String(s) if s.starts_with('$') => {
                inclusions.push((field.as_str(), get_path(doc, &s[1..]).cloned()));
            }
            Bson::Boolean(_) | Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => {
                if truthy(spec) {
                    inclusions.push((field.as_str(), get_path(doc, field).cloned()));
                } else {
                    exclusions.push(field.as_str());
                }
            }
            other => inclusions.push((field.as_str(), Some(other.clone()))),
        }
    }
    if !inclusions.is_empty() && !exclusions.is_empty() {
        return Err(StoreError::Message(
            "cannot mix inclusion and exclusion in a projection".into(),
        ));
    }
    if inclusions.is_empty() {
        let mut out = doc.clone();
        for f in exclusions {
            unset_path(&mut out, f);
        }
        if !include_id {
            out.remove("_id");
        }
        return Ok(out);
    }
    let mut out = Document::new();
    if include_id && let Some(id) = doc.get("_id") {
        out.insert("_id", id.clone());
    }
    for (field, value) in inclusions {
        if let Some(v) = value {
            set_path(&mut out, field, v);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn implicit_equality_and_operators() {
        let d = doc! {"age": 30, "name": "alice", "tags": ["a", "b"]};
        assert!(matches(&d, &doc! {"age": 30}).unwrap());
        assert!(matches(&d, &doc! {"age": 30.0}).unwrap());
        assert!(matches(&d, &doc! {"age": {"$gt": 20, "$lte": 30}}).unwrap());
        assert!(!matches(&d, &doc! {"age": {"$ne": 30}}).unwrap());
        assert!(matches(&d, &doc! {"tags": "b"}).unwrap());
        assert!(matches(&d, &doc! {"tags": {"$all": ["a", "b"]}}).unwrap());
        assert!(matches(&d, &doc! {"missing": {"$exists": false}}).unwrap());
    }

    #[test]
    fn regex_and_not() {
        let d = doc! {"name": "Alice"};
        assert!(matches(&d, &doc! {"name": {"$regex": "^al", "$options": "i"}}).unwrap());
        assert!(!matches(&d, &doc! {"name": {"$regex": "^al"}}).unwrap());
        assert!(matches(&d, &doc! {"name": {"$not": {"$regex": "^bob", "$options": "i"}}}).unwrap());
    }

    #[test]
    fn logical_and_elem_match() {
        let d = doc! {"dims": [{"kind": "Company", "value": "Kano"}, {"kind": "Project", "value": "X"}]};
        let f = doc! {"$or": [
            {"dims": {"$elemMatch": {"kind": "Company", "value": "Kano"}}},
            {"dims": {"$elemMatch": {"kind": "Project", "value": "Y"}}},
        ]};
        assert!(matches(&d, &f).unwrap());
        let f = doc! {"dims": {"$elemMatch": {"kind": "Company", "value": "X"}}};
        assert!(!matches(&d, &f).unwrap());
        assert!(matches(&d, &doc! {"$nor": [{"dims.0.kind": "Project"}]}).unwrap());
    }

    #[test]
    fn update_set_inc_unset() {
        let mut d = doc! {"age": 30, "info": {"visits": 1}, "old": true};
        let changed = apply_update(
            &mut d,
            &doc! {"$set": {"name": "alice"}, "$inc": {"age": 1, "info.visits": 2}, "$unset": {"old": ""}},
        )
        .unwrap();
        assert!(changed);
        assert_eq!(d.get_str("name").unwrap(), "alice");
        assert_eq!(d.get("age"), Some(&Bson::Int32(31)));
        assert_eq!(get_path(&d, "info.visits"), Some(&Bson::Int32(3)));
        assert!(d.get("old").is_none());
    }

    #[test]
    fn projection_with_alias_and_exclusion() {
        let d = doc! {"_id": 1, "name": "bob", "addr": {"city": "Oslo"}, "age": 4};
        let p = project(&d, &doc! {"name": 1, "town": "$addr.city"}).unwrap();
        assert_eq!(p, doc! {"_id": 1, "name": "bob", "town": "Oslo"});
        let p = project(&d, &doc! {"addr": 0, "_id": 0}).unwrap();
        assert_eq!(p, doc! {"name": "bob", "age": 4});
        assert!(project(&d, &doc! {"addr": 0, "name": 1}).is_err());
    }

    #[test]
    fn sort_order_descending() {
        let a = doc! {"v": 1};
        let b = doc! {"v": 2};
        assert_eq!(compare_docs(&a, &b, &doc! {"v": -1}), Ordering::Greater);
        assert_eq!(compare_docs(&a, &b, &doc! {"v": 1}), Ordering::Less);
    }

    #[test]
    fn every_sort_key_counts() {
        let mut sort = Document::new();
        let mut a = Document::new();
        let mut b = Document::new();
        for i in 1..=9 {
            sort.insert(format!("k{i}"), 1);
            a.insert(format!("k{i}"), 0);
            b.insert(format!("k{i}"), 0);
        }
        a.insert("k9", 2);
        b.insert("k9", 1);
        assert!(check_sort(&sort).is_ok());
        assert_eq!(compare_docs(&a, &b, &sort), Ordering::Greater);

        for i in 10..=MAX_SORT_FIELDS + 1 {
            sort.insert(format!("k{i}"), 1);
        }
        assert!(check_sort(&sort).is_err());
    }

    #[test]
    fn oversized_in_sets_are_rejected() {
        let d = doc! {"v": 1};
        let set: Vec<Bson> = (0..=MAX_IN_SET).map(|i| Bson::from(i32::try_from(i).unwrap())).collect();
        assert!(matches(&d, &doc! {"v": {"$in": set.clone()}}).is_err());
        assert!(matches(&d, &doc! {"v": {"$nin": set}}).is_err());
        let set: Vec<Bson> = (0..MAX_IN_SET).map(|i| Bson::from(i32::try_from(i).unwrap())).collect();
        assert!(matches(&d, &doc! {"v": {"$in": set}}).unwrap());
    }
}
