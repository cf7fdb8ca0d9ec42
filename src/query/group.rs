use crate::errors::DbError;
use crate::filter::Filter;

use super::types::{
    AggrItem, CommandKind, CommandSpec, MAX_PROJECTION_FIELDS, MAX_SORT_FIELDS, QueryItem,
};

/// Query clauses classified by kind. Built once per invocation and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupedQueryItems {
    pub table: String,
    pub select: Vec<String>,
    pub filter: Option<Filter>,
    pub order: Vec<String>,
    pub skip: Option<u64>,
    pub take: Option<i64>,
    pub aggr: Option<Vec<AggrItem>>,
    pub group_by: Vec<String>,
    pub command: Option<CommandSpec>,
    /// Allow-list from an update clause.
    pub update_fields: Vec<String>,
    pub kind: Option<CommandKind>,
}

impl GroupedQueryItems {
    /// Classifies `items`. Repeated select/order/group clauses accumulate, repeated where clauses
    /// are and-combined, later skip/take win. Two different mutating kinds are rejected.
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a QueryItem>) -> Result<Self, DbError> {
        let mut g = Self::default();
        for item in items {
            match item {
                QueryItem::From(t) => t.clone_into(&mut g.table),
                QueryItem::Select(fields) => g.select.extend(fields.iter().cloned()),
                QueryItem::Where(f) => {
                    g.filter = Some(match g.filter.take() {
                        None => f.clone(),
                        Some(Filter::And(mut items)) => {
                            items.push(f.clone());
                            Filter::And(items)
                        }
                        Some(prev) => Filter::And(vec![prev, f.clone()]),
                    });
                }
                QueryItem::Order(keys) => g.order.extend(keys.iter().cloned()),
                QueryItem::Skip(n) => g.skip = Some(*n),
                QueryItem::Take(n) => g.take = Some(*n),
                QueryItem::Aggr(a) => g.aggr.get_or_insert_with(Vec::new).extend(a.iter().cloned()),
                QueryItem::GroupBy(keys) => g.group_by.extend(keys.iter().cloned()),
                QueryItem::Command(spec) => {
                    g.command = Some(spec.clone());
                    g.set_kind(CommandKind::Command)?;
                }
                QueryItem::Insert => g.set_kind(CommandKind::Insert)?,
                QueryItem::Update(fields) => {
                    g.update_fields.extend(fields.iter().cloned());
                    g.set_kind(CommandKind::Update)?;
                }
                QueryItem::Delete => g.set_kind(CommandKind::Delete)?,
                QueryItem::Save => g.set_kind(CommandKind::Save)?,
            }
        }
        if g.select.len() > MAX_PROJECTION_FIELDS {
            return Err(DbError::Translation(format!(
                "too many select fields: {} > {MAX_PROJECTION_FIELDS}",
                g.select.len()
            )));
        }
        if g.order.len() > MAX_SORT_FIELDS {
            return Err(DbError::Translation(format!(
                "too many sort keys: {} > {MAX_SORT_FIELDS}",
                g.order.len()
            )));
        }
        Ok(g)
    }

    fn set_kind(&mut self, kind: CommandKind) -> Result<(), DbError> {
        match self.kind {
            Some(prev) if prev != kind => Err(DbError::Dispatch(format!(
                "query mixes {prev:?} and {kind:?} commands"
            ))),
            _ => {
                self.kind = Some(kind);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{eq, gt};
    use crate::query::Query;

    #[test]
    fn clauses_are_classified() {
        let q = Query::from("staff")
            .select(["name", "age"])
            .filter(eq("dept", "ops"))
            .filter(gt("age", 30))
            .order_by(["-age"])
            .skip(5)
            .take(10);
        let g = q.group().unwrap();
        assert_eq!(g.table, "staff");
        assert_eq!(g.select, vec!["name", "age"]);
        assert_eq!(g.filter, Some(Filter::And(vec![eq("dept", "ops"), gt("age", 30)])));
        assert_eq!(g.order, vec!["-age"]);
        assert_eq!((g.skip, g.take), (Some(5), Some(10)));
        assert!(g.kind.is_none());
    }

    #[test]
    fn mixed_commands_are_rejected() {
        let q = Query::from("staff").insert().delete();
        assert!(q.group().is_err());
        let g = Query::from("staff").update(["name"]).group().unwrap();
        assert_eq!(g.kind, Some(CommandKind::Update));
        assert_eq!(g.update_fields, vec!["name"]);
    }
}
