use bson::Bson;

use crate::errors::DbError;
use crate::filter::Filter;

use super::group::GroupedQueryItems;
use super::types::{AggrItem, CommandName, CommandSpec, QueryItem};

/// Fluent builder producing the ordered [`QueryItem`] list a connection consumes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    items: Vec<QueryItem>,
}

fn strings<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    values.into_iter().map(Into::into).collect()
}

impl Query {
    #[allow(clippy::should_implement_trait)]
    pub fn from(table: &str) -> Self {
        Self { items: vec![QueryItem::From(table.to_string())] }
    }

    #[must_use]
    pub fn from_items(items: Vec<QueryItem>) -> Self {
        Self { items }
    }

    #[must_use]
    pub fn push(mut self, item: QueryItem) -> Self {
        self.items.push(item);
        self
    }

    /// Projected fields; `"path:alias"` renames.
    #[must_use]
    pub fn select<I, S>(self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(QueryItem::Select(strings(fields)))
    }

    #[must_use]
    pub fn filter(self, f: Filter) -> Self {
        self.push(QueryItem::Where(f))
    }

    /// Sort keys; a leading `-` sorts descending.
    #[must_use]
    pub fn order_by<I, S>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(QueryItem::Order(strings(keys)))
    }

    #[must_use]
    pub fn skip(self, n: u64) -> Self {
        self.push(QueryItem::Skip(n))
    }

    #[must_use]
    pub fn take(self, n: i64) -> Self {
        self.push(QueryItem::Take(n))
    }

    #[must_use]
    pub fn aggr(self, items: impl IntoIterator<Item = AggrItem>) -> Self {
        self.push(QueryItem::Aggr(items.into_iter().collect()))
    }

    #[must_use]
    pub fn group_by<I, S>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(QueryItem::GroupBy(strings(keys)))
    }

    #[must_use]
    pub fn insert(self) -> Self {
        self.push(QueryItem::Insert)
    }

    /// Partial update limited to `fields` (all payload fields when empty).
    #[must_use]
    pub fn update<I, S>(self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(QueryItem::Update(strings(fields)))
    }

    #[must_use]
    pub fn delete(self) -> Self {
        self.push(QueryItem::Delete)
    }

    #[must_use]
    pub fn save(self) -> Self {
        self.push(QueryItem::Save)
    }

    #[must_use]
    pub fn command(self, name: impl Into<CommandName>, payload: impl Into<Bson>) -> Self {
        self.push(QueryItem::Command(CommandSpec { name: name.into(), payload: payload.into() }))
    }

    #[must_use]
    pub fn items(&self) -> &[QueryItem] {
        &self.items
    }

    pub fn group(&self) -> Result<GroupedQueryItems, DbError> {
        GroupedQueryItems::from_items(&self.items)
    }
}
