//! Command Executor: insert, update, delete, save and named commands.
//!
//! Each command is a single pass with no retry. Preconditions (where clause for update/delete,
//! identifier for save) are checked before any client call is made.

mod blob;

use bson::{Bson, Document, doc};
use std::time::{Duration, Instant};

use crate::config::SaveMode;
use crate::connection::Scope;
use crate::dispatch::resolve_where;
use crate::errors::DbError;
use crate::query::{CommandKind, CommandName, CommandSpec, GroupedQueryItems, Params, Query};
use crate::store::{DeleteReport, UpdateReport};
use crate::utils::devlog::{self, TraceEvent};
use crate::watch::Watcher;

/// What a command produced.
#[derive(Debug)]
pub enum ExecResult {
    None,
    /// The stored payload with its identifier written back.
    Inserted(Document),
    Updated(UpdateReport),
    Deleted(DeleteReport),
    /// Identifier of an uploaded blob.
    Id(Bson),
    /// Bytes copied out of a blob.
    Copied(u64),
    Values(Vec<Bson>),
    /// Reply document of a raw command.
    Reply(Document),
    Watcher(Watcher),
}

impl ExecResult {
    #[must_use]
    pub fn into_document(self) -> Option<Document> {
        match self {
            Self::Inserted(d) | Self::Reply(d) => Some(d),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_values(self) -> Option<Vec<Bson>> {
        match self {
            Self::Values(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_watcher(self) -> Option<Watcher> {
        match self {
            Self::Watcher(w) => Some(w),
            _ => None,
        }
    }
}

/// Groups and translates `query`, then executes it.
pub fn execute_query(scope: Scope<'_>, query: &Query, params: Params<'_>) -> Result<ExecResult, DbError> {
    let grouped = query.group()?;
    let resolved = resolve_where(scope, &grouped)?;
    execute(scope, &grouped, &resolved, params)
}

pub fn execute(
    scope: Scope<'_>,
    grouped: &GroupedQueryItems,
    resolved_where: &Document,
    params: Params<'_>,
) -> Result<ExecResult, DbError> {
    let kind = grouped
        .kind
        .ok_or_else(|| DbError::Dispatch("no command to execute".into()))?;
    let started = Instant::now();
    let out = match kind {
        CommandKind::Insert => insert(scope, grouped, params),
        CommandKind::Update => update(scope, grouped, resolved_where, params),
        CommandKind::Delete => delete(scope, grouped, resolved_where),
        CommandKind::Save => save(scope, grouped, params),
        CommandKind::Command => match &grouped.command {
            Some(cmd) => command(scope, grouped, cmd, resolved_where, params),
            None => Err(DbError::Dispatch("no command".into())),
        },
    };
    devlog::emit(TraceEvent::Execute {
        kind,
        collection: grouped.table.clone(),
        bound: scope.is_bound(),
        ok: out.is_ok(),
        duration_us: devlog::elapsed_us(started),
    });
    out
}

fn payload(params: Params<'_>, op: &str) -> Result<Document, DbError> {
    params
        .data
        .ok_or_else(|| DbError::Precondition(format!("{op} needs a data payload")))
}

fn insert(scope: Scope<'_>, grouped: &GroupedQueryItems, params: Params<'_>) -> Result<ExecResult, DbError> {
    let mut doc = scope.config().field_naming.rename_keys(payload(params, "insert")?);
    let id = scope.run("unable to insert", |s, session| s.insert_one(session, &grouped.table, &doc))?;
    doc.insert("_id", id);
    Ok(ExecResult::Inserted(doc))
}

fn update(
    scope: Scope<'_>,
    grouped: &GroupedQueryItems,
    resolved_where: &Document,
    params: Params<'_>,
) -> Result<ExecResult, DbError> {
    if resolved_where.is_empty() {
        return Err(DbError::Precondition("update need to have where clause".into()));
    }
    let single = params.single_update;
    let data = payload(params, "update")?;
    let report = if single {
        let set = doc! {"$set": data};
        scope.run("unable to update", |s, session| {
            s.update_one(session, &grouped.table, resolved_where, &set, false)
        })?
    } else {
        let data = scope.config().field_naming.rename_keys(data);
        let fields = &grouped.update_fields;
        let kept: Document = data
            .into_iter()
            .filter(|(k, _)| k != "_id")
            .filter(|(k, _)| fields.is_empty() || fields.iter().any(|f| f.eq_ignore_ascii_case(k)))
            .collect();
        if kept.is_empty() {
            return Err(DbError::Precondition("no updatable fields in payload".into()));
        }
        let set = doc! {"$set": kept};
        scope.run("unable to update", |s, session| {
            s.update_many(session, &grouped.table, resolved_where, &set, false)
        })?
    };
    Ok(ExecResult::Updated(report))
}

fn delete(
    scope: Scope<'_>,
    grouped: &GroupedQueryItems,
    resolved_where: &Document,
) -> Result<ExecResult, DbError> {
    if resolved_where.is_empty() {
        return Err(DbError::Precondition(
            "delete need to have where clause. To delete all data in a collection, use drop_collection instead of delete".into(),
        ));
    }
    let report = scope.run("unable to delete", |s, session| {
        s.delete_many(session, &grouped.table, resolved_where)
    })?;
    Ok(ExecResult::Deleted(report))
}

fn has_identifier(id: &Bson) -> bool {
    match id {
        Bson::Null | Bson::Undefined => false,
        Bson::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn save(scope: Scope<'_>, grouped: &GroupedQueryItems, params: Params<'_>) -> Result<ExecResult, DbError> {
    let doc = scope.config().field_naming.rename_keys(payload(params, "save")?);
    let id = match doc.get("_id") {
        Some(id) if has_identifier(id) => id.clone(),
        _ => return Err(DbError::Precondition("_id field is required".into())),
    };
    let key = doc! {"_id": id};
    let report = match scope.config().save_mode {
        SaveMode::Replace => scope.run("unable to save", |s, session| {
            s.replace_one(session, &grouped.table, &key, &doc, true)
        })?,
        SaveMode::Merge => {
            let mut fields = doc;
            fields.remove("_id");
            let set = doc! {"$set": fields};
            scope.run("unable to save", |s, session| {
                s.update_many(session, &grouped.table, &key, &set, true)
            })?
        }
    };
    Ok(ExecResult::Updated(report))
}

fn distinct_field(payload: &Bson) -> Result<String, DbError> {
    let field = match payload {
        Bson::String(s) => s.as_str(),
        Bson::Document(d) => d.get_str("field").unwrap_or_default(),
        _ => {
            return Err(DbError::Precondition(
                "distinct only accepts a field name or a {field} document".into(),
            ));
        }
    };
    if field.trim().is_empty() {
        return Err(DbError::Precondition("field attribute is mandatory".into()));
    }
    Ok(field.trim().to_string())
}

fn command(
    scope: Scope<'_>,
    grouped: &GroupedQueryItems,
    cmd: &CommandSpec,
    resolved_where: &Document,
    params: Params<'_>,
) -> Result<ExecResult, DbError> {
    if cmd.name.is_blob() {
        return blob::handle(scope, grouped, cmd, params);
    }
    match &cmd.name {
        CommandName::Distinct => {
            let field = distinct_field(&cmd.payload)?;
            let values = scope.run("unable to get distinct values", |s, session| {
                s.distinct(session, &grouped.table, &field, resolved_where)
            })?;
            Ok(ExecResult::Values(values))
        }
        CommandName::Command => {
            let Bson::Document(raw) = &cmd.payload else {
                return Err(DbError::Dispatch(format!("unknown command {}", cmd.payload)));
            };
            let reply = scope.run("unable to run command", |s, session| s.run_command(session, raw))?;
            Ok(ExecResult::Reply(reply))
        }
        CommandName::Watch => {
            let poll = Duration::from_millis(scope.config().watch_poll_ms.max(1));
            Ok(ExecResult::Watcher(Watcher::start(scope.store, &grouped.table, poll)?))
        }
        other => Err(DbError::Dispatch(format!("invalid command: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_payload_forms() {
        assert_eq!(distinct_field(&Bson::from("dept")).unwrap(), "dept");
        assert_eq!(distinct_field(&doc! {"field": "dept"}.into()).unwrap(), "dept");
        assert!(distinct_field(&doc! {}.into()).unwrap_err().is_precondition());
        assert!(distinct_field(&Bson::Int32(1)).unwrap_err().is_precondition());
    }

    #[test]
    fn identifier_presence() {
        assert!(has_identifier(&Bson::from("a")));
        assert!(has_identifier(&Bson::Int32(0)));
        assert!(!has_identifier(&Bson::from("")));
        assert!(!has_identifier(&Bson::Null));
    }
}
