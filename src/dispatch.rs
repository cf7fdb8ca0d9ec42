//! Query Dispatcher: picks aggregate, named-command or plain-find execution for a grouped query
//! and wraps the resulting stream in a [`Cursor`].

use bson::{Bson, Document, doc};
use serde::Serialize;
use std::time::Instant;

use crate::connection::Scope;
use crate::cursor::{CountSpec, Cursor};
use crate::errors::DbError;
use crate::query::{AggrItem, AggrOp, CommandName, CommandSpec, GroupedQueryItems, Query};
use crate::store::{AggregateOptions, FindOptions};
use crate::translate::Translator;
use crate::utils::devlog::{self, TraceEvent};

/// Groups and translates `query`, then builds its cursor. Every failure lands in the cursor's
/// error slot.
pub fn cursor_for(scope: Scope<'_>, query: &Query) -> Cursor {
    let prepared = query.group().and_then(|grouped| {
        let resolved = resolve_where(scope, &grouped)?;
        Ok((grouped, resolved))
    });
    match prepared {
        Ok((grouped, resolved)) => build_cursor(scope, &grouped, &resolved),
        Err(e) => Cursor::failed(scope, e),
    }
}

/// Translates the grouped where clause with the connection's composite policy; no clause gives
/// an empty document.
pub fn resolve_where(scope: Scope<'_>, grouped: &GroupedQueryItems) -> Result<Document, DbError> {
    match &grouped.filter {
        Some(f) => Translator::new(scope.config().composite_policy).translate(f),
        None => Ok(Document::new()),
    }
}

/// Execution mode the dispatcher picked for a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorMode {
    Aggregate,
    Command,
    Find,
}

pub fn build_cursor(
    scope: Scope<'_>,
    grouped: &GroupedQueryItems,
    resolved_where: &Document,
) -> Cursor {
    let started = Instant::now();
    let (mode, built) = if let Some(items) = &grouped.aggr {
        (CursorMode::Aggregate, aggregate_cursor(scope, grouped, items, resolved_where))
    } else if let Some(cmd) = &grouped.command {
        (CursorMode::Command, command_cursor(scope, grouped, cmd, resolved_where))
    } else {
        (CursorMode::Find, find_cursor(scope, grouped, resolved_where))
    };
    devlog::emit(TraceEvent::Cursor {
        mode,
        collection: grouped.table.clone(),
        ok: built.is_ok(),
        duration_us: devlog::elapsed_us(started),
    });
    built.unwrap_or_else(|e| Cursor::failed(scope, e))
}

fn count_spec(grouped: &GroupedQueryItems, resolved_where: &Document) -> CountSpec {
    CountSpec { collection: grouped.table.clone(), filter: resolved_where.clone() }
}

/// Output key for an accumulator: the alias, else the field with dots replaced.
fn accumulator_alias(item: &AggrItem) -> String {
    if !item.alias.is_empty() {
        return item.alias.replace('.', "_");
    }
    if item.field.is_empty() {
        return item.op.as_str().trim_start_matches('$').to_string();
    }
    item.field.replace('.', "_")
}

pub(crate) fn group_stage(items: &[AggrItem], group_by: &[String]) -> Result<Document, DbError> {
    let mut group = Document::new();
    let keys: Vec<&str> = group_by.iter().map(|g| g.trim()).filter(|g| !g.is_empty()).collect();
    if keys.is_empty() {
        group.insert("_id", "");
    } else {
        let mut id = Document::new();
        for k in keys {
            id.insert(k.replace('.', "_"), format!("${k}"));
        }
        group.insert("_id", id);
    }
    for item in items {
        let expr = match item.op {
            AggrOp::Count => doc! {"$sum": 1},
            op => {
                if item.field.is_empty() {
                    return Err(DbError::Translation(format!("{} needs a field", op.as_str())));
                }
                let mut d = Document::new();
                d.insert(op.as_str(), format!("${}", item.field));
                d
            }
        };
        group.insert(accumulator_alias(item), expr);
    }
    Ok(group)
}

fn aggregate_cursor(
    scope: Scope<'_>,
    grouped: &GroupedQueryItems,
    items: &[AggrItem],
    resolved_where: &Document,
) -> Result<Cursor, DbError> {
    let mut pipeline = Vec::with_capacity(2);
    if !resolved_where.is_empty() {
        pipeline.push(doc! {"$match": resolved_where.clone()});
    }
    pipeline.push(doc! {"$group": group_stage(items, &grouped.group_by)?});
    let opts = AggregateOptions { allow_disk_use: true };
    let stream = scope.run("unable to aggregate", |s, session| {
        s.aggregate(session, &grouped.table, &pipeline, &opts)
    })?;
    Ok(Cursor::new(scope, stream, Some(count_spec(grouped, resolved_where))))
}

/// Caller stages from an array payload or a `{pipe: [...]}` document.
fn pipeline_stages(payload: &Bson) -> Result<Vec<Document>, DbError> {
    let stages = match payload {
        Bson::Array(items) => items,
        Bson::Document(d) => d
            .get_array("pipe")
            .map_err(|_| DbError::Dispatch("pipeline command needs a pipe array".into()))?,
        _ => return Err(DbError::Dispatch("pipeline command needs a pipe array".into())),
    };
    stages
        .iter()
        .map(|s| {
            s.as_document()
                .cloned()
                .ok_or_else(|| DbError::Dispatch(format!("pipeline stage must be a document, got {s}")))
        })
        .collect()
}

fn is_text_stage(stage: &Document) -> bool {
    stage.contains_key("$text")
        || stage.get_document("$match").is_ok_and(|m| m.contains_key("$text"))
}

fn command_cursor(
    scope: Scope<'_>,
    grouped: &GroupedQueryItems,
    cmd: &CommandSpec,
    resolved_where: &Document,
) -> Result<Cursor, DbError> {
    let stream = match &cmd.name {
        CommandName::Aggregate | CommandName::Pipe => {
            let stages = pipeline_stages(&cmd.payload)?;
            // text search has to lead the pipeline, so the caller's stages go in untouched
            let mut pipeline = Vec::with_capacity(stages.len() + 1);
            if !resolved_where.is_empty() && !stages.first().is_some_and(is_text_stage) {
                pipeline.push(doc! {"$match": resolved_where.clone()});
            }
            pipeline.extend(stages);
            let opts = AggregateOptions { allow_disk_use: true };
            scope.run("unable to aggregate", |s, session| {
                s.aggregate(session, &grouped.table, &pipeline, &opts)
            })?
        }
        CommandName::Command => {
            let Bson::Document(command) = &cmd.payload else {
                return Err(DbError::Dispatch(format!("command payload must be a document, got {}", cmd.payload)));
            };
            scope.run("unable to run command", |s, session| s.run_command_cursor(session, command))?
        }
        other => return Err(DbError::Dispatch(format!("invalid command {other}"))),
    };
    Ok(Cursor::new(scope, stream, None))
}

/// Projection from select fields; `"path:alias"` projects `path` under `alias`.
pub(crate) fn projection(select: &[String]) -> Result<Option<Document>, DbError> {
    let mut out = Document::new();
    for raw in select {
        let field = raw.trim();
        if field.is_empty() {
            continue;
        }
        match field.split_once(':') {
            None => {
                out.insert(field, 1);
            }
            Some((source, alias)) => {
                let (source, alias) = (source.trim(), alias.trim());
                if source.is_empty() || alias.is_empty() || alias.contains(':') {
                    return Err(DbError::Translation(format!("malformed projection {raw}")));
                }
                out.insert(alias, format!("${source}"));
            }
        }
    }
    Ok((!out.is_empty()).then_some(out))
}

/// Sort document from order keys; a leading `-` sorts descending.
pub(crate) fn sort(order: &[String]) -> Option<Document> {
    let mut out = Document::new();
    for key in order {
        let key = key.trim();
        match key.strip_prefix('-') {
            Some(desc) if !desc.is_empty() => {
                out.insert(desc, -1);
            }
            Some(_) => {}
            None if !key.is_empty() => {
                out.insert(key, 1);
            }
            None => {}
        }
    }
    (!out.is_empty()).then_some(out)
}

fn find_cursor(
    scope: Scope<'_>,
    grouped: &GroupedQueryItems,
    resolved_where: &Document,
) -> Result<Cursor, DbError> {
    let opts = FindOptions {
        projection: projection(&grouped.select)?,
        sort: sort(&grouped.order),
        skip: grouped.skip,
        limit: grouped.take,
    };
    let stream = scope.run("unable to find", |s, session| {
        s.find(session, &grouped.table, resolved_where, &opts)
    })?;
    Ok(Cursor::new(scope, stream, Some(count_spec(grouped, resolved_where))))
}
