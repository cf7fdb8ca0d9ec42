use bson::{Bson, Document};
use rand::Rng;
use rand::distr::Alphanumeric;

use super::ExecResult;
use crate::connection::Scope;
use crate::errors::DbError;
use crate::query::{CommandName, CommandSpec, GroupedQueryItems, Params};
use crate::store::{DownloadStream, StoreError, copy_download};

const RANDOM_NAME_LEN: usize = 32;

fn random_name() -> String {
    rand::rng().sample_iter(&Alphanumeric).take(RANDOM_NAME_LEN).map(char::from).collect()
}

/// Blob command options: `{id, name, metadata, size}`, all optional.
struct BlobArgs {
    id: Option<Bson>,
    name: String,
    metadata: Document,
    chunk_size: Option<u32>,
}

impl BlobArgs {
    fn parse(payload: &Bson) -> Result<Self, DbError> {
        let opts = match payload {
            Bson::Document(d) => d.clone(),
            Bson::Null => Document::new(),
            other => {
                return Err(DbError::Dispatch(format!("blob command options must be a document, got {other}")));
            }
        };
        let id = opts.get("id").filter(|v| !matches!(v, Bson::Null)).cloned();
        let name = opts.get_str("name").unwrap_or_default().to_string();
        let metadata = opts.get_document("metadata").cloned().unwrap_or_default();
        let chunk_size = match opts.get("size") {
            None | Some(Bson::Null) => None,
            Some(Bson::Int32(n)) => u32::try_from(*n).ok().filter(|n| *n > 0),
            Some(Bson::Int64(n)) => u32::try_from(*n).ok().filter(|n| *n > 0),
            Some(other) => {
                return Err(DbError::Dispatch(format!("blob chunk size must be an integer, got {other}")));
            }
        };
        Ok(Self { id, name, metadata, chunk_size })
    }

    /// Explicit name, else the identifier's text.
    fn name_or_id(&self) -> Option<String> {
        if !self.name.is_empty() {
            return Some(self.name.clone());
        }
        match &self.id {
            Some(Bson::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(other) => Some(other.to_string()),
            None => None,
        }
    }
}

/// Closes a download on drop unless it was closed explicitly.
struct DownloadGuard(Box<dyn DownloadStream>);

impl DownloadGuard {
    fn close(&mut self) -> Result<(), StoreError> {
        self.0.close()
    }
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        if let Err(e) = self.0.close() {
            log::warn!("closing blob download: {e}");
        }
    }
}

pub(super) fn handle(
    scope: Scope<'_>,
    grouped: &GroupedQueryItems,
    cmd: &CommandSpec,
    params: Params<'_>,
) -> Result<ExecResult, DbError> {
    let args = BlobArgs::parse(&cmd.payload)?;
    let chunk = args.chunk_size.unwrap_or(scope.config().blob_chunk_size);
    let table = grouped.table.as_str();
    let mut bucket = scope.run("error prepare blob bucket", |s, _| s.bucket(table, chunk))?;

    match &cmd.name {
        CommandName::GfsWrite => {
            let source = params
                .source
                .ok_or_else(|| DbError::Precondition("invalid reader".into()))?;
            if let Some(id) = &args.id {
                // replace: drop whatever is stored under the same id first
                match bucket.delete(id) {
                    Ok(()) | Err(StoreError::NotFound(_)) => {}
                    Err(e) => log::debug!("pre-write delete of {id} in {table}: {e}"),
                }
            }
            let filename = args.name_or_id().unwrap_or_else(random_name);
            let id = bucket
                .upload(args.id.clone(), &filename, args.metadata.clone(), source)
                .map_err(|e| DbError::store("error upload file to blob storage", e))?;
            log::debug!("stored blob {filename} in {table}");
            Ok(ExecResult::Id(id))
        }
        CommandName::GfsRead => {
            let output = params
                .output
                .ok_or_else(|| DbError::Precondition("invalid writer".into()))?;
            let label = args.name_or_id().unwrap_or_default();
            let opened = match &args.id {
                Some(id) => bucket.open_download(id),
                None if !args.name.is_empty() => bucket.open_download_by_name(&args.name),
                None => {
                    return Err(DbError::Precondition("blob read needs an id or a name".into()));
                }
            };
            let mut download = DownloadGuard(
                opened.map_err(|e| DbError::store(format!("unable to open blob {table}-{label}"), e))?,
            );
            let copied = copy_download(download.0.as_mut(), output)
                .map_err(|e| DbError::store(format!("unable to read blob {table}-{label}"), e))?;
            download
                .close()
                .map_err(|e| DbError::store(format!("unable to close blob {table}-{label}"), e))?;
            Ok(ExecResult::Copied(copied))
        }
        CommandName::GfsRemove => {
            let id = args
                .id
                .as_ref()
                .filter(|id| !matches!(id, Bson::String(s) if s.is_empty()))
                .ok_or_else(|| DbError::Precondition("blob remove needs an id".into()))?;
            bucket
                .delete(id)
                .map_err(|e| DbError::store("unable to remove blob", e))?;
            Ok(ExecResult::None)
        }
        CommandName::GfsTruncate => {
            bucket
                .drop_bucket()
                .map_err(|e| DbError::store("unable to truncate blob storage", e))?;
            Ok(ExecResult::None)
        }
        other => Err(DbError::Dispatch(format!("invalid command: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn args_defaults_and_naming() {
        let a = BlobArgs::parse(&Bson::Null).unwrap();
        assert!(a.id.is_none() && a.name.is_empty() && a.chunk_size.is_none());
        assert_eq!(a.name_or_id(), None);

        let a = BlobArgs::parse(&doc! {"id": "report-1", "size": 512, "metadata": {"k": 1}}.into())
            .unwrap();
        assert_eq!(a.name_or_id().as_deref(), Some("report-1"));
        assert_eq!(a.chunk_size, Some(512));
        assert_eq!(a.metadata, doc! {"k": 1});

        assert!(BlobArgs::parse(&Bson::from("x")).is_err());
        assert!(BlobArgs::parse(&doc! {"size": "big"}.into()).is_err());
    }

    #[test]
    fn random_names_are_alphanumeric() {
        let n = random_name();
        assert_eq!(n.len(), RANDOM_NAME_LEN);
        assert!(n.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(n, random_name());
    }
}
