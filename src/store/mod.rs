//! Client contract for the document database the engine talks to.
//!
//! Everything the dispatcher and executor need from a network client is expressed through
//! [`DocumentStore`]. Every collection-scoped call takes an optional [`SessionHandle`]; when it is
//! present the operation must run bound to that session's transaction.

pub mod memory;

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Message(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("BSON: {0}")]
    Bson(#[from] bson::error::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Opaque handle to a started session with an open transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub(crate) String);

impl SessionHandle {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.0
    }
}

/// Options for `find`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindOptions {
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateOptions {
    pub allow_disk_use: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReport {
    pub matched: u64,
    pub modified: u64,
    pub upserted: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteReport {
    pub deleted: u64,
}

/// A lazily advanced stream of result documents.
pub trait DocumentStream: Send {
    /// Returns the next document, or `None` once the stream is exhausted.
    fn next_document(&mut self) -> StoreResult<Option<Document>>;

    /// Releases the server-side handle. Calling it more than once is harmless.
    fn close(&mut self) -> StoreResult<()>;
}

/// A readable blob download; `close` must be safe to call repeatedly.
pub trait DownloadStream: Read + Send {
    fn close(&mut self) -> StoreResult<()>;
}

/// Bucket-style large-object storage scoped to one name.
pub trait BlobBucket: Send {
    /// Uploads `source` under `id` (generated when `None`) and returns the object identifier.
    fn upload(
        &mut self,
        id: Option<Bson>,
        filename: &str,
        metadata: Document,
        source: &mut dyn Read,
    ) -> StoreResult<Bson>;

    fn open_download(&mut self, id: &Bson) -> StoreResult<Box<dyn DownloadStream>>;

    fn open_download_by_name(&mut self, filename: &str) -> StoreResult<Box<dyn DownloadStream>>;

    fn delete(&mut self, id: &Bson) -> StoreResult<()>;

    /// Removes every object in the bucket.
    fn drop_bucket(&mut self) -> StoreResult<()>;
}

/// Change events for one collection.
pub trait ChangeStream: Send {
    /// Waits up to `timeout` for the next event.
    fn next_event(&mut self, timeout: Duration) -> StoreResult<Option<Document>>;

    fn close(&mut self) -> StoreResult<()>;
}

/// The network document-database client, reduced to the calls the engine issues.
pub trait DocumentStore: Send + Sync {
    fn find(
        &self,
        session: Option<&SessionHandle>,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> StoreResult<Box<dyn DocumentStream>>;

    fn aggregate(
        &self,
        session: Option<&SessionHandle>,
        collection: &str,
        pipeline: &[Document],
        options: &AggregateOptions,
    ) -> StoreResult<Box<dyn DocumentStream>>;

    /// Runs a database-level command whose reply carries a cursor.
    fn run_command_cursor(
        &self,
        session: Option<&SessionHandle>,
        command: &Document,
    ) -> StoreResult<Box<dyn DocumentStream>>;

    /// Runs a database-level command and returns its single reply document.
    fn run_command(
        &self,
        session: Option<&SessionHandle>,
        command: &Document,
    ) -> StoreResult<Document>;

    /// Inserts one document and returns its identifier, generating one when `_id` is absent.
    fn insert_one(
        &self,
        session: Option<&SessionHandle>,
        collection: &str,
        document: &Document,
    ) -> StoreResult<Bson>;

    fn update_many(
        &self,
        session: Option<&SessionHandle>,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> StoreResult<UpdateReport>;

    fn update_one(
        &self,
        session: Option<&SessionHandle>,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> StoreResult<UpdateReport>;

    fn replace_one(
        &self,
        session: Option<&SessionHandle>,
        collection: &str,
        filter: &Document,
        replacement: &Document,
        upsert: bool,
    ) -> StoreResult<UpdateReport>;

    fn delete_many(
        &self,
        session: Option<&SessionHandle>,
        collection: &str,
        filter: &Document,
    ) -> StoreResult<DeleteReport>;

    fn distinct(
        &self,
        session: Option<&SessionHandle>,
        collection: &str,
        field: &str,
        filter: &Document,
    ) -> StoreResult<Vec<Bson>>;

    fn count_documents(
        &self,
        session: Option<&SessionHandle>,
        collection: &str,
        filter: &Document,
    ) -> StoreResult<u64>;

    fn drop_collection(&self, collection: &str) -> StoreResult<()>;

    fn collection_names(&self) -> StoreResult<Vec<String>>;

    fn start_session(&self) -> StoreResult<SessionHandle>;

    fn commit_transaction(&self, session: &SessionHandle) -> StoreResult<()>;

    fn abort_transaction(&self, session: &SessionHandle) -> StoreResult<()>;

    fn bucket(&self, name: &str, chunk_size: u32) -> StoreResult<Box<dyn BlobBucket>>;

    fn watch(&self, collection: &str) -> StoreResult<Box<dyn ChangeStream>>;
}

/// Writer-side helper so callers can hand `&mut Vec<u8>` or files alike to blob reads.
pub fn copy_download(stream: &mut dyn DownloadStream, output: &mut dyn Write) -> StoreResult<u64> {
    Ok(std::io::copy(stream, output)?)
}
