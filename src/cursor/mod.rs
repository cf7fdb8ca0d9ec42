//! Result cursor and the decoder that drains it into caller destinations.
//!
//! A [`Cursor`] owns the live stream, an optional count descriptor and an error slot. Dispatch
//! failures are parked in the slot instead of being returned, so callers check
//! [`Cursor::error`] (or any fetch, which reports it) before relying on results. The stream is
//! released exactly once: by [`Cursor::close`] or, failing that, on drop.

mod decode;

use bson::Document;
use std::sync::Arc;

pub use decode::{FromRecord, Record, coerce_dates};

use crate::config::ConnectionConfig;
use crate::connection::Scope;
use crate::errors::DbError;
use crate::store::{DocumentStore, DocumentStream, SessionHandle};

/// Collection and filter a later [`Cursor::count`] runs against.
#[derive(Debug, Clone, PartialEq)]
pub struct CountSpec {
    pub collection: String,
    pub filter: Document,
}

pub struct Cursor {
    stream: Option<Box<dyn DocumentStream>>,
    count: Option<CountSpec>,
    error: Option<DbError>,
    store: Arc<dyn DocumentStore>,
    config: ConnectionConfig,
    session: Option<SessionHandle>,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("open", &self.stream.is_some())
            .field("count", &self.count)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl Cursor {
    pub(crate) fn new(
        scope: Scope<'_>,
        stream: Box<dyn DocumentStream>,
        count: Option<CountSpec>,
    ) -> Self {
        Self {
            stream: Some(stream),
            count,
            error: None,
            store: Arc::clone(scope.store),
            config: scope.config.clone(),
            session: scope.session.cloned(),
        }
    }

    /// A cursor carrying only an error.
    pub(crate) fn failed(scope: Scope<'_>, err: DbError) -> Self {
        log::debug!("cursor failed at dispatch: {err}");
        Self {
            stream: None,
            count: None,
            error: Some(err),
            store: Arc::clone(scope.store),
            config: scope.config.clone(),
            session: scope.session.cloned(),
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&DbError> {
        self.error.as_ref()
    }

    #[must_use]
    pub fn count_spec(&self) -> Option<&CountSpec> {
        self.count.as_ref()
    }

    fn scope(&self) -> Scope<'_> {
        Scope::new(&self.store, &self.config, self.session.as_ref())
    }

    fn ready(&mut self) -> Result<&mut Box<dyn DocumentStream>, DbError> {
        match &self.error {
            Some(DbError::Fetch(msg)) => return Err(DbError::Fetch(msg.clone())),
            Some(e) => return Err(DbError::Fetch(e.to_string())),
            None => {}
        }
        self.stream.as_mut().ok_or_else(|| DbError::Fetch("cursor is closed".into()))
    }

    fn next_record<T: FromRecord>(&mut self) -> Result<Option<T>, DbError> {
        let stream = self.ready()?;
        let next = stream
            .next_document()
            .map_err(|e| DbError::store("unable to fetch data", e))
            .and_then(|doc| {
                doc.map(|mut doc| {
                    coerce_dates(&mut doc);
                    T::from_record(doc)
                })
                .transpose()
            });
        if let Err(e) = &next {
            // later fetches and close report it too
            self.error = Some(DbError::Fetch(e.to_string()));
        }
        next
    }

    /// Decodes the next document, or `Ok(None)` once the stream is exhausted.
    pub fn fetch_one<T: FromRecord>(&mut self) -> Result<Option<T>, DbError> {
        self.next_record()
    }

    /// Decodes up to `limit` documents (`0` drains the stream). The returned vector is trimmed
    /// to the number of documents read.
    pub fn fetch_many<T: FromRecord>(&mut self, limit: usize) -> Result<Vec<T>, DbError> {
        let chunk = self.config.fetch_batch_size.max(1);
        let first = if limit == 0 { chunk } else { chunk.min(limit) };
        let mut out: Vec<T> = Vec::with_capacity(first);
        while limit == 0 || out.len() < limit {
            if out.len() == out.capacity() {
                out.reserve_exact(chunk);
            }
            match self.next_record()? {
                Some(item) => out.push(item),
                None => break,
            }
        }
        out.shrink_to_fit();
        Ok(out)
    }

    pub fn fetch_all<T: FromRecord>(&mut self) -> Result<Vec<T>, DbError> {
        self.fetch_many(0)
    }

    /// Counts the documents behind this cursor, ignoring skip/take. Zero when the cursor has no
    /// count descriptor (command cursors and failed dispatches).
    pub fn count(&self) -> Result<u64, DbError> {
        let Some(spec) = &self.count else {
            return Ok(0);
        };
        self.scope().run("unable to count", |store, session| {
            store.count_documents(session, &spec.collection, &spec.filter)
        })
    }

    /// Releases the stream and reports any error recorded on the cursor.
    pub fn close(&mut self) -> Result<(), DbError> {
        let closed = match self.stream.take() {
            Some(mut stream) => stream.close().map_err(|e| DbError::store("unable to close cursor", e)),
            None => Ok(()),
        };
        match self.error.take() {
            Some(e) => Err(e),
            None => closed,
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Some(mut stream) = self.stream.take()
            && let Err(e) = stream.close()
        {
            log::warn!("closing abandoned cursor: {e}");
        }
    }
}
