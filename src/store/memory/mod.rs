//! In-process implementation of the [`DocumentStore`] client contract.
//!
//! Collections are insertion-ordered vectors of BSON documents. Sessions take a full snapshot
//! when started; bound operations mutate the snapshot and `commit_transaction` publishes it
//! (last commit wins). Change events for bound writes are held back until commit.

mod blob;
pub mod eval;
mod pipeline;

use bson::{Bson, Document, doc, oid::ObjectId};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use self::blob::{BlobState, MemoryBucket};
use self::eval::{apply_update, check_sort, compare_docs, get_path, matches, project};
use super::{
    AggregateOptions, BlobBucket, ChangeStream, DeleteReport, DocumentStore, DocumentStream,
    FindOptions, SessionHandle, StoreError, StoreResult, UpdateReport,
};

type Collections = HashMap<String, Vec<Document>>;

struct SessionState {
    data: Collections,
    events: Vec<(String, Document)>,
}

#[derive(Default)]
pub struct MemoryStore {
    committed: RwLock<Collections>,
    sessions: Mutex<HashMap<String, SessionState>>,
    blobs: BlobState,
    subscribers: Mutex<Vec<(String, mpsc::Sender<Document>)>>,
    stream_closes: Arc<AtomicUsize>,
    download_closes: Arc<AtomicUsize>,
    calls: AtomicUsize,
    fail_next: Mutex<Option<String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of client calls issued so far.
    pub fn operation_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of result streams released so far.
    pub fn closed_streams(&self) -> usize {
        self.stream_closes.load(Ordering::SeqCst)
    }

    /// Number of blob downloads released so far.
    pub fn closed_downloads(&self) -> usize {
        self.download_closes.load(Ordering::SeqCst)
    }

    /// Makes the next call of `op` (e.g. `"find"`) fail with a client error.
    pub fn fail_next(&self, op: &str) {
        *self.fail_next.lock() = Some(op.to_string());
    }

    /// Committed contents of a collection.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.committed.read().get(collection).cloned().unwrap_or_default()
    }

    /// `(id, filename)` of every object in a blob bucket.
    pub fn blob_files(&self, bucket: &str) -> Vec<(Bson, String)> {
        self.blobs
            .lock()
            .get(bucket)
            .map(|files| files.iter().map(|f| (f.id.clone(), f.filename.clone())).collect())
            .unwrap_or_default()
    }

    /// Metadata stored with a blob object.
    pub fn blob_metadata(&self, bucket: &str, id: &Bson) -> Option<Document> {
        self.blobs
            .lock()
            .get(bucket)
            .and_then(|files| files.iter().find(|f| &f.id == id))
            .map(|f| {
                let mut m = f.metadata.clone();
                m.insert("chunkSize", i64::from(f.chunk_size));
                m
            })
    }

    fn enter(&self, op: &str) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut fail = self.fail_next.lock();
        if fail.as_deref() == Some(op) {
            *fail = None;
            return Err(StoreError::Message(format!("injected failure in {op}")));
        }
        Ok(())
    }

    fn read<T>(
        &self,
        session: Option<&SessionHandle>,
        f: impl FnOnce(&Collections) -> StoreResult<T>,
    ) -> StoreResult<T> {
        match session {
            Some(s) => {
                let sessions = self.sessions.lock();
                let state = sessions
                    .get(s.id())
                    .ok_or_else(|| StoreError::Session(format!("unknown session {}", s.id())))?;
                f(&state.data)
            }
            None => f(&self.committed.read()),
        }
    }

    fn write<T>(
        &self,
        session: Option<&SessionHandle>,
        collection: &str,
        f: impl FnOnce(&mut Vec<Document>, &mut Vec<Document>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut events = Vec::new();
        let out = match session {
            Some(s) => {
                let mut sessions = self.sessions.lock();
                let state = sessions
                    .get_mut(s.id())
                    .ok_or_else(|| StoreError::Session(format!("unknown session {}", s.id())))?;
                let out = f(state.data.entry(collection.to_string()).or_default(), &mut events)?;
                state.events.extend(events.into_iter().map(|e| (collection.to_string(), e)));
                return Ok(out);
            }
            None => {
                let mut committed = self.committed.write();
                f(committed.entry(collection.to_string()).or_default(), &mut events)?
            }
        };
        self.publish(events.into_iter().map(|e| (collection.to_string(), e)));
        Ok(out)
    }

    fn publish(&self, events: impl IntoIterator<Item = (String, Document)>) {
        let mut subs = self.subscribers.lock();
        for (collection, event) in events {
            subs.retain(|(c, tx)| c != &collection || tx.send(event.clone()).is_ok());
        }
    }

    fn stream(&self, docs: Vec<Document>) -> Box<dyn DocumentStream> {
        Box::new(VecStream { docs: docs.into(), closed: false, closes: self.stream_closes.clone() })
    }

    fn find_in(
        cols: &Collections,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> StoreResult<Vec<Document>> {
        let mut docs = Vec::new();
        for d in cols.get(collection).map(Vec::as_slice).unwrap_or_default() {
            if matches(d, filter)? {
                docs.push(d.clone());
            }
        }
        if let Some(sort) = &options.sort {
            check_sort(sort)?;
            docs.sort_by(|a, b| compare_docs(a, b, sort));
        }
        let skip = usize::try_from(options.skip.unwrap_or(0)).unwrap_or(usize::MAX);
        let mut docs: Vec<Document> = docs.into_iter().skip(skip).collect();
        if let Some(limit) = options.limit.filter(|l| *l != 0) {
            docs.truncate(usize::try_from(limit.unsigned_abs()).unwrap_or(usize::MAX));
        }
        if let Some(projection) = &options.projection {
            docs = docs.iter().map(|d| project(d, projection)).collect::<StoreResult<_>>()?;
        }
        Ok(docs)
    }

    fn cursor_command(
        &self,
        session: Option<&SessionHandle>,
        command: &Document,
    ) -> StoreResult<(String, Vec<Document>)> {
        let (name, arg) = command
            .iter()
            .next()
            .ok_or_else(|| StoreError::Message("empty command".into()))?;
        match name.as_str() {
            "find" => {
                let collection = command_target(name, arg)?;
                let filter = command.get_document("filter").cloned().unwrap_or_default();
                let options = FindOptions {
                    projection: command.get_document("projection").ok().cloned(),
                    sort: command.get_document("sort").ok().cloned(),
                    skip: command.get("skip").and_then(eval::as_i64).and_then(|n| u64::try_from(n).ok()),
                    limit: command.get("limit").and_then(eval::as_i64),
                };
                let docs = self.read(session, |cols| {
                    Self::find_in(cols, &collection, &filter, &options)
                })?;
                Ok((collection, docs))
            }
            "aggregate" => {
                let collection = command_target(name, arg)?;
                let pipeline = command
                    .get_array("pipeline")
                    .map_err(|_| StoreError::Message("aggregate needs a pipeline".into()))?
                    .iter()
                    .map(|b| {
                        b.as_document()
                            .cloned()
                            .ok_or_else(|| StoreError::Message("stages must be documents".into()))
                    })
                    .collect::<StoreResult<Vec<_>>>()?;
                let docs = self.read(session, |cols| {
                    pipeline::run(cols.get(&collection).cloned().unwrap_or_default(), &pipeline)
                })?;
                Ok((collection, docs))
            }
            "listCollections" => {
                let mut names: Vec<String> = self.read(session, |cols| Ok(cols.keys().cloned().collect()))?;
                names.sort();
                let docs = names.into_iter().map(|n| doc! {"name": n, "type": "collection"}).collect();
                Ok(("$cmd.listCollections".to_string(), docs))
            }
            other => Err(StoreError::Unsupported(format!("cursor command {other}"))),
        }
    }
}

fn command_target(name: &str, arg: &Bson) -> StoreResult<String> {
    arg.as_str()
        .map(str::to_string)
        .ok_or_else(|| StoreError::Message(format!("{name} needs a collection name")))
}

fn change_event(kind: &str, collection: &str, doc: &Document) -> Document {
    doc! {
        "operationType": kind,
        "ns": {"coll": collection},
        "documentKey": {"_id": doc.get("_id").cloned().unwrap_or(Bson::Null)},
        "fullDocument": doc.clone(),
    }
}

/// Puts `_id` first, generating an `ObjectId` when absent.
fn with_id(doc: &Document, id: Option<Bson>) -> Document {
    let id = id
        .or_else(|| doc.get("_id").cloned())
        .unwrap_or_else(|| Bson::ObjectId(ObjectId::new()));
    let mut out = Document::new();
    out.insert("_id", id);
    for (k, v) in doc {
        if k != "_id" {
            out.insert(k.clone(), v.clone());
        }
    }
    out
}

/// Equality terms of a filter, used to seed an upserted document.
fn upsert_seed(filter: &Document) -> Document {
    let mut seed = Document::new();
    for (k, v) in filter {
        if k.starts_with('$') || k.contains('.') {
            continue;
        }
        match v {
            Bson::Document(d) if d.keys().next().is_some_and(|o| o.starts_with('$')) => {
                if let Some(eq) = d.get("$eq") {
                    seed.insert(k.clone(), eq.clone());
                }
            }
            other => {
                seed.insert(k.clone(), other.clone());
            }
        }
    }
    seed
}

fn update_in(
    collection: &str,
    docs: &mut [Document],
    events: &mut Vec<Document>,
    filter: &Document,
    update: &Document,
    only_first: bool,
) -> StoreResult<UpdateReport> {
    let mut report = UpdateReport::default();
    for d in docs.iter_mut() {
        if !matches(d, filter)? {
            continue;
        }
        report.matched += 1;
        let mut next = d.clone();
        if apply_update(&mut next, update)? {
            report.modified += 1;
            *d = next;
            events.push(change_event("update", collection, d));
        }
        if only_first {
            break;
        }
    }
    Ok(report)
}

impl MemoryStore {
    fn update_impl(
        &self,
        session: Option<&SessionHandle>,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
        only_first: bool,
    ) -> StoreResult<UpdateReport> {
        self.write(session, collection, |docs, events| {
            let mut report = update_in(collection, docs, events, filter, update, only_first)?;
            if report.matched == 0 && upsert {
                let mut seeded = upsert_seed(filter);
                apply_update(&mut seeded, update)?;
                let created = with_id(&seeded, None);
                events.push(change_event("insert", collection, &created));
                docs.push(created);
                report.upserted = true;
            }
            Ok(report)
        })
    }
}

impl DocumentStore for MemoryStore {
    fn find(
        &self,
        session: Option<&SessionHandle>,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> StoreResult<Box<dyn DocumentStream>> {
        self.enter("find")?;
        let docs = self.read(session, |cols| Self::find_in(cols, collection, filter, options))?;
        Ok(self.stream(docs))
    }

    fn aggregate(
        &self,
        session: Option<&SessionHandle>,
        collection: &str,
        pipeline: &[Document],
        _options: &AggregateOptions,
    ) -> StoreResult<Box<dyn DocumentStream>> {
        self.enter("aggregate")?;
        let docs = self.read(session, |cols| {
            pipeline::run(cols.get(collection).cloned().unwrap_or_default(), pipeline)
        })?;
        Ok(self.stream(docs))
    }

    fn run_command_cursor(
        &self,
        session: Option<&SessionHandle>,
        command: &Document,
    ) -> StoreResult<Box<dyn DocumentStream>> {
        self.enter("run_command_cursor")?;
        let (_, docs) = self.cursor_command(session, command)?;
        Ok(self.stream(docs))
    }

    fn run_command(
        &self,
        session: Option<&SessionHandle>,
        command: &Document,
    ) -> StoreResult<Document> {
        self.enter("run_command")?;
        let (name, arg) = command
            .iter()
            .next()
            .ok_or_else(|| StoreError::Message("empty command".into()))?;
        match name.as_str() {
            "ping" => Ok(doc! {"ok": 1}),
            "count" => {
                let collection = command_target(name, arg)?;
                let query = command.get_document("query").cloned().unwrap_or_default();
                let n = self.read(session, |cols| {
                    let mut n = 0i64;
                    for d in cols.get(&collection).map(Vec::as_slice).unwrap_or_default() {
                        if matches(d, &query)? {
                            n += 1;
                        }
                    }
                    Ok(n)
                })?;
                Ok(doc! {"n": n, "ok": 1})
            }
            "distinct" => {
                let collection = command_target(name, arg)?;
                let key = command
                    .get_str("key")
                    .map_err(|_| StoreError::Message("distinct needs a key".into()))?
                    .to_string();
                let query = command.get_document("query").cloned().unwrap_or_default();
                let values = self.distinct_impl(session, &collection, &key, &query)?;
                Ok(doc! {"values": values, "ok": 1})
            }
            "drop" => {
                let collection = command_target(name, arg)?;
                self.committed.write().remove(&collection);
                Ok(doc! {"ok": 1})
            }
            _ => {
                let (ns, docs) = self.cursor_command(session, command)?;
                let batch: Vec<Bson> = docs.into_iter().map(Bson::Document).collect();
                Ok(doc! {"cursor": {"firstBatch": batch, "id": 0i64, "ns": ns}, "ok": 1})
            }
        }
    }

    fn insert_one(
        &self,
        session: Option<&SessionHandle>,
        collection: &str,
        document: &Document,
    ) -> StoreResult<Bson> {
        self.enter("insert_one")?;
        self.write(session, collection, |docs, events| {
            let stored = with_id(document, None);
            let id = stored.get("_id").cloned().unwrap_or(Bson::Null);
            if docs.iter().any(|d| d.get("_id") == Some(&id)) {
                return Err(StoreError::DuplicateKey(id.to_string()));
            }
            events.push(change_event("insert", collection, &stored));
            docs.push(stored);
            Ok(id)
        })
    }

    fn update_many(
        &self,
        session: Option<&SessionHandle>,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> StoreResult<UpdateReport> {
        self.enter("update_many")?;
        self.update_impl(session, collection, filter, update, upsert, false)
    }

    fn update_one(
        &self,
        session: Option<&SessionHandle>,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> StoreResult<UpdateReport> {
        self.enter("update_one")?;
        self.update_impl(session, collection, filter, update, upsert, true)
    }

    fn replace_one(
        &self,
        session: Option<&SessionHandle>,
        collection: &str,
        filter: &Document,
        replacement: &Document,
        upsert: bool,
    ) -> StoreResult<UpdateReport> {
        self.enter("replace_one")?;
        self.write(session, collection, |docs, events| {
            for d in docs.iter_mut() {
                if !matches(d, filter)? {
                    continue;
                }
                let id = d.get("_id").cloned();
                if let (Some(new_id), Some(old_id)) = (replacement.get("_id"), id.as_ref())
                    && new_id != old_id
                {
                    return Err(StoreError::Message("the _id field is immutable".into()));
                }
                let next = with_id(replacement, id);
                let modified = u64::from(*d != next);
                *d = next;
                events.push(change_event("replace", collection, d));
                return Ok(UpdateReport { matched: 1, modified, upserted: false });
            }
            if !upsert {
                return Ok(UpdateReport::default());
            }
            let id = replacement.get("_id").cloned().or_else(|| upsert_seed(filter).get("_id").cloned());
            let created = with_id(replacement, id);
            events.push(change_event("insert", collection, &created));
            docs.push(created);
            Ok(UpdateReport { matched: 0, modified: 0, upserted: true })
        })
    }

    fn delete_many(
        &self,
        session: Option<&SessionHandle>,
        collection: &str,
        filter: &Document,
    ) -> StoreResult<DeleteReport> {
        self.enter("delete_many")?;
        self.write(session, collection, |docs, events| {
            let hits = docs.iter().map(|d| matches(d, filter)).collect::<StoreResult<Vec<_>>>()?;
            let mut kept = Vec::with_capacity(docs.len());
            let mut deleted = 0u64;
            for (d, hit) in docs.drain(..).zip(hits) {
                if hit {
                    deleted += 1;
                    events.push(change_event("delete", collection, &d));
                } else {
                    kept.push(d);
                }
            }
            *docs = kept;
            Ok(DeleteReport { deleted })
        })
    }

    fn distinct(
        &self,
        session: Option<&SessionHandle>,
        collection: &str,
        field: &str,
        filter: &Document,
    ) -> StoreResult<Vec<Bson>> {
        self.enter("distinct")?;
        self.distinct_impl(session, collection, field, filter)
    }

    fn count_documents(
        &self,
        session: Option<&SessionHandle>,
        collection: &str,
        filter: &Document,
    ) -> StoreResult<u64> {
        self.enter("count_documents")?;
        self.read(session, |cols| {
            let mut n = 0u64;
            for d in cols.get(collection).map(Vec::as_slice).unwrap_or_default() {
                if matches(d, filter)? {
                    n += 1;
                }
            }
            Ok(n)
        })
    }

    fn drop_collection(&self, collection: &str) -> StoreResult<()> {
        self.enter("drop_collection")?;
        self.committed.write().remove(collection);
        Ok(())
    }

    fn collection_names(&self) -> StoreResult<Vec<String>> {
        self.enter("collection_names")?;
        let mut names: Vec<String> = self
            .committed
            .read()
            .iter()
            .filter(|(_, docs)| !docs.is_empty())
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    fn start_session(&self) -> StoreResult<SessionHandle> {
        self.enter("start_session")?;
        let id = uuid::Uuid::new_v4().to_string();
        let data = self.committed.read().clone();
        self.sessions.lock().insert(id.clone(), SessionState { data, events: Vec::new() });
        Ok(SessionHandle(id))
    }

    fn commit_transaction(&self, session: &SessionHandle) -> StoreResult<()> {
        self.enter("commit_transaction")?;
        let state = self
            .sessions
            .lock()
            .remove(session.id())
            .ok_or_else(|| StoreError::Session(format!("unknown session {}", session.id())))?;
        *self.committed.write() = state.data;
        self.publish(state.events);
        Ok(())
    }

    fn abort_transaction(&self, session: &SessionHandle) -> StoreResult<()> {
        self.enter("abort_transaction")?;
        self.sessions
            .lock()
            .remove(session.id())
            .map(|_| ())
            .ok_or_else(|| StoreError::Session(format!("unknown session {}", session.id())))
    }

    fn bucket(&self, name: &str, chunk_size: u32) -> StoreResult<Box<dyn BlobBucket>> {
        self.enter("bucket")?;
        Ok(Box::new(MemoryBucket {
            name: name.to_string(),
            chunk_size,
            state: self.blobs.clone(),
            closes: self.download_closes.clone(),
        }))
    }

    fn watch(&self, collection: &str) -> StoreResult<Box<dyn ChangeStream>> {
        self.enter("watch")?;
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push((collection.to_string(), tx));
        Ok(Box::new(MemoryChangeStream { rx: Some(rx) }))
    }
}

impl MemoryStore {
    fn distinct_impl(
        &self,
        session: Option<&SessionHandle>,
        collection: &str,
        field: &str,
        filter: &Document,
    ) -> StoreResult<Vec<Bson>> {
        self.read(session, |cols| {
            let mut out: Vec<Bson> = Vec::new();
            for d in cols.get(collection).map(Vec::as_slice).unwrap_or_default() {
                if !matches(d, filter)? {
                    continue;
                }
                let values = match get_path(d, field) {
                    Some(Bson::Array(items)) => items.clone(),
                    Some(v) => vec![v.clone()],
                    None => continue,
                };
                for v in values {
                    if !out.contains(&v) {
                        out.push(v);
                    }
                }
            }
            Ok(out)
        })
    }
}

struct VecStream {
    docs: VecDeque<Document>,
    closed: bool,
    closes: Arc<AtomicUsize>,
}

impl DocumentStream for VecStream {
    fn next_document(&mut self) -> StoreResult<Option<Document>> {
        if self.closed {
            return Err(StoreError::Message("cursor is closed".into()));
        }
        Ok(self.docs.pop_front())
    }

    fn close(&mut self) -> StoreResult<()> {
        if !self.closed {
            self.closed = true;
            self.docs.clear();
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MemoryChangeStream {
    rx: Option<mpsc::Receiver<Document>>,
}

impl ChangeStream for MemoryChangeStream {
    fn next_event(&mut self, timeout: Duration) -> StoreResult<Option<Document>> {
        let rx = self
            .rx
            .as_ref()
            .ok_or_else(|| StoreError::Message("change stream is closed".into()))?;
        match rx.recv_timeout(timeout) {
            Ok(ev) => Ok(Some(ev)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(StoreError::Message("change stream disconnected".into()))
            }
        }
    }

    fn close(&mut self) -> StoreResult<()> {
        self.rx = None;
        Ok(())
    }
}
