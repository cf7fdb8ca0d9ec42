use bson::{Bson, Document, oid::ObjectId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Cursor as IoCursor, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::store::{BlobBucket, DownloadStream, StoreError, StoreResult};

#[derive(Debug, Clone)]
pub(crate) struct StoredBlob {
    pub id: Bson,
    pub filename: String,
    pub metadata: Document,
    pub chunk_size: u32,
    pub data: Vec<u8>,
}

pub(crate) type BlobState = Arc<Mutex<HashMap<String, Vec<StoredBlob>>>>;

pub(crate) struct MemoryBucket {
    pub(crate) name: String,
    pub(crate) chunk_size: u32,
    pub(crate) state: BlobState,
    pub(crate) closes: Arc<AtomicUsize>,
}

impl BlobBucket for MemoryBucket {
    fn upload(
        &mut self,
        id: Option<Bson>,
        filename: &str,
        metadata: Document,
        source: &mut dyn Read,
    ) -> StoreResult<Bson> {
        let mut data = Vec::new();
        source.read_to_end(&mut data)?;
        let id = id.unwrap_or_else(|| Bson::ObjectId(ObjectId::new()));
        let mut state = self.state.lock();
        let files = state.entry(self.name.clone()).or_default();
        if files.iter().any(|f| f.id == id) {
            return Err(StoreError::DuplicateKey(id.to_string()));
        }
        files.push(StoredBlob {
            id: id.clone(),
            filename: filename.to_string(),
            metadata,
            chunk_size: self.chunk_size,
            data,
        });
        Ok(id)
    }

    fn open_download(&mut self, id: &Bson) -> StoreResult<Box<dyn DownloadStream>> {
        let state = self.state.lock();
        let blob = state
            .get(&self.name)
            .and_then(|files| files.iter().find(|f| &f.id == id))
            .ok_or_else(|| StoreError::NotFound(format!("file with id {id}")))?;
        Ok(Box::new(MemoryDownload::new(blob.data.clone(), self.closes.clone())))
    }

    fn open_download_by_name(&mut self, filename: &str) -> StoreResult<Box<dyn DownloadStream>> {
        let state = self.state.lock();
        // newest revision wins
        let blob = state
            .get(&self.name)
            .and_then(|files| files.iter().rev().find(|f| f.filename == filename))
            .ok_or_else(|| StoreError::NotFound(format!("file named {filename}")))?;
        Ok(Box::new(MemoryDownload::new(blob.data.clone(), self.closes.clone())))
    }

    fn delete(&mut self, id: &Bson) -> StoreResult<()> {
        let mut state = self.state.lock();
        let files = state.entry(self.name.clone()).or_default();
        let before = files.len();
        files.retain(|f| &f.id != id);
        if files.len() == before {
            return Err(StoreError::NotFound(format!("file with id {id}")));
        }
        Ok(())
    }

    fn drop_bucket(&mut self) -> StoreResult<()> {
        self.state.lock().remove(&self.name);
        Ok(())
    }
}

pub(crate) struct MemoryDownload {
    inner: IoCursor<Vec<u8>>,
    closed: bool,
    closes: Arc<AtomicUsize>,
}

impl MemoryDownload {
    fn new(data: Vec<u8>, closes: Arc<AtomicUsize>) -> Self {
        Self { inner: IoCursor::new(data), closed: false, closes }
    }
}

impl Read for MemoryDownload {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other("download stream is closed"));
        }
        self.inner.read(buf)
    }
}

impl DownloadStream for MemoryDownload {
    fn close(&mut self) -> StoreResult<()> {
        if !self.closed {
            self.closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
