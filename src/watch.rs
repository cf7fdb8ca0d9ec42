//! Change-event listener running on a background thread.
//!
//! Events are forwarded over a channel; the thread stops when [`Watcher::stop`] is called, when
//! the watcher is dropped, or when the change stream fails.

use bson::Document;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::errors::DbError;
use crate::store::DocumentStore;

pub struct Watcher {
    collection: String,
    events: Receiver<Document>,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("collection", &self.collection)
            .field("running", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Opens a change stream on `collection` and starts forwarding its events. `poll` bounds how
    /// long a stop request can go unnoticed.
    pub fn start(
        store: &Arc<dyn DocumentStore>,
        collection: &str,
        poll: Duration,
    ) -> Result<Self, DbError> {
        let mut stream = store
            .watch(collection)
            .map_err(|e| DbError::store("unable to watch", e))?;
        let (tx, events) = mpsc::channel();
        let (stop, stop_rx) = mpsc::channel::<()>();
        let name = collection.to_string();
        let handle = thread::Builder::new()
            .name(format!("flexdoc-watch-{name}"))
            .spawn(move || {
                loop {
                    match stop_rx.try_recv() {
                        Ok(()) | Err(TryRecvError::Disconnected) => break,
                        Err(TryRecvError::Empty) => {}
                    }
                    match stream.next_event(poll) {
                        Ok(Some(ev)) => {
                            if tx.send(ev).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            log::warn!("watch on {name} ended: {e}");
                            break;
                        }
                    }
                }
                if let Err(e) = stream.close() {
                    log::warn!("closing change stream on {name}: {e}");
                }
            })?;
        log::debug!("watching {collection}");
        Ok(Self { collection: collection.to_string(), events, stop: Some(stop), handle: Some(handle) })
    }

    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Waits up to `timeout` for the next event. `None` on timeout or once the listener ended.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Document> {
        match self.events.recv_timeout(timeout) {
            Ok(ev) => Some(ev),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Events already received, without blocking.
    pub fn try_iter(&self) -> impl Iterator<Item = Document> + '_ {
        self.events.try_iter()
    }

    fn shutdown(&mut self) -> Result<(), DbError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.handle.take() {
            Some(h) => h
                .join()
                .map_err(|_| DbError::Dispatch(format!("watch thread for {} panicked", self.collection))),
            None => Ok(()),
        }
    }

    /// Signals the listener and waits for it to finish.
    pub fn stop(mut self) -> Result<(), DbError> {
        self.shutdown()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("{e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use bson::doc;

    #[test]
    fn forwards_events_until_stopped() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let w = Watcher::start(&store, "c", Duration::from_millis(20)).unwrap();
        store.insert_one(None, "c", &doc! {"_id": 1}).unwrap();
        let ev = w.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(ev.get_document("documentKey").unwrap(), &doc! {"_id": 1});
        w.stop().unwrap();
    }

    #[test]
    fn drop_joins_listener() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let w = Watcher::start(&store, "c", Duration::from_millis(10)).unwrap();
        assert_eq!(w.collection(), "c");
        drop(w);
    }
}
