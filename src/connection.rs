//! Connection facade and the transaction wrapper.
//!
//! Whether an operation runs bound to a session is decided in exactly one place: the [`Scope`]
//! an operation is issued through. A [`Connection`] hands out unbound scopes; a live
//! [`Transaction`] hands out scopes bound to its session. At most one transaction is live per
//! connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::ConnectionConfig;
use crate::cursor::Cursor;
use crate::errors::DbError;
use crate::execute::ExecResult;
use crate::query::{Params, Query};
use crate::store::{DocumentStore, SessionHandle, StoreResult};
use crate::{dispatch, execute};

/// Execution context of one operation: the client, the connection settings, and the session the
/// operation is bound to (`None` runs standalone).
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    pub(crate) store: &'a Arc<dyn DocumentStore>,
    pub(crate) config: &'a ConnectionConfig,
    pub(crate) session: Option<&'a SessionHandle>,
}

impl<'a> Scope<'a> {
    pub fn new(
        store: &'a Arc<dyn DocumentStore>,
        config: &'a ConnectionConfig,
        session: Option<&'a SessionHandle>,
    ) -> Self {
        Self { store, config, session }
    }

    #[must_use]
    pub fn config(&self) -> &'a ConnectionConfig {
        self.config
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.session.is_some()
    }

    /// Runs one client call in this scope. Client failures are prefixed with `op`; nothing is
    /// retried.
    pub fn run<T>(
        &self,
        op: &str,
        f: impl FnOnce(&dyn DocumentStore, Option<&SessionHandle>) -> StoreResult<T>,
    ) -> Result<T, DbError> {
        f(self.store.as_ref(), self.session).map_err(|e| DbError::store(op, e))
    }
}

pub struct Connection {
    store: Arc<dyn DocumentStore>,
    config: ConnectionConfig,
    in_tx: AtomicBool,
}

impl Connection {
    pub fn new(store: Arc<dyn DocumentStore>, config: ConnectionConfig) -> Self {
        Self { store, config, in_tx: AtomicBool::new(false) }
    }

    pub fn with_defaults(store: Arc<dyn DocumentStore>) -> Self {
        Self::new(store, ConnectionConfig::default())
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    fn scope(&self) -> Scope<'_> {
        Scope::new(&self.store, &self.config, None)
    }

    /// Runs a read query. Failures are attached to the returned cursor.
    pub fn cursor(&self, query: &Query) -> Cursor {
        dispatch::cursor_for(self.scope(), query)
    }

    /// Runs a mutating query (insert/update/delete/save/command).
    pub fn execute(&self, query: &Query, params: Params<'_>) -> Result<ExecResult, DbError> {
        execute::execute_query(self.scope(), query, params)
    }

    /// Removes a whole collection, the sanctioned alternative to an unfiltered delete.
    pub fn drop_collection(&self, name: &str) -> Result<(), DbError> {
        log::info!("dropping collection {name}");
        self.scope().run("unable to drop collection", |s, _| s.drop_collection(name))
    }

    pub fn collection_names(&self) -> Result<Vec<String>, DbError> {
        self.scope().run("unable to list collections", |s, _| s.collection_names())
    }

    pub fn disable_tx(&mut self, disable: bool) {
        self.config.disable_tx = disable;
    }

    #[must_use]
    pub fn supports_tx(&self) -> bool {
        !self.config.disable_tx
    }

    /// Whether a transaction is currently live on this connection.
    #[must_use]
    pub fn is_tx(&self) -> bool {
        self.in_tx.load(Ordering::SeqCst)
    }

    pub fn begin_tx(&self) -> Result<Transaction<'_>, DbError> {
        if self.config.disable_tx {
            return Err(DbError::Transaction("tx is disabled".into()));
        }
        if self.in_tx.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(DbError::Transaction("a transaction is already active".into()));
        }
        match self.scope().run("unable to start transaction", |s, _| s.start_session()) {
            Ok(session) => {
                log::debug!("transaction {} started", session.id());
                Ok(Transaction { conn: self, session: Some(session) })
            }
            Err(e) => {
                self.in_tx.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

/// A live transaction. Dropping it without `commit` rolls it back.
pub struct Transaction<'c> {
    conn: &'c Connection,
    session: Option<SessionHandle>,
}

impl Transaction<'_> {
    fn scope(&self) -> Scope<'_> {
        Scope::new(&self.conn.store, &self.conn.config, self.session.as_ref())
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(SessionHandle::id)
    }

    pub fn cursor(&self, query: &Query) -> Cursor {
        dispatch::cursor_for(self.scope(), query)
    }

    pub fn execute(&self, query: &Query, params: Params<'_>) -> Result<ExecResult, DbError> {
        execute::execute_query(self.scope(), query, params)
    }

    fn finish(&mut self, commit: bool) -> Result<(), DbError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        let scope = Scope::new(&self.conn.store, &self.conn.config, None);
        let out = if commit {
            scope.run("unable to commit transaction", |s, _| s.commit_transaction(&session))
        } else {
            scope.run("unable to rollback transaction", |s, _| s.abort_transaction(&session))
        };
        self.conn.in_tx.store(false, Ordering::SeqCst);
        log::debug!("transaction {} {}", session.id(), if commit { "committed" } else { "rolled back" });
        out
    }

    pub fn commit(mut self) -> Result<(), DbError> {
        self.finish(true)
    }

    pub fn rollback(mut self) -> Result<(), DbError> {
        self.finish(false)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.session.is_some()
            && let Err(e) = self.finish(false)
        {
            log::warn!("rolling back abandoned transaction: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError};

    fn conn() -> (Arc<MemoryStore>, Connection) {
        let mem = Arc::new(MemoryStore::new());
        let store: Arc<dyn DocumentStore> = mem.clone();
        (mem, Connection::with_defaults(store))
    }

    #[test]
    fn scope_prefixes_client_errors() {
        let (_, c) = conn();
        let err = c
            .scope()
            .run::<()>("unable to delete", |_, _| Err(StoreError::Message("boom".into())))
            .unwrap_err();
        assert_eq!(err.to_string(), "unable to delete. boom");
    }

    #[test]
    fn one_live_transaction_per_connection() {
        let (_, c) = conn();
        let tx = c.begin_tx().unwrap();
        assert!(c.is_tx());
        assert!(tx.scope().is_bound());
        assert!(matches!(c.begin_tx(), Err(DbError::Transaction(_))));
        tx.rollback().unwrap();
        assert!(!c.is_tx());
        let tx = c.begin_tx().unwrap();
        drop(tx);
        assert!(!c.is_tx());
    }

    #[test]
    fn disabled_transactions() {
        let (_, mut c) = conn();
        c.disable_tx(true);
        assert!(!c.supports_tx());
        let err = c.begin_tx().err().unwrap();
        assert_eq!(err.to_string(), "transaction error: tx is disabled");
    }

    #[test]
    fn failed_session_start_releases_flag() {
        let (mem, c) = conn();
        mem.fail_next("start_session");
        assert!(c.begin_tx().is_err());
        assert!(!c.is_tx());
        assert!(c.begin_tx().is_ok());
    }
}
