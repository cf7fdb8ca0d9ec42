//! Filter trees compiled to document-database query documents, plus the dispatch, execution and
//! decoding layers that run them through a [`DocumentStore`] client.
//!
//! ```no_run
//! use std::sync::Arc;
//! use flexdoc::{Connection, MemoryStore, Query, filter};
//!
//! let conn = Connection::with_defaults(Arc::new(MemoryStore::new()));
//! let mut cur = conn.cursor(&Query::from("employees").filter(filter::gte("age", 30)));
//! let rows: Vec<bson::Document> = cur.fetch_all().unwrap_or_default();
//! # let _ = rows;
//! ```

pub mod config;
pub mod connection;
pub mod cursor;
pub mod dispatch;
pub mod errors;
pub mod execute;
pub mod filter;
pub mod query;
pub mod store;
pub mod translate;
pub mod utils;
pub mod watch;

pub use config::{ConnectionConfig, FieldNaming, SaveMode};
pub use connection::{Connection, Scope, Transaction};
pub use cursor::{CountSpec, Cursor, FromRecord, Record};
pub use errors::DbError;
pub use execute::ExecResult;
pub use filter::{Filter, FilterOp, FilterSpec, Rejected};
pub use query::{AggrItem, AggrOp, CommandName, Params, Query};
pub use store::{DocumentStore, MemoryStore, StoreError};
pub use translate::{CompositePolicy, Translator, translate};
pub use utils::logger::{configure_from_env, configure_logging};
pub use watch::Watcher;
