use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("translation error: {0}")]
    Translation(String),

    #[error("filter op {0} is not defined")]
    UnsupportedOperator(String),

    #[error("{0}")]
    Precondition(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("{op}. {source}")]
    Store {
        op: String,
        #[source]
        source: StoreError,
    },

    #[error("unable to decode output. {0}")]
    Decode(String),

    #[error("unable to fetch data. {0}")]
    Fetch(String),

    #[error("BSON: {0}")]
    Bson(#[from] bson::error::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("transaction error: {0}")]
    Transaction(String),
}

impl DbError {
    /// Wraps a client failure with the name of the high-level operation that issued it.
    pub fn store(op: impl Into<String>, source: StoreError) -> Self {
        Self::Store { op: op.into(), source }
    }

    #[must_use]
    pub const fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition(_))
    }

    #[must_use]
    pub const fn is_translation(&self) -> bool {
        matches!(self, Self::Translation(_) | Self::UnsupportedOperator(_))
    }
}
